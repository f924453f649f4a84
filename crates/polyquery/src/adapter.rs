//! Backend adapter contract.
//!
//! An adapter lowers the IR into its native query form, validates the IR
//! against its declared capabilities and executes the native query. Only
//! execution is async; compilation stays synchronous. The IR is threaded
//! explicitly through `execute_query` so shared adapter instances carry
//! no per-request state.

use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::ir::{ComparisonOperator, FilterCondition, IntermediateQuery, JoinClause, JoinType};

/// Native query form, backend-specific but always JSON-representable: an
/// aggregation pipeline array, a `{sql, params}` object, a search DSL
/// object.
pub type NativeQuery = serde_json::Value;

/// Capabilities an adapter declares for validation purposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub filter_operators: Vec<ComparisonOperator>,
    pub join_types: Vec<JoinType>,
    pub aggregations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_complexity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_result_size: Option<u64>,
}

/// A structured validation failure with a stable code and an IR path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Per-call execution options; deadlines are owned by the adapter
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout_ms: Option<u64>,
}

/// Raw result of one backend execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub data: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_count: Option<u64>,
}

/// Contract every storage backend implements
#[async_trait]
pub trait QueryAdapter: Send + Sync + Downcast {
    /// Stable backend identifier (e.g. "mongodb", "postgres", "elastic")
    fn adapter_name(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Lower the IR into the backend's native query form
    fn convert_query(&self, query: &IntermediateQuery) -> Result<NativeQuery>;

    /// Check the IR against this adapter's declared capabilities
    fn validate_query(&self, query: &IntermediateQuery) -> ValidationReport {
        validate_against_capabilities(query, &self.capabilities())
    }

    /// Execute a previously lowered query
    async fn execute_query(
        &self,
        query: &IntermediateQuery,
        native: &NativeQuery,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome>;
}

impl_downcast!(QueryAdapter);

/// Shared capability validation used by every adapter: reports operators,
/// join types and aggregations the backend does not declare, plus joins
/// left unresolved by enhancement.
pub fn validate_against_capabilities(
    query: &IntermediateQuery,
    capabilities: &AdapterCapabilities,
) -> ValidationReport {
    let mut errors = Vec::new();

    if let Some(filter) = &query.filter {
        check_filter(filter, capabilities, "filter", &mut errors);
    }
    check_joins(&query.joins, capabilities, "joins", &mut errors);

    for (i, aggregation) in query.aggregations.iter().enumerate() {
        if !capabilities.aggregations.contains(&aggregation.function) {
            errors.push(ValidationError {
                code: "UNSUPPORTED_AGGREGATION".to_string(),
                message: format!("aggregation '{}' is not supported", aggregation.function),
                path: format!("aggregations[{}]", i),
            });
        }
    }

    ValidationReport::failed(errors)
}

fn check_filter(
    filter: &FilterCondition,
    capabilities: &AdapterCapabilities,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    for (i, condition) in filter.conditions.iter().enumerate() {
        if !capabilities.filter_operators.contains(&condition.operator) {
            errors.push(ValidationError {
                code: "UNSUPPORTED_OPERATOR".to_string(),
                message: format!(
                    "operator '{}' on field '{}' is not supported",
                    condition.operator, condition.field
                ),
                path: format!("{}.conditions[{}]", path, i),
            });
        }
    }
    for (i, nested) in filter.nested.iter().enumerate() {
        check_filter(nested, capabilities, &format!("{}.nested[{}]", path, i), errors);
    }
}

fn check_joins(
    joins: &[JoinClause],
    capabilities: &AdapterCapabilities,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    for (i, join) in joins.iter().enumerate() {
        let join_path = format!("{}[{}]", path, i);
        if join.is_stub() {
            errors.push(ValidationError {
                code: "JOIN_UNRESOLVED".to_string(),
                message: format!(
                    "join '{}' references an unknown relationship",
                    join.effective_alias()
                ),
                path: join_path.clone(),
            });
        } else if !capabilities.join_types.contains(&join.join_type) {
            errors.push(ValidationError {
                code: "UNSUPPORTED_JOIN_TYPE".to_string(),
                message: format!("join type '{:?}' is not supported", join.join_type),
                path: join_path.clone(),
            });
        }
        if let Some(filter) = &join.filter {
            check_filter(filter, capabilities, &format!("{}.filter", join_path), errors);
        }
        check_joins(&join.joins, capabilities, &format!("{}.joins", join_path), errors);
    }
}

/// Registry of adapters keyed by name. Built by the composition root at
/// bootstrap; read-only at query time.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn QueryAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn QueryAdapter>) {
        let name = adapter.adapter_name();
        if self.adapters.contains_key(name) {
            warn!(adapter = name, "overwriting existing adapter");
        }
        debug!(adapter = name, "registered adapter");
        self.adapters.insert(name.to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn QueryAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::adapter_not_found(name))
    }

    pub fn list(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}
