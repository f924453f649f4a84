//! Request pipeline: access check -> convert -> enhance joins -> RBAC
//! projection -> capability validation -> lowering -> delegated execution.
//!
//! Compilation is synchronous and stateless per request; it only reads
//! the immutable registries, so concurrent compilations need no
//! coordination. Execution is delegated to the adapter and is the only
//! async step.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::adapter::{AdapterRegistry, ExecuteOptions, NativeQuery};
use crate::convert::QueryConverter;
use crate::enhance::enhance_joins;
use crate::error::{QueryError, Result};
use crate::ir::{IntermediateQuery, QueryType};
use crate::rbac::RbacTable;
use crate::relationships::RelationshipRegistry;

/// Pagination echo in the response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub offset: u64,
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

/// Execution metadata returned alongside the data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub adapter: String,
    /// The compiled IR, for caller-side inspection
    pub query: IntermediateQuery,
    pub native_query: NativeQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_count: Option<u64>,
}

/// Response envelope for a completed query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<serde_json::Value>,
    pub metadata: ResponseMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationInfo>,
}

/// Composition root of the compiler: owns the relationship registry, the
/// RBAC table and the adapter registry. No hidden global state; tests get
/// isolated instances.
pub struct QueryService {
    relationships: RelationshipRegistry,
    rbac: RbacTable,
    adapters: AdapterRegistry,
}

impl QueryService {
    pub fn new(
        relationships: RelationshipRegistry,
        rbac: RbacTable,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            relationships,
            rbac,
            adapters,
        }
    }

    pub fn relationships(&self) -> &RelationshipRegistry {
        &self.relationships
    }

    pub fn rbac(&self) -> &RbacTable {
        &self.rbac
    }

    /// Swap the RBAC table as one unit (hot reload)
    pub fn replace_rbac(&mut self, rbac: RbacTable) {
        self.rbac = rbac;
    }

    /// Compile parameters into an enhanced, RBAC-constrained IR. Denied
    /// access rejects before any IR work begins.
    pub fn compile(
        &self,
        params: &[(String, String)],
        collection: &str,
        action: QueryType,
        roles: &[String],
    ) -> Result<IntermediateQuery> {
        if !self.rbac.has_access(collection, action, roles) {
            return Err(QueryError::access_denied(collection, action.to_string(), roles));
        }

        let mut query = QueryConverter::convert(params, collection, roles)?;
        query.query_type = Some(action);
        enhance_joins(&mut query, &self.relationships)?;
        self.rbac.apply_projection(&mut query, action, roles)?;

        debug!(collection, %action, "compiled query");
        Ok(query)
    }

    /// Full pipeline through a named adapter.
    pub async fn execute(
        &self,
        params: &[(String, String)],
        collection: &str,
        action: QueryType,
        roles: &[String],
        adapter_name: &str,
        options: &ExecuteOptions,
    ) -> Result<QueryResponse> {
        let query = self.compile(params, collection, action, roles)?;
        let adapter = self.adapters.get(adapter_name)?;

        let report = adapter.validate_query(&query);
        if !report.valid {
            return Err(QueryError::ValidationFailed {
                adapter: adapter.adapter_name().to_string(),
                errors: report.errors,
            });
        }

        let native = adapter.convert_query(&query)?;
        let outcome = adapter
            .execute_query(&query, &native, options)
            .await
            .map_err(|e| {
                error!(adapter = adapter.adapter_name(), error = %e, "backend execution failed");
                match e {
                    already @ QueryError::ExecutionFailed { .. } => already,
                    other => QueryError::execution_failed(adapter.adapter_name(), other.to_string()),
                }
            })?;

        let pagination = query.pagination.as_ref().map(|p| {
            let offset = p.offset.unwrap_or(0);
            let has_more = match (outcome.total, p.limit) {
                (Some(total), _) => Some(offset + (outcome.data.len() as u64) < total),
                (None, Some(limit)) => Some((outcome.data.len() as u64) >= limit),
                (None, None) => None,
            };
            PaginationInfo {
                offset,
                limit: p.limit,
                total: outcome.total,
                has_more,
            }
        });

        Ok(QueryResponse {
            data: outcome.data,
            metadata: ResponseMetadata {
                adapter: adapter.adapter_name().to_string(),
                query,
                native_query: native,
                execution_time_ms: outcome.execution_time_ms,
                inserted_count: outcome.inserted_count,
                modified_count: outcome.modified_count,
                deleted_count: outcome.deleted_count,
                matched_count: outcome.matched_count,
            },
            pagination,
        })
    }
}
