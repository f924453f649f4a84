//! # polyquery
//!
//! Compiles REST-style query parameters into a backend-agnostic
//! intermediate query representation (IR), then lowers the IR into native
//! queries for heterogeneous storage backends while enforcing role-based
//! field-level access control and resolving declared relationships.
//!
//! ## Pipeline
//!
//! ```text
//! parameters -> convert -> enhance joins -> RBAC projection
//!            -> capability validation -> lower -> execute
//! ```
//!
//! - **Converter**: parses the parameter grammar (filters, logical groups,
//!   select with embedded relationships, order, pagination) into the IR.
//! - **Relationship registry**: declarative cardinality definitions,
//!   bulk-loaded at bootstrap and immutable at query time.
//! - **Join enhancer**: resolves join stubs against the registry.
//! - **RBAC table**: per-collection/action/role pattern lists resolved
//!   into allowed field sets and applied to the IR's selection.
//! - **Adapters**: one per backend family, lowering the IR into an
//!   aggregation pipeline, parameterized SQL or a search DSL.
//!
//! ## Example
//!
//! ```rust
//! use polyquery::{
//!     AdapterRegistry, QueryService, QueryType, RbacPattern, RbacTable,
//!     RelationshipRegistry,
//! };
//!
//! # fn example() -> polyquery::Result<()> {
//! let relationships = RelationshipRegistry::new();
//! let mut rbac = RbacTable::new();
//! rbac.allow(
//!     "users",
//!     QueryType::Read,
//!     "user",
//!     vec![RbacPattern::field("name"), RbacPattern::field("email")],
//! );
//!
//! let service = QueryService::new(relationships, rbac, AdapterRegistry::new());
//! let params = vec![("age".to_string(), "gt.25".to_string())];
//! let query = service.compile(&params, "users", QueryType::Read, &["user".to_string()])?;
//! assert_eq!(query.collection, "users");
//! # Ok(())
//! # }
//! ```
//!
//! Backend adapter crates:
//! - `polyquery-mongodb` - document-store lowering (aggregation pipelines)
//! - `polyquery-postgres` - relational lowering (parameterized SQL)
//! - `polyquery-elastic` - search-engine lowering (bool-query DSL)

pub mod adapter;
pub mod convert;
pub mod enhance;
pub mod error;
pub mod ir;
pub mod orchestrator;
pub mod rbac;
pub mod relationships;
pub mod tokenizer;

// Re-export commonly used items
pub use adapter::{
    validate_against_capabilities, AdapterCapabilities, AdapterRegistry, ExecuteOptions,
    ExecutionOutcome, NativeQuery, QueryAdapter, ValidationError, ValidationReport,
};
pub use convert::QueryConverter;
pub use enhance::enhance_joins;
pub use error::{QueryError, Result};
pub use ir::{
    AggregationClause, ComparisonOperator, FieldCondition, FilterCondition, IntermediateQuery,
    JoinClause, JoinCondition, JoinType, JunctionSpec, LogicalOperator, NullsOrder,
    PaginationClause, QueryType, RelationshipRef, SelectClause, SortClause, SortDirection,
};
pub use orchestrator::{PaginationInfo, QueryResponse, QueryService, ResponseMetadata};
pub use rbac::{RbacPattern, RbacTable};
pub use relationships::{Cardinality, RelationshipDefinition, RelationshipRegistry};
