use thiserror::Error;

use crate::adapter::ValidationError;

/// Unified error type for query compilation and execution
#[derive(Error, Debug)]
pub enum QueryError {
    /// Caller roles do not grant the requested action on the collection.
    /// Raised before any IR construction.
    #[error("Access denied: action '{action}' on collection '{collection}' is not permitted for roles [{roles}]")]
    AccessDenied {
        collection: String,
        action: String,
        roles: String,
    },

    /// The IR failed validation against an adapter's declared capabilities
    #[error("Query validation failed for adapter '{adapter}': {} error(s)", errors.len())]
    ValidationFailed {
        adapter: String,
        errors: Vec<ValidationError>,
    },

    /// A join referenced a relationship the registry does not know
    #[error("Relationship '{name}' not found for collection '{collection}'")]
    RelationshipNotFound { collection: String, name: String },

    /// Join enhancement ran against an empty relationship registry
    #[error("Relationship registry is uninitialized but the query contains join stubs")]
    RegistryUninitialized,

    /// No adapter registered under the requested name
    #[error("Adapter not found: {name}")]
    AdapterNotFound { name: String },

    /// Input that cannot be interpreted at all (bad query string, bad payload)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Invariant violation inside the compiler
    #[error("Internal error: {0}")]
    Internal(String),

    /// Backend execution failed; message is backend-qualified
    #[error("Execution failed on backend '{backend}': {message}")]
    ExecutionFailed { backend: String, message: String },
}

impl QueryError {
    /// Create an access-denied error with the caller's role list
    pub fn access_denied(
        collection: impl Into<String>,
        action: impl Into<String>,
        roles: &[String],
    ) -> Self {
        QueryError::AccessDenied {
            collection: collection.into(),
            action: action.into(),
            roles: roles.join(", "),
        }
    }

    /// Create a relationship-not-found error
    pub fn relationship_not_found(
        collection: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        QueryError::RelationshipNotFound {
            collection: collection.into(),
            name: name.into(),
        }
    }

    /// Create an adapter-not-found error
    pub fn adapter_not_found(name: impl Into<String>) -> Self {
        QueryError::AdapterNotFound { name: name.into() }
    }

    /// Wrap a backend failure with a backend-qualified message
    pub fn execution_failed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::ExecutionFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for client-side branching
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::AccessDenied { .. } => "ACCESS_DENIED",
            QueryError::ValidationFailed { .. } => "QUERY_VALIDATION_FAILED",
            QueryError::RelationshipNotFound { .. } => "RELATIONSHIP_NOT_FOUND",
            QueryError::RegistryUninitialized => "REGISTRY_UNINITIALIZED",
            QueryError::AdapterNotFound { .. } => "ADAPTER_NOT_FOUND",
            QueryError::MalformedInput(_) => "MALFORMED_INPUT",
            QueryError::Internal(_) => "INTERNAL_ERROR",
            QueryError::ExecutionFailed { .. } => "EXECUTION_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
