// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Error type for storage driver operations
///
/// Every variant is a distinct kind so the orchestrator can decide between
/// retry, abort and user-visible failure.
#[derive(Error, Debug, Diagnostic)]
pub enum DriverError {
    /// Backend resource not found
    #[error("{kind} not found: {id}")]
    #[diagnostic(
        code(replistor::driver::not_found),
        help("The backend has no resource tagged with this system id. It may not be provisioned yet, or it was removed out-of-band")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        id: String,
    },

    /// Backend resource already exists
    #[error("Resource already exists: {resource}")]
    #[diagnostic(
        code(replistor::driver::already_exists),
        help("Delete the existing resource first, or use a different system id")
    )]
    AlreadyExists {
        #[allow(unused)]
        resource: String,
    },

    /// Operation not supported by this backend/driver combination
    #[error("Invalid operation: {message}")]
    #[diagnostic(code(replistor::driver::invalid_operation), help("{suggestion}"))]
    InvalidOperation {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Capacity value that cannot be converted
    #[error("Invalid size: {size}")]
    #[diagnostic(
        code(replistor::driver::invalid_size),
        help("Sizes must be positive integers that fit the backend unit range")
    )]
    InvalidSize {
        #[allow(unused)]
        size: i128,
    },

    /// Backend state violates an invariant the driver relies on
    #[error("Driver inconsistency: {message}")]
    #[diagnostic(
        code(replistor::driver::inconsistency),
        help("Backend state needs manual inspection. Check for duplicate system-id properties or undeployed resources")
    )]
    DriverInconsistency {
        #[allow(unused)]
        message: String,
    },

    /// Transport-level failure; eligible for one reconnect-retry
    #[error("Backend connection failed: {message}")]
    #[diagnostic(
        code(replistor::driver::connection_failure),
        help("Verify the backend control plane is running and reachable at the configured endpoint")
    )]
    ConnectionFailure {
        #[allow(unused)]
        message: String,
    },

    /// Backend reported a failure status that is not otherwise classified
    #[error("Backend call '{operation}' failed with status {status}: {message}")]
    #[diagnostic(code(replistor::driver::generic_error), help("details: {details}"))]
    GenericError {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        status: String,
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        details: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(replistor::driver::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn invalid_size(size: impl Into<i128>) -> Self {
        Self::InvalidSize { size: size.into() }
    }

    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::DriverInconsistency {
            message: message.into(),
        }
    }

    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    pub fn generic(
        operation: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
        details: &[String],
    ) -> Self {
        Self::GenericError {
            operation: operation.into(),
            status: status.into(),
            message: message.into(),
            details: details.join("; "),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Whether this error is a transport-level failure
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }
}
