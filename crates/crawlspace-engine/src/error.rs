//! Engine error taxonomy.
//!
//! Every service-level failure surfaces as one of these variants; the HTTP
//! layer maps them onto the stable wire codes. Infrastructure failures from
//! the blob or coordination store arrive as `Dependency` after the service's
//! single retry.

use crawlspace_core::Error as CoreError;

/// The result type used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by engine services.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `run` or `request-queue`.
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A precondition on the entity's current state was not met.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the unmet precondition.
        message: String,
    },

    /// A run status update does not follow the state machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A lease operation was attempted by a client that does not hold it.
    #[error("request {request_id} is not locked by this client")]
    NotLockOwner {
        /// The request whose lease was targeted.
        request_id: String,
    },

    /// A mutation was attempted on a request locked by another client.
    #[error("request {request_id} is locked by another client")]
    LockedByOther {
        /// The locked request.
        request_id: String,
    },

    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A uniqueness constraint was violated at a layer boundary.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting write.
        message: String,
    },

    /// A dataset push failed before all items were durably written.
    #[error("partial write: {message}")]
    PartialWrite {
        /// Description of the failed sub-write.
        message: String,
    },

    /// A downstream dependency (metadata store, blob store, coordination
    /// store, container runtime) is unavailable.
    #[error("dependency unavailable: {message}")]
    Dependency {
        /// Description of the downstream failure.
        message: String,
    },

    /// An unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl EngineError {
    /// Creates a not-found error for an entity kind and id.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Creates an invalid-state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a dependency-unavailable error.
    #[must_use]
    pub fn dependency(message: impl std::fmt::Display) -> Self {
        Self::Dependency {
            message: message.to_string(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    /// Returns true when a single in-service retry is appropriate.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Dependency { .. })
    }
}

impl From<CoreError> for EngineError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::Storage { message, .. } | CoreError::Coordination { message } => {
                Self::Dependency { message }
            }
            CoreError::InvalidId { message } => Self::Validation(message),
            CoreError::InvalidInput(message) => Self::Validation(message),
            CoreError::Serialization { message } => Self::Internal { message },
            CoreError::NotFound(message) | CoreError::Internal { message } => {
                Self::Internal { message }
            }
        }
    }
}
