//! Error taxonomy shared by every manager and registry

/// Errors surfaced by orchestration commands
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{component} is not initialized")]
    NotInitialized { component: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{message}")]
    InvalidTransition { message: String },

    #[error("no enabled provider available: {message}")]
    ProviderUnavailable { message: String },

    #[error("{operation} failed: {message}")]
    ExternalOperation { operation: String, message: String },

    #[error("{operation} timed out after {seconds}s")]
    TimeoutExceeded { operation: String, seconds: u64 },

    #[error("{message}")]
    Unsupported { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn external(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::ExternalOperation {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(
            OrchestratorError::not_found("inference server", "abc").to_string(),
            "inference server abc not found"
        );
        assert_eq!(
            OrchestratorError::external("stop container", "socket closed").to_string(),
            "stop container failed: socket closed"
        );
        assert_eq!(
            OrchestratorError::TimeoutExceeded {
                operation: "waiting for container".to_string(),
                seconds: 3600
            }
            .to_string(),
            "waiting for container timed out after 3600s"
        );
    }
}
