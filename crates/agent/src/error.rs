//! Errors raised by pipeline stages.

use quarry_core::error::{ProviderError, StorageError};
use thiserror::Error;

use crate::extract::ExtractError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to generate valid query after {0} attempts")]
    Exhausted(usize),
}

impl From<ExtractError> for AgentError {
    fn from(e: ExtractError) -> Self {
        Self::MalformedOutput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_attempts() {
        assert_eq!(
            AgentError::Exhausted(10).to_string(),
            "Failed to generate valid query after 10 attempts"
        );
    }

    #[test]
    fn extract_errors_become_malformed_output() {
        let err: AgentError = ExtractError::NotFound.into();
        assert!(matches!(err, AgentError::MalformedOutput(_)));
    }
}
