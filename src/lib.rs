pub mod integration;
pub mod llm;
pub mod scene;
pub mod stream;
pub mod tools;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StagehandError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Mutation error: {0}")]
    MutationError(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Stale write: {0}")]
    StaleWrite(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for StagehandError {
    fn from(e: std::io::Error) -> Self {
        StagehandError::IOError(e.to_string())
    }
}

impl From<stream::JsonStreamError> for StagehandError {
    fn from(e: stream::JsonStreamError) -> Self {
        StagehandError::ParseError(e.to_string())
    }
}

impl From<scene::MarkupError> for StagehandError {
    fn from(e: scene::MarkupError) -> Self {
        StagehandError::ParseError(e.to_string())
    }
}

impl From<tools::MutationError> for StagehandError {
    fn from(e: tools::MutationError) -> Self {
        StagehandError::MutationError(e.to_string())
    }
}

impl From<tools::ToolError> for StagehandError {
    fn from(e: tools::ToolError) -> Self {
        StagehandError::ToolError(e.to_string())
    }
}

impl StagehandError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // The next trigger retries the queued backlog
            StagehandError::TransportError(_) => true,
            StagehandError::ParseError(_) => true,
            StagehandError::MutationError(_) => true,
            StagehandError::Cancelled => true,
            StagehandError::ToolError(_) => true,
            StagehandError::StaleWrite(_) => true,
            StagehandError::IOError(_) => false,
            StagehandError::ConfigError(_) => false,
            StagehandError::ChannelError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            StagehandError::TransportError(_) => {
                "The model request failed. Your input is kept and will be retried.".to_string()
            }
            StagehandError::ParseError(_) => {
                "The model returned malformed output. Please try again.".to_string()
            }
            StagehandError::MutationError(_) => {
                "The scene edit could not be applied. The scene is unchanged.".to_string()
            }
            StagehandError::Cancelled => "The request was superseded.".to_string(),
            StagehandError::ToolError(_) => {
                "The model used a tool incorrectly. The scene is unchanged.".to_string()
            }
            StagehandError::StaleWrite(_) => {
                "The scene changed while the request was running. Please try again.".to_string()
            }
            StagehandError::IOError(_) => "File system error occurred.".to_string(),
            StagehandError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            StagehandError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StagehandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(StagehandError::TransportError("reset".into()).is_recoverable());
        assert!(StagehandError::Cancelled.is_recoverable());
        assert!(!StagehandError::ConfigError("bad".into()).is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StagehandError = io.into();
        assert!(matches!(err, StagehandError::IOError(_)));
        assert!(!err.user_message().is_empty());
    }
}
