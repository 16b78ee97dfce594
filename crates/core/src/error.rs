//! Error types for SnapGrid

use thiserror::Error;

/// Result type alias using the SnapGrid error
pub type GridResult<T> = std::result::Result<T, GridError>;

/// SnapGrid error types
#[derive(Error, Debug)]
pub enum GridError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Failed uploading image: {0}")]
    UploadFailed(String),

    #[error("Match window failed: {0}")]
    MatchFailed(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Render timeout for step {step_id} (render {render_id})")]
    RenderTimeout { step_id: String, render_id: String },

    #[error("Timeout in start session after {waited_ms} ms of server backpressure")]
    OpenTimeout { waited_ms: u64 },

    #[error("Failed closing test: {0}")]
    CloseFailed(String),

    #[error("Failed downloading {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Failed parsing {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Test {0} never opened")]
    NeverOpened(String),

    #[error("Test {test_id} failed: {reason}")]
    TestFailed { test_id: String, reason: String },

    #[error("Execution crashed: {0}")]
    ExecutionCrashed(String),

    #[error("Unknown test: {0}")]
    UnknownTest(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GridError {
    /// Errors that describe a broken scheduler rather than a single failed operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::ExecutionCrashed(_)
                | GridError::UnknownTest(_)
                | GridError::UnknownStep(_)
                | GridError::InvalidStateTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GridError::UnknownTest("t".into()).is_fatal());
        assert!(!GridError::MatchFailed("boom".into()).is_fatal());
        assert!(!GridError::NeverOpened("t".into()).is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = GridError::InvalidStateTransition {
            from: "closed".into(),
            to: "open".into(),
        };
        assert_eq!(err.to_string(), "Invalid state transition: closed -> open");
    }
}
