use crate::BugId;
use thiserror::Error;

/// Errors raised while turning a request into a job matrix. All of them are
/// fatal for the run and are reported before any job is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("invalid bug selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("unknown bug id {0}")]
    UnknownBug(BugId),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid tool name '{name}': {reason}")]
    InvalidToolName { name: String, reason: String },

    #[error("unknown benchmark '{0}'")]
    UnknownBenchmark(String),

    #[error("run count must be at least 1")]
    InvalidRunCount,

    #[error("at least one tool is required")]
    NoTools,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate outcome for job key {0}")]
    DuplicateKey(String),

    #[error("corrupt outcome record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("result store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("result store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure of the isolated environment itself, as opposed to the tool
/// running inside it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("environment creation failed: {0}")]
    Create(String),

    #[error("bug checkout failed: {0}")]
    Checkout(String),

    #[error("command execution failed: {0}")]
    Exec(String),

    #[error("environment teardown failed: {0}")]
    Teardown(String),

    #[error("job inputs unavailable: {0}")]
    Inputs(String),
}
