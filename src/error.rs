use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn executor: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("executor exited with status {code:?}")]
    ExecutorFailed { code: Option<i32> },

    #[error("malformed executor response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
