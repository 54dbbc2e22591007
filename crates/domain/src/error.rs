/// Shared error type used across all RELAY crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend is not running")]
    NotRunning,

    #[error("backend is busy with another turn")]
    Busy,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("turn error: {0}")]
    TurnError(String),

    #[error("child exited (code {code:?}): {stderr_tail}")]
    ChildExited {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("turn cancelled")]
    Cancelled,

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("config: {0}")]
    Config(String),

    #[error("frontend: {0}")]
    Frontend(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
