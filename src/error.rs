use thiserror::Error;

/// Fatal, caller-visible errors. `Restart` (optimistic validation failure) is
/// deliberately **not** a variant here — it is local control flow handled
/// inside latch-coupling retry loops and never surfaces (see `latch::Restart`).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("key already exists")]
    KeyExists,

    #[error("execution error: {0}")]
    Execution(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
