//! Shared error type used across all Tarsy crates.
//!
//! The variants map one-to-one onto the error kinds the engine distinguishes:
//! validation failures, duplicate alerts, queue admission, missing entities,
//! store outages, transport problems and provider failures. HTTP status
//! mapping happens at the gateway boundary, not here.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("duplicate alert: {0}")]
    DuplicateAlert(String),

    #[error("queue full: {queue_size}/{max_queue_size}")]
    QueueFull {
        queue_size: usize,
        max_queue_size: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("LLM provider {provider}: {message}")]
    Llm { provider: String, message: String },

    #[error("MCP: {0}")]
    Mcp(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient errors are worth retrying once at the repository wrapper.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
