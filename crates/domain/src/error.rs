/// Shared error type used across all Maestro crates.
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

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("state store: {0}")]
    Store(String),

    #[error("document store: {0}")]
    DocStore(String),

    #[error("worker {worker}: {message}")]
    Worker { worker: String, message: String },

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("thread busy: {0}")]
    ThreadBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no such method: {0}")]
    MethodNotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
