use thiserror::Error;

/// Workspace-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A required setting or credential is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient provider failure; eligible for retry.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Terminal provider failure for the current call.
    #[error("provider error: {0}")]
    Provider(String),

    /// The memory database could not be opened or a query failed.
    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const RATE_LIMIT_MARKERS: [&str; 4] = ["429", "ratelimit_exceeded", "quota", "rate limit"];

impl Error {
    /// Whether this error should be treated as a transient rate-limit failure.
    ///
    /// Providers that know the HTTP status report `RateLimited` directly; other
    /// errors are classified by the markers remote backends put in their messages.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::Provider(message) => {
                let lower = message.to_ascii_lowercase();
                RATE_LIMIT_MARKERS
                    .iter()
                    .any(|marker| lower.contains(marker))
            }
            _ => false,
        }
    }
}
