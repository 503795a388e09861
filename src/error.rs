use thiserror::Error;

/// Errors raised by a single call to the upstream search endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited (429)")]
    RateLimited,

    #[error("forbidden (403)")]
    Forbidden,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body was not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Maps an upstream HTTP status code to the taxonomy above.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ApiError::RateLimited,
            403 => ApiError::Forbidden,
            other => ApiError::Status(other),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(e) if e.is_timeout() || e.is_connect())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("browser credential capture failed: {0}")]
    CapturationFailed(String),

    #[error("signing error: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("task record was not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("timed out waiting for a rate limit token")]
    Timeout,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}
