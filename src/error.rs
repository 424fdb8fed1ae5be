/// Failures reported by the upstream language model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Upstream model is rate limited: {0}")]
    RateLimited(String),
    #[error("Upstream model request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response from upstream model: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("record"),
            e => Error::Database(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Fatal(e.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
