use thiserror::Error;

/// Failures talking to the completion service.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("completion service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response from completion service: {body}")]
    Malformed { body: String },

    #[error("completion request failed: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error("Failed to generate SQL: {0}")]
    Upstream(#[from] UpstreamError),

    /// Rejected input. `sql` echoes the offending statement back to the caller.
    #[error("{message}")]
    Validation { message: String, sql: Option<String> },

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Schema introspection failed: {0}")]
    Schema(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            sql: None,
        }
    }

    pub fn rejected_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// HTTP status for the error class: rejections are the caller's to fix, everything
    /// else is a server-side failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation { .. } => 400,
            _ => 500,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Validation { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(UpstreamError::Transport(err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
