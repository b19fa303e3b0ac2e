//! Error types for the Ragdesk client

use thiserror::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the calling layer.
///
/// Citation payload decode failures and citation-info lookup failures are
/// recovered where they happen and never show up here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unauthorized - Please log in again")]
    Unauthorized,

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// HTTP-equivalent status used when reporting the error to the user
    pub fn status(&self) -> u16 {
        match self {
            Error::Unauthorized => 401,
            Error::Api { status, .. } => *status,
            Error::InvalidInput(_) => 400,
            _ => 500,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
