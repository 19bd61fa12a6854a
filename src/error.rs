use thiserror::Error;

use crate::cipher::CryptoError;
use crate::runtime::RuntimeError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("No workers available")]
    NoWorkersAvailable,

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
