//! Errors raised while loading settings or parsing signaling messages.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file or signal message is not the JSON we expect.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value outside its documented range.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
