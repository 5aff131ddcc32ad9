pub mod types;
pub mod prompt;
pub mod parser;
pub mod gemini;
pub mod client;

pub use types::*;
pub use prompt::*;
pub use parser::*;
pub use gemini::*;
pub use client::*;

use thiserror::Error;

use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Model backend is not configured: {0}")]
    MissingCredentials(String),

    #[error("Model backend is unreachable at {0}")]
    Connection(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Model backend returned error (status {status}): {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed model output: {message}")]
    Malformed { message: String, raw_excerpt: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Extraction cancelled")]
    Cancelled,
}

impl ExtractionError {
    /// Configuration or transport failure calling the model.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials(_)
                | Self::Connection(_)
                | Self::HttpClient(_)
                | Self::Backend { .. }
        )
    }

    /// The model answered but its output could not be parsed, even after repair.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Failures the batching controller absorbs by bisecting.
    pub fn is_recoverable(&self) -> bool {
        self.is_unavailable() || self.is_malformed()
    }
}
