use serde_json::{Map, Value};

use super::ExtractionError;

/// Raw per-key model output for one batch: `field key -> untrusted JSON`.
pub type RawExtraction = Map<String, Value>;

/// A document handed to the model alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Read an attachment from disk, keeping only the file name.
    pub fn from_path(path: &std::path::Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { filename, bytes })
    }

    /// MIME type inferred from the file extension.
    pub fn mime_type(&self) -> &'static str {
        mime_guess::from_path(&self.filename)
            .first_raw()
            .unwrap_or("application/octet-stream")
    }
}

/// One model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub attachments: &'a [Attachment],
    /// 0.0 for deterministic extraction.
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Ask the backend for machine-parseable JSON output.
    pub json_mode: bool,
}

/// Language model abstraction (allows mocking).
///
/// Given a prompt and optional attachments, return the raw response text.
pub trait LlmClient: Send + Sync {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ExtractionError>;
}
