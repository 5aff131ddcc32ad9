use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Cannot read document {}: {source}", .path.display())]
pub struct DocumentReadError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// Text of every uploaded document, concatenated with per-file headers.
///
/// PDF text extraction happens upstream; this only assembles its output
/// into the single blob the extraction prompt expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBundle {
    pub text: String,
    /// File names in processing order.
    pub filenames: Vec<String>,
}

impl DocumentBundle {
    /// Build a bundle from `(filename, text)` pairs.
    pub fn from_texts<I, N, T>(documents: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: AsRef<str>,
    {
        let mut bundle = Self::default();
        for (name, text) in documents {
            bundle.push(name, text.as_ref());
        }
        bundle
    }

    /// Read already-extracted text files, one document per file.
    pub fn from_text_files(paths: &[impl AsRef<Path>]) -> Result<Self, DocumentReadError> {
        let mut bundle = Self::default();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|source| DocumentReadError {
                path: path.to_path_buf(),
                source,
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            bundle.push(name, &text);
        }
        Ok(bundle)
    }

    pub fn push(&mut self, name: impl Into<String>, text: &str) {
        let name = name.into();
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        self.text.push_str(&format!("### FILE: {name}\n{}", text.trim()));
        self.filenames.push(name);
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }
}
