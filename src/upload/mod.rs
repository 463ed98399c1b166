//! Local `.txt` file selection

use crate::pipeline::UploadedFile;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// The only accepted file name suffix
pub const ACCEPTED_SUFFIX: &str = ".txt";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Only .txt files are supported (got {0})")]
    UnsupportedExtension(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// True if the file name ends in `.txt`, ignoring case
pub fn is_accepted(name: &str) -> bool {
    name.len() >= ACCEPTED_SUFFIX.len()
        && name.is_char_boundary(name.len() - ACCEPTED_SUFFIX.len())
        && name[name.len() - ACCEPTED_SUFFIX.len()..].eq_ignore_ascii_case(ACCEPTED_SUFFIX)
}

impl UploadedFile {
    /// Read a `.txt` file in full. Other extensions are refused before any IO.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if !is_accepted(&name) {
            return Err(UploadError::UnsupportedExtension(name));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| UploadError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!(file = %name, chars = content.chars().count(), "Loaded upload");
        Ok(Self { name, content })
    }
}
