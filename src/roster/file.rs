//! Local file roster source: one application id per line.

use super::{FetchError, RosterSource};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Reads the roster from a newline-delimited file.
#[derive(Debug, Clone)]
pub struct FileRosterSource {
    path: PathBuf,
}

impl FileRosterSource {
    /// Create a source for the given file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RosterSource for FileRosterSource {
    async fn fetch(&self) -> Result<Vec<String>, FetchError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FetchError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(FetchError::Other(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}
