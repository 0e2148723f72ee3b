//! Byte sources for uploaded files.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::error::PipelineError;

pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the byte stream behind a file's storage location.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, location: &str) -> Result<SourceReader, PipelineError>;
}

/// Reads uploads from the local filesystem. Relative locations resolve
/// against `root` and may not climb out of it.
#[derive(Debug, Clone, Default)]
pub struct FsSourceProvider {
    root: Option<PathBuf>,
}

impl FsSourceProvider {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, PipelineError> {
        let path = Path::new(location);
        match &self.root {
            Some(root) if path.is_relative() => {
                if path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
                {
                    return Err(PipelineError::Source {
                        location: location.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "location escapes the storage root",
                        ),
                    });
                }
                Ok(root.join(path))
            }
            _ => Ok(path.to_path_buf()),
        }
    }
}

#[async_trait]
impl SourceProvider for FsSourceProvider {
    async fn open(&self, location: &str) -> Result<SourceReader, PipelineError> {
        let path = self.resolve(location)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| PipelineError::Source {
                location: location.to_string(),
                source: e,
            })?;
        Ok(Box::new(file))
    }
}

/// In-memory uploads keyed by location.
#[derive(Debug, Default)]
pub struct MemorySourceProvider {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: &str, content: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(location.to_string(), content.into());
        }
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn open(&self, location: &str) -> Result<SourceReader, PipelineError> {
        let content = self
            .files
            .read()
            .ok()
            .and_then(|files| files.get(location).cloned())
            .ok_or_else(|| PipelineError::Source {
                location: location.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such upload"),
            })?;
        Ok(Box::new(Cursor::new(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fs_provider_reads_under_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "data;kg\n").unwrap();
        let provider = FsSourceProvider::new(Some(dir.path().to_path_buf()));

        let mut reader = provider.open("a.csv").await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "data;kg\n");
    }

    #[tokio::test]
    async fn test_fs_provider_rejects_parent_components() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = FsSourceProvider::new(Some(dir.path().to_path_buf()));
        let err = provider.open("../etc/passwd").await.err().unwrap();
        assert!(matches!(err, PipelineError::Source { .. }));
    }

    #[tokio::test]
    async fn test_missing_upload_is_not_found() {
        let provider = MemorySourceProvider::new();
        match provider.open("nope.csv").await {
            Err(PipelineError::Source { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            _ => panic!("expected a source error"),
        }
    }
}
