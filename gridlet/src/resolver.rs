//! Backing-location resolution channel.
//!
//! The external collaborator (the master, or a promoted-object store) owns the
//! authoritative content for pending objects. This core only issues
//! open/close/delete calls and blocks for the reply; the collaborator's own
//! wire format is out of scope. `FileResolver` is the in-process
//! implementation used when backing locations are plain local files.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Outcome of resolving a backing location.
///
/// `Absent` signals "no result": the producing task was skipped or cancelled
/// and never materialized its output.
#[derive(Debug)]
pub enum Resolution {
    Content(Vec<u8>),
    Absent,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to open backing location {location}: {source}")]
    Open {
        location: String,
        source: std::io::Error,
    },

    #[error("failed to delete backing location {location}: {source}")]
    Delete {
        location: String,
        source: std::io::Error,
    },
}

/// Resolution channel to the owner of backing content.
#[async_trait]
pub trait BackingResolver: Send + Sync {
    async fn open(&self, location: &str, mode: AccessMode) -> Result<Resolution, ResolveError>;
    async fn close(&self, location: &str, mode: AccessMode) -> Result<(), ResolveError>;
    async fn delete(&self, location: &str) -> Result<(), ResolveError>;
}

/// Resolver for backing locations that are local file paths.
///
/// A missing file maps to `Resolution::Absent` (the producer never wrote its
/// output); any other I/O failure is a `ResolveError`.
pub struct FileResolver {
    root: Option<PathBuf>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Resolve relative locations under `root` instead of the process cwd.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve_path(&self, location: &str) -> PathBuf {
        match &self.root {
            Some(root) if !location.starts_with('/') => root.join(location),
            _ => PathBuf::from(location),
        }
    }
}

impl Default for FileResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingResolver for FileResolver {
    async fn open(&self, location: &str, _mode: AccessMode) -> Result<Resolution, ResolveError> {
        let path = self.resolve_path(location);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Resolution::Content(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(location, "backing location absent");
                Ok(Resolution::Absent)
            }
            Err(e) => Err(ResolveError::Open {
                location: location.to_string(),
                source: e,
            }),
        }
    }

    async fn close(&self, _location: &str, _mode: AccessMode) -> Result<(), ResolveError> {
        // Local files have no open-handle bookkeeping on the collaborator side.
        Ok(())
    }

    async fn delete(&self, location: &str) -> Result<(), ResolveError> {
        let path = self.resolve_path(location);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResolveError::Delete {
                location: location.to_string(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.json");
        std::fs::write(&path, b"[1,2]").unwrap();

        let resolver = FileResolver::new();
        let res = resolver
            .open(path.to_str().unwrap(), AccessMode::Read)
            .await
            .unwrap();
        match res {
            Resolution::Content(bytes) => assert_eq!(bytes, b"[1,2]"),
            Resolution::Absent => panic!("expected content"),
        }
    }

    #[tokio::test]
    async fn open_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-written.json");

        let resolver = FileResolver::new();
        let res = resolver
            .open(path.to_str().unwrap(), AccessMode::Read)
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Absent));
    }

    #[tokio::test]
    async fn rooted_resolver_joins_relative_locations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rel.bin"), b"x").unwrap();

        let resolver = FileResolver::rooted(dir.path());
        let res = resolver.open("rel.bin", AccessMode::Read).await.unwrap();
        assert!(matches!(res, Resolution::Content(b) if b == b"x"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        std::fs::write(&path, b"x").unwrap();

        let resolver = FileResolver::new();
        resolver.delete(path.to_str().unwrap()).await.unwrap();
        resolver.delete(path.to_str().unwrap()).await.unwrap();
        assert!(!path.exists());
    }
}
