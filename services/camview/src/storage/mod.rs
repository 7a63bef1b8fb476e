//! Storage for published web artifacts.
//!
//! [`WebStorage`] is the switch every publishing component talks to. It is
//! resolved once at startup into one of a closed set of backends: the local
//! filesystem or an S3-compatible object store. Paths handed to it use `/`
//! separators and are joined with [`path_join`] semantics on both backends.

pub mod local;
pub mod s3;

use crate::config::S3Config;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Errors surfaced by the storage switch and its backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Web storage has not been initialized")]
    NotInitialized,

    #[error("Unrecognized web storage backend: {0}")]
    BackendUnrecognized(String),

    #[error("Web storage I/O error: {0}")]
    Io(String),

    #[error("Object store request failed: {0}")]
    Remote(String),
}

impl StorageError {
    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        StorageError::Io(format!("{}: {}", context, err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Closed set of storage backends selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    RemoteObjectStore,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "remote_object_store" | "s3" => Ok(BackendKind::RemoteObjectStore),
            other => Err(StorageError::BackendUnrecognized(other.to_string())),
        }
    }
}

/// A resolved backend.
pub enum Backend {
    Local(LocalStorage),
    RemoteObjectStore(S3Storage),
}

/// Storage switch. Every operation fails with
/// [`StorageError::NotInitialized`] until a backend is installed.
#[derive(Default)]
pub struct WebStorage {
    backend: Option<Backend>,
}

impl WebStorage {
    /// An uninitialized switch.
    pub fn new() -> Self {
        Self { backend: None }
    }

    /// A switch already pointing at `backend`.
    pub fn with_backend(backend: Backend) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Resolve `backend_name` and install the matching backend.
    pub async fn initialize(&mut self, backend_name: &str, s3: &S3Config) -> StorageResult<()> {
        let backend = match backend_name.parse::<BackendKind>()? {
            BackendKind::Local => Backend::Local(LocalStorage::new()),
            BackendKind::RemoteObjectStore => Backend::RemoteObjectStore(S3Storage::new(s3).await?),
        };
        self.backend = Some(backend);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    pub fn kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| match b {
            Backend::Local(_) => BackendKind::Local,
            Backend::RemoteObjectStore(_) => BackendKind::RemoteObjectStore,
        })
    }

    fn backend(&self) -> StorageResult<&Backend> {
        self.backend.as_ref().ok_or(StorageError::NotInitialized)
    }

    /// Names of the entries directly under `path`. An empty path is an error.
    pub async fn listdir(&self, path: &str) -> StorageResult<Vec<String>> {
        match self.backend()? {
            Backend::Local(b) => b.listdir(path).await,
            Backend::RemoteObjectStore(b) => b.listdir(path).await,
        }
    }

    /// Create a directory; no-op if it already exists.
    pub async fn mkdir(&self, path: &str) -> StorageResult<()> {
        match self.backend()? {
            Backend::Local(b) => b.mkdir(path).await,
            Backend::RemoteObjectStore(b) => b.mkdir(path).await,
        }
    }

    /// Move a local file into web storage. Both paths name files.
    pub async fn move_to_web(&self, src: &Path, dest: &str) -> StorageResult<()> {
        match self.backend()? {
            Backend::Local(b) => b.move_to_web(src, dest).await,
            Backend::RemoteObjectStore(b) => b.move_to_web(src, dest).await,
        }
    }

    pub async fn path_is_file(&self, path: &str) -> StorageResult<bool> {
        match self.backend()? {
            Backend::Local(b) => b.path_is_file(path).await,
            Backend::RemoteObjectStore(b) => b.path_is_file(path).await,
        }
    }

    /// Join path segments for the active backend.
    pub fn path_join(&self, segments: &[&str]) -> StorageResult<String> {
        self.backend()?;
        Ok(path_join(segments))
    }

    /// Delete the tree rooted at `path`; absent paths are not an error.
    /// Returns whether anything was removed.
    pub async fn rmtree(&self, path: &str) -> StorageResult<bool> {
        match self.backend()? {
            Backend::Local(b) => b.rmtree(path).await,
            Backend::RemoteObjectStore(b) => b.rmtree(path).await,
        }
    }

    /// Delete a single published file; absent files are not an error.
    pub async fn remove_file(&self, path: &str) -> StorageResult<()> {
        match self.backend()? {
            Backend::Local(b) => b.remove_file(path).await,
            Backend::RemoteObjectStore(b) => b.remove_file(path).await,
        }
    }
}

/// Unix-style path join.
///
/// A segment starting with `/` replaces everything before it, empty segments
/// add nothing except that a trailing empty segment leaves a trailing `/`.
pub fn path_join(segments: &[&str]) -> String {
    let mut path = String::new();

    for segment in segments {
        if segment.starts_with('/') {
            path = (*segment).to_string();
            continue;
        }
        if path.is_empty() {
            path = (*segment).to_string();
        } else if path.ends_with('/') {
            path.push_str(segment);
        } else {
            path.push('/');
            path.push_str(segment);
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(
            "remote_object_store".parse::<BackendKind>().unwrap(),
            BackendKind::RemoteObjectStore
        );
        assert!(matches!(
            "wbfs_s3".parse::<BackendKind>(),
            Err(StorageError::BackendUnrecognized(name)) if name == "wbfs_s3"
        ));
    }

    #[test]
    fn test_path_join() {
        assert_eq!(path_join(&["abc", "", "def"]), "abc/def");
        assert_eq!(path_join(&["abc", "/def", "ghi"]), "/def/ghi");
        assert_eq!(path_join(&["abc/", "def"]), "abc/def");
        assert_eq!(path_join(&["abc", ""]), "abc/");
        assert_eq!(path_join(&["", "abc"]), "abc");
        assert_eq!(path_join(&["/"]), "/");
        assert_eq!(path_join(&["/", "2013-07-01", "camera1"]), "/2013-07-01/camera1");
    }

    #[tokio::test]
    async fn test_uninitialized_switch() {
        let storage = WebStorage::new();
        assert!(!storage.is_initialized());
        assert!(matches!(
            storage.mkdir("foo").await,
            Err(StorageError::NotInitialized)
        ));
        assert!(matches!(
            storage.listdir("/").await,
            Err(StorageError::NotInitialized)
        ));
        assert!(matches!(
            storage.path_join(&["a", "b"]),
            Err(StorageError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_initialize_rejects_unknown_backend() {
        let mut storage = WebStorage::new();
        let result = storage.initialize("wbfs_s3", &S3Config::default()).await;
        assert!(matches!(result, Err(StorageError::BackendUnrecognized(_))));
        assert!(!storage.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_local() {
        let mut storage = WebStorage::new();
        storage
            .initialize("local", &S3Config::default())
            .await
            .unwrap();
        assert_eq!(storage.kind(), Some(BackendKind::Local));
        assert_eq!(storage.path_join(&["a", "b"]).unwrap(), "a/b");
    }
}
