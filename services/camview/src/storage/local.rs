//! Local filesystem web storage.

use super::{StorageError, StorageResult};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, instrument};

/// Publishes into a directory served by a local web server.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }

    pub async fn listdir(&self, path: &str) -> StorageResult<Vec<String>> {
        if path.is_empty() {
            return Err(StorageError::Io("Empty path not allowed".to_string()));
        }

        let mut entries = fs::read_dir(path)
            .await
            .map_err(|e| StorageError::io(format!("listdir {}", path), e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(format!("listdir {}", path), e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        Ok(names)
    }

    pub async fn mkdir(&self, path: &str) -> StorageResult<()> {
        match fs::create_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StorageError::io(format!("mkdir {}", path), e)),
        }
    }

    #[instrument(skip(self), fields(src = %src.display()))]
    pub async fn move_to_web(&self, src: &Path, dest: &str) -> StorageResult<()> {
        let src_meta = match fs::metadata(src).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                return Err(StorageError::Io(format!(
                    "Source path must be a regular file: {}",
                    src.display()
                )))
            }
        };

        if fs::metadata(dest).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StorageError::Io(format!(
                "Destination path must not be a directory: {}",
                dest
            )));
        }

        let copied = fs::copy(src, dest)
            .await
            .map_err(|e| StorageError::io(format!("copy {} to {}", src.display(), dest), e))?;

        if copied != src_meta.len() {
            // leave nothing half-written behind
            let _ = fs::remove_file(dest).await;
            return Err(StorageError::Io(format!(
                "move_to_web(): {} to {} attempted {} bytes but only transferred {}",
                src.display(),
                dest,
                src_meta.len(),
                copied
            )));
        }

        fs::remove_file(src)
            .await
            .map_err(|e| StorageError::io(format!("remove {}", src.display()), e))?;

        debug!(dest = %dest, bytes = copied, "Moved file to web storage");
        Ok(())
    }

    pub async fn path_is_file(&self, path: &str) -> StorageResult<bool> {
        Ok(fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    /// Returns whether a directory was actually removed.
    pub async fn rmtree(&self, path: &str) -> StorageResult<bool> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(path)
                    .await
                    .map_err(|e| StorageError::io(format!("rmtree {}", path), e))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn remove_file(&self, path: &str) -> StorageResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(format!("remove {}", path), e)),
        }
    }
}
