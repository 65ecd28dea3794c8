use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_path, BlobStore, RemoteError};

/// Hub émulé sur un répertoire local : `<root>/<bucket>/<path>`.
///
/// Utilisé hors ligne et dans les tests ; se comporte comme le hub distant
/// (objets opaques, suppression idempotente).
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, RemoteError> {
        validate_path(bucket)?;
        validate_path(path)?;
        let mut full = self.root.join(bucket);
        for segment in path.split('/') {
            full.push(segment);
        }
        Ok(full)
    }
}

#[async_trait]
impl BlobStore for DirectoryStore {
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let full = self.object_path(bucket, path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::Io(format!("Failed to read {}: {}", full.display(), e))),
        }
    }

    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        let full = self.object_path(bucket, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::Io(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| RemoteError::Io(format!("Failed to write {}: {}", full.display(), e)))
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), RemoteError> {
        let full = self.object_path(bucket, path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::Io(format!("Failed to delete {}: {}", full.display(), e))),
        }
    }

    async fn list(&self, bucket: &str) -> Result<Vec<String>, RemoteError> {
        validate_path(bucket)?;
        let bucket_root = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![bucket_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(RemoteError::Io(format!(
                        "Failed to list {}: {}",
                        dir.display(),
                        e
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RemoteError::Io(format!("Failed to list {}: {}", dir.display(), e)))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| RemoteError::Io(e.to_string()))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&bucket_root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
