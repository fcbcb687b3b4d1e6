//! Export destinations for finished downloads
//! Local directories are written directly; sandboxed targets go through object_store

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{ObjectStore, PutPayload, local::LocalFileSystem, path::Path as StoragePath};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("permission denied for {target}: {reason}")]
    PermissionDenied { target: String, reason: String },

    #[error("destination unavailable: {0}")]
    MissingDestination(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error: {0}")]
    ObjectStore(object_store::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return StorageError::PermissionDenied {
                target: path.display().to_string(),
                reason: source.to_string(),
            };
        }
        StorageError::Io { path, source }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, StorageError::PermissionDenied { .. })
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::PermissionDenied { path, source }
            | object_store::Error::Unauthenticated { path, source } => {
                StorageError::PermissionDenied {
                    target: path,
                    reason: source.to_string(),
                }
            }
            other => StorageError::ObjectStore(other),
        }
    }
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Progress callback for block-wise imports: (bytes copied, total bytes)
pub type ImportProgress<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Where finished files end up
#[async_trait]
pub trait Destination: Send + Sync {
    /// Human-readable target, used in logs and error messages
    fn describe(&self) -> String;

    /// Whether staged files must be copied block by block instead of moved
    fn requires_block_copy(&self) -> bool;

    async fn has_permission(&self) -> bool;

    /// Store a fully buffered payload, returning the final location
    async fn write(&self, filename: &str, data: Bytes) -> Result<String>;

    /// Move a staged file into the destination, returning the final location
    async fn import(
        &self,
        staging: &Path,
        filename: &str,
        progress: ImportProgress<'_>,
    ) -> Result<String>;
}

/// Directory on the local filesystem, created on demand
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn prepare(&self) -> Result<()> {
        match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                StorageError::MissingDestination(self.root.display().to_string()),
            ),
            Err(e) => Err(StorageError::io(&self.root, e)),
        }
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn requires_block_copy(&self) -> bool {
        false
    }

    async fn has_permission(&self) -> bool {
        if self.prepare().await.is_err() {
            return false;
        }
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    async fn write(&self, filename: &str, data: Bytes) -> Result<String> {
        self.prepare().await?;
        let target = self.root.join(filename);
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| StorageError::io(&target, e))?;

        tracing::info!(path = %target.display(), size = data.len(), "Saved download");
        Ok(target.display().to_string())
    }

    async fn import(
        &self,
        staging: &Path,
        filename: &str,
        progress: ImportProgress<'_>,
    ) -> Result<String> {
        self.prepare().await?;
        let target = self.root.join(filename);

        if let Err(e) = tokio::fs::rename(staging, &target).await {
            // Cross-device moves fail with EXDEV; fall back to copy and remove
            tracing::debug!(error = %e, "Rename failed, copying instead");
            tokio::fs::copy(staging, &target)
                .await
                .map_err(|e| StorageError::io(&target, e))?;
            tokio::fs::remove_file(staging)
                .await
                .map_err(|e| StorageError::io(staging, e))?;
        }

        let size = tokio::fs::metadata(&target)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        progress(size, size);

        tracing::info!(path = %target.display(), size, "Moved download into place");
        Ok(target.display().to_string())
    }
}

/// Destination backed by any object_store implementation
#[derive(Clone)]
pub struct ObjectStoreDestination {
    store: Arc<dyn ObjectStore>,
    label: String,
    prefix: StoragePath,
    block_size: usize,
}

impl ObjectStoreDestination {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        label: impl Into<String>,
        prefix: &str,
        block_size: usize,
    ) -> Self {
        Self {
            store,
            label: label.into(),
            prefix: StoragePath::from(prefix),
            block_size: block_size.max(1),
        }
    }

    /// Sandboxed view of a local directory
    pub fn local(root: &Path, block_size: usize) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| StorageError::io(root, e))?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(
            Arc::new(store),
            root.display().to_string(),
            "",
            block_size,
        ))
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory(block_size: usize) -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            "memory:/",
            "",
            block_size,
        )
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    fn location(&self, filename: &str) -> StoragePath {
        self.prefix.child(filename)
    }

    fn display(&self, location: &StoragePath) -> String {
        format!("{}/{}", self.label.trim_end_matches('/'), location)
    }

    async fn copy_blocks(
        &self,
        staging: &Path,
        location: &StoragePath,
        progress: ImportProgress<'_>,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(staging)
            .await
            .map_err(|e| StorageError::io(staging, e))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(staging, e))?
            .len();

        let mut upload = self.store.put_multipart(location).await?;
        let mut copied = 0u64;
        let mut block = vec![0u8; self.block_size];

        loop {
            let filled = match read_block(&mut file, &mut block).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(StorageError::io(staging, e));
                }
            };
            if filled == 0 {
                break;
            }

            let payload = PutPayload::from(Bytes::copy_from_slice(&block[..filled]));
            if let Err(e) = upload.put_part(payload).await {
                let _ = upload.abort().await;
                return Err(e.into());
            }

            copied += filled as u64;
            progress(copied, total);
        }

        upload.complete().await?;
        Ok(copied)
    }
}

/// Fill `block` from `file`, returning fewer bytes only at end of file
async fn read_block(file: &mut tokio::fs::File, block: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        let n = file.read(&mut block[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl Destination for ObjectStoreDestination {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn requires_block_copy(&self) -> bool {
        true
    }

    async fn has_permission(&self) -> bool {
        let marker = self.location(".mediafetch-write-check");
        match self.store.put(&marker, PutPayload::from_static(b"ok")).await {
            Ok(_) => {
                let _ = self.store.delete(&marker).await;
                true
            }
            Err(e) => {
                tracing::warn!(target_store = %self.label, error = %e, "Destination not writable");
                false
            }
        }
    }

    async fn write(&self, filename: &str, data: Bytes) -> Result<String> {
        let location = self.location(filename);
        let size = data.len();
        self.store.put(&location, data.into()).await?;

        tracing::info!(key = %location, size, "Uploaded download");
        Ok(self.display(&location))
    }

    async fn import(
        &self,
        staging: &Path,
        filename: &str,
        progress: ImportProgress<'_>,
    ) -> Result<String> {
        let location = self.location(filename);
        let copied = self.copy_blocks(staging, &location, progress).await?;

        tokio::fs::remove_file(staging)
            .await
            .map_err(|e| StorageError::io(staging, e))?;

        tracing::info!(key = %location, size = copied, "Copied download into sandbox");
        Ok(self.display(&location))
    }
}

/// Replace path separators, reserved and control characters
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{title}.{format}`, sanitized
pub fn default_filename(title: &str, format: &str) -> String {
    sanitize_filename(&format!("{}.{}", title.trim(), format.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c:d.mp3"), "a_b_c_d.mp3");
        assert_eq!(sanitize_filename("line\nbreak.mp4"), "line_break.mp4");
        assert_eq!(sanitize_filename("  ..  "), "download");
        assert_eq!(default_filename("My Song ", "mp3"), "My Song.mp3");
    }

    #[tokio::test]
    async fn test_local_write_creates_directory() {
        let temp = TempDir::new().unwrap();
        let dest = LocalDestination::new(temp.path().join("nested/out"));

        assert!(dest.has_permission().await);
        let path = dest.write("song.mp3", Bytes::from_static(b"abc")).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_local_import_moves_staging_file() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("job.part");
        std::fs::write(&staging, b"payload").unwrap();
        let dest = LocalDestination::new(temp.path().join("out"));

        let mut last = (0, 0);
        let path = dest
            .import(&staging, "video.mp4", &mut |done: u64, total: u64| last = (done, total))
            .await
            .unwrap();

        assert!(!staging.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert_eq!(last, (7, 7));
    }

    #[tokio::test]
    async fn test_object_store_import_copies_in_blocks() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("job.part");
        std::fs::write(&staging, vec![7u8; 10]).unwrap();
        let dest = ObjectStoreDestination::in_memory(4);

        let mut reports = Vec::new();
        let path = dest
            .import(&staging, "clip.mp4", &mut |done: u64, total: u64| reports.push((done, total)))
            .await
            .unwrap();

        assert_eq!(path, "memory:/clip.mp4");
        assert_eq!(reports, vec![(4, 10), (8, 10), (10, 10)]);
        assert!(!staging.exists());

        let stored = dest
            .store()
            .get(&StoragePath::from("clip.mp4"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.len(), 10);
    }

    #[tokio::test]
    async fn test_object_store_permission_check_leaves_no_trace() {
        let dest = ObjectStoreDestination::in_memory(1024);
        assert!(dest.has_permission().await);

        let marker = dest.store().head(&StoragePath::from(".mediafetch-write-check")).await;
        assert!(matches!(marker, Err(object_store::Error::NotFound { .. })));
    }

    #[test]
    fn test_permission_errors_are_classified() {
        let err = StorageError::io(
            "/locked",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(err.is_permission());
        assert!(err.to_string().starts_with("permission denied"));

        let err = StorageError::io("/x", std::io::Error::other("disk full"));
        assert!(!err.is_permission());
    }
}
