use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{CacheError, CacheKey};

/// Flat on-disk store mapping each key to one `{key}.jpg` file directly under the cache
/// root. The directory itself is the index; a file's existence is the entry.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the entry file for a key, re-checking confinement to the cache root.
    /// The digits-only key type already rules out traversal; this guards any future
    /// caller that constructs paths some other way.
    fn entry_path(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let name = key.file_name();
        if Path::new(&name).components().count() != 1 {
            return Err(CacheError::io(
                key,
                "resolve",
                std::io::Error::new(ErrorKind::InvalidInput, "entry name escapes cache root"),
            ));
        }
        let path = self.root.join(&name);
        debug_assert_eq!(path.parent(), Some(self.root.as_path()));
        Ok(path)
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Bytes, CacheError> {
        let path = self.entry_path(key)?;
        match async_fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(CacheError::io(key, "read", err)),
        }
    }

    /// Creates or replaces the entry for a key.
    ///
    /// The body is staged in a uniquely named temp file in the same directory and
    /// renamed into place, so a concurrent reader observes either the complete previous
    /// entry or the complete new one. An empty body is a valid zero-length entry.
    pub async fn put(&self, key: &CacheKey, body: &[u8]) -> Result<(), CacheError> {
        let final_path = self.entry_path(key)?;
        let temp_path = self.root.join(format!("tmp_{}", Uuid::new_v4()));

        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }

        let result = async {
            let mut file = options.open(&temp_path).await?;
            file.write_all(body).await?;
            file.flush().await?;
            drop(file);
            async_fs::rename(&temp_path, &final_path).await
        }
        .await;

        match result {
            Ok(()) => {
                trace!(key = %key, bytes = body.len(), "stored cache entry");
                Ok(())
            }
            Err(err) => {
                // Never leave a stale temp file behind a failed commit.
                async_fs::remove_file(&temp_path).await.ok();
                Err(CacheError::io(key, "write", err))
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => {
                trace!(key = %key, "removed cache entry");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(CacheError::io(key, "delete", err)),
        }
    }

    /// Sweeps `tmp_*` files left behind by an earlier crash. Run once before the
    /// listener starts accepting traffic.
    pub async fn remove_temp_files(&self) -> std::io::Result<()> {
        let mut entries = async_fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with("tmp_"))
                .unwrap_or(false);
            if is_temp && path.is_file() {
                debug!(path = %path.display(), "removing stale cache temp file");
                async_fs::remove_file(&path).await.ok();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ImageStore {
        ImageStore::new(dir.path().to_path_buf())
    }

    fn key(token: &str) -> CacheKey {
        CacheKey::resolve(&format!("/{token}"))
    }

    #[test]
    fn root_reports_the_configured_directory() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).root(), dir.path());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let k = key("200");

        store.put(&k, b"jpeg bytes").await.unwrap();
        let got = store.get(&k).await.unwrap();
        assert_eq!(&got[..], b"jpeg bytes");
        assert!(dir.path().join("200.jpg").is_file());
    }

    #[tokio::test]
    async fn empty_body_is_a_valid_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let k = key("204");

        store.put(&k, b"").await.unwrap();
        let got = store.get(&k).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_whole_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let k = key("301");

        store.put(&k, b"first version, quite long").await.unwrap();
        store.put(&k, b"second").await.unwrap();
        let got = store.get(&k).await.unwrap();
        assert_eq!(&got[..], b"second");
    }

    #[tokio::test]
    async fn get_missing_entry_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).get(&key("500")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_reports_not_found_on_second_call() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let k = key("410");

        store.put(&k, b"gone soon").await.unwrap();
        store.delete(&k).await.unwrap();
        let err = store.delete(&k).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&key("201"), b"payload").await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn temp_sweep_removes_only_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&key("200"), b"keep me").await.unwrap();
        fs::write(dir.path().join("tmp_deadbeef"), b"stale").unwrap();

        store.remove_temp_files().await.unwrap();

        assert!(!dir.path().join("tmp_deadbeef").exists());
        assert!(dir.path().join("200.jpg").exists());
    }

    #[tokio::test]
    async fn concurrent_puts_never_expose_a_torn_entry() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));
        let k = key("503");

        let bodies: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 4096]).collect();
        let mut tasks = Vec::new();
        for body in bodies.clone() {
            let store = store.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move { store.put(&k, &body).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let got = store.get(&k).await.unwrap();
        assert!(
            bodies.iter().any(|body| body[..] == got[..]),
            "read back a value that no writer produced"
        );
    }
}
