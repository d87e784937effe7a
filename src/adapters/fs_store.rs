//! Filesystem record store
//!
//! One directory per pool under a root, one file per record.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::domain::{RawObjectStore, Usage};
use crate::error::{Error, Result};

/// Directory backed [`RawObjectStore`].
pub struct FsObjectStore {
    fsid: String,
    root: PathBuf,
    capacity_kb: u64,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(fsid: impl Into<String>, root: impl Into<PathBuf>, capacity_kb: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!("Opened filesystem store at {}", root.display());
        Ok(Self {
            fsid: fsid.into(),
            root,
            capacity_kb,
        })
    }

    fn record_path(&self, pool: &str, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(Error::Internal(format!("invalid record name {:?}", name)));
        }
        Ok(self.root.join(pool).join(name))
    }

    fn backend_err(&self, e: std::io::Error) -> Error {
        Error::Backend {
            cluster: self.fsid.clone(),
            reason: e.to_string(),
        }
    }

    async fn dir_size(path: &Path) -> Result<u64> {
        let mut total = 0;
        let mut pools = match fs::read_dir(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(pool) = pools.next_entry().await? {
            if !pool.file_type().await?.is_dir() {
                continue;
            }
            let mut records = fs::read_dir(pool.path()).await?;
            while let Some(record) = records.next_entry().await? {
                total += record.metadata().await?.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl RawObjectStore for FsObjectStore {
    fn fsid(&self) -> &str {
        &self.fsid
    }

    async fn write_full(&self, pool: &str, name: &str, data: Bytes) -> Result<()> {
        let path = self.record_path(pool, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.backend_err(e))?;
        }
        fs::write(&path, &data).await.map_err(|e| self.backend_err(e))
    }

    async fn write_at(&self, pool: &str, name: &str, offset: u64, data: Bytes) -> Result<()> {
        let path = self.record_path(pool, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.backend_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| self.backend_err(e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.backend_err(e))?;
        file.write_all(&data).await.map_err(|e| self.backend_err(e))?;
        file.flush().await.map_err(|e| self.backend_err(e))
    }

    async fn read_at(&self, pool: &str, name: &str, offset: u64, len: usize) -> Result<Bytes> {
        let path = self.record_path(pool, name)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound(format!("{}/{}", pool, name)))
            }
            Err(e) => return Err(self.backend_err(e)),
        };
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.backend_err(e))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| self.backend_err(e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn size(&self, pool: &str, name: &str) -> Result<Option<u64>> {
        let path = self.record_path(pool, name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.backend_err(e)),
        }
    }

    async fn remove(&self, pool: &str, name: &str) -> Result<bool> {
        let path = self.record_path(pool, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.backend_err(e)),
        }
    }

    async fn usage(&self) -> Result<Usage> {
        let used = Self::dir_size(&self.root).await?;
        Ok(Usage {
            kb: self.capacity_kb,
            kb_used: used.div_ceil(1024),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open("fs", dir.path(), 1024).await.unwrap();

        store
            .write_at("big", "a:1.0", 3, Bytes::from_static(b"xyz"))
            .await
            .unwrap();
        let data = store.read_at("big", "a:1.0", 0, 10).await.unwrap();
        assert_eq!(&data[..], b"\0\0\0xyz");
        assert_eq!(store.size("big", "a:1.0").await.unwrap(), Some(6));

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.kb, 1024);
        assert_eq!(usage.kb_used, 1);

        assert!(store.remove("big", "a:1.0").await.unwrap());
        assert!(!store.remove("big", "a:1.0").await.unwrap());
        assert_eq!(store.size("big", "a:1.0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open("fs", dir.path(), 1024).await.unwrap();
        assert!(store
            .write_full("big", "../escape", Bytes::new())
            .await
            .is_err());
    }
}
