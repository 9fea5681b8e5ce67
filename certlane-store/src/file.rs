//! Flat-directory store
//!
//! One JSON file per record under a base directory:
//! `user-<ca-host>-<email>.json`, `resource-<site>.json`, and a `leader`
//! lease file whose payload is the holder id and whose mtime is the
//! acquisition instant (size 0 means unlocked).
//!
//! The lease compare-and-swap here is approximate (read, then truncate and
//! rewrite under a fresh open). It is advisory only: good enough for a few
//! cooperating replicas on a shared filesystem, not a correctness-critical
//! mutex. Use the Consul store when real multi-replica exclusion matters.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::{Account, Certificates, Result, Store, StoreError, sanitize_ca_host};

pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `base`, creating the directory if needed.
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await?;
        tracing::debug!(base = %base.display(), "file store ready");
        Ok(Self { base })
    }

    fn user_path(&self, ca_dir: &str, email: &str) -> Result<PathBuf> {
        let host = sanitize_ca_host(ca_dir)?;
        Ok(self.base.join(format!("user-{host}-{email}.json")))
    }

    fn resource_path(&self, name: &str) -> PathBuf {
        self.base.join(format!("resource-{name}.json"))
    }

    fn lease_path(&self) -> PathBuf {
        self.base.join("leader")
    }

    /// Write a record atomically: temp file in the same directory, 0600,
    /// then rename over the destination.
    async fn write_record(&self, path: &Path, content: &[u8]) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut file = options.open(&tmp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_record(&self, path: &Path, missing: StoreError) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(missing),
            Err(e) => Err(e.into()),
        }
    }

    /// Truncate-and-write the lease file; refreshes the mtime.
    async fn write_lease(&self, id: &str) -> Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(self.lease_path()).await?;
        file.write_all(id.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn fetch_user(&self, ca_dir: &str, email: &str) -> Result<Account> {
        let path = self.user_path(ca_dir, email)?;
        let content = self.read_record(&path, StoreError::NotFoundUser).await?;
        serde_json::from_slice(&content).map_err(StoreError::Decode)
    }

    async fn write_user(&self, ca_dir: &str, account: &Account) -> Result<()> {
        let path = self.user_path(ca_dir, &account.email)?;
        let content = serde_json::to_vec(account).map_err(StoreError::Encode)?;
        self.write_record(&path, &content).await
    }

    async fn fetch_resource(&self, name: &str) -> Result<Certificates> {
        let path = self.resource_path(name);
        let content = self
            .read_record(&path, StoreError::NotFoundCertificate)
            .await?;
        serde_json::from_slice(&content).map_err(StoreError::Decode)
    }

    async fn write_resource(&self, name: &str, resource: &Certificates) -> Result<()> {
        let path = self.resource_path(name);
        let content = serde_json::to_vec(resource).map_err(StoreError::Encode)?;
        self.write_record(&path, &content).await
    }

    async fn lock(&self, id: &str, timeout: Duration) -> Result<bool> {
        let path = self.lease_path();
        let meta = match tokio::fs::metadata(&path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write_lease(id).await?;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
            Ok(meta) => meta,
        };

        let holder = tokio::fs::read_to_string(&path).await?;
        let unlocked = holder.is_empty();
        let owned = holder == id;
        let expired = SystemTime::now() >= meta.modified()? + timeout;

        if unlocked || owned || expired {
            if expired && !owned && !unlocked {
                tracing::debug!(holder = holder.as_str(), "reclaiming stale lease");
            }
            self.write_lease(id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, id: &str) -> Result<()> {
        let path = self.lease_path();
        let holder = match tokio::fs::read_to_string(&path).await {
            Ok(holder) => holder,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if holder != id {
            // Someone else holds (or reclaimed) the lease; leave it alone.
            return Ok(());
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await?;
        file.set_len(0).await?;
        Ok(())
    }
}
