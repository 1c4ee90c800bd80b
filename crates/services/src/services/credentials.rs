use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use git::RemoteCredentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Saved login for one remote as used from one local repository.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct CredentialRecord {
    pub remote_url: String,
    pub repo_path: PathBuf,
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl CredentialRecord {
    /// The secret is only kept when the user asked for it to be remembered.
    pub fn from_credentials(credentials: &RemoteCredentials) -> Self {
        Self {
            remote_url: credentials.remote_url.clone(),
            repo_path: credentials.repo_path.clone(),
            username: credentials.username.clone(),
            secret: credentials
                .remember
                .then(|| credentials.secret.clone())
                .flatten(),
            key_path: credentials.key_path.clone(),
        }
    }

    pub fn matches(&self, remote_url: &str, repo_path: &Path) -> bool {
        self.remote_url.eq_ignore_ascii_case(remote_url)
            && self
                .repo_path
                .to_string_lossy()
                .eq_ignore_ascii_case(&repo_path.to_string_lossy())
    }

    /// Fill the engine-side credentials from this record.
    pub fn apply_to(&self, credentials: &mut RemoteCredentials) {
        credentials.username = self.username.clone();
        credentials.key_path = self.key_path.clone();
        if self.secret.is_some() {
            credentials.secret = self.secret.clone();
            credentials.remember = true;
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("remote_url", &self.remote_url)
            .field("repo_path", &self.repo_path)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(
        &self,
        remote_url: &str,
        repo_path: &Path,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError>;

    /// Insert or replace the record for its (remote URL, repository) pair.
    async fn save(&self, record: CredentialRecord) -> Result<(), CredentialStoreError>;
}

fn upsert(records: &mut Vec<CredentialRecord>, record: CredentialRecord) {
    match records
        .iter_mut()
        .find(|r| r.matches(&record.remote_url, &record.repo_path))
    {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

/// Records kept for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<Vec<CredentialRecord>>,
    saves: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn records(&self) -> Vec<CredentialRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(
        &self,
        remote_url: &str,
        repo_path: &Path,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.matches(remote_url, repo_path))
            .cloned())
    }

    async fn save(&self, record: CredentialRecord) -> Result<(), CredentialStoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        upsert(&mut *self.records.write().await, record);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default)]
    records: Vec<CredentialRecord>,
}

/// Records persisted as JSON, readable by the current user only.
pub struct FileCredentialStore {
    path: PathBuf,
    cache: RwLock<Option<Vec<CredentialRecord>>>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn loaded(&self) -> Result<Vec<CredentialRecord>, CredentialStoreError> {
        if let Some(records) = self.cache.read().await.as_ref() {
            return Ok(records.clone());
        }
        let records = self.load()?;
        *self.cache.write().await = Some(records.clone());
        Ok(records)
    }

    fn load(&self) -> Result<Vec<CredentialRecord>, CredentialStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        match serde_json::from_slice::<StoredCredentials>(&bytes) {
            Ok(stored) => Ok(stored.records),
            Err(e) => {
                tracing::warn!(?e, "failed to parse credentials file, renaming to .bad");
                let bad = self.path.with_extension("bad");
                let _ = std::fs::rename(&self.path, bad);
                Ok(Vec::new())
            }
        }
    }

    fn write(&self, records: &[CredentialRecord]) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");

        let file = {
            let mut opts = std::fs::OpenOptions::new();
            opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }

            opts.open(&tmp)?
        };

        let stored = StoredCredentials {
            records: records.to_vec(),
        };
        serde_json::to_writer_pretty(&file, &stored)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn lookup(
        &self,
        remote_url: &str,
        repo_path: &Path,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError> {
        Ok(self
            .loaded()
            .await?
            .into_iter()
            .find(|r| r.matches(remote_url, repo_path)))
    }

    async fn save(&self, record: CredentialRecord) -> Result<(), CredentialStoreError> {
        // Held until the file and the cache agree, so concurrent saves neither
        // drop each other's records nor share the temp file.
        let mut cache = self.cache.write().await;
        let mut records = match cache.as_ref() {
            Some(records) => records.clone(),
            None => self.load()?,
        };
        upsert(&mut records, record);
        self.write(&records)?;
        *cache = Some(records);
        Ok(())
    }
}
