//! JSON file persistence for OAuth state.
//!
//! [`FileStore`] keeps a [`MemoryStore`] as the source of truth and rewrites
//! `<dir>/oauth.json` after every durable mutation, so registered clients,
//! refresh tokens and credential entries survive a restart. Writes go to a
//! temporary file that is renamed over the old one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info};

use super::{
    error::OAuthError,
    store::{ClientRegistry, CredentialStore, GrantStore, MemoryStore, Snapshot},
    types::{AuthorizationCode, Client, CodeRedemption, RefreshToken, Secret},
};
use crate::error::{Error, Result};

const STATE_FILE: &str = "oauth.json";

pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (or creates) the state file inside `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(STATE_FILE);

        let snapshot = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice::<Snapshot>(&data).map_err(|e| {
                Error::Storage(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Loaded OAuth state from {} ({} clients, {} refresh tokens)",
            path.display(),
            snapshot.clients.len(),
            snapshot.refresh_tokens.len()
        );

        Ok(Self {
            inner: MemoryStore::from_snapshot(snapshot),
            path,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        // A leftover from an interrupted flush may carry other permissions.
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Persisted OAuth state to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl ClientRegistry for FileStore {
    async fn insert_client(&self, client: Client) -> Result<()> {
        self.inner.insert_client(client).await?;
        self.flush().await
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>> {
        self.inner.get_client(client_id).await
    }
}

#[async_trait]
impl GrantStore for FileStore {
    async fn put_code(&self, code: AuthorizationCode) -> Result<()> {
        self.inner.put_code(code).await
    }

    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        self.inner.get_code(code).await
    }

    async fn redeem_code(
        &self,
        code: &str,
        redemption: &CodeRedemption,
    ) -> std::result::Result<AuthorizationCode, OAuthError> {
        self.inner.redeem_code(code, redemption).await
    }

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.inner.put_refresh_token(token).await?;
        self.flush().await
    }

    async fn take_refresh_token(&self, token: &str) -> std::result::Result<RefreshToken, OAuthError> {
        let taken = self.inner.take_refresh_token(token).await;
        // Expired tokens are removed as well, so persist in both cases.
        if !matches!(&taken, Err(e) if e.description() == "unknown refresh token") {
            self.flush().await?;
        }
        taken
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.inner.purge_expired(now).await?;
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn put_credential(&self, tenant_id: &str, secret: Secret) -> Result<()> {
        self.inner.put_credential(tenant_id, secret).await?;
        self.flush().await
    }

    async fn get_credential(&self, tenant_id: &str) -> Result<Option<Secret>> {
        self.inner.get_credential(tenant_id).await
    }
}
