//! Repository traits for OAuth state, plus the in-memory implementation.
//!
//! Each store is guarded independently: clients live in a sharded
//! [`DashMap`], codes, refresh tokens and credentials each sit behind their
//! own reader/writer lock. Read paths take shared locks; every mutation takes
//! the exclusive lock only for the map operation itself.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    error::OAuthError,
    types::{AuthorizationCode, Client, CodeRedemption, RefreshToken, Secret},
};
use crate::error::Result;

/// Registered OAuth clients. Clients are immutable once inserted.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn insert_client(&self, client: Client) -> Result<()>;

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>>;
}

/// Authorization codes and refresh tokens.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn put_code(&self, code: AuthorizationCode) -> Result<()>;

    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>>;

    /// Atomically validates `redemption` against the stored code and marks it
    /// used. A failed check leaves the code untouched.
    async fn redeem_code(
        &self,
        code: &str,
        redemption: &CodeRedemption,
    ) -> std::result::Result<AuthorizationCode, OAuthError>;

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()>;

    /// Removes and returns a refresh token. Expired tokens are removed too,
    /// but reported as `invalid_grant`.
    async fn take_refresh_token(&self, token: &str) -> std::result::Result<RefreshToken, OAuthError>;

    /// Drops expired or used codes and expired refresh tokens, returning how
    /// many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Tenant identity to backend secret.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put_credential(&self, tenant_id: &str, secret: Secret) -> Result<()>;

    async fn get_credential(&self, tenant_id: &str) -> Result<Option<Secret>>;
}

/// The durable subset of [`MemoryStore`]. Authorization codes are left out:
/// they live for minutes and a restart simply invalidates them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub refresh_tokens: Vec<RefreshToken>,
    #[serde(default)]
    pub credentials: HashMap<String, Secret>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    clients: DashMap<String, Client>,
    codes: RwLock<HashMap<String, AuthorizationCode>>,
    refresh_tokens: RwLock<HashMap<String, RefreshToken>>,
    credentials: RwLock<HashMap<String, Secret>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut store = Self::default();
        for client in snapshot.clients {
            store.clients.insert(client.client_id.clone(), client);
        }
        store.refresh_tokens = RwLock::new(
            snapshot
                .refresh_tokens
                .into_iter()
                .map(|t| (t.token.clone(), t))
                .collect(),
        );
        store.credentials = RwLock::new(snapshot.credentials);
        store
    }

    pub async fn snapshot(&self) -> Snapshot {
        let clients = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let refresh_tokens = self.refresh_tokens.read().await.values().cloned().collect();
        let credentials = self.credentials.read().await.clone();
        Snapshot {
            clients,
            refresh_tokens,
            credentials,
        }
    }
}

#[async_trait]
impl ClientRegistry for MemoryStore {
    async fn insert_client(&self, client: Client) -> Result<()> {
        self.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>> {
        Ok(self.clients.get(client_id).map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn put_code(&self, code: AuthorizationCode) -> Result<()> {
        self.codes.write().await.insert(code.code.clone(), code);
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        Ok(self.codes.read().await.get(code).cloned())
    }

    async fn redeem_code(
        &self,
        code: &str,
        redemption: &CodeRedemption,
    ) -> std::result::Result<AuthorizationCode, OAuthError> {
        let mut codes = self.codes.write().await;
        let stored = codes
            .get_mut(code)
            .ok_or_else(|| OAuthError::InvalidGrant("unknown authorization code".into()))?;
        stored.check(redemption, Utc::now())?;
        stored.used = true;
        Ok(stored.clone())
    }

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.refresh_tokens
            .write()
            .await
            .insert(token.token.clone(), token);
        Ok(())
    }

    async fn take_refresh_token(&self, token: &str) -> std::result::Result<RefreshToken, OAuthError> {
        let taken = self
            .refresh_tokens
            .write()
            .await
            .remove(token)
            .ok_or_else(|| OAuthError::InvalidGrant("unknown refresh token".into()))?;
        if taken.is_expired(Utc::now()) {
            return Err(OAuthError::InvalidGrant("refresh token expired".into()));
        }
        Ok(taken)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        {
            let mut codes = self.codes.write().await;
            let before = codes.len();
            codes.retain(|_, c| !c.used && !c.is_expired(now));
            removed += before - codes.len();
        }
        {
            let mut tokens = self.refresh_tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, t| !t.is_expired(now));
            removed += before - tokens.len();
        }
        Ok(removed)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn put_credential(&self, tenant_id: &str, secret: Secret) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(tenant_id.to_string(), secret);
        Ok(())
    }

    async fn get_credential(&self, tenant_id: &str) -> Result<Option<Secret>> {
        Ok(self.credentials.read().await.get(tenant_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce;
    use chrono::Duration;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn code(code: &str, expires_in: Duration) -> AuthorizationCode {
        AuthorizationCode {
            code: code.into(),
            client_id: "client".into(),
            redirect_uri: "https://app/cb".into(),
            tenant_id: "user@example.com".into(),
            tenant_secret: "hunter2".into(),
            code_challenge: pkce::challenge_for(VERIFIER),
            expires_at: Utc::now() + expires_in,
            used: false,
        }
    }

    fn redemption(verifier: &str) -> CodeRedemption {
        CodeRedemption {
            client_id: "client".into(),
            redirect_uri: "https://app/cb".into(),
            code_verifier: verifier.into(),
        }
    }

    #[tokio::test]
    async fn test_code_redeems_once() {
        let store = MemoryStore::new();
        store.put_code(code("abc", Duration::minutes(10))).await.unwrap();

        let redeemed = store.redeem_code("abc", &redemption(VERIFIER)).await.unwrap();
        assert!(redeemed.used);
        assert_eq!(redeemed.tenant_id, "user@example.com");

        let err = store
            .redeem_code("abc", &redemption(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.description(), "authorization code already used");
    }

    #[tokio::test]
    async fn test_failed_pkce_leaves_code_unused() {
        let store = MemoryStore::new();
        store.put_code(code("abc", Duration::minutes(10))).await.unwrap();

        let err = store
            .redeem_code("abc", &redemption("wrong-verifier"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
        assert!(!store.get_code("abc").await.unwrap().unwrap().used);

        // The legitimate holder can still redeem it.
        assert!(store.redeem_code("abc", &redemption(VERIFIER)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let store = MemoryStore::new();
        store.put_code(code("old", Duration::seconds(-1))).await.unwrap();

        let err = store
            .redeem_code("old", &redemption(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.description(), "authorization code expired");
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let store = MemoryStore::new();
        let err = store
            .redeem_code("nope", &redemption(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.description(), "unknown authorization code");
    }

    #[tokio::test]
    async fn test_refresh_token_is_single_use() {
        let store = MemoryStore::new();
        let token = RefreshToken::issue("user@example.com", &"hunter2".into(), "client");
        let value = token.token.clone();
        store.put_refresh_token(token).await.unwrap();

        let taken = store.take_refresh_token(&value).await.unwrap();
        assert_eq!(taken.client_id, "client");
        assert_eq!(
            store.take_refresh_token(&value).await.unwrap_err().description(),
            "unknown refresh token"
        );
    }

    #[tokio::test]
    async fn test_expired_refresh_token_is_removed() {
        let store = MemoryStore::new();
        let mut token = RefreshToken::issue("user@example.com", &"hunter2".into(), "client");
        token.expires_at = Utc::now() - Duration::seconds(1);
        let value = token.token.clone();
        store.put_refresh_token(token).await.unwrap();

        assert_eq!(
            store.take_refresh_token(&value).await.unwrap_err().description(),
            "refresh token expired"
        );
        assert_eq!(
            store.take_refresh_token(&value).await.unwrap_err().description(),
            "unknown refresh token"
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.put_code(code("live", Duration::minutes(10))).await.unwrap();
        store.put_code(code("dead", Duration::seconds(-5))).await.unwrap();
        let mut stale = RefreshToken::issue("user@example.com", &"pw".into(), "client");
        stale.expires_at = Utc::now() - Duration::days(1);
        store.put_refresh_token(stale).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 2);
        assert!(store.get_code("live").await.unwrap().is_some());
        assert!(store.get_code("dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let store = MemoryStore::new();
        store
            .put_credential("user@example.com", "hunter2".into())
            .await
            .unwrap();
        store
            .put_refresh_token(RefreshToken::issue("user@example.com", &"hunter2".into(), "c"))
            .await
            .unwrap();
        store.put_code(code("abc", Duration::minutes(10))).await.unwrap();

        let restored = MemoryStore::from_snapshot(store.snapshot().await);
        assert_eq!(
            restored.get_credential("user@example.com").await.unwrap(),
            Some(Secret::new("hunter2"))
        );
        assert_eq!(restored.snapshot().await.refresh_tokens.len(), 1);
        assert!(restored.get_code("abc").await.unwrap().is_none());
    }
}
