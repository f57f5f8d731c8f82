//! Per-tenant backend session cache.
//!
//! Sessions are expensive to build (they log in to the backend), so each
//! tenant gets exactly one, created lazily on first use. Every tenant owns a
//! [`Slot`] in the map: the map lock is held only long enough to find or
//! insert the slot, and construction runs on the slot's [`OnceCell`].
//! Concurrent callers for one tenant therefore wait on a single
//! construction, while other tenants never touch that cell.
//!
//! A slot is tagged with a SHA-256 fingerprint of the secret it is built
//! with. Presenting a different secret installs a fresh slot for the new
//! fingerprint, so a credential change is also built once no matter how many
//! callers race on it. If that build fails the previous session is put back.
//! Slots whose build failed are removed, so the map only holds tenants that
//! have, or are about to have, a session.

use std::{collections::HashMap, sync::Arc};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::{
    auth::{mask_identity, Secret},
    backend::SessionFactory,
    error::Result,
};

type Fingerprint = [u8; 32];

fn fingerprint(secret: &Secret) -> Fingerprint {
    Sha256::digest(secret.expose().as_bytes()).into()
}

struct Slot<S> {
    fingerprint: Fingerprint,
    cell: OnceCell<Arc<S>>,
    /// The session this slot replaced, restored if the build fails.
    fallback: Mutex<Option<(Fingerprint, Arc<S>)>>,
}

impl<S> Slot<S> {
    fn empty(fingerprint: Fingerprint, fallback: Option<(Fingerprint, Arc<S>)>) -> Self {
        Self {
            fingerprint,
            cell: OnceCell::new(),
            fallback: Mutex::new(fallback),
        }
    }

    fn ready(fingerprint: Fingerprint, session: Arc<S>) -> Self {
        Self {
            fingerprint,
            cell: OnceCell::new_with(Some(session)),
            fallback: Mutex::new(None),
        }
    }
}

pub struct SessionCache<F: SessionFactory> {
    factory: Arc<F>,
    entries: RwLock<HashMap<String, Arc<Slot<F::Session>>>>,
}

impl<F: SessionFactory> SessionCache<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self {
            factory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the tenant's session, building it on first use or when the
    /// secret changed.
    ///
    /// A failed construction is returned to the caller that ran it and is not
    /// cached; callers still waiting on the slot retry it, later calls start
    /// over.
    pub async fn get_or_create(&self, tenant_id: &str, secret: &Secret) -> Result<Arc<F::Session>> {
        let slot = self.slot(tenant_id, fingerprint(secret)).await;

        let built = slot
            .cell
            .get_or_try_init(|| async {
                info!("Creating backend session for {}", mask_identity(tenant_id));
                self.factory.create(tenant_id, secret).await.map(Arc::new)
            })
            .await;

        match built {
            Ok(session) => {
                let session = session.clone();
                slot.fallback.lock().await.take();
                Ok(session)
            }
            Err(e) => {
                warn!(
                    "Session construction failed for {}: {}",
                    mask_identity(tenant_id),
                    e
                );
                self.discard(tenant_id, &slot).await;
                Err(e)
            }
        }
    }

    /// Drops the cached session for `tenant_id`. Returns whether one existed.
    pub async fn invalidate(&self, tenant_id: &str) -> bool {
        let removed = self.entries.write().await.remove(tenant_id).is_some();
        if removed {
            debug!("Invalidated session for {}", mask_identity(tenant_id));
        }
        removed
    }

    /// Number of tenants in the cache, including ones whose session is still
    /// being built.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Finds the slot for `tenant_id` matching `presented`, installing a new
    /// one if the tenant is unknown or was built with another secret.
    async fn slot(&self, tenant_id: &str, presented: Fingerprint) -> Arc<Slot<F::Session>> {
        if let Some(slot) = self.entries.read().await.get(tenant_id) {
            if slot.fingerprint == presented {
                return slot.clone();
            }
        }

        let mut entries = self.entries.write().await;
        let fallback = match entries.get(tenant_id) {
            Some(slot) if slot.fingerprint == presented => return slot.clone(),
            Some(slot) => {
                info!(
                    "Credentials changed for {}, rebuilding session",
                    mask_identity(tenant_id)
                );
                slot.cell
                    .get()
                    .map(|session| (slot.fingerprint, session.clone()))
            }
            None => None,
        };

        let slot = Arc::new(Slot::empty(presented, fallback));
        entries.insert(tenant_id.to_string(), slot.clone());
        slot
    }

    /// Removes a slot whose build failed, restoring the session it replaced.
    /// Does nothing if the slot has since been replaced or built.
    async fn discard(&self, tenant_id: &str, slot: &Arc<Slot<F::Session>>) {
        let mut entries = self.entries.write().await;
        let current = match entries.get(tenant_id) {
            Some(current) if Arc::ptr_eq(current, slot) => current,
            _ => return,
        };
        if current.cell.initialized() {
            return;
        }

        match slot.fallback.lock().await.take() {
            Some((fingerprint, session)) => {
                entries.insert(
                    tenant_id.to_string(),
                    Arc::new(Slot::ready(fingerprint, session)),
                );
            }
            None => {
                entries.remove(tenant_id);
            }
        }
    }
}

impl<F: SessionFactory> std::fmt::Debug for SessionCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeFactory;

    #[tokio::test]
    async fn test_reuses_session() {
        let factory = Arc::new(FakeFactory::new());
        let cache = SessionCache::new(factory.clone());

        let a = cache.get_or_create("a@example.com", &"pw".into()).await.unwrap();
        let b = cache.get_or_create("a@example.com", &"pw".into()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let factory = Arc::new(FakeFactory::new());
        factory.reject("a@example.com");
        let cache = SessionCache::new(factory.clone());

        assert!(cache.get_or_create("a@example.com", &"pw".into()).await.is_err());
        assert!(cache.is_empty().await);

        factory.accept("a@example.com");
        assert!(cache.get_or_create("a@example.com", &"pw".into()).await.is_ok());
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn test_failed_builds_leave_no_slots() {
        let factory = Arc::new(FakeFactory::new().with_account("a@example.com", "pw"));
        let cache = SessionCache::new(factory.clone());

        for i in 0..100 {
            let tenant = format!("bogus{i}@example.com");
            assert!(cache.get_or_create(&tenant, &"pw".into()).await.is_err());
        }
        assert_eq!(factory.attempts(), 100);
        assert!(cache.is_empty().await);
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_changed_secret_rebuilds() {
        let factory = Arc::new(FakeFactory::new());
        let cache = SessionCache::new(factory.clone());

        let first = cache.get_or_create("a@example.com", &"old".into()).await.unwrap();
        let second = cache.get_or_create("a@example.com", &"new".into()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.secret, "new");

        let third = cache.get_or_create("a@example.com", &"new".into()).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_old_session() {
        let factory = Arc::new(FakeFactory::new());
        let cache = SessionCache::new(factory.clone());

        let first = cache.get_or_create("a@example.com", &"old".into()).await.unwrap();
        factory.reject("a@example.com");
        assert!(cache.get_or_create("a@example.com", &"wrong".into()).await.is_err());

        factory.accept("a@example.com");
        let again = cache.get_or_create("a@example.com", &"old".into()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let factory = Arc::new(FakeFactory::new());
        let cache = SessionCache::new(factory.clone());

        cache.get_or_create("a@example.com", &"pw".into()).await.unwrap();
        assert!(cache.invalidate("a@example.com").await);
        assert!(!cache.invalidate("a@example.com").await);

        cache.get_or_create("a@example.com", &"pw".into()).await.unwrap();
        assert_eq!(factory.created(), 2);
    }
}
