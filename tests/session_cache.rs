//! Concurrency behaviour of the per-tenant session cache.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use things_mcp::{auth::Secret, session::SessionCache, testutils::*};

#[tokio::test]
async fn test_concurrent_first_use_builds_once() {
    let factory = Arc::new(FakeFactory::new().with_delay(Duration::from_millis(100)));
    let cache = Arc::new(SessionCache::new(factory.clone()));
    let secret = Secret::new(TEST_PASSWORD);

    let sessions = join_all((0..32).map(|_| {
        let cache = cache.clone();
        let secret = secret.clone();
        tokio::spawn(async move { cache.get_or_create(TEST_EMAIL, &secret).await })
    }))
    .await;

    let sessions: Vec<_> = sessions
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.attempts(), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_slow_tenant_does_not_block_others() {
    let factory = Arc::new(FakeFactory::new());
    factory.delay_for("slow@example.com", Duration::from_secs(5));
    let cache = Arc::new(SessionCache::new(factory.clone()));

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_create("slow@example.com", &Secret::new("pw"))
                .await
        })
    };
    // Let the slow construction start first
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = tokio::time::timeout(
        Duration::from_secs(1),
        cache.get_or_create("fast@example.com", &Secret::new("pw")),
    )
    .await
    .expect("fast tenant waited on the slow one")
    .unwrap();
    assert_eq!(fast.identity, "fast@example.com");

    slow.abort();
}

#[tokio::test]
async fn test_concurrent_failures_are_not_cached() {
    let factory = Arc::new(FakeFactory::new().with_delay(Duration::from_millis(20)));
    factory.reject(TEST_EMAIL);
    let cache = Arc::new(SessionCache::new(factory.clone()));
    let secret = Secret::new(TEST_PASSWORD);

    let results = join_all((0..8).map(|_| cache.get_or_create(TEST_EMAIL, &secret))).await;
    assert!(results.iter().all(|r| r.is_err()));
    assert_eq!(factory.created(), 0);
    assert!(cache.is_empty().await);

    factory.accept(TEST_EMAIL);
    let session = cache.get_or_create(TEST_EMAIL, &secret).await.unwrap();
    assert_eq!(session.serial, 1);
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_changed_password_rebuilds_for_everyone() {
    let factory = Arc::new(FakeFactory::new());
    let cache = SessionCache::new(factory.clone());

    let old = cache
        .get_or_create(TEST_EMAIL, &Secret::new("old"))
        .await
        .unwrap();
    let new = cache
        .get_or_create(TEST_EMAIL, &Secret::new("new"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.secret, "new");

    // Later callers with the new password reuse the rebuilt session
    let again = cache
        .get_or_create(TEST_EMAIL, &Secret::new("new"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&new, &again));
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_concurrent_rebuild_builds_once() {
    let factory = Arc::new(FakeFactory::new().with_delay(Duration::from_millis(50)));
    let cache = Arc::new(SessionCache::new(factory.clone()));
    let old = cache
        .get_or_create(TEST_EMAIL, &Secret::new("old"))
        .await
        .unwrap();

    let sessions = join_all((0..16).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_create(TEST_EMAIL, &Secret::new("new")).await })
    }))
    .await;

    let sessions: Vec<_> = sessions
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(factory.created(), 2);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert!(!Arc::ptr_eq(&old, &sessions[0]));
    assert_eq!(sessions[0].secret, "new");
}

#[tokio::test]
async fn test_failed_concurrent_rebuild_restores_old_session() {
    let factory = Arc::new(FakeFactory::new().with_account(TEST_EMAIL, TEST_PASSWORD));
    let cache = Arc::new(SessionCache::new(factory.clone()));
    let old = cache
        .get_or_create(TEST_EMAIL, &Secret::new(TEST_PASSWORD))
        .await
        .unwrap();

    let wrong = Secret::new("wrong");
    let results = join_all((0..8).map(|_| cache.get_or_create(TEST_EMAIL, &wrong))).await;
    assert!(results.iter().all(|r| r.is_err()));
    assert_eq!(cache.len().await, 1);

    let again = cache
        .get_or_create(TEST_EMAIL, &Secret::new(TEST_PASSWORD))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&old, &again));
    assert_eq!(factory.created(), 1);
}
