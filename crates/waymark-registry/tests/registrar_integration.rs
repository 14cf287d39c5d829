//! Registrar lease handling against the in-memory store
//!
//! TigerStyle: Explicit time control for TTLs, 2+ assertions per test.

use std::sync::Arc;
use std::time::Duration;
use waymark_core::{RegistrationConfig, RenewalFailurePolicy};
use waymark_registry::{
    CoordinationStore, LeaseId, MemoryStore, RecordPayload, Registrar, RegistrarState,
    RegistryError,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn reregister_config() -> RegistrationConfig {
    RegistrationConfig::default()
        .with_policy(RenewalFailurePolicy::Reregister)
        .with_reregister(3, 50)
}

fn fail_config() -> RegistrationConfig {
    RegistrationConfig::default().with_policy(RenewalFailurePolicy::Fail)
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn key_lease(store: &MemoryStore, key: &str) -> Option<LeaseId> {
    store
        .get(key)
        .await
        .unwrap()
        .kvs
        .into_iter()
        .find(|kv| kv.key == key)
        .and_then(|kv| kv.lease)
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Register then close: a fresh reader no longer sees the key.
#[tokio::test]
async fn test_register_then_close() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());

    let payload = RecordPayload::new("10.0.0.1", 9000).with_weight(10);
    let lease = registrar.register_record("/svc/a", &payload, 10).await.unwrap();
    assert_eq!(key_lease(&store, "/svc/a").await, Some(lease));

    registrar.close().await;
    assert_eq!(registrar.state(), RegistrarState::Closed);
    assert_eq!(registrar.lease_id(), None);

    let reader = store.session();
    assert!(reader.get("/svc/a").await.unwrap().kvs.is_empty());
    assert_eq!(store.lease_count(), 0);
}

/// The payload is stored in the wire format discovery parses.
#[tokio::test]
async fn test_registered_payload_format() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());
    registrar
        .announce("/svc/a", &RecordPayload::new("10.0.0.1", 9000).with_weight(10))
        .await
        .unwrap();

    let snapshot = store.get("/svc/a").await.unwrap();
    let record = waymark_registry::AddressRecord::parse("/svc/a", &snapshot.kvs[0].value).unwrap();
    assert_eq!(record.address, "10.0.0.1:9000");
    assert_eq!(record.weight, 10);
    registrar.close().await;
}

/// Store calls that hang are bounded by the request timeout.
#[tokio::test(start_paused = true)]
async fn test_register_times_out() {
    let store = MemoryStore::new();
    store.set_latency(Some(Duration::from_secs(5)));
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());

    let err = registrar.register("/svc/a", "v", 10).await.unwrap_err();
    assert!(matches!(err, RegistryError::StoreTimeout { .. }));
    assert_eq!(registrar.state(), RegistrarState::Unregistered);
}

// =============================================================================
// Renewal
// =============================================================================

/// Keepalive renews the lease for as long as the registrar lives.
#[tokio::test(start_paused = true)]
async fn test_keepalive_outlives_ttl() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());
    let lease = registrar.register("/svc/a", "v", 3).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(key_lease(&store, "/svc/a").await, Some(lease));
    assert_eq!(registrar.state(), RegistrarState::Registered { lease_id: lease });

    registrar.close().await;
}

/// A lost keepalive stream is recovered with a new lease.
#[tokio::test]
async fn test_reregister_after_severed_keepalive() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());
    let first = registrar.register("/svc/a", "v", 10).await.unwrap();

    store.sever_keepalives();
    eventually("new lease", || {
        matches!(registrar.lease_id(), Some(lease) if lease != first)
    })
    .await;

    let second = registrar.lease_id().unwrap();
    eventually("registered", || {
        registrar.state() == RegistrarState::Registered { lease_id: second }
    })
    .await;
    assert_eq!(key_lease(&store, "/svc/a").await, Some(second));
    registrar.close().await;
}

/// An expired lease (key already deleted) is re-published.
#[tokio::test(start_paused = true)]
async fn test_reregister_after_expiry() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());
    let first = registrar.register("/svc/a", "v", 3).await.unwrap();

    assert!(store.expire_lease(first));
    assert!(store.get("/svc/a").await.unwrap().kvs.is_empty());

    eventually("key restored", || {
        matches!(registrar.state(), RegistrarState::Registered { lease_id } if lease_id != first)
    })
    .await;
    assert!(key_lease(&store, "/svc/a").await.is_some());
    registrar.close().await;
}

/// Re-registration that keeps failing ends in `Failed` and is reported.
#[tokio::test]
async fn test_reregister_exhausted() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), reregister_config());
    let mut failures = registrar.subscribe_failures();
    registrar.register("/svc/a", "v", 10).await.unwrap();

    store.set_unavailable(true);
    store.sever_keepalives();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(failure, RegistryError::KeepaliveLost { ref key, .. } if key == "/svc/a"));
    assert_eq!(registrar.state(), RegistrarState::Failed);
    assert_eq!(registrar.lease_id(), None);

    store.set_unavailable(false);
    registrar.close().await;
    assert_eq!(registrar.state(), RegistrarState::Closed);
}

/// With the `Fail` policy a lost lease is reported without retrying.
#[tokio::test]
async fn test_fail_policy() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), fail_config());
    let mut failures = registrar.subscribe_failures();
    let lease = registrar.register("/svc/a", "v", 10).await.unwrap();

    store.sever_keepalives();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        failure,
        RegistryError::KeepaliveLost {
            key: "/svc/a".into(),
            lease_id: lease,
            reason: "keepalive stream ended".into(),
        }
    );
    assert_eq!(registrar.state(), RegistrarState::Failed);
    assert_eq!(registrar.lease_id(), None);
    assert_eq!(store.lease_count(), 0);
    assert!(store.get("/svc/a").await.unwrap().kvs.is_empty());

    registrar.close().await;
    assert_eq!(registrar.state(), RegistrarState::Closed);
}

/// A failed registrar may register again.
#[tokio::test]
async fn test_register_after_failure() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(Arc::new(store.session()), fail_config());
    let mut failures = registrar.subscribe_failures();
    registrar.register("/svc/a", "v", 10).await.unwrap();

    store.sever_keepalives();
    failures.recv().await.unwrap();

    let lease = registrar.register("/svc/a", "v", 10).await.unwrap();
    assert_eq!(registrar.state(), RegistrarState::Registered { lease_id: lease });
    assert_eq!(key_lease(&store, "/svc/a").await, Some(lease));
    registrar.close().await;
}
