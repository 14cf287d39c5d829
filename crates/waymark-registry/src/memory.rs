//! In-memory coordination store
//!
//! TigerStyle: All state changes are explicit, deterministic ordering.
//!
//! Implements [`CoordinationStore`] with the semantics the registry relies on:
//! a global revision counter, prefix snapshots, watches that replay history
//! from a revision, compaction, leases that expire on tokio time unless kept
//! alive, and revocation that deletes bound keys.
//!
//! Sessions created with [`MemoryStore::session`] share one keyspace but can
//! be closed independently, the way separate clients of one cluster behave.
//! Fault hooks (`fail_next`, `set_unavailable`, `sever_watches`,
//! `sever_keepalives`, `compact`, `expire_lease`, `set_latency`) make the
//! recovery paths of discovery and registration testable.

use crate::error::{RegistryError, RegistryResult};
use crate::store::{
    CoordinationStore, KeepaliveAck, KeepaliveStream, KeyValue, LeaseId, Revision,
    Snapshot, WatchBatch, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;
use waymark_core::constants::{LEASE_KEEPALIVE_DIVISOR, LEASE_TTL_SECS_MIN};

/// History retained for watch replay before automatic compaction
pub const HISTORY_EVENTS_COUNT_MAX: usize = 10_000;

/// Capacity of each keepalive ack channel
const KEEPALIVE_BUFFER_COUNT: usize = 16;

/// Store operations that faults can target
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    Watch,
    GrantLease,
    Put,
    Delete,
    Keepalive,
    Revoke,
}

impl StoreOperation {
    /// Get a human-readable name for this operation
    pub fn name(&self) -> &'static str {
        match self {
            StoreOperation::Get => "get",
            StoreOperation::Watch => "watch",
            StoreOperation::GrantLease => "grant_lease",
            StoreOperation::Put => "put",
            StoreOperation::Delete => "delete",
            StoreOperation::Keepalive => "keepalive",
            StoreOperation::Revoke => "revoke",
        }
    }
}

#[derive(Debug)]
struct LeaseEntry {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<RegistryResult<WatchBatch>>,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    history: VecDeque<WatchEvent>,
    /// Events before this revision are no longer replayable
    compact_revision: Revision,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: i64,
    watchers: Vec<Watcher>,
    pending_failures: HashMap<StoreOperation, u32>,
    unavailable: bool,
    latency: Option<Duration>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            revision: 1,
            next_lease: 1,
            ..Default::default()
        }
    }

    fn record(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }

        for watcher in &self.watchers {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if !matching.is_empty() {
                let _ = watcher.tx.send(Ok(WatchBatch {
                    revision: self.revision,
                    events: matching,
                }));
            }
        }
        self.watchers.retain(|w| !w.tx.is_closed());

        self.history.extend(events);
        while self.history.len() > HISTORY_EVENTS_COUNT_MAX {
            if let Some(dropped) = self.history.pop_front() {
                self.compact_revision = dropped.revision + 1;
            }
        }
    }

    fn remove_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };

        let removed: Vec<String> = entry
            .keys
            .into_iter()
            .filter(|key| self.kvs.remove(key).is_some())
            .collect();

        if !removed.is_empty() {
            // all bound keys disappear atomically at one revision
            self.revision += 1;
            let revision = self.revision;
            let events = removed
                .into_iter()
                .map(|key| WatchEvent::delete(key, revision))
                .collect();
            self.record(events);
        }
        true
    }

    fn unbind(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(entry) = lease.and_then(|l| self.leases.get_mut(&l)) {
            entry.keys.remove(key);
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<StoreState>,
    sever_keepalives: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn renew(&self, lease: LeaseId) -> Option<i64> {
        let mut state = self.state();
        let entry = state.leases.get_mut(&lease)?;
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl_secs as u64);
        Some(entry.ttl_secs)
    }

    fn lease_deadline(&self, lease: LeaseId) -> Option<Instant> {
        self.state().leases.get(&lease).map(|e| e.deadline)
    }

    /// Expire `lease` if its deadline has passed; true when the reaper is done
    fn expire_if_due(&self, lease: LeaseId, now: Instant) -> bool {
        let mut state = self.state();
        match state.leases.get(&lease) {
            None => true,
            Some(entry) if entry.deadline <= now => {
                state.remove_lease(lease);
                debug!(lease = %lease, "lease expired");
                true
            }
            Some(_) => false,
        }
    }
}

/// In-memory [`CoordinationStore`] session
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store and its first session
    pub fn new() -> Self {
        let (sever_keepalives, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::new()),
                sever_keepalives,
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open another session on the same keyspace
    pub fn session(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.shared.state().revision
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.shared.state().leases.len()
    }

    /// Number of open watch subscriptions
    pub fn watcher_count(&self) -> usize {
        let mut state = self.shared.state();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    // =========================================================================
    // Fault hooks
    // =========================================================================

    /// Make the next `count` calls of `operation` fail with `StoreUnavailable`
    pub fn fail_next(&self, operation: StoreOperation, count: u32) {
        *self
            .shared
            .state()
            .pending_failures
            .entry(operation)
            .or_insert(0) += count;
    }

    /// Make every call fail (or succeed again) until toggled back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state().unavailable = unavailable;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.shared.state().latency = latency;
    }

    /// End every open watch stream, as a lost connection would
    pub fn sever_watches(&self) {
        let mut state = self.shared.state();
        debug!(count = state.watchers.len(), "severing watches");
        state.watchers.clear();
    }

    /// End every open keepalive stream without revoking the leases
    pub fn sever_keepalives(&self) {
        self.shared.sever_keepalives.send_modify(|generation| *generation += 1);
    }

    /// Discard history before `revision`
    pub fn compact(&self, revision: Revision) {
        let mut state = self.shared.state();
        let revision = revision.min(state.revision);
        state.history.retain(|e| e.revision >= revision);
        state.compact_revision = state.compact_revision.max(revision);
        debug!(revision, "store compacted");
    }

    /// Expire a lease immediately; returns whether it existed
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.shared.state().remove_lease(lease)
    }

    async fn check(&self, operation: StoreOperation) -> RegistryResult<()> {
        let latency = self.shared.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_closed() {
            return Err(RegistryError::StoreClosed);
        }

        let mut state = self.shared.state();
        if state.unavailable {
            return Err(RegistryError::store_unavailable(
                operation.name(),
                "store unreachable",
            ));
        }
        if let Some(pending) = state.pending_failures.get_mut(&operation) {
            if *pending > 0 {
                *pending -= 1;
                return Err(RegistryError::store_unavailable(
                    operation.name(),
                    "injected failure",
                ));
            }
        }
        Ok(())
    }
}

async fn reap_lease(shared: Arc<Shared>, lease: LeaseId) {
    loop {
        let Some(deadline) = shared.lease_deadline(lease) else {
            return;
        };
        tokio::time::sleep_until(deadline).await;
        if shared.expire_if_due(lease, Instant::now()) {
            return;
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, prefix: &str) -> RegistryResult<Snapshot> {
        self.check(StoreOperation::Get).await?;

        let state = self.shared.state();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(Snapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<Revision>,
    ) -> RegistryResult<WatchStream> {
        self.check(StoreOperation::Watch).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state();

            if let Some(from) = from_revision {
                if from < state.compact_revision {
                    return Err(RegistryError::Compacted {
                        requested: from,
                        compact_revision: state.compact_revision,
                    });
                }

                let replay: Vec<WatchEvent> = state
                    .history
                    .iter()
                    .filter(|e| e.revision >= from && e.key.starts_with(prefix))
                    .cloned()
                    .collect();
                if !replay.is_empty() {
                    let _ = tx.send(Ok(WatchBatch {
                        revision: state.revision,
                        events: replay,
                    }));
                }
            }

            state.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        self.check(StoreOperation::GrantLease).await?;

        let ttl_secs = ttl_secs.max(LEASE_TTL_SECS_MIN);
        let lease = {
            let mut state = self.shared.state();
            let lease = LeaseId(state.next_lease);
            state.next_lease += 1;
            state.leases.insert(
                lease,
                LeaseEntry {
                    ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: BTreeSet::new(),
                },
            );
            lease
        };

        tokio::spawn(reap_lease(self.shared.clone(), lease));
        debug!(lease = %lease, ttl_secs, "lease granted");
        Ok(lease)
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> RegistryResult<Revision> {
        self.check(StoreOperation::Put).await?;

        let mut state = self.shared.state();
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(RegistryError::LeaseNotFound { lease_id: lease });
            }
        }

        let previous_lease = state.kvs.get(key).and_then(|kv| kv.lease);
        if previous_lease != lease {
            state.unbind(key, previous_lease);
        }
        if let Some(entry) = lease.and_then(|l| state.leases.get_mut(&l)) {
            entry.keys.insert(key.to_string());
        }

        state.revision += 1;
        let revision = state.revision;
        state.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );
        state.record(vec![WatchEvent::put(key, value, revision)]);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> RegistryResult<bool> {
        self.check(StoreOperation::Delete).await?;

        let mut state = self.shared.state();
        let Some(previous) = state.kvs.remove(key) else {
            return Ok(false);
        };
        state.unbind(key, previous.lease);

        state.revision += 1;
        let revision = state.revision;
        state.record(vec![WatchEvent::delete(key, revision)]);
        Ok(true)
    }

    async fn keepalive(&self, lease: LeaseId) -> RegistryResult<KeepaliveStream> {
        self.check(StoreOperation::Keepalive).await?;

        let ttl_secs = self
            .shared
            .state()
            .leases
            .get(&lease)
            .map(|e| e.ttl_secs)
            .ok_or(RegistryError::LeaseNotFound { lease_id: lease })?;

        let interval = Duration::from_millis(
            ((ttl_secs as u64 * 1000) / LEASE_KEEPALIVE_DIVISOR).max(1),
        );
        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER_COUNT);
        let shared = self.shared.clone();
        let closed = self.closed.clone();
        let mut sever = self.shared.sever_keepalives.subscribe();

        tokio::spawn(async move {
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                let ack = match shared.renew(lease) {
                    Some(ttl_secs) => KeepaliveAck { lease_id: lease, ttl_secs },
                    None => {
                        let _ = tx.try_send(Ok(KeepaliveAck { lease_id: lease, ttl_secs: 0 }));
                        break;
                    }
                };

                tokio::select! {
                    sent = tx.send(Ok(ack)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = sever.changed() => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = sever.changed() => break,
                }
            }
            debug!(lease = %lease, "keepalive stream ended");
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        self.check(StoreOperation::Revoke).await?;

        if self.shared.state().remove_lease(lease) {
            debug!(lease = %lease, "lease revoked");
            Ok(())
        } else {
            Err(RegistryError::LeaseNotFound { lease_id: lease })
        }
    }

    async fn close(&self) -> RegistryResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventKind;

    async fn next_batch(stream: &mut WatchStream) -> WatchBatch {
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_get_prefix_ordered() {
        let store = MemoryStore::new();
        store.put("/svc/b", Bytes::from("2"), None).await.unwrap();
        store.put("/svc/a", Bytes::from("1"), None).await.unwrap();
        store.put("/other/c", Bytes::from("3"), None).await.unwrap();

        let snapshot = store.get("/svc/").await.unwrap();
        let keys: Vec<_> = snapshot.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/svc/a", "/svc/b"]);
        assert_eq!(snapshot.revision, store.revision());
    }

    #[tokio::test]
    async fn test_watch_delivers_puts_and_deletes() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/svc/", None).await.unwrap();

        store.put("/svc/a", Bytes::from("x"), None).await.unwrap();
        store.put("/elsewhere", Bytes::from("y"), None).await.unwrap();
        assert!(store.delete("/svc/a").await.unwrap());
        assert!(!store.delete("/svc/a").await.unwrap());

        let put = next_batch(&mut stream).await;
        assert_eq!(put.events.len(), 1);
        assert_eq!(put.events[0].kind, EventKind::Put);

        let delete = next_batch(&mut stream).await;
        assert_eq!(delete.events[0].kind, EventKind::Delete);
        assert_eq!(delete.events[0].key, "/svc/a");
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = MemoryStore::new();
        let first = store.put("/svc/a", Bytes::from("1"), None).await.unwrap();
        store.put("/svc/b", Bytes::from("2"), None).await.unwrap();

        let mut stream = store.watch("/svc/", Some(first + 1)).await.unwrap();
        let replay = next_batch(&mut stream).await;
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].key, "/svc/b");
    }

    #[tokio::test]
    async fn test_watch_compacted_revision() {
        let store = MemoryStore::new();
        store.put("/svc/a", Bytes::from("1"), None).await.unwrap();
        store.put("/svc/a", Bytes::from("2"), None).await.unwrap();
        store.compact(store.revision());

        let err = store.watch("/svc/", Some(1)).await.err().unwrap();
        assert!(matches!(err, RegistryError::Compacted { .. }));
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/svc/a", Bytes::from("1"), Some(lease)).await.unwrap();
        let mut stream = store.watch("/svc/", None).await.unwrap();

        store.revoke(lease).await.unwrap();
        assert!(store.get("/svc/a").await.unwrap().kvs.is_empty());
        assert_eq!(next_batch(&mut stream).await.events[0].kind, EventKind::Delete);

        let err = store.revoke(lease).await.unwrap_err();
        assert_eq!(err, RegistryError::LeaseNotFound { lease_id: lease });
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease() {
        let store = MemoryStore::new();
        let err = store
            .put("/svc/a", Bytes::from("1"), Some(LeaseId(99)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::LeaseNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/svc/a", Bytes::from("1"), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(store.get("/svc/a").await.unwrap().kvs.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_keeps_lease() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(3).await.unwrap();
        store.put("/svc/a", Bytes::from("1"), Some(lease)).await.unwrap();
        let mut acks = store.keepalive(lease).await.unwrap();

        let drain = tokio::spawn(async move {
            let mut count = 0;
            while let Some(Ok(ack)) = acks.next().await {
                if ack.ttl_secs <= 0 {
                    break;
                }
                count += 1;
            }
            count
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get("/svc/a").await.unwrap().kvs.len(), 1);

        store.revoke(lease).await.unwrap();
        let count = drain.await.unwrap();
        assert!(count >= 3);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let store = MemoryStore::new();
        let other = store.session();
        store.close().await.unwrap();

        assert_eq!(store.get("/").await.unwrap_err(), RegistryError::StoreClosed);
        assert!(other.get("/").await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let store = MemoryStore::new();
        store.fail_next(StoreOperation::Put, 1);

        let err = store.put("/k", Bytes::from("v"), None).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(store.put("/k", Bytes::from("v"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_watches_ends_streams() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/svc/", None).await.unwrap();
        assert_eq!(store.watcher_count(), 1);

        store.sever_watches();
        assert!(stream.next().await.is_none());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_unregisters_watcher() {
        let store = MemoryStore::new();
        let stream = store.watch("/svc/", None).await.unwrap();
        drop(stream);
        assert_eq!(store.watcher_count(), 0);
    }
}
