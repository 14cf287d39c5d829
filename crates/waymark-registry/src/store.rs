//! Coordination store abstraction
//!
//! TigerStyle: Explicit trait bounds, explicit error handling.
//!
//! Discovery and registration only need a handful of primitives from the
//! underlying store (etcd-like). They are collected in [`CoordinationStore`]
//! so that production clients and the in-memory [`MemoryStore`] are
//! interchangeable.
//!
//! [`MemoryStore`]: crate::memory::MemoryStore

use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Store revision (monotonically increasing per mutation)
pub type Revision = u64;

/// Lease identifier issued by the store
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Matching pairs ordered by key
    pub kvs: Vec<KeyValue>,
    /// Store revision the snapshot was taken at
    pub revision: Revision,
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed on a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Bytes,
    /// Revision at which the change happened
    pub revision: Revision,
}

impl WatchEvent {
    /// Create a put event
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>, revision: Revision) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
            revision,
        }
    }

    /// Create a delete event
    pub fn delete(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: Bytes::new(),
            revision,
        }
    }
}

/// Events delivered together by one watch response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    /// Store revision when the batch was sent
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Lease renewal acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveAck {
    pub lease_id: LeaseId,
    /// Remaining TTL after renewal; `<= 0` means the lease is gone
    pub ttl_secs: i64,
}

/// Change stream for a prefix
///
/// An `Err` item (e.g. [`RegistryError::Compacted`]) or the end of the stream
/// means the subscription is over and must be re-established.
pub type WatchStream = BoxStream<'static, RegistryResult<WatchBatch>>;

/// Stream of renewal acknowledgements for one lease
///
/// Must be drained continuously; it ends when the lease is revoked, expires,
/// or the session is lost.
pub type KeepaliveStream = BoxStream<'static, RegistryResult<KeepaliveAck>>;

/// The coordination-store capabilities consumed by Waymark
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read every key under `prefix` (a full key matches itself)
    async fn get(&self, prefix: &str) -> RegistryResult<Snapshot>;

    /// Subscribe to changes under `prefix`
    ///
    /// With `from_revision`, events at or after that revision are replayed
    /// first. Fails with `Compacted` if that history is gone.
    async fn watch(&self, prefix: &str, from_revision: Option<Revision>)
        -> RegistryResult<WatchStream>;

    /// Grant a lease with the given TTL
    async fn grant_lease(&self, ttl_secs: i64) -> RegistryResult<LeaseId>;

    /// Write a key, optionally bound to a lease
    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> RegistryResult<Revision>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> RegistryResult<bool>;

    /// Start renewing a lease
    async fn keepalive(&self, lease: LeaseId) -> RegistryResult<KeepaliveStream>;

    /// Revoke a lease and delete every key bound to it
    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Close this session; later calls fail with `StoreClosed`
    async fn close(&self) -> RegistryResult<()>;
}

/// Bound a store call by `timeout`
///
/// Every direct call to the store goes through here so that a hung
/// store cannot stall a caller or a background task indefinitely.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> RegistryResult<T>
where
    F: Future<Output = RegistryResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::StoreTimeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
