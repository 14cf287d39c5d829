//! Registry cache
//!
//! TigerStyle: Single writer lock over records, pools rebuilt inside it.
//!
//! Holds the discovered `key -> AddressRecord` map and one
//! [`WeightedSelector`] per [`ServiceType`]. Candidate order is key order, so
//! selection is deterministic for a given set of records.

use crate::error::RegistryResult;
use crate::record::{AddressRecord, ServiceType};
use crate::selector::WeightedSelector;
use crate::store::Snapshot;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};
use waymark_core::RebuildMode;

/// Discovered records and their selection pools
#[derive(Debug)]
pub struct RegistryCache {
    records: RwLock<BTreeMap<String, AddressRecord>>,
    pools: RwLock<HashMap<ServiceType, Arc<WeightedSelector>>>,
    mode: RebuildMode,
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new(RebuildMode::default())
    }
}

impl RegistryCache {
    /// Create an empty cache whose pools use `mode`
    pub fn new(mode: RebuildMode) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            pools: RwLock::new(HashMap::new()),
            mode,
        }
    }

    fn read_records(&self) -> RwLockReadGuard<'_, BTreeMap<String, AddressRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, BTreeMap<String, AddressRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Parse and insert (or replace) the record stored under `key`
    ///
    /// # Errors
    /// Returns `InvalidRecord` if the value does not parse. Any record
    /// previously cached under `key` is removed, matching what a resync of the
    /// same store state would hold.
    pub fn apply_put(&self, key: &str, value: &[u8]) -> RegistryResult<()> {
        match AddressRecord::parse(key, value) {
            Ok(record) => {
                self.insert(record);
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "dropping malformed record");
                self.apply_delete(key);
                Err(e)
            }
        }
    }

    /// Insert (or replace) an already parsed record
    pub fn insert(&self, record: AddressRecord) {
        let mut records = self.write_records();

        let mut affected = BTreeSet::from([record.service_type]);
        debug!(record = %record, "record put");
        if let Some(previous) = records.insert(record.key.clone(), record) {
            affected.insert(previous.service_type);
        }

        self.rebuild_pools(&records, affected);
    }

    /// Remove the record under `key`; unknown keys are ignored
    pub fn apply_delete(&self, key: &str) {
        let mut records = self.write_records();

        let Some(removed) = records.remove(key) else {
            debug!(key = %key, "delete for unknown key");
            return;
        };
        debug!(record = %removed, "record deleted");

        self.rebuild_pools(&records, BTreeSet::from([removed.service_type]));
    }

    /// Make the records under `prefix` match `snapshot` exactly
    ///
    /// Cached keys under `prefix` absent from the snapshot are removed.
    /// Malformed snapshot entries are skipped. Returns the number of records
    /// now cached under `prefix`.
    pub fn replace_prefix(&self, prefix: &str, snapshot: &Snapshot) -> usize {
        let parsed: Vec<AddressRecord> = snapshot
            .kvs
            .iter()
            .filter(|kv| kv.key.starts_with(prefix))
            .filter_map(|kv| match AddressRecord::parse(&kv.key, &kv.value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping malformed snapshot entry");
                    None
                }
            })
            .collect();

        let mut records = self.write_records();
        let mut affected = BTreeSet::new();

        let stale: Vec<String> = records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(previous) = records.remove(&key) {
                affected.insert(previous.service_type);
            }
        }

        let count = parsed.len();
        for record in parsed {
            affected.insert(record.service_type);
            records.insert(record.key.clone(), record);
        }

        self.rebuild_pools(&records, affected);
        debug!(prefix = %prefix, count, revision = snapshot.revision, "prefix resynced");
        count
    }

    /// Rebuild the selectors for `affected` pools from `records`
    ///
    /// Called with the records write lock held.
    fn rebuild_pools(
        &self,
        records: &BTreeMap<String, AddressRecord>,
        affected: BTreeSet<ServiceType>,
    ) {
        let mut pools = self.pools.write().unwrap_or_else(|p| p.into_inner());

        for service_type in affected {
            let candidates: Vec<(String, i64)> = records
                .values()
                .filter(|r| r.service_type == service_type)
                .map(|r| (r.address.clone(), i64::from(r.weight)))
                .collect();

            pools
                .entry(service_type)
                .or_insert_with(|| Arc::new(WeightedSelector::new(self.mode)))
                .rebuild(candidates);
        }
    }

    /// Pick an address from the `service_type` pool
    pub fn resolve(&self, service_type: ServiceType) -> Option<String> {
        self.pool(service_type)?.next()
    }

    /// Selector for `service_type`, if that pool has ever had records
    pub fn pool(&self, service_type: ServiceType) -> Option<Arc<WeightedSelector>> {
        self.pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&service_type)
            .cloned()
    }

    /// Point-in-time copy of every record, ordered by key
    pub fn list(&self) -> Vec<AddressRecord> {
        self.read_records().values().cloned().collect()
    }

    /// Record stored under `key`
    pub fn get(&self, key: &str) -> Option<AddressRecord> {
        self.read_records().get(key).cloned()
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    /// Whether the cache holds no records
    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::record::RecordPayload;
    use crate::store::KeyValue;
    use bytes::Bytes;

    fn payload(ip: &str, port: u16, weight: i64, service_type: ServiceType) -> Vec<u8> {
        RecordPayload::new(ip, port)
            .with_weight(weight)
            .with_service_type(service_type)
            .to_json()
            .unwrap()
            .into_bytes()
    }

    fn kv(key: &str, value: Vec<u8>) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Bytes::from(value),
            mod_revision: 1,
            lease: None,
        }
    }

    #[test]
    fn test_put_then_delete() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/a", &payload("10.0.0.1", 80, 1, ServiceType::TCP))
            .unwrap();
        assert_eq!(cache.resolve(ServiceType::TCP).as_deref(), Some("10.0.0.1:80"));

        cache.apply_delete("/svc/a");
        assert!(cache.get("/svc/a").is_none());
        assert_eq!(cache.resolve(ServiceType::TCP), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_second_put_replaces() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/a", &payload("10.0.0.1", 80, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/svc/a", &payload("10.0.0.2", 81, 5, ServiceType::TCP))
            .unwrap();

        assert_eq!(cache.len(), 1);
        let record = cache.get("/svc/a").unwrap();
        assert_eq!(record.address, "10.0.0.2:81");
        assert_eq!(record.weight, 5);
        assert_eq!(
            cache.pool(ServiceType::TCP).unwrap().candidates(),
            vec![("10.0.0.2:81".to_string(), 5)]
        );
    }

    #[test]
    fn test_service_type_change_moves_pools() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/a", &payload("h", 80, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/svc/a", &payload("h", 80, 1, ServiceType::WEBSOCKET))
            .unwrap();

        assert_eq!(cache.resolve(ServiceType::TCP), None);
        assert_eq!(cache.resolve(ServiceType::WEBSOCKET).as_deref(), Some("h:80"));
    }

    #[test]
    fn test_malformed_put_evicts_superseded_record() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/a", &payload("10.0.0.1", 80, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/svc/b", &payload("10.0.0.2", 80, 1, ServiceType::TCP))
            .unwrap();

        let err = cache.apply_put("/svc/a", br#"{"port":"80"}"#).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { .. }));
        assert!(cache.get("/svc/a").is_none());
        assert_eq!(
            cache.pool(ServiceType::TCP).unwrap().candidates(),
            vec![("10.0.0.2:80".to_string(), 1)]
        );
    }

    #[test]
    fn test_malformed_put_matches_resync() {
        let bad = br#"{"port":"80"}"#.to_vec();

        let watched = RegistryCache::default();
        watched
            .apply_put("/svc/a", &payload("10.0.0.1", 80, 1, ServiceType::TCP))
            .unwrap();
        assert!(watched.apply_put("/svc/a", &bad).is_err());

        let resynced = RegistryCache::default();
        resynced
            .apply_put("/svc/a", &payload("10.0.0.1", 80, 1, ServiceType::TCP))
            .unwrap();
        let snapshot = Snapshot {
            kvs: vec![kv("/svc/a", bad)],
            revision: 2,
        };
        assert_eq!(resynced.replace_prefix("/svc/", &snapshot), 0);

        assert_eq!(watched.list(), resynced.list());
        assert_eq!(watched.resolve(ServiceType::TCP), None);
        assert_eq!(resynced.resolve(ServiceType::TCP), None);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let cache = RegistryCache::default();
        cache.apply_delete("/svc/missing");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_prefix() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/stale", &payload("old", 1, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/other/keep", &payload("keep", 2, 1, ServiceType::TCP))
            .unwrap();

        let snapshot = Snapshot {
            kvs: vec![
                kv("/svc/a", payload("new", 3, 1, ServiceType::TCP)),
                kv("/svc/bad", b"{}".to_vec()),
            ],
            revision: 9,
        };
        assert_eq!(cache.replace_prefix("/svc/", &snapshot), 1);

        let keys: Vec<_> = cache.list().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["/other/keep", "/svc/a"]);
    }

    #[test]
    fn test_pools_are_independent() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/tcp", &payload("t", 1, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/svc/ws", &payload("w", 2, 1, ServiceType::WEBSOCKET))
            .unwrap();

        for _ in 0..3 {
            assert_eq!(cache.resolve(ServiceType::TCP).as_deref(), Some("t:1"));
            assert_eq!(cache.resolve(ServiceType::WEBSOCKET).as_deref(), Some("w:2"));
        }
        assert_eq!(cache.resolve(ServiceType(9)), None);
    }

    #[test]
    fn test_candidates_follow_key_order() {
        let cache = RegistryCache::default();
        cache
            .apply_put("/svc/b", &payload("b", 1, 1, ServiceType::TCP))
            .unwrap();
        cache
            .apply_put("/svc/a", &payload("a", 1, 1, ServiceType::TCP))
            .unwrap();

        assert_eq!(cache.resolve(ServiceType::TCP).as_deref(), Some("a:1"));
        assert_eq!(cache.resolve(ServiceType::TCP).as_deref(), Some("b:1"));
    }
}
