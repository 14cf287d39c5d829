//! Prefix discovery
//!
//! TigerStyle: Fail closed on start, bounded retries, explicit shutdown.
//!
//! For every watched prefix discovery loads a snapshot into the
//! [`RegistryCache`] and then follows the store's change stream. Each prefix
//! gets two tasks:
//!
//! - a *pump* that reads the watch stream and forwards events through a
//!   bounded channel, resubscribing (or resyncing from a fresh snapshot) when
//!   the stream ends, fails, or the channel overflows;
//! - an *apply* task that writes events into the cache in delivery order.
//!
//! Failures the pump cannot recover from are published on a broadcast
//! channel, see [`Discovery::subscribe_failures`].

use crate::cache::RegistryCache;
use crate::error::{RegistryError, RegistryResult};
use crate::record::{AddressRecord, ServiceType};
use crate::store::{
    with_timeout, CoordinationStore, EventKind, Revision, Snapshot, WatchBatch, WatchEvent,
    WatchStream,
};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use waymark_core::constants::FAILURE_CHANNEL_COUNT_MAX;
use waymark_core::{validate_prefixes, DiscoveryConfig};

/// Update passed from a prefix pump to its apply task
#[derive(Debug)]
enum PrefixUpdate {
    /// A single change, in store order
    Event(WatchEvent),
    /// Replace everything under the prefix with this snapshot
    Resync(Snapshot),
}

/// Outcome of forwarding one watch batch
#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    All,
    Overflow,
    Closed,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    prefixes: Vec<String>,
}

/// Watches key prefixes and keeps a [`RegistryCache`] in sync
pub struct Discovery<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    config: DiscoveryConfig,
    cache: Arc<RegistryCache>,
    failures: broadcast::Sender<RegistryError>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl<S: CoordinationStore + ?Sized + 'static> Discovery<S> {
    /// Create a discovery instance; nothing is read until [`start`](Self::start)
    pub fn new(store: Arc<S>, config: DiscoveryConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_COUNT_MAX);
        Self {
            cache: Arc::new(RegistryCache::new(config.rebuild_mode)),
            store,
            config,
            failures,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start watching the prefixes from the configuration
    pub async fn discover(&self) -> RegistryResult<()> {
        self.start(self.config.prefixes.clone()).await
    }

    /// Load and start watching `prefixes`
    ///
    /// Each prefix is loaded with a timeout-bounded snapshot read before its
    /// watch starts at `snapshot.revision + 1`. If any prefix fails, the tasks
    /// already started are stopped, the records loaded so far are dropped and
    /// the error is returned.
    ///
    /// # Errors
    /// `AlreadyStarted` if discovery is running, `Config` for invalid
    /// settings, or the store error of the first prefix that failed to load.
    pub async fn start<I, P>(&self, prefixes: I) -> RegistryResult<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.config.validate()?;

        let mut seen = BTreeSet::new();
        let prefixes: Vec<String> = prefixes
            .into_iter()
            .map(Into::into)
            .filter(|p| seen.insert(p.clone()))
            .collect();

        validate_prefixes(&prefixes)?;

        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::AlreadyStarted);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(prefixes.len() * 2);

        for (index, prefix) in prefixes.iter().enumerate() {
            match self.start_prefix(prefix, &shutdown_tx).await {
                Ok(handles) => tasks.extend(handles),
                Err(e) => {
                    error!(prefix = %prefix, error = %e, "discovery start failed");
                    let _ = shutdown_tx.send(true);
                    for task in tasks {
                        let _ = task.await;
                    }
                    for loaded in &prefixes[..index] {
                        self.cache.replace_prefix(loaded, &Snapshot::default());
                    }
                    self.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        info!(prefixes = prefixes.len(), records = self.cache.len(), "discovery started");
        *self.running() = Some(Running {
            shutdown_tx,
            tasks,
            prefixes,
        });
        Ok(())
    }

    async fn start_prefix(
        &self,
        prefix: &str,
        shutdown_tx: &watch::Sender<bool>,
    ) -> RegistryResult<[JoinHandle<()>; 2]> {
        let timeout = self.config.request_timeout();
        let snapshot = with_timeout(timeout, "get", self.store.get(prefix)).await?;
        let stream = with_timeout(
            timeout,
            "watch",
            self.store.watch(prefix, Some(snapshot.revision + 1)),
        )
        .await?;

        let records = self.cache.replace_prefix(prefix, &snapshot);
        info!(prefix = %prefix, records, revision = snapshot.revision, "prefix loaded");

        let (tx, rx) = mpsc::channel(self.config.event_buffer_count);
        let apply = tokio::spawn(run_apply(
            prefix.to_string(),
            self.cache.clone(),
            rx,
            snapshot.revision,
            shutdown_tx.subscribe(),
        ));

        let pump = PrefixPump {
            prefix: prefix.to_string(),
            store: self.store.clone(),
            config: self.config.clone(),
            tx,
            failures: self.failures.clone(),
            shutdown: shutdown_tx.subscribe(),
            last_revision: snapshot.revision,
        };
        let pump = tokio::spawn(pump.run(stream));

        Ok([pump, apply])
    }

    /// Stop all background tasks and wait for them; idempotent
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "discovery task did not stop cleanly");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        info!(prefixes = running.prefixes.len(), "discovery stopped");
    }

    /// Stop, then close the store session
    pub async fn close(&self) {
        self.stop().await;
        if let Err(e) = with_timeout(self.config.request_timeout(), "close", self.store.close()).await
        {
            warn!(error = %e, "failed to close store session");
        }
    }

    /// Whether background tasks are running
    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Prefixes currently watched
    pub fn prefixes(&self) -> Vec<String> {
        self.running()
            .as_ref()
            .map(|r| r.prefixes.clone())
            .unwrap_or_default()
    }

    /// Pick an address from the `service_type` pool
    pub fn resolve(&self, service_type: ServiceType) -> Option<String> {
        self.cache.resolve(service_type)
    }

    /// Point-in-time copy of every discovered record
    pub fn list(&self) -> Vec<AddressRecord> {
        self.cache.list()
    }

    /// Record stored under `key`
    pub fn get(&self, key: &str) -> Option<AddressRecord> {
        self.cache.get(key)
    }

    /// Shared cache backing this instance
    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    /// Receive failures that background tasks could not recover from
    pub fn subscribe_failures(&self) -> broadcast::Receiver<RegistryError> {
        self.failures.subscribe()
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for Discovery<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}

// =============================================================================
// Pump
// =============================================================================

struct PrefixPump<S: CoordinationStore + ?Sized> {
    prefix: String,
    store: Arc<S>,
    config: DiscoveryConfig,
    tx: mpsc::Sender<PrefixUpdate>,
    failures: broadcast::Sender<RegistryError>,
    shutdown: watch::Receiver<bool>,
    /// Highest revision forwarded to the apply task
    last_revision: Revision,
}

impl<S: CoordinationStore + ?Sized> PrefixPump<S> {
    async fn run(mut self, mut stream: WatchStream) {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => break,
                item = stream.next() => item,
            };

            let resync = match item {
                Some(Ok(batch)) => match self.forward(batch) {
                    Forwarded::All => continue,
                    Forwarded::Overflow => true,
                    Forwarded::Closed => break,
                },
                Some(Err(e)) => {
                    warn!(prefix = %self.prefix, error = %e, "watch stream failed");
                    matches!(e, RegistryError::Compacted { .. })
                }
                None => {
                    warn!(prefix = %self.prefix, revision = self.last_revision, "watch stream ended");
                    false
                }
            };

            match self.recover(resync).await {
                Some(next) => stream = next,
                None => break,
            }
        }
        debug!(prefix = %self.prefix, "watch pump stopped");
    }

    fn forward(&mut self, batch: WatchBatch) -> Forwarded {
        for event in batch.events {
            let revision = event.revision;
            match self.tx.try_send(PrefixUpdate::Event(event)) {
                Ok(()) => self.last_revision = self.last_revision.max(revision),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        prefix = %self.prefix,
                        revision,
                        capacity = self.config.event_buffer_count,
                        "event buffer full, dropping event and resyncing"
                    );
                    return Forwarded::Overflow;
                }
                Err(TrySendError::Closed(_)) => return Forwarded::Closed,
            }
        }
        Forwarded::All
    }

    /// Re-establish the watch, resuming from `last_revision + 1` or from a
    /// fresh snapshot when `resync` is set or the resume point is compacted
    async fn recover(&mut self, resync: bool) -> Option<WatchStream> {
        let attempts_max = self.config.resubscribe_retry_count_max.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts_max {
            if attempt > 1 {
                let backoff = self.config.resubscribe_backoff() * (attempt - 1);
                tokio::select! {
                    _ = self.shutdown.changed() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            if *self.shutdown.borrow() {
                return None;
            }

            let result = if resync {
                self.resync().await
            } else {
                match self.resume().await {
                    Err(RegistryError::Compacted {
                        requested,
                        compact_revision,
                    }) => {
                        warn!(
                            prefix = %self.prefix,
                            requested,
                            compact_revision,
                            "resume revision compacted, reloading snapshot"
                        );
                        self.resync().await
                    }
                    other => other,
                }
            };

            match result {
                Ok(stream) => {
                    info!(
                        prefix = %self.prefix,
                        attempt,
                        revision = self.last_revision,
                        "watch re-established"
                    );
                    return Some(stream);
                }
                Err(e) => {
                    warn!(prefix = %self.prefix, attempt, error = %e, "resubscribe failed");
                    last_error = Some(e);
                }
            }
        }

        if *self.shutdown.borrow() {
            return None;
        }

        let failure = RegistryError::WatchFailed {
            prefix: self.prefix.clone(),
            attempts: attempts_max,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        error!(prefix = %self.prefix, error = %failure, "giving up on watch");
        let _ = self.failures.send(failure);
        None
    }

    async fn resume(&self) -> RegistryResult<WatchStream> {
        with_timeout(
            self.config.request_timeout(),
            "watch",
            self.store.watch(&self.prefix, Some(self.last_revision + 1)),
        )
        .await
    }

    async fn resync(&mut self) -> RegistryResult<WatchStream> {
        let timeout = self.config.request_timeout();
        let snapshot = with_timeout(timeout, "get", self.store.get(&self.prefix)).await?;
        let stream = with_timeout(
            timeout,
            "watch",
            self.store.watch(&self.prefix, Some(snapshot.revision + 1)),
        )
        .await?;

        let revision = snapshot.revision;
        self.tx
            .send(PrefixUpdate::Resync(snapshot))
            .await
            .map_err(|_| RegistryError::Internal {
                message: format!("apply task for {} stopped", self.prefix),
            })?;
        self.last_revision = revision;
        Ok(stream)
    }
}

// =============================================================================
// Apply
// =============================================================================

/// Apply updates for one prefix in delivery order
///
/// Events at or below the revision of the latest snapshot are skipped.
async fn run_apply(
    prefix: String,
    cache: Arc<RegistryCache>,
    mut rx: mpsc::Receiver<PrefixUpdate>,
    mut floor: Revision,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let update = tokio::select! {
            _ = shutdown.changed() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        match update {
            PrefixUpdate::Resync(snapshot) => {
                floor = snapshot.revision;
                cache.replace_prefix(&prefix, &snapshot);
            }
            PrefixUpdate::Event(event) if event.revision <= floor => {
                debug!(key = %event.key, revision = event.revision, floor, "skipping stale event");
            }
            PrefixUpdate::Event(event) => match event.kind {
                EventKind::Put => {
                    // malformed payloads are logged by the cache and skipped
                    let _ = cache.apply_put(&event.key, &event.value);
                }
                EventKind::Delete => cache.apply_delete(&event.key),
            },
        }
    }
    debug!(prefix = %prefix, "apply task stopped");
}
