//! Lease-backed registration
//!
//! TigerStyle: Explicit state machine, no partial registrations.
//!
//! A [`Registrar`] publishes one key under a lease and keeps the lease alive
//! from a background task:
//!
//! ```text
//! Unregistered -> Registering -> Registered(lease) -> Closing -> Closed
//!                                   |      ^
//!                     lease lost    v      | new lease
//!                                Reregistering -> Failed
//! ```
//!
//! What happens when renewal stops is chosen by
//! [`RenewalFailurePolicy`](waymark_core::RenewalFailurePolicy).

use crate::error::{RegistryError, RegistryResult};
use crate::record::RecordPayload;
use crate::store::{with_timeout, CoordinationStore, KeepaliveStream, LeaseId};
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use waymark_core::config::validate_ttl_secs;
use waymark_core::constants::FAILURE_CHANNEL_COUNT_MAX;
use waymark_core::{RegistrationConfig, RenewalFailurePolicy};

/// Registrar lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    /// Nothing published
    Unregistered,
    /// Grant/put/keepalive in progress
    Registering,
    /// Published and renewing under `lease_id`
    Registered { lease_id: LeaseId },
    /// Lease lost, publishing again
    Reregistering { attempt: u32 },
    /// Close in progress
    Closing,
    /// Closed; no further registrations
    Closed,
    /// Renewal lost and not recovered
    Failed,
}

impl RegistrarState {
    /// Whether the registrar is being or has been closed
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Registering => write!(f, "registering"),
            Self::Registered { lease_id } => write!(f, "registered({})", lease_id),
            Self::Reregistering { attempt } => write!(f, "reregistering(attempt {})", attempt),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The published key and the lease it is bound to
#[derive(Debug, Clone)]
struct LeaseBinding {
    lease_id: LeaseId,
    key: String,
    value: Bytes,
    ttl_secs: i64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<RegistrarState>,
    binding: Mutex<Option<LeaseBinding>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RegistrarState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn binding(&self) -> MutexGuard<'_, Option<LeaseBinding>> {
        self.binding.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Set `next` unless a close has started
    fn transition(&self, next: RegistrarState) -> bool {
        let mut state = self.state();
        if state.is_closing() {
            return false;
        }
        *state = next;
        true
    }
}

struct KeepaliveTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Publishes one key under a lease and keeps it alive
pub struct Registrar<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    config: RegistrationConfig,
    shared: Arc<Shared>,
    failures: broadcast::Sender<RegistryError>,
    task: Mutex<Option<KeepaliveTask>>,
}

impl<S: CoordinationStore + ?Sized + 'static> Registrar<S> {
    /// Create an unregistered registrar
    pub fn new(store: Arc<S>, config: RegistrationConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_COUNT_MAX);
        Self {
            store,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(RegistrarState::Unregistered),
                binding: Mutex::new(None),
            }),
            failures,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<KeepaliveTask>> {
        self.task.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegistrarState {
        *self.shared.state()
    }

    /// Lease currently bound to the registration
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.shared.binding().as_ref().map(|b| b.lease_id)
    }

    /// Receive renewal failures the keepalive task could not recover from
    pub fn subscribe_failures(&self) -> broadcast::Receiver<RegistryError> {
        self.failures.subscribe()
    }

    /// Publish `payload` under `key` with the configured TTL
    pub async fn announce(&self, key: &str, payload: &RecordPayload) -> RegistryResult<LeaseId> {
        self.register_record(key, payload, self.config.ttl_secs).await
    }

    /// Publish a [`RecordPayload`] under `key`
    pub async fn register_record(
        &self,
        key: &str,
        payload: &RecordPayload,
        ttl_secs: i64,
    ) -> RegistryResult<LeaseId> {
        let value = payload.to_json()?;
        self.register(key, value, ttl_secs).await
    }

    /// Publish `value` under `key`, bound to a fresh lease of `ttl_secs`
    ///
    /// Grants the lease, writes the key, opens the keepalive stream and spawns
    /// the renewal task. If any step fails the granted lease is revoked and
    /// nothing stays published.
    ///
    /// # Errors
    /// `AlreadyRegistered` if a registration is active, `StoreClosed` after
    /// [`close`](Self::close), `Config` for an out-of-range TTL, otherwise
    /// `RegistrationFailed` or the grant error.
    pub async fn register(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl_secs: i64,
    ) -> RegistryResult<LeaseId> {
        validate_ttl_secs(ttl_secs)?;
        let value = value.into();

        {
            let mut state = self.shared.state();
            match *state {
                RegistrarState::Unregistered | RegistrarState::Failed => {
                    *state = RegistrarState::Registering;
                }
                RegistrarState::Closing | RegistrarState::Closed => {
                    return Err(RegistryError::StoreClosed);
                }
                _ => {
                    let key = self
                        .shared
                        .binding()
                        .as_ref()
                        .map(|b| b.key.clone())
                        .unwrap_or_else(|| key.to_string());
                    return Err(RegistryError::AlreadyRegistered { key });
                }
            }
        }

        // a keepalive task left over from a failed registration
        self.stop_keepalive().await;

        let (lease_id, stream) =
            match publish(self.store.as_ref(), &self.config, key, &value, ttl_secs).await {
                Ok(published) => published,
                Err(e) => {
                    self.shared.transition(RegistrarState::Unregistered);
                    return Err(e);
                }
            };

        let binding = LeaseBinding {
            lease_id,
            key: key.to_string(),
            value,
            ttl_secs,
        };
        let previous = self.shared.binding().replace(binding.clone());
        if let Some(previous) = previous {
            revoke_previous(self.store.as_ref(), &self.config, previous.lease_id).await;
        }

        if !self.shared.transition(RegistrarState::Registered { lease_id }) {
            // closed while registering; close() may have missed this lease
            let _ = with_timeout(
                self.config.request_timeout(),
                "revoke",
                self.store.revoke(lease_id),
            )
            .await;
            self.shared.binding().take();
            return Err(RegistryError::StoreClosed);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let keepalive = KeepaliveLoop {
            store: self.store.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            failures: self.failures.clone(),
            shutdown: shutdown_rx,
            binding,
        };
        let handle = tokio::spawn(keepalive.run(stream));
        *self.task() = Some(KeepaliveTask {
            shutdown_tx,
            handle,
        });

        info!(key = %key, lease = %lease_id, ttl_secs, "registered");
        Ok(lease_id)
    }

    async fn stop_keepalive(&self) {
        let task = self.task().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "keepalive task did not stop cleanly");
            }
        }
    }

    /// Revoke the current lease, deleting the key; the registrar can register again
    ///
    /// Without an active lease this logs a warning and does nothing.
    pub async fn revoke(&self) -> RegistryResult<()> {
        if self.shared.binding().is_none() {
            warn!("revoke without an active lease");
            return Ok(());
        }

        self.stop_keepalive().await;
        let binding = self.shared.binding().take();
        self.shared.transition(RegistrarState::Unregistered);

        let Some(binding) = binding else {
            return Ok(());
        };
        with_timeout(
            self.config.request_timeout(),
            "revoke",
            self.store.revoke(binding.lease_id),
        )
        .await?;
        info!(key = %binding.key, lease = %binding.lease_id, "lease revoked");
        Ok(())
    }

    /// Stop renewing, revoke the lease and close the store session
    ///
    /// Revocation and session close are best effort. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state();
            if state.is_closing() {
                return;
            }
            *state = RegistrarState::Closing;
        }

        self.stop_keepalive().await;

        let binding = self.shared.binding().take();
        if let Some(binding) = binding {
            match with_timeout(
                self.config.request_timeout(),
                "revoke",
                self.store.revoke(binding.lease_id),
            )
            .await
            {
                Ok(()) => debug!(key = %binding.key, lease = %binding.lease_id, "lease revoked"),
                Err(e) => warn!(
                    key = %binding.key,
                    lease = %binding.lease_id,
                    error = %e,
                    "failed to revoke lease on close"
                ),
            }
        }

        if let Err(e) =
            with_timeout(self.config.request_timeout(), "close", self.store.close()).await
        {
            warn!(error = %e, "failed to close store session");
        }

        *self.shared.state() = RegistrarState::Closed;
        info!("registrar closed");
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for Registrar<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            let _ = task.shutdown_tx.send(true);
        }
    }
}

/// Grant, put and open keepalive; revoke the grant if a later step fails
async fn publish<S: CoordinationStore + ?Sized>(
    store: &S,
    config: &RegistrationConfig,
    key: &str,
    value: &Bytes,
    ttl_secs: i64,
) -> RegistryResult<(LeaseId, KeepaliveStream)> {
    let timeout = config.request_timeout();
    let lease_id = with_timeout(timeout, "grant_lease", store.grant_lease(ttl_secs)).await?;

    let published: RegistryResult<KeepaliveStream> = async {
        with_timeout(timeout, "put", store.put(key, value.clone(), Some(lease_id))).await?;
        with_timeout(timeout, "keepalive", store.keepalive(lease_id)).await
    }
    .await;

    match published {
        Ok(stream) => Ok((lease_id, stream)),
        Err(e) => {
            if let Err(revoke_err) =
                with_timeout(timeout, "revoke", store.revoke(lease_id)).await
            {
                warn!(lease = %lease_id, error = %revoke_err, "failed to revoke lease after failed registration");
            }
            Err(RegistryError::registration_failed(key, e.to_string()))
        }
    }
}

/// Best-effort revoke of a lease superseded by a new registration
///
/// A key republished under the new lease is no longer bound to the old one
/// and survives the revoke.
async fn revoke_previous<S: CoordinationStore + ?Sized>(
    store: &S,
    config: &RegistrationConfig,
    lease_id: LeaseId,
) {
    if let Err(e) = with_timeout(config.request_timeout(), "revoke", store.revoke(lease_id)).await {
        debug!(lease = %lease_id, error = %e, "previous lease not revoked");
    }
}

// =============================================================================
// Keepalive
// =============================================================================

struct KeepaliveLoop<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    config: RegistrationConfig,
    shared: Arc<Shared>,
    failures: broadcast::Sender<RegistryError>,
    shutdown: watch::Receiver<bool>,
    binding: LeaseBinding,
}

impl<S: CoordinationStore + ?Sized> KeepaliveLoop<S> {
    async fn run(mut self, mut stream: KeepaliveStream) {
        loop {
            let Some(reason) = self.drain(&mut stream).await else {
                break;
            };
            warn!(
                key = %self.binding.key,
                lease = %self.binding.lease_id,
                reason = %reason,
                "lease lost"
            );

            match self.config.renewal_failure_policy {
                RenewalFailurePolicy::Fail => {
                    self.fail(reason).await;
                    break;
                }
                RenewalFailurePolicy::Reregister => match self.reregister(reason).await {
                    Some(next) => stream = next,
                    None => break,
                },
            }
        }
        debug!(key = %self.binding.key, "keepalive task stopped");
    }

    /// Read acks until the lease is lost; `None` on shutdown
    async fn drain(&mut self, stream: &mut KeepaliveStream) -> Option<String> {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => return None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(ack)) if ack.ttl_secs > 0 => {
                    debug!(lease = %ack.lease_id, ttl_secs = ack.ttl_secs, "lease renewed");
                }
                Some(Ok(_)) => return Some("lease expired".to_string()),
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("keepalive stream ended".to_string()),
            }
        }
    }

    /// Move to `Failed`, drop the lost binding and report it
    ///
    /// The lost lease is revoked so a lease that is still alive stops
    /// advertising the key before its TTL runs out.
    async fn fail(&self, reason: String) {
        let lost = {
            let mut state = self.shared.state();
            if state.is_closing() {
                None
            } else {
                *state = RegistrarState::Failed;
                let mut binding = self.shared.binding();
                let current = binding.as_ref().map(|b| b.lease_id);
                if current == Some(self.binding.lease_id) {
                    binding.take()
                } else {
                    None
                }
            }
        };
        if let Some(lost) = lost {
            revoke_previous(self.store.as_ref(), &self.config, lost.lease_id).await;
        }

        let failure = RegistryError::KeepaliveLost {
            key: self.binding.key.clone(),
            lease_id: self.binding.lease_id,
            reason,
        };
        error!(error = %failure, "registration failed");
        let _ = self.failures.send(failure);
    }

    async fn reregister(&mut self, reason: String) -> Option<KeepaliveStream> {
        let attempts_max = self.config.reregister_retry_count_max.max(1);
        let mut last_reason = reason;

        for attempt in 1..=attempts_max {
            if !self
                .shared
                .transition(RegistrarState::Reregistering { attempt })
            {
                return None;
            }
            if attempt > 1 {
                let backoff: Duration = self.config.reregister_backoff() * (attempt - 1);
                tokio::select! {
                    _ = self.shutdown.changed() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            match publish(
                self.store.as_ref(),
                &self.config,
                &self.binding.key,
                &self.binding.value,
                self.binding.ttl_secs,
            )
            .await
            {
                Ok((lease_id, stream)) => {
                    let previous = std::mem::replace(&mut self.binding.lease_id, lease_id);
                    *self.shared.binding() = Some(self.binding.clone());
                    revoke_previous(self.store.as_ref(), &self.config, previous).await;
                    if !self.shared.transition(RegistrarState::Registered { lease_id }) {
                        // close() revokes whatever lease the binding holds
                        return None;
                    }
                    info!(key = %self.binding.key, lease = %lease_id, attempt, "re-registered");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(key = %self.binding.key, attempt, error = %e, "re-registration failed");
                    last_reason = e.to_string();
                }
            }
        }

        self.fail(format!(
            "re-registration failed after {} attempts: {}",
            attempts_max, last_reason
        ))
        .await;
        None
    }
}
