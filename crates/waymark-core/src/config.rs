//! Configuration for Waymark
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for Waymark
///
/// Also accepts the legacy `{"etcd": {endpoints, dts, etcdUser, etcdPass,
/// watcher}}` layout; `watcher` is folded into `discovery.prefixes` and `dts`
/// (seconds) overrides `store.dial_timeout_ms`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ConfigFile")]
pub struct WaymarkConfig {
    /// Coordination store connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Discovery (watch side) settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Registration (lease side) settings
    #[serde(default)]
    pub registration: RegistrationConfig,
}

impl WaymarkConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.discovery.validate()?;
        self.registration.validate()?;
        Ok(())
    }

    /// Parse and validate a configuration from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::ConfigLoadFailed {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    ///
    /// Falls back to [`CONFIG_PATH_DEFAULT`] when `path` is `None`.
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_PATH_DEFAULT));
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self =
            serde_json::from_str(&contents).map_err(|e| Error::ConfigLoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            endpoints = config.store.endpoints.len(),
            prefixes = config.discovery.prefixes.len(),
            "Configuration loaded"
        );

        Ok(config)
    }
}

/// On-disk shape, including the legacy fields nested in the store section
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default, alias = "etcd")]
    store: StoreSection,
    #[serde(default)]
    discovery: DiscoveryConfig,
    #[serde(default)]
    registration: RegistrationConfig,
}

#[derive(Default, Deserialize)]
struct StoreSection {
    #[serde(flatten)]
    store: StoreConfig,
    /// Prefixes to watch (legacy)
    #[serde(default)]
    watcher: Vec<String>,
    /// Dial timeout in seconds (legacy)
    #[serde(default)]
    dts: Option<u64>,
}

impl From<ConfigFile> for WaymarkConfig {
    fn from(file: ConfigFile) -> Self {
        let StoreSection {
            mut store,
            watcher,
            dts,
        } = file.store;
        let mut discovery = file.discovery;

        if let Some(dts) = dts {
            store.dial_timeout_ms = dts.saturating_mul(1000);
        }
        for prefix in watcher {
            if !discovery.prefixes.contains(&prefix) {
                discovery.prefixes.push(prefix);
            }
        }

        Self {
            store,
            discovery,
            registration: file.registration,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Coordination store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints (host:port)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Dial timeout (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Timeout applied to every direct store call (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Optional username
    #[serde(default, alias = "etcdUser")]
    pub username: Option<String>,

    /// Optional password
    #[serde(default, alias = "etcdPass", skip_serializing)]
    pub password: Option<String>,
}

fn default_dial_timeout_ms() -> u64 {
    STORE_DIAL_TIMEOUT_MS_DEFAULT
}

fn default_request_timeout_ms() -> u64 {
    STORE_REQUEST_TIMEOUT_MS_DEFAULT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            username: None,
            password: None,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        for endpoint in &self.endpoints {
            if !endpoint.contains(':') {
                return Err(Error::invalid_configuration(
                    "store.endpoints",
                    format!("{} must be in host:port format", endpoint),
                ));
            }
        }
        validate_request_timeout("store.request_timeout_ms", self.request_timeout_ms)?;
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::invalid_configuration(
                "store.username",
                "username and password must be set together",
            ));
        }
        Ok(())
    }

    /// Get the dial timeout as Duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn validate_request_timeout(field: &str, timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 || timeout_ms > STORE_REQUEST_TIMEOUT_MS_MAX {
        return Err(Error::invalid_configuration(
            field,
            format!(
                "{} must be in 1..={}",
                timeout_ms, STORE_REQUEST_TIMEOUT_MS_MAX
            ),
        ));
    }
    Ok(())
}

// =============================================================================
// Discovery
// =============================================================================

/// How a selector treats its accumulated round-robin state on rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildMode {
    /// Replace the node list wholesale; accumulators restart from zero
    #[default]
    Reset,
    /// Carry accumulators over for addresses present before and after
    Preserve,
}

/// Discovery (watch side) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Key prefixes to watch
    #[serde(default, alias = "watcher")]
    pub prefixes: Vec<String>,

    /// Capacity of the per-prefix event buffer
    #[serde(default = "default_event_buffer_count")]
    pub event_buffer_count: usize,

    /// Consecutive resubscription failures tolerated before escalating
    #[serde(default = "default_resubscribe_retry_count_max")]
    pub resubscribe_retry_count_max: u32,

    /// Backoff between resubscription attempts (milliseconds)
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,

    /// Timeout applied to snapshot reads and watch creation (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Selector behaviour on rebuild
    #[serde(default)]
    pub rebuild_mode: RebuildMode,
}

fn default_event_buffer_count() -> usize {
    WATCH_EVENT_BUFFER_COUNT_DEFAULT
}

fn default_resubscribe_retry_count_max() -> u32 {
    RESUBSCRIBE_RETRY_COUNT_MAX_DEFAULT
}

fn default_resubscribe_backoff_ms() -> u64 {
    RESUBSCRIBE_BACKOFF_MS_DEFAULT
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            event_buffer_count: default_event_buffer_count(),
            resubscribe_retry_count_max: default_resubscribe_retry_count_max(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            rebuild_mode: RebuildMode::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Create a discovery config watching the given prefixes
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the event buffer capacity
    pub fn with_event_buffer_count(mut self, count: usize) -> Self {
        self.event_buffer_count = count;
        self
    }

    /// Set the resubscription retry budget and backoff
    pub fn with_resubscribe(mut self, retry_count_max: u32, backoff_ms: u64) -> Self {
        self.resubscribe_retry_count_max = retry_count_max;
        self.resubscribe_backoff_ms = backoff_ms;
        self
    }

    /// Set the selector rebuild mode
    pub fn with_rebuild_mode(mut self, mode: RebuildMode) -> Self {
        self.rebuild_mode = mode;
        self
    }

    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the resubscription backoff as Duration
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    /// Validate the discovery settings
    pub fn validate(&self) -> Result<()> {
        validate_prefixes(&self.prefixes)?;
        if self.event_buffer_count == 0 || self.event_buffer_count > WATCH_EVENT_BUFFER_COUNT_MAX
        {
            return Err(Error::invalid_configuration(
                "discovery.event_buffer_count",
                format!(
                    "{} must be in 1..={}",
                    self.event_buffer_count, WATCH_EVENT_BUFFER_COUNT_MAX
                ),
            ));
        }
        validate_request_timeout("discovery.request_timeout_ms", self.request_timeout_ms)?;
        Ok(())
    }
}

/// Validate a set of watch prefixes
///
/// Exact duplicates are allowed (they collapse into one watch). A prefix that
/// contains another is rejected: both watches would write the same keys with
/// no ordering between them.
pub fn validate_prefixes(prefixes: &[String]) -> Result<()> {
    if prefixes.len() > WATCH_PREFIXES_COUNT_MAX {
        return Err(Error::invalid_configuration(
            "discovery.prefixes",
            format!(
                "{} exceeds limit {}",
                prefixes.len(),
                WATCH_PREFIXES_COUNT_MAX
            ),
        ));
    }
    if prefixes.iter().any(|p| p.is_empty()) {
        return Err(Error::invalid_configuration(
            "discovery.prefixes",
            "prefix must not be empty",
        ));
    }
    for outer in prefixes {
        if let Some(inner) = prefixes
            .iter()
            .find(|p| *p != outer && p.starts_with(outer.as_str()))
        {
            return Err(Error::invalid_configuration(
                "discovery.prefixes",
                format!("{} overlaps {}", inner, outer),
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Registration
// =============================================================================

/// What the registrar does when its lease can no longer be renewed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalFailurePolicy {
    /// Grant a new lease and publish the key again
    #[default]
    Reregister,
    /// Transition to failed and report to the owner
    Fail,
}

/// Registration (lease side) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Lease TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// Behaviour when the keepalive stream is lost
    #[serde(default)]
    pub renewal_failure_policy: RenewalFailurePolicy,

    /// Maximum re-registration attempts before failing
    #[serde(default = "default_reregister_retry_count_max")]
    pub reregister_retry_count_max: u32,

    /// Backoff between re-registration attempts (milliseconds)
    #[serde(default = "default_reregister_backoff_ms")]
    pub reregister_backoff_ms: u64,

    /// Timeout applied to grant, put and revoke calls (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_ttl_secs() -> i64 {
    LEASE_TTL_SECS_DEFAULT
}

fn default_reregister_retry_count_max() -> u32 {
    REREGISTER_RETRY_COUNT_MAX_DEFAULT
}

fn default_reregister_backoff_ms() -> u64 {
    REREGISTER_BACKOFF_MS_DEFAULT
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            renewal_failure_policy: RenewalFailurePolicy::default(),
            reregister_retry_count_max: default_reregister_retry_count_max(),
            reregister_backoff_ms: default_reregister_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RegistrationConfig {
    /// Set the renewal failure policy
    pub fn with_policy(mut self, policy: RenewalFailurePolicy) -> Self {
        self.renewal_failure_policy = policy;
        self
    }

    /// Set the re-registration retry budget and backoff
    pub fn with_reregister(mut self, retry_count_max: u32, backoff_ms: u64) -> Self {
        self.reregister_retry_count_max = retry_count_max;
        self.reregister_backoff_ms = backoff_ms;
        self
    }

    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the re-registration backoff as Duration
    pub fn reregister_backoff(&self) -> Duration {
        Duration::from_millis(self.reregister_backoff_ms)
    }

    /// Validate the registration settings
    pub fn validate(&self) -> Result<()> {
        validate_ttl_secs(self.ttl_secs)?;
        validate_request_timeout("registration.request_timeout_ms", self.request_timeout_ms)?;
        Ok(())
    }
}

/// Validate a lease TTL against the configured bounds
pub fn validate_ttl_secs(ttl_secs: i64) -> Result<()> {
    if !(LEASE_TTL_SECS_MIN..=LEASE_TTL_SECS_MAX).contains(&ttl_secs) {
        return Err(Error::invalid_configuration(
            "registration.ttl_secs",
            format!(
                "{} must be in {}..={}",
                ttl_secs, LEASE_TTL_SECS_MIN, LEASE_TTL_SECS_MAX
            ),
        ));
    }
    Ok(())
}
