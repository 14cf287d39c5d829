//! TigerStyle constants for Waymark
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Coordination Store
// =============================================================================

/// Default timeout for a single coordination-store call in milliseconds (1 sec)
pub const STORE_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 1000;

/// Maximum timeout for a single coordination-store call in milliseconds (30 sec)
pub const STORE_REQUEST_TIMEOUT_MS_MAX: u64 = 30 * 1000;

/// Default dial timeout when connecting to the store in milliseconds (5 sec)
pub const STORE_DIAL_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Default config file path
pub const CONFIG_PATH_DEFAULT: &str = "deploy/reg_etcd.json";

// =============================================================================
// Leases
// =============================================================================

/// Default lease TTL in seconds
pub const LEASE_TTL_SECS_DEFAULT: i64 = 30;

/// Minimum lease TTL in seconds
pub const LEASE_TTL_SECS_MIN: i64 = 1;

/// Maximum lease TTL in seconds (1 hour)
pub const LEASE_TTL_SECS_MAX: i64 = 60 * 60;

/// Keepalive requests are sent every `ttl / LEASE_KEEPALIVE_DIVISOR`
pub const LEASE_KEEPALIVE_DIVISOR: u64 = 3;

/// Default maximum re-registration attempts after a lost lease
pub const REREGISTER_RETRY_COUNT_MAX_DEFAULT: u32 = 5;

/// Default backoff between re-registration attempts in milliseconds
pub const REREGISTER_BACKOFF_MS_DEFAULT: u64 = 500;

// =============================================================================
// Discovery
// =============================================================================

/// Default capacity of the per-prefix event buffer
pub const WATCH_EVENT_BUFFER_COUNT_DEFAULT: usize = 64;

/// Maximum capacity of the per-prefix event buffer
pub const WATCH_EVENT_BUFFER_COUNT_MAX: usize = 64 * 1024;

/// Default maximum consecutive resubscription failures before escalating
pub const RESUBSCRIBE_RETRY_COUNT_MAX_DEFAULT: u32 = 5;

/// Default backoff between resubscription attempts in milliseconds
pub const RESUBSCRIBE_BACKOFF_MS_DEFAULT: u64 = 200;

/// Maximum number of prefixes a single discovery instance watches
pub const WATCH_PREFIXES_COUNT_MAX: usize = 256;

// =============================================================================
// Records
// =============================================================================

/// Weight assigned to records that omit it or carry a non-positive value
pub const RECORD_WEIGHT_DEFAULT: u32 = 1;

/// Maximum size of a record payload in bytes (64 KB)
pub const RECORD_PAYLOAD_SIZE_BYTES_MAX: usize = 64 * 1024;

/// Failure channel capacity for background task errors
pub const FAILURE_CHANNEL_COUNT_MAX: usize = 64;

// Compile-time assertions for constant validity
const _: () = {
    assert!(LEASE_TTL_SECS_MIN > 0);
    assert!(LEASE_TTL_SECS_DEFAULT >= LEASE_TTL_SECS_MIN);
    assert!(LEASE_TTL_SECS_DEFAULT <= LEASE_TTL_SECS_MAX);
    assert!(STORE_REQUEST_TIMEOUT_MS_DEFAULT <= STORE_REQUEST_TIMEOUT_MS_MAX);
    assert!(WATCH_EVENT_BUFFER_COUNT_DEFAULT <= WATCH_EVENT_BUFFER_COUNT_MAX);
    assert!(RECORD_WEIGHT_DEFAULT >= 1);
};
