//! Waymark Core
//!
//! Core constants, errors, configuration and telemetry for the Waymark
//! service registry.
//!
//! # Overview
//!
//! Waymark is a client-side service-registry layer over a coordination store:
//! processes announce their address under a lease, discover the live set of
//! addresses under key prefixes, and pick one with smooth weighted round robin.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `LEASE_TTL_SECS_MAX`)
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod telemetry;

pub use config::{
    validate_prefixes, DiscoveryConfig, RebuildMode, RegistrationConfig, RenewalFailurePolicy,
    StoreConfig, WaymarkConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
