//! Waymark Registry
//!
//! Lease-based service registration, prefix discovery and weighted selection.
//!
//! # Overview
//!
//! The registry provides:
//! - [`Registrar`]: publish this process's address under a lease and keep it alive
//! - [`Discovery`]: keep a local [`RegistryCache`] in sync with watched prefixes
//! - [`WeightedSelector`]: smooth weighted round robin over discovered addresses
//! - [`CoordinationStore`]: the store capabilities consumed, with an in-memory
//!   [`MemoryStore`] backend
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waymark_core::{DiscoveryConfig, RegistrationConfig};
//! use waymark_registry::{Discovery, MemoryStore, RecordPayload, Registrar, ServiceType};
//!
//! # async fn example() -> waymark_registry::RegistryResult<()> {
//! let store = Arc::new(MemoryStore::new());
//!
//! let registrar = Registrar::new(Arc::new(store.session()), RegistrationConfig::default());
//! registrar
//!     .announce("/gamesrv/1", &RecordPayload::new("10.0.0.1", 9000).with_weight(10))
//!     .await?;
//!
//! let discovery = Discovery::new(store, DiscoveryConfig::new(["/gamesrv/"]));
//! discovery.discover().await?;
//! let address = discovery.resolve(ServiceType::TCP);
//! # let _ = address;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod record;
pub mod registrar;
pub mod selector;
pub mod store;

pub use cache::RegistryCache;
pub use discovery::Discovery;
pub use error::{RegistryError, RegistryResult};
pub use memory::{MemoryStore, StoreOperation};
pub use record::{normalize_weight, AddressRecord, RecordPayload, ServiceType};
pub use registrar::{Registrar, RegistrarState};
pub use selector::WeightedSelector;
pub use store::{
    with_timeout, CoordinationStore, EventKind, KeepaliveAck, KeepaliveStream, KeyValue, LeaseId,
    Revision, Snapshot, WatchBatch, WatchEvent, WatchStream,
};
