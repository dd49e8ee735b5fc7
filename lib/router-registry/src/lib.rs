//! Service registry interface consumed by the router
//!
//! This library provides:
//! - The `Registry` and `Watcher` traits the router reconciles against
//! - Service, node and watch event data types
//! - An in-memory registry with domain partitioning and watch fan-out

pub mod error;
pub mod memory;
pub mod registry;
pub mod service;

pub use error::{RegistryError, Result};
pub use memory::MemoryRegistry;
pub use registry::{Registry, Watcher, DEFAULT_DOMAIN, WILDCARD_DOMAIN};
pub use service::{Action, Node, Service, WatchResult, DOMAIN_METADATA_KEY};
