//! Core routing functionality
//!
//! This library provides:
//! - The routing table with change watchers
//! - Route lookup queries
//! - The registry-backed router that keeps the table reconciled
//! - Router configuration and metrics

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod route;
pub mod router;
pub mod table;
pub mod watcher;

pub use backoff::WatchBackoff;
pub use config::{RouterConfig, RouterOptions, DEFAULT_NETWORK, DEFAULT_REFRESH_INTERVAL};
pub use error::{Result, RouterError};
pub use metrics::RouterMetrics;
pub use query::{filter, LookupQuery};
pub use route::{Route, DEFAULT_LINK, DEFAULT_METRIC, WILDCARD};
pub use router::{build_routes, get_domain, RegistryRouter};
pub use table::{ReadOptions, Table, DEFAULT_WATCH_BUFFER};
pub use watcher::{Event, EventType, TableWatcher, WatchOptions};
