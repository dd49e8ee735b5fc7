//! Registry collaborator interface

use crate::{Result, Service, WatchResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Domain services land in when they do not name one
pub const DEFAULT_DOMAIN: &str = "micro";
/// Domain that spans every partition of the registry
pub const WILDCARD_DOMAIN: &str = "*";

/// Registry is the source of truth the router reconciles its table against.
///
/// Implementations are expected to apply their own timeouts to remote calls;
/// callers impose no deadline of their own.
#[async_trait]
pub trait Registry: Send + Sync {
    /// List every service in a domain. Backends may return summaries
    /// without node information.
    async fn list_services(&self, domain: &str) -> Result<Vec<Service>>;

    /// Get every version of a named service, with nodes.
    /// Returns `RegistryError::NotFound` when nothing is registered.
    async fn get_service(&self, name: &str, domain: &str) -> Result<Vec<Service>>;

    /// Open a change stream for a domain
    async fn watch(&self, domain: &str) -> Result<Arc<dyn Watcher>>;
}

/// A stream of registry changes.
///
/// `stop` may be called from another task while `next` is pending; the
/// pending call must then resolve with `RegistryError::WatcherStopped`.
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn next(&self) -> Result<WatchResult>;

    fn stop(&self);
}
