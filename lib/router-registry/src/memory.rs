//! In-memory registry with domain partitioning and watch fan-out

use crate::registry::{Registry, Watcher, DEFAULT_DOMAIN, WILDCARD_DOMAIN};
use crate::service::DOMAIN_METADATA_KEY;
use crate::{Action, RegistryError, Result, Service, WatchResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

const DEFAULT_WATCH_CAPACITY: usize = 128;

// version -> service
type Versions = HashMap<String, Service>;
// domain -> name -> versions
type Domains = HashMap<String, HashMap<String, Versions>>;

#[derive(Clone, Debug)]
struct DomainEvent {
    domain: String,
    result: WatchResult,
}

/// MemoryRegistry keeps services per domain and broadcasts every change to
/// its watchers
#[derive(Clone)]
pub struct MemoryRegistry {
    services: Arc<RwLock<Domains>>,
    events: broadcast::Sender<DomainEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create a registry whose watchers buffer at most `capacity` events
    /// before they start failing as lagged
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register a service version, merging nodes by id into an existing one
    pub async fn register(&self, service: Service, domain: &str) -> Result<()> {
        let domain = resolve_domain(domain);

        let mut services = self.services.write().await;
        let versions = services
            .entry(domain.to_string())
            .or_default()
            .entry(service.name.clone())
            .or_default();

        let action = match versions.get_mut(&service.version) {
            Some(existing) => {
                for node in &service.nodes {
                    match existing.nodes.iter_mut().find(|n| n.id == node.id) {
                        Some(current) => *current = node.clone(),
                        None => existing.nodes.push(node.clone()),
                    }
                }
                existing.metadata.extend(service.metadata.clone());
                Action::Update
            }
            None => {
                versions.insert(service.version.clone(), service.clone());
                Action::Create
            }
        };

        debug!(
            "Registered service {}@{} in domain {} ({})",
            service.name, service.version, domain, action
        );
        self.publish(domain, action, service);
        Ok(())
    }

    /// Deregister the listed nodes of a service version. A service without
    /// nodes removes the whole version.
    pub async fn deregister(&self, service: &Service, domain: &str) -> Result<()> {
        let domain = resolve_domain(domain);

        let mut services = self.services.write().await;
        let Some(names) = services.get_mut(domain) else {
            debug!("Deregister of unknown domain {}", domain);
            return Ok(());
        };
        let Some(versions) = names.get_mut(&service.name) else {
            debug!("Deregister of unknown service {} in {}", service.name, domain);
            return Ok(());
        };

        let remove_version = match versions.get_mut(&service.version) {
            Some(existing) if !service.nodes.is_empty() => {
                existing
                    .nodes
                    .retain(|n| !service.nodes.iter().any(|gone| gone.id == n.id));
                existing.nodes.is_empty()
            }
            Some(_) => true,
            None => false,
        };
        if remove_version {
            versions.remove(&service.version);
        }
        if versions.is_empty() {
            names.remove(&service.name);
        }
        if names.is_empty() {
            services.remove(domain);
        }

        debug!(
            "Deregistered service {}@{} from domain {}",
            service.name, service.version, domain
        );
        self.publish(domain, Action::Delete, service.clone());
        Ok(())
    }

    /// Number of registered service versions across all domains
    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services
            .values()
            .flat_map(|names| names.values())
            .map(|versions| versions.len())
            .sum()
    }

    /// Number of open watchers
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn publish(&self, domain: &str, action: Action, service: Service) {
        let event = DomainEvent {
            domain: domain.to_string(),
            result: WatchResult {
                action,
                service: Some(with_domain(service, domain)),
            },
        };
        // no active watchers is not an error
        let _ = self.events.send(event);
    }

    fn collect<F>(services: &Domains, domain: &str, mut f: F) -> Vec<Service>
    where
        F: FnMut(&str, &HashMap<String, Versions>, &mut Vec<Service>),
    {
        let mut out = Vec::new();
        let mut domains: Vec<&String> = services
            .keys()
            .filter(|d| domain == WILDCARD_DOMAIN || d.as_str() == domain)
            .collect();
        domains.sort();
        for d in domains {
            f(d, &services[d], &mut out);
        }
        out
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_services(&self, domain: &str) -> Result<Vec<Service>> {
        let domain = resolve_domain(domain);
        let services = self.services.read().await;

        Ok(Self::collect(&services, domain, |d, names, out| {
            for versions in names.values() {
                for svc in versions.values() {
                    // listings are summaries, nodes are fetched with get_service
                    let summary = Service {
                        name: svc.name.clone(),
                        version: svc.version.clone(),
                        metadata: svc.metadata.clone(),
                        nodes: Vec::new(),
                    };
                    out.push(with_domain(summary, d));
                }
            }
        }))
    }

    async fn get_service(&self, name: &str, domain: &str) -> Result<Vec<Service>> {
        let domain = resolve_domain(domain);
        let services = self.services.read().await;

        let mut found = Self::collect(&services, domain, |d, names, out| {
            if let Some(versions) = names.get(name) {
                out.extend(versions.values().cloned().map(|svc| with_domain(svc, d)));
            }
        });

        if found.is_empty() {
            return Err(RegistryError::NotFound);
        }
        found.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(found)
    }

    async fn watch(&self, domain: &str) -> Result<Arc<dyn Watcher>> {
        let (stop, _) = watch::channel(false);
        Ok(Arc::new(MemoryWatcher {
            domain: resolve_domain(domain).to_string(),
            events: Mutex::new(self.events.subscribe()),
            stop,
        }))
    }
}

/// Watcher over a MemoryRegistry, filtered to one domain or the wildcard
pub struct MemoryWatcher {
    domain: String,
    events: Mutex<broadcast::Receiver<DomainEvent>>,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&self) -> Result<WatchResult> {
        let mut stopped = self.stop.subscribe();
        if *stopped.borrow() {
            return Err(RegistryError::WatcherStopped);
        }

        let mut events = self.events.lock().await;
        loop {
            tokio::select! {
                _ = stopped.changed() => return Err(RegistryError::WatcherStopped),
                event = events.recv() => match event {
                    Ok(event) => {
                        if self.domain == WILDCARD_DOMAIN || event.domain == self.domain {
                            return Ok(event.result);
                        }
                    }
                    Err(RecvError::Closed) => return Err(RegistryError::WatcherStopped),
                    Err(RecvError::Lagged(n)) => {
                        return Err(RegistryError::Unavailable(format!(
                            "watcher lagged behind by {} events",
                            n
                        )))
                    }
                },
            }
        }
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

fn resolve_domain(domain: &str) -> &str {
    if domain.is_empty() {
        DEFAULT_DOMAIN
    } else {
        domain
    }
}

fn with_domain(mut service: Service, domain: &str) -> Service {
    service
        .metadata
        .insert(DOMAIN_METADATA_KEY.to_string(), domain.to_string());
    service
}
