//! In-memory routing table

use crate::route::{Route, WILDCARD};
use crate::watcher::{Event, EventType, TableWatcher, WatchOptions};
use crate::{Result, RouterError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Events a watcher can buffer before further events are dropped for it
pub const DEFAULT_WATCH_BUFFER: usize = 64;

#[derive(Clone, Debug)]
struct Entry {
    route: Route,
    updated: Instant,
}

struct Subscriber {
    options: WatchOptions,
    events: mpsc::Sender<Event>,
}

/// Options for reading the table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Only read routes of this service
    pub service: Option<String>,
}

impl ReadOptions {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
        }
    }
}

/// Table stores routes by fingerprint, grouped by service, and fans every
/// change out to its watchers.
///
/// Fan-out never blocks a mutation: an event that does not fit in a
/// watcher's buffer is dropped for that watcher and counted.
pub struct Table {
    // service -> fingerprint -> entry
    routes: RwLock<HashMap<String, HashMap<u64, Entry>>>,
    watchers: RwLock<HashMap<Uuid, Subscriber>>,
    next_event_id: AtomicU64,
    dropped_events: AtomicU64,
    watch_buffer: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::with_watch_buffer(DEFAULT_WATCH_BUFFER)
    }

    pub fn with_watch_buffer(watch_buffer: usize) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
            dropped_events: AtomicU64::new(0),
            watch_buffer: watch_buffer.max(1),
        }
    }

    /// Insert a new route. Fails with `DuplicateRoute` if its fingerprint exists.
    pub async fn create(&self, route: Route) -> Result<()> {
        let hash = route.hash();
        let mut routes = self.routes.write().await;

        let service = routes.entry(route.service.clone()).or_default();
        if service.contains_key(&hash) {
            return Err(RouterError::DuplicateRoute);
        }
        service.insert(
            hash,
            Entry {
                route: route.clone(),
                updated: Instant::now(),
            },
        );

        trace!("Created route {} -> {} ({})", route.service, route.address, route.network);
        self.send_events(vec![(EventType::Create, route)]).await;
        Ok(())
    }

    /// Insert or refresh a route, resetting its age
    pub async fn update(&self, route: Route) -> Result<()> {
        let hash = route.hash();
        let mut routes = self.routes.write().await;

        let previous = routes.entry(route.service.clone()).or_default().insert(
            hash,
            Entry {
                route: route.clone(),
                updated: Instant::now(),
            },
        );

        let event_type = match previous {
            Some(_) => EventType::Update,
            None => EventType::Create,
        };
        self.send_events(vec![(event_type, route)]).await;
        Ok(())
    }

    /// Remove a route. Fails with `RouteNotFound` if it is not in the table.
    pub async fn delete(&self, route: Route) -> Result<()> {
        let hash = route.hash();
        let mut routes = self.routes.write().await;

        let Some(service) = routes.get_mut(&route.service) else {
            return Err(RouterError::RouteNotFound);
        };
        let Some(entry) = service.remove(&hash) else {
            return Err(RouterError::RouteNotFound);
        };
        if service.is_empty() {
            routes.remove(&route.service);
        }

        self.send_events(vec![(EventType::Delete, entry.route)]).await;
        Ok(())
    }

    /// Read routes, optionally restricted to one service. Reading a service
    /// with no routes fails with `RouteNotFound`.
    pub async fn read(&self, opts: ReadOptions) -> Result<Vec<Route>> {
        let routes = self.routes.read().await;

        match opts.service {
            Some(service) => match routes.get(&service) {
                Some(entries) if !entries.is_empty() => {
                    Ok(entries.values().map(|e| e.route.clone()).collect())
                }
                _ => Err(RouterError::RouteNotFound),
            },
            None => Ok(routes
                .values()
                .flat_map(|entries| entries.values().map(|e| e.route.clone()))
                .collect()),
        }
    }

    /// Remove every route of a service in one network. The wildcard network
    /// removes the service from all networks.
    pub async fn delete_service(&self, name: &str, network: &str) -> usize {
        let mut routes = self.routes.write().await;

        let Some(entries) = routes.get_mut(name) else {
            return 0;
        };

        let doomed: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| network == WILDCARD || e.route.network == network)
            .map(|(hash, _)| *hash)
            .collect();

        let removed: Vec<(EventType, Route)> = doomed
            .iter()
            .filter_map(|hash| entries.remove(hash))
            .map(|e| (EventType::Delete, e.route))
            .collect();

        if entries.is_empty() {
            routes.remove(name);
        }

        let count = removed.len();
        if count > 0 {
            debug!("Deleted {} routes for service {} in {}", count, name, network);
            self.send_events(removed).await;
        }
        count
    }

    /// Swap the routes of a service in one network for `routes` under a
    /// single write lock. Routes no longer present are deleted, the rest are
    /// created or refreshed. Readers never see the service half rebuilt.
    /// Returns the number of routes removed.
    pub async fn replace_service(&self, name: &str, network: &str, routes: Vec<Route>) -> usize {
        let mut table = self.routes.write().await;
        let entries = table.entry(name.to_string()).or_default();

        let fresh: HashMap<u64, Route> = routes
            .into_iter()
            .filter(|r| r.service == name)
            .map(|r| (r.hash(), r))
            .collect();

        let stale: Vec<u64> = entries
            .iter()
            .filter(|(hash, e)| {
                (network == WILDCARD || e.route.network == network) && !fresh.contains_key(*hash)
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut changes: Vec<(EventType, Route)> = stale
            .iter()
            .filter_map(|hash| entries.remove(hash))
            .map(|e| (EventType::Delete, e.route))
            .collect();
        let removed = changes.len();

        let now = Instant::now();
        for (hash, route) in fresh {
            let previous = entries.insert(
                hash,
                Entry {
                    route: route.clone(),
                    updated: now,
                },
            );
            let event_type = match previous {
                Some(_) => EventType::Update,
                None => EventType::Create,
            };
            changes.push((event_type, route));
        }

        if entries.is_empty() {
            table.remove(name);
        }

        trace!(
            "Replaced routes for service {} in {}: {} removed, {} kept or added",
            name,
            network,
            removed,
            changes.len() - removed
        );
        if !changes.is_empty() {
            self.send_events(changes).await;
        }
        removed
    }

    /// Remove every route not touched within `max_age`. Returns the number
    /// of routes removed.
    pub async fn prune_routes(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut routes = self.routes.write().await;

        let mut removed = Vec::new();
        for entries in routes.values_mut() {
            entries.retain(|_, e| {
                if now.duration_since(e.updated) > max_age {
                    removed.push((EventType::Delete, e.route.clone()));
                    false
                } else {
                    true
                }
            });
        }
        routes.retain(|_, entries| !entries.is_empty());

        let count = removed.len();
        if count > 0 {
            debug!("Pruned {} routes older than {:?}", count, max_age);
            self.send_events(removed).await;
        }
        count
    }

    /// Number of routes in the table
    pub async fn len(&self) -> usize {
        let routes = self.routes.read().await;
        routes.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Open a watcher for table changes
    pub async fn watch(&self, options: WatchOptions) -> Result<TableWatcher> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.watch_buffer);

        let mut watchers = self.watchers.write().await;
        watchers.insert(
            id,
            Subscriber {
                options: options.clone(),
                events: tx,
            },
        );

        debug!("Table watcher {} started for service {}", id, options.service);
        Ok(TableWatcher::new(id, options, rx))
    }

    /// Number of registered watchers
    pub async fn watcher_count(&self) -> usize {
        self.watchers.read().await.len()
    }

    /// Events dropped because a watcher's buffer was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    // Called with the routes lock held so watchers see changes in table order.
    async fn send_events(&self, changes: Vec<(EventType, Route)>) {
        let mut closed = Vec::new();
        {
            let watchers = self.watchers.read().await;
            for (event_type, route) in changes {
                let event = Event {
                    id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
                    event_type,
                    timestamp: Utc::now(),
                    route,
                };

                for (id, subscriber) in watchers.iter() {
                    if !subscriber.options.wants(&event.route) {
                        continue;
                    }
                    match subscriber.events.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.dropped_events.fetch_add(1, Ordering::Relaxed);
                            warn!("Table watcher {} is full, dropping event {}", id, event.id);
                        }
                        Err(TrySendError::Closed(_)) => closed.push(*id),
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut watchers = self.watchers.write().await;
            for id in closed {
                if watchers.remove(&id).is_some() {
                    debug!("Table watcher {} stopped", id);
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(service: &str, address: &str, network: &str) -> Route {
        Route::new(service, address).with_network(network)
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let table = Table::new();
        let r = route("foo", "A:1", "d1");

        table.create(r.clone()).await.unwrap();
        assert!(matches!(
            table.create(r.clone()).await,
            Err(RouterError::DuplicateRoute)
        ));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_metric_keeps_size() {
        let table = Table::new();
        let r = route("foo", "A:1", "d1");
        table.create(r.clone()).await.unwrap();

        table.update(r.clone().with_metric(10)).await.unwrap();
        assert_eq!(table.len().await, 1);

        let routes = table.read(ReadOptions::service("foo")).await.unwrap();
        assert_eq!(routes[0].metric, 10);
    }

    #[tokio::test]
    async fn test_update_inserts_missing() {
        let table = Table::new();
        table.update(route("foo", "A:1", "d1")).await.unwrap();
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let table = Table::new();
        let r = route("foo", "A:1", "d1");

        assert!(matches!(
            table.delete(r.clone()).await,
            Err(RouterError::RouteNotFound)
        ));
        table.create(r.clone()).await.unwrap();
        table.delete(r.clone()).await.unwrap();
        assert!(table.is_empty().await);
        assert!(matches!(
            table.read(ReadOptions::service("foo")).await,
            Err(RouterError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_read() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        table.create(route("foo", "A:2", "d2")).await.unwrap();
        table.create(route("bar", "B:1", "d1")).await.unwrap();

        assert_eq!(table.read(ReadOptions::default()).await.unwrap().len(), 3);
        assert_eq!(table.read(ReadOptions::service("foo")).await.unwrap().len(), 2);
        assert!(matches!(
            table.read(ReadOptions::service("baz")).await,
            Err(RouterError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_service_scoped_to_network() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        table.create(route("foo", "A:2", "d1")).await.unwrap();
        table.create(route("foo", "A:3", "d2")).await.unwrap();
        table.create(route("bar", "B:1", "d1")).await.unwrap();

        assert_eq!(table.delete_service("foo", "d1").await, 2);

        let foo = table.read(ReadOptions::service("foo")).await.unwrap();
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].network, "d2");
        assert_eq!(table.read(ReadOptions::service("bar")).await.unwrap().len(), 1);

        assert_eq!(table.delete_service("foo", WILDCARD).await, 1);
        assert_eq!(table.delete_service("missing", "d1").await, 0);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_routes() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        table.create(route("foo", "A:2", "d1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        table.create(route("bar", "B:1", "d1")).await.unwrap();
        // refreshed routes survive
        table.update(route("foo", "A:2", "d1")).await.unwrap();

        assert_eq!(table.prune_routes(Duration::from_secs(5)).await, 1);

        let remaining = table.read(ReadOptions::default()).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.address != "A:1"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(table.prune_routes(Duration::from_secs(5)).await, 2);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_watch_events() {
        let table = Table::new();
        let mut all = table.watch(WatchOptions::default()).await.unwrap();
        let mut foo = table.watch(WatchOptions::service("foo")).await.unwrap();

        let r = route("foo", "A:1", "d1");
        table.create(r.clone()).await.unwrap();
        table.create(route("bar", "B:1", "d1")).await.unwrap();
        table.update(r.clone().with_metric(5)).await.unwrap();
        table.delete(r.clone()).await.unwrap();

        let first = foo.next().await.unwrap();
        assert_eq!(first.event_type, EventType::Create);
        let second = foo.next().await.unwrap();
        assert_eq!(second.event_type, EventType::Update);
        assert_eq!(second.route.metric, 5);
        let third = foo.next().await.unwrap();
        assert_eq!(third.event_type, EventType::Delete);
        assert!(first.id < second.id && second.id < third.id);

        let mut services = Vec::new();
        for _ in 0..4 {
            services.push(all.next().await.unwrap().route.service);
        }
        assert_eq!(services, vec!["foo", "bar", "foo", "foo"]);
    }

    #[tokio::test]
    async fn test_full_watcher_drops_events() {
        let table = Table::with_watch_buffer(1);
        let mut watcher = table.watch(WatchOptions::default()).await.unwrap();

        for i in 0..3 {
            table
                .create(route("foo", &format!("A:{}", i), "d1"))
                .await
                .unwrap();
        }

        assert_eq!(table.len().await, 3);
        assert_eq!(table.dropped_events(), 2);
        assert_eq!(watcher.next().await.unwrap().route.address, "A:0");
    }

    #[tokio::test]
    async fn test_stopped_watcher_is_removed() {
        let table = Table::new();
        let mut watcher = table.watch(WatchOptions::default()).await.unwrap();
        assert_eq!(table.watcher_count().await, 1);

        watcher.stop();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        assert_eq!(table.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_service_emits_deletes() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        table.create(route("foo", "A:2", "d1")).await.unwrap();

        let mut watcher = table.watch(WatchOptions::service("foo")).await.unwrap();
        table.delete_service("foo", "d1").await;

        for _ in 0..2 {
            assert_eq!(watcher.next().await.unwrap().event_type, EventType::Delete);
        }
    }

    #[tokio::test]
    async fn test_replace_service_swaps_one_network() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();
        table.create(route("foo", "A:2", "d1")).await.unwrap();
        table.create(route("foo", "A:1", "d2")).await.unwrap();
        table.create(route("bar", "B:1", "d1")).await.unwrap();

        let mut watcher = table.watch(WatchOptions::service("foo")).await.unwrap();
        let removed = table
            .replace_service(
                "foo",
                "d1",
                vec![route("foo", "A:2", "d1"), route("foo", "A:3", "d1")],
            )
            .await;
        assert_eq!(removed, 1);

        let mut addresses: Vec<(String, String)> = table
            .read(ReadOptions::service("foo"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.network, r.address))
            .collect();
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                ("d1".to_string(), "A:2".to_string()),
                ("d1".to_string(), "A:3".to_string()),
                ("d2".to_string(), "A:1".to_string()),
            ]
        );
        assert_eq!(table.len().await, 4);

        let deleted = watcher.next().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Delete);
        assert_eq!(deleted.route.address, "A:1");
        let mut rest = vec![
            watcher.next().await.unwrap().event_type,
            watcher.next().await.unwrap().event_type,
        ];
        rest.sort_by_key(|t| t.to_string());
        assert_eq!(rest, vec![EventType::Create, EventType::Update]);
    }

    #[tokio::test]
    async fn test_replace_service_with_nothing_clears_it() {
        let table = Table::new();
        table.create(route("foo", "A:1", "d1")).await.unwrap();

        assert_eq!(table.replace_service("foo", "d1", Vec::new()).await, 1);
        assert!(table.is_empty().await);
        assert_eq!(table.replace_service("foo", "d1", Vec::new()).await, 0);
    }
}
