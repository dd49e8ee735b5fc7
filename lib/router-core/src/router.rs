//! Registry-backed router
//!
//! RegistryRouter keeps a routing table in sync with a service registry.
//! Two background tasks run once caching is enabled:
//! - the watch loop, which reloads a service whenever the registry reports
//!   a change for it, and restarts the watch (with a full refresh) on error
//! - the refresh loop, which periodically reloads every service and prunes
//!   routes that were not refreshed since the previous pass

use crate::config::{RouterConfig, RouterOptions};
use crate::metrics::{
    RouterMetrics, LOOKUP_ERROR, LOOKUP_NOT_FOUND, LOOKUP_REGISTRY, LOOKUP_TABLE, TRIGGER_REFRESH,
    TRIGGER_WATCH,
};
use crate::query::{filter, LookupQuery};
use crate::route::{Route, DEFAULT_LINK, DEFAULT_METRIC, WILDCARD};
use crate::table::{ReadOptions, Table};
use crate::watcher::{TableWatcher, WatchOptions};
use crate::{Result, RouterError};
use router_registry::{
    RegistryError, Service, WatchResult, Watcher, DEFAULT_DOMAIN, DOMAIN_METADATA_KEY,
    WILDCARD_DOMAIN,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Default)]
struct RunState {
    running: bool,
    refresh: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// RegistryRouter answers lookups from a table it keeps in sync with a
/// registry
pub struct RegistryRouter {
    options: RwLock<RouterOptions>,
    state: Mutex<RunState>,
    table: Arc<Table>,
    metrics: RouterMetrics,
    exit: watch::Sender<bool>,
    init_signal: Arc<Notify>,
}

impl RegistryRouter {
    /// Create a router and initialise it with `options`
    pub async fn new(options: RouterOptions) -> Result<Arc<Self>> {
        let config = options.config.clone().validate()?;
        let (exit, _) = watch::channel(false);

        let router = Arc::new(Self {
            table: Arc::new(Table::with_watch_buffer(config.watch_buffer)),
            options: RwLock::new(RouterOptions::new(config, options.registry.clone())),
            state: Mutex::new(RunState::default()),
            metrics: RouterMetrics::new()?,
            exit,
            init_signal: Arc::new(Notify::new()),
        });

        router.init(options).await?;
        Ok(router)
    }

    /// Apply new options.
    ///
    /// Seeds the gateway and initial routes, starts the background
    /// reconciler once when caching is on, and makes an in-flight registry
    /// watch restart against the new options.
    pub async fn init(self: &Arc<Self>, options: RouterOptions) -> Result<()> {
        let config = options.config.clone().validate()?;
        let options = RouterOptions::new(config, options.registry);

        {
            let mut current = self.options.write().await;
            *current = options.clone();
        }

        for route in static_routes(&options.config) {
            match self.table.create(route).await {
                Ok(()) | Err(RouterError::DuplicateRoute) => {}
                Err(e) => {
                    return Err(RouterError::Internal(format!(
                        "failed adding static route: {}",
                        e
                    )))
                }
            }
        }

        let was_running = self.state.lock().await.running;
        if options.config.cache {
            self.run().await;
        }

        // an in-flight watch picks up the new registry on restart
        if was_running {
            self.init_signal.notify_one();
        }

        debug!("Router {} initialised", options.config.id);
        Ok(())
    }

    /// Current options
    pub async fn options(&self) -> RouterOptions {
        self.options.read().await.clone()
    }

    /// The routing table
    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table)
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Whether the background reconciler is running
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Look up routes for a service.
    ///
    /// Answers from the table when it holds the service, otherwise asks the
    /// registry directly, caching the result when caching is on.
    pub async fn lookup(&self, service: &str, query: &LookupQuery) -> Result<Vec<Route>> {
        match self.table.read(ReadOptions::service(service)).await {
            Ok(routes) => {
                let routes = filter(routes, query);
                if routes.is_empty() {
                    self.metrics.record_lookup(LOOKUP_NOT_FOUND);
                    return Err(RouterError::RouteNotFound);
                }
                self.metrics.record_lookup(LOOKUP_TABLE);
                return Ok(routes);
            }
            Err(RouterError::RouteNotFound) => {}
            Err(e) => return Err(e),
        }

        let (registry, config) = {
            let options = self.options.read().await;
            (options.registry.clone(), options.config.clone())
        };

        trace!("Fetching route for {} domain: {}", service, WILDCARD_DOMAIN);
        let services = match registry.get_service(service, WILDCARD_DOMAIN).await {
            Ok(services) => services,
            Err(RegistryError::NotFound) => {
                trace!("Failed to find route for {}", service);
                self.metrics.record_lookup(LOOKUP_NOT_FOUND);
                return Err(RouterError::RouteNotFound);
            }
            Err(e) => {
                debug!("Failed to find route for {}: {}", service, e);
                self.metrics.record_lookup(LOOKUP_ERROR);
                return Err(RouterError::Registry(e));
            }
        };

        let routes: Vec<Route> = services
            .iter()
            .flat_map(|srv| build_routes(srv, &get_domain(srv), &config.id))
            .collect();

        if config.cache {
            for route in &routes {
                // the reconciler owns accuracy, a failed insert is harmless
                let _ = self.table.create(route.clone()).await;
            }
        }

        let routes = filter(routes, query);
        if routes.is_empty() {
            self.metrics.record_lookup(LOOKUP_NOT_FOUND);
            return Err(RouterError::RouteNotFound);
        }
        self.metrics.record_lookup(LOOKUP_REGISTRY);
        Ok(routes)
    }

    /// Watch routing table changes
    pub async fn watch(&self, options: WatchOptions) -> Result<TableWatcher> {
        self.table.watch(options).await
    }

    /// Ask the background reconciler for a full refresh. Returns false when
    /// it is not running. Pending requests are coalesced.
    pub async fn refresh(&self) -> bool {
        let state = self.state.lock().await;
        match &state.refresh {
            Some(tx) => {
                signal(tx);
                true
            }
            None => false,
        }
    }

    /// Stop the router and wait for its background tasks to finish.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let closed_now = self.exit.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        let tasks = {
            let mut state = self.state.lock().await;
            state.running = false;
            state.refresh = None;
            std::mem::take(&mut state.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                error!("Router task failed during shutdown: {}", e);
            }
        }

        if closed_now {
            info!("Router {} closed", self.options.read().await.config.id);
        }
        Ok(())
    }

    /// Rebuild the routes of `name` in `domain` from the registry, or of
    /// every service when `name` is empty.
    ///
    /// All routes are fetched and built before the table is touched. Each
    /// (service, domain) is then swapped in one step, so lookups never see
    /// a live service without routes and nodes that left without a delete
    /// event do not linger. A service whose nodes cannot be fetched is left
    /// untouched here.
    pub(crate) async fn load_routes(&self, name: &str, domain: &str) -> Result<()> {
        let domain = if domain.is_empty() {
            WILDCARD_DOMAIN
        } else {
            domain
        };

        let (registry, router_id) = {
            let options = self.options.read().await;
            (options.registry.clone(), options.config.id.clone())
        };

        let services = if name.is_empty() {
            registry.list_services(domain).await?
        } else {
            match registry.get_service(name, domain).await {
                Ok(services) => services,
                Err(RegistryError::NotFound) => {
                    // nothing left registered under this name
                    self.table.delete_service(name, domain).await;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut rebuilt: HashMap<(String, String), Vec<Route>> = HashMap::new();
        let mut fetched = HashSet::new();
        for service in &services {
            let domain = get_domain(service);
            let key = (service.name.clone(), domain.clone());

            if !service.nodes.is_empty() {
                rebuilt
                    .entry(key)
                    .or_default()
                    .extend(build_routes(service, &domain, &router_id));
                continue;
            }

            // listings may be summaries, fetch the nodes once per name and domain
            if !fetched.insert(key.clone()) {
                continue;
            }
            match registry.get_service(&service.name, &domain).await {
                Ok(full) => {
                    let routes = rebuilt.entry(key).or_default();
                    for srv in &full {
                        routes.extend(build_routes(srv, &domain, &router_id));
                    }
                }
                // deregistered since it was listed
                Err(RegistryError::NotFound) => {
                    rebuilt.entry(key).or_default();
                }
                Err(e) => {
                    trace!(
                        "Failed to get service {} domain: {}: {}",
                        service.name,
                        domain,
                        e
                    );
                }
            }
        }

        for ((name, domain), routes) in rebuilt {
            let removed = self.table.replace_service(&name, &domain, routes).await;
            if removed > 0 {
                debug!(
                    "Removed {} stale routes for service {} in domain {}",
                    removed, name, domain
                );
            }
        }

        Ok(())
    }

    async fn process_event(&self, result: WatchResult) -> Result<()> {
        let Some(service) = result.service else {
            trace!("Received a nil service");
            return Ok(());
        };

        trace!(
            "Router dealing with next event {} for {}",
            result.action,
            service.name
        );

        // events are only triggers, the registry is queried for the full record
        let domain = get_domain(&service);
        self.load_routes(&service.name, &domain).await
    }

    async fn run(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }
        if *self.exit.borrow() {
            warn!("Router is closed, not starting the reconciler");
            return;
        }
        state.running = true;

        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        // the first refresh loads the table
        signal(&refresh_tx);

        state.tasks.push(tokio::spawn(
            Arc::clone(self).refresh_loop(refresh_rx, refresh_tx.clone()),
        ));
        state
            .tasks
            .push(tokio::spawn(Arc::clone(self).watch_loop(refresh_tx.clone())));
        state.refresh = Some(refresh_tx);

        debug!("Router reconciler started");
    }

    async fn refresh_loop(
        self: Arc<Self>,
        mut refresh_rx: mpsc::Receiver<()>,
        refresh_tx: mpsc::Sender<()>,
    ) {
        let mut exit = self.exit.subscribe();
        let mut last_refresh: Option<Instant> = None;

        loop {
            let interval = self.options.read().await.config.refresh_interval;

            tokio::select! {
                _ = wait_closed(&mut exit) => break,
                Some(()) = refresh_rx.recv() => {
                    self.refresh_table(&mut last_refresh).await;
                }
                _ = tokio::time::sleep(interval) => signal(&refresh_tx),
            }
        }

        debug!("Router refresh loop stopped");
    }

    async fn refresh_table(&self, last_refresh: &mut Option<Instant>) {
        if let Err(e) = self.load_routes("", "").await {
            debug!("Failed refreshing registry routes: {}", e);
            self.metrics.record_reconciliation(TRIGGER_REFRESH, false);
            // a partial load must not be followed by a prune
            return;
        }
        self.metrics.record_reconciliation(TRIGGER_REFRESH, true);

        // static routes never come from the registry, keep them fresh
        let config = self.options.read().await.config.clone();
        for route in static_routes(&config) {
            let _ = self.table.update(route).await;
        }

        // everything still registered was touched above, anything older
        // than the previous pass is gone from the registry
        if let Some(previous) = *last_refresh {
            let pruned = self.table.prune_routes(previous.elapsed()).await;
            if pruned > 0 {
                debug!("Pruned {} stale routes", pruned);
            }
            self.metrics.routes_pruned_total.inc_by(pruned as u64);
        }

        *last_refresh = Some(Instant::now());
        self.record_table_size().await;
    }

    async fn watch_loop(self: Arc<Self>, refresh_tx: mpsc::Sender<()>) {
        let mut exit = self.exit.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *exit.borrow() {
                break;
            }

            let (registry, backoff) = {
                let options = self.options.read().await;
                (options.registry.clone(), options.config.watch_backoff.clone())
            };

            trace!("Router starting registry watch");
            let result = match registry.watch(WILDCARD_DOMAIN).await {
                Ok(watcher) => self.watch_registry(watcher, &mut attempt).await,
                Err(e) => Err(RouterError::Registry(e)),
            };

            if let Err(e) = result {
                debug!("Error watching the registry: {}", e);
                self.metrics.watch_restarts_total.inc();

                let delay = backoff.backoff_duration(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = wait_closed(&mut exit) => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                // events may have been missed, reload everything
                signal(&refresh_tx);
            }
        }

        debug!("Router watch loop stopped");
    }

    /// Apply registry events until the watcher stops or fails. The watcher
    /// is stopped when the router is re-initialised or closed.
    async fn watch_registry(&self, watcher: Arc<dyn Watcher>, attempt: &mut u32) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let observer = {
            let watcher = Arc::clone(&watcher);
            let init = Arc::clone(&self.init_signal);
            let mut exit = self.exit.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done_rx => {}
                    _ = init.notified() => trace!("Router re-initialised, stopping registry watch"),
                    _ = wait_closed(&mut exit) => {}
                }
                watcher.stop();
            })
        };

        let result = loop {
            let event = match watcher.next().await {
                Ok(event) => event,
                Err(RegistryError::WatcherStopped) => break Ok(()),
                Err(e) => break Err(RouterError::Registry(e)),
            };

            match self.process_event(event).await {
                Ok(()) => {
                    *attempt = 0;
                    self.metrics.record_reconciliation(TRIGGER_WATCH, true);
                    self.record_table_size().await;
                }
                Err(e) => {
                    self.metrics.record_reconciliation(TRIGGER_WATCH, false);
                    break Err(e);
                }
            }
        };

        let _ = done_tx.send(());
        if let Err(e) = observer.await {
            error!("Registry watch observer failed: {}", e);
        }
        result
    }

    async fn record_table_size(&self) {
        self.metrics.table_routes.set(self.table.len().await as i64);
    }
}

impl fmt::Display for RegistryRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("registry")
    }
}

/// Domain of a registry service: its own metadata, then its first node's,
/// then the default domain
pub fn get_domain(service: &Service) -> String {
    if let Some(domain) = service.domain() {
        return domain.to_string();
    }

    service
        .nodes
        .first()
        .and_then(|node| node.metadata.get(DOMAIN_METADATA_KEY))
        .filter(|domain| !domain.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
}

/// One route per node of the service
pub fn build_routes(service: &Service, network: &str, router_id: &str) -> Vec<Route> {
    service
        .nodes
        .iter()
        .map(|node| Route {
            service: service.name.clone(),
            address: node.address.clone(),
            gateway: String::new(),
            network: network.to_string(),
            router: router_id.to_string(),
            link: DEFAULT_LINK.to_string(),
            metric: DEFAULT_METRIC,
            metadata: node.metadata.clone(),
        })
        .collect()
}

/// Gateway catch-all and configured routes, stamped with this router
fn static_routes(config: &RouterConfig) -> Vec<Route> {
    let mut routes = Vec::with_capacity(config.initial_routes.len() + 1);

    if let Some(gateway) = &config.gateway {
        routes.push(
            Route::new(WILDCARD, WILDCARD)
                .with_gateway(gateway.clone())
                .with_network(WILDCARD)
                .with_router(config.id.clone()),
        );
    }

    for route in &config.initial_routes {
        let mut route = route.clone();
        if route.router.is_empty() {
            route.router = config.id.clone();
        }
        if route.network.is_empty() {
            route.network = config.network.clone();
        }
        routes.push(route);
    }

    routes
}

// Non-blocking: a pending signal is not duplicated.
fn signal(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}

async fn wait_closed(exit: &mut watch::Receiver<bool>) {
    while !*exit.borrow_and_update() {
        if exit.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_registry::{Action, MemoryRegistry, Node};

    fn service(name: &str, version: &str, addrs: &[&str]) -> Service {
        addrs
            .iter()
            .enumerate()
            .fold(Service::new(name, version), |svc, (i, addr)| {
                svc.with_node(Node::new(format!("{}-{}", name, i), *addr))
            })
    }

    async fn router(registry: &MemoryRegistry) -> Arc<RegistryRouter> {
        let config = RouterConfig {
            id: "router-1".to_string(),
            cache: false,
            ..Default::default()
        };
        RegistryRouter::new(RouterOptions::new(config, Arc::new(registry.clone())))
            .await
            .unwrap()
    }

    async fn count(router: &RegistryRouter, name: &str, network: &str) -> usize {
        router
            .table()
            .read(ReadOptions::service(name))
            .await
            .map(|routes| routes.iter().filter(|r| r.network == network).count())
            .unwrap_or(0)
    }

    #[test]
    fn test_get_domain() {
        let svc = Service::new("foo", "1").with_metadata(DOMAIN_METADATA_KEY, "d1");
        assert_eq!(get_domain(&svc), "d1");

        let svc = Service::new("foo", "1")
            .with_node(Node::new("n", "A:1").with_metadata(DOMAIN_METADATA_KEY, "d2"));
        assert_eq!(get_domain(&svc), "d2");

        let svc = Service::new("foo", "1").with_node(Node::new("n", "A:1"));
        assert_eq!(get_domain(&svc), DEFAULT_DOMAIN);
    }

    #[test]
    fn test_build_routes() {
        let svc = service("foo", "1.0.0", &["A:1", "A:2"]);
        let routes = build_routes(&svc, "d1", "router-1");

        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.service == "foo"
            && r.network == "d1"
            && r.router == "router-1"
            && r.link == DEFAULT_LINK
            && r.metric == DEFAULT_METRIC));
        assert_eq!(routes[1].address, "A:2");
    }

    #[test]
    fn test_static_routes() {
        let config = RouterConfig {
            id: "router-1".to_string(),
            network: "d1".to_string(),
            gateway: Some("10.0.0.1:9094".to_string()),
            initial_routes: vec![Route::new("foo", "A:1")],
            ..Default::default()
        };
        let routes = static_routes(&config);

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].service, WILDCARD);
        assert_eq!(routes[0].network, WILDCARD);
        assert_eq!(routes[0].gateway, "10.0.0.1:9094");
        assert_eq!(routes[1].network, "d1");
        assert_eq!(routes[1].router, "router-1");
    }

    #[tokio::test]
    async fn test_load_routes_rebuilds_after_scale_down() {
        let registry = MemoryRegistry::new();
        registry
            .register(service("foo", "1.0.0", &["A:1", "A:2", "A:3"]), "d1")
            .await
            .unwrap();
        let router = router(&registry).await;

        router.load_routes("foo", "d1").await.unwrap();
        assert_eq!(count(&router, "foo", "d1").await, 3);

        registry
            .deregister(&service("foo", "1.0.0", &["A:1", "A:2", "A:3"]), "d1")
            .await
            .unwrap();
        registry
            .register(service("foo", "1.0.0", &["A:1"]), "d1")
            .await
            .unwrap();

        router.load_routes("foo", "d1").await.unwrap();
        assert_eq!(count(&router, "foo", "d1").await, 1);
    }

    #[tokio::test]
    async fn test_load_all_follows_up_summaries() {
        let registry = MemoryRegistry::new();
        registry
            .register(service("foo", "1.0.0", &["A:1", "A:2"]), "d1")
            .await
            .unwrap();
        registry
            .register(service("foo", "1.0.1", &["A:3"]), "d1")
            .await
            .unwrap();
        registry
            .register(service("bar", "1.0.0", &["B:1"]), "d2")
            .await
            .unwrap();
        let router = router(&registry).await;

        router.load_routes("", "").await.unwrap();
        assert_eq!(count(&router, "foo", "d1").await, 3);
        assert_eq!(count(&router, "bar", "d2").await, 1);
        assert_eq!(router.table().len().await, 4);
    }

    #[tokio::test]
    async fn test_delete_event_clears_only_its_domain() {
        let registry = MemoryRegistry::new();
        let foo = service("foo", "1.0.0", &["A:1", "A:2"]);
        registry.register(foo.clone(), "d1").await.unwrap();
        registry.register(foo.clone(), "d2").await.unwrap();
        registry
            .register(service("bar", "1.0.0", &["B:1"]), "d1")
            .await
            .unwrap();
        let router = router(&registry).await;
        router.load_routes("", "").await.unwrap();
        assert_eq!(router.table().len().await, 5);

        registry.deregister(&foo, "d1").await.unwrap();
        let gone = Service::new("foo", "1.0.0").with_metadata(DOMAIN_METADATA_KEY, "d1");
        router
            .process_event(WatchResult {
                action: Action::Delete,
                service: Some(gone),
            })
            .await
            .unwrap();

        assert_eq!(count(&router, "foo", "d1").await, 0);
        assert_eq!(count(&router, "foo", "d2").await, 2);
        assert_eq!(count(&router, "bar", "d1").await, 1);
    }

    #[tokio::test]
    async fn test_nil_service_is_skipped() {
        let registry = MemoryRegistry::new();
        let router = router(&registry).await;

        router
            .process_event(WatchResult {
                action: Action::Update,
                service: None,
            })
            .await
            .unwrap();
        assert!(router.table().is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_without_reconciler() {
        let registry = MemoryRegistry::new();
        let router = router(&registry).await;
        assert!(!router.is_running().await);
        assert!(!router.refresh().await);
        assert_eq!(router.to_string(), "registry");
    }
}
