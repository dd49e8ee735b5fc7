//! Prometheus metrics for routing table reconciliation

use crate::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Where a lookup was answered from
pub const LOOKUP_TABLE: &str = "table";
pub const LOOKUP_REGISTRY: &str = "registry";
pub const LOOKUP_NOT_FOUND: &str = "not_found";
pub const LOOKUP_ERROR: &str = "error";

/// What triggered a reconciliation
pub const TRIGGER_WATCH: &str = "watch";
pub const TRIGGER_REFRESH: &str = "refresh";

/// Prometheus metrics collected by a router
#[derive(Clone)]
pub struct RouterMetrics {
    /// Lookups by the source that answered them
    pub lookups_total: IntCounterVec,
    /// Reconciliation passes by trigger and outcome
    pub reconciliations_total: IntCounterVec,
    /// Routes removed by age-based pruning
    pub routes_pruned_total: IntCounter,
    /// Registry watch sessions that ended in an error
    pub watch_restarts_total: IntCounter,
    /// Routes currently in the table
    pub table_routes: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RouterMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let lookups_total = IntCounterVec::new(
            Opts::new("router_lookups_total", "Route lookups by answering source"),
            &["source"],
        )?;

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "router_reconciliations_total",
                "Routing table reconciliations by trigger and outcome",
            ),
            &["trigger", "outcome"],
        )?;

        let routes_pruned_total = IntCounter::new(
            "router_routes_pruned_total",
            "Routes removed because they were not refreshed",
        )?;

        let watch_restarts_total = IntCounter::new(
            "router_watch_restarts_total",
            "Registry watches restarted after an error",
        )?;

        let table_routes = IntGauge::new("router_table_routes", "Routes in the routing table")?;

        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(routes_pruned_total.clone()))?;
        registry.register(Box::new(watch_restarts_total.clone()))?;
        registry.register(Box::new(table_routes.clone()))?;

        Ok(Self {
            lookups_total,
            reconciliations_total,
            routes_pruned_total,
            watch_restarts_total,
            table_routes,
            registry,
        })
    }

    pub fn record_lookup(&self, source: &str) {
        self.lookups_total.with_label_values(&[source]).inc();
    }

    pub fn record_reconciliation(&self, trigger: &str, ok: bool) {
        let outcome = if ok { "success" } else { "failure" };
        self.reconciliations_total
            .with_label_values(&[trigger, outcome])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::RouterError::Internal(e.to_string()))
    }
}
