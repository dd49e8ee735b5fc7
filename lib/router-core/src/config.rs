//! Router configuration

use crate::backoff::{millis, WatchBackoff};
use crate::route::Route;
use crate::table::DEFAULT_WATCH_BUFFER;
use crate::{Result, RouterError};
use router_registry::Registry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Network a router operates in unless configured otherwise
pub const DEFAULT_NETWORK: &str = "micro";
/// Interval between full table refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// RouterConfig holds every tunable of a router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Router id, stamped on every route this router creates
    pub id: String,

    /// Network (domain) the router operates in
    pub network: String,

    /// Default gateway, seeded as a catch-all route when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Keep the table in sync with the registry in the background.
    /// When off, lookups that miss the table go to the registry every time.
    pub cache: bool,

    /// Interval between full refreshes of the table
    #[serde(rename = "refresh_interval_ms", with = "millis")]
    pub refresh_interval: Duration,

    /// Backoff applied when the registry watch fails
    pub watch_backoff: WatchBackoff,

    /// Events each table watcher buffers before events are dropped for it
    pub watch_buffer: usize,

    /// Static routes added to the table on init and kept fresh
    pub initial_routes: Vec<Route>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            network: DEFAULT_NETWORK.to_string(),
            gateway: None,
            cache: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            watch_backoff: WatchBackoff::default(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
            initial_routes: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Check the configuration, normalising an empty gateway to none
    pub fn validate(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            return Err(RouterError::InvalidConfiguration(
                "router id must not be empty".to_string(),
            ));
        }
        if self.network.trim().is_empty() {
            return Err(RouterError::InvalidConfiguration(
                "network must not be empty".to_string(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(RouterError::InvalidConfiguration(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        if self.watch_buffer == 0 {
            return Err(RouterError::InvalidConfiguration(
                "watch buffer must be greater than zero".to_string(),
            ));
        }
        if self.watch_backoff.initial > self.watch_backoff.max {
            return Err(RouterError::InvalidConfiguration(format!(
                "watch backoff initial {:?} exceeds max {:?}",
                self.watch_backoff.initial, self.watch_backoff.max
            )));
        }
        if let Some(route) = self
            .initial_routes
            .iter()
            .find(|r| r.service.is_empty() || r.address.is_empty())
        {
            return Err(RouterError::InvalidConfiguration(format!(
                "initial route {:?} needs a service and an address",
                route
            )));
        }

        if self.gateway.as_deref().map(str::trim) == Some("") {
            self.gateway = None;
        }
        Ok(self)
    }
}

/// RouterOptions pairs a configuration with the registry the router
/// reconciles against
#[derive(Clone)]
pub struct RouterOptions {
    pub config: RouterConfig,
    pub registry: Arc<dyn Registry>,
}

impl RouterOptions {
    pub fn new(config: RouterConfig, registry: Arc<dyn Registry>) -> Self {
        Self { config, registry }
    }
}

impl fmt::Debug for RouterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterOptions")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
