//! Routes and their identity fingerprint

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub use router_api::{DEFAULT_LINK, DEFAULT_METRIC};
/// Matches any value in a route field or a query field
pub const WILDCARD: &str = "*";

/// Route is a single dispatchable path to a service node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination service name
    pub service: String,
    /// host:port of the target node
    pub address: String,
    /// Optional next-hop override, empty when unset
    #[serde(default)]
    pub gateway: String,
    /// Domain the route belongs to
    #[serde(default)]
    pub network: String,
    /// Id of the router that created the route
    #[serde(default)]
    pub router: String,
    #[serde(default = "default_link")]
    pub link: String,
    /// Route cost, lower is preferred
    #[serde(default = "default_metric")]
    pub metric: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Route {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            gateway: String::new(),
            network: String::new(),
            router: String::new(),
            link: default_link(),
            metric: DEFAULT_METRIC,
            metadata: HashMap::new(),
        }
    }

    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = gateway.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_router(mut self, router: impl Into<String>) -> Self {
        self.router = router.into();
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    pub fn with_metric(mut self, metric: i64) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identity fingerprint of the route.
    ///
    /// Covers service, address, gateway, network, router and link. Metric and
    /// metadata are attributes: changing them does not change the hash.
    pub fn hash(&self) -> u64 {
        // keeps ("ab", "c") and ("a", "bc") apart
        const SEPARATOR: [u8; 1] = [0xff];

        let fields = [
            &self.service,
            &self.address,
            &self.gateway,
            &self.network,
            &self.router,
            &self.link,
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update(SEPARATOR);
        }
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

fn default_link() -> String {
    DEFAULT_LINK.to_string()
}

fn default_metric() -> i64 {
    DEFAULT_METRIC
}

impl From<Route> for router_api::Route {
    fn from(route: Route) -> Self {
        Self {
            service: route.service,
            address: route.address,
            gateway: route.gateway,
            network: route.network,
            router: route.router,
            link: route.link,
            metric: route.metric,
            metadata: route.metadata,
        }
    }
}

impl From<router_api::Route> for Route {
    fn from(route: router_api::Route) -> Self {
        Self {
            service: route.service,
            address: route.address,
            gateway: route.gateway,
            network: route.network,
            router: route.router,
            link: route.link,
            metric: route.metric,
            metadata: route.metadata,
        }
    }
}
