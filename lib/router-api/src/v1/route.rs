use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Link name routes are created with
pub const DEFAULT_LINK: &str = "default";
/// Cost routes are created with
pub const DEFAULT_METRIC: i64 = 1;

/// Route is the wire shape of a routing table entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination service name
    pub service: String,

    /// host:port of the service node
    pub address: String,

    /// Optional next-hop override
    #[serde(default)]
    pub gateway: String,

    /// Network (domain) the route belongs to
    #[serde(default)]
    pub network: String,

    /// Id of the router that created the route
    #[serde(default)]
    pub router: String,

    /// Logical link name
    #[serde(default = "default_link")]
    pub link: String,

    /// Route cost, lower is preferred
    #[serde(default = "default_metric")]
    pub metric: i64,

    /// Opaque key/value metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            service: String::new(),
            address: String::new(),
            gateway: String::new(),
            network: String::new(),
            router: String::new(),
            link: default_link(),
            metric: default_metric(),
            metadata: HashMap::new(),
        }
    }
}

fn default_link() -> String {
    DEFAULT_LINK.to_string()
}

fn default_metric() -> i64 {
    DEFAULT_METRIC
}
