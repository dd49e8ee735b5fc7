//! Registry data model: services, nodes and watch results

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Metadata key carrying the domain a service or node belongs to
pub const DOMAIN_METADATA_KEY: &str = "domain";

/// A single running instance of a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// host:port the node listens on
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A named, versioned service and the nodes currently registered for it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Domain recorded in the service metadata, if any
    pub fn domain(&self) -> Option<&str> {
        self.metadata
            .get(DOMAIN_METADATA_KEY)
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }
}

/// Kind of change a watch result reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A single change delivered by a registry watcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResult {
    pub action: Action,
    /// The service the change applies to. Backends may deliver `None`.
    pub service: Option<Service>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_domain_from_metadata() {
        let svc = Service::new("foo", "1.0.0").with_metadata(DOMAIN_METADATA_KEY, "d1");
        assert_eq!(svc.domain(), Some("d1"));

        let empty = Service::new("foo", "1.0.0").with_metadata(DOMAIN_METADATA_KEY, "");
        assert_eq!(empty.domain(), None);
        assert_eq!(Service::new("foo", "1.0.0").domain(), None);
    }

    #[test]
    fn test_action_serde() {
        assert_eq!(Action::Delete.to_string(), "delete");
        let json = serde_json::to_string(&Action::Update).unwrap();
        assert_eq!(json, "\"update\"");
        let parsed: Action = serde_json::from_str("\"create\"").unwrap();
        assert_eq!(parsed, Action::Create);
    }
}
