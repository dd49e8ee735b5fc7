//! Server configuration: a YAML file plus environment overrides

use anyhow::{anyhow, Context, Result};
use router_core::RouterConfig;
use router_registry::{Service, DEFAULT_DOMAIN};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;

/// Path of the YAML configuration file
pub const CONFIG_ENV: &str = "ROUTER_CONFIG";
pub const ADDRESS_ENV: &str = "ROUTER_ADDRESS";
pub const NETWORK_ENV: &str = "ROUTER_NETWORK";
pub const GATEWAY_ENV: &str = "ROUTER_GATEWAY";
pub const CACHE_ENV: &str = "ROUTER_CACHE";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub address: SocketAddr,
    pub router: RouterConfig,
    /// Services registered in the in-memory registry at startup
    pub services: Vec<StaticService>,
}

/// A service and the domain it is registered in
#[derive(Clone, Debug, Deserialize)]
pub struct StaticService {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(flatten)]
    pub service: Service,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([0, 0, 0, 0], 8084).into(),
            router: RouterConfig::default(),
            services: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from the file named by `ROUTER_CONFIG`, if any, then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path))?;
                info!("Configuration loaded from {}", path);
                Self::from_yaml(&raw)?
            }
            Err(_) => Self::default(),
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("invalid configuration")
    }

    /// Apply overrides looked up by environment variable name
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(ADDRESS_ENV) {
            self.address = address
                .parse()
                .with_context(|| format!("invalid {} {:?}", ADDRESS_ENV, address))?;
        }
        if let Some(network) = lookup(NETWORK_ENV) {
            self.router.network = network;
        }
        if let Some(gateway) = lookup(GATEWAY_ENV) {
            self.router.gateway = Some(gateway);
        }
        if let Some(cache) = lookup(CACHE_ENV) {
            self.router.cache = parse_bool(&cache)
                .ok_or_else(|| anyhow!("invalid {} {:?}", CACHE_ENV, cache))?;
        }
        Ok(self)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "0.0.0.0:8084".parse().unwrap());
        assert!(config.router.cache);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_from_yaml() {
        let config = ServerConfig::from_yaml(
            r#"
address: 127.0.0.1:9000
router:
  id: router-1
  network: d1
  refresh_interval_ms: 1000
  initial_routes:
    - service: legacy
      address: 10.0.0.9:80
services:
  - name: foo
    version: 1.0.0
    domain: d1
    nodes:
      - id: foo-1
        address: 10.0.0.1:8080
  - name: bar
    nodes:
      - id: bar-1
        address: 10.0.0.2:8080
"#,
        )
        .unwrap();

        assert_eq!(config.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.router.id, "router-1");
        assert_eq!(config.router.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.router.initial_routes.len(), 1);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].domain, "d1");
        assert_eq!(config.services[0].service.nodes[0].address, "10.0.0.1:8080");
        assert_eq!(config.services[1].domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ADDRESS_ENV, "127.0.0.1:7000"),
            (NETWORK_ENV, "d2"),
            (GATEWAY_ENV, "10.0.0.1:9094"),
            (CACHE_ENV, "false"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.address, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.router.network, "d2");
        assert_eq!(config.router.gateway.as_deref(), Some("10.0.0.1:9094"));
        assert!(!config.router.cache);
    }

    #[test]
    fn test_invalid_override() {
        let result = ServerConfig::default()
            .with_overrides(|key| (key == CACHE_ENV).then(|| "maybe".to_string()));
        assert!(result.is_err());

        let result = ServerConfig::default()
            .with_overrides(|key| (key == ADDRESS_ENV).then(|| "nowhere".to_string()));
        assert!(result.is_err());
    }
}
