//! Lookup queries and route filtering

use crate::route::{Route, WILDCARD};

/// LookupQuery narrows a set of routes. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupQuery {
    pub address: Option<String>,
    pub gateway: Option<String>,
    pub router: Option<String>,
    pub network: Option<String>,
    pub link: Option<String>,
}

impl LookupQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn router(mut self, router: impl Into<String>) -> Self {
        self.router = Some(router.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Whether a route satisfies every set field of the query
    pub fn matches(&self, route: &Route) -> bool {
        let pairs = [
            (&self.address, &route.address),
            (&self.gateway, &route.gateway),
            (&self.router, &route.router),
            (&self.network, &route.network),
            (&self.link, &route.link),
        ];
        pairs
            .iter()
            .all(|(want, have)| field_matches(want.as_deref(), have))
    }
}

fn field_matches(want: Option<&str>, have: &str) -> bool {
    match want {
        None => true,
        Some(want) => want == WILDCARD || have == WILDCARD || want == have,
    }
}

/// Keep the routes that satisfy the query
pub fn filter(routes: Vec<Route>, query: &LookupQuery) -> Vec<Route> {
    routes.into_iter().filter(|r| query.matches(r)).collect()
}

impl From<router_api::LookupOptions> for LookupQuery {
    fn from(opts: router_api::LookupOptions) -> Self {
        Self {
            address: opts.address,
            gateway: opts.gateway,
            router: opts.router,
            network: opts.network,
            link: opts.link,
        }
    }
}

impl From<LookupQuery> for router_api::LookupOptions {
    fn from(query: LookupQuery) -> Self {
        Self {
            address: query.address,
            gateway: query.gateway,
            router: query.router,
            network: query.network,
            link: query.link,
        }
    }
}
