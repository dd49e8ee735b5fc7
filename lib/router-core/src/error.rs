use router_registry::RegistryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("route not found")]
    RouteNotFound,

    #[error("duplicate route")]
    DuplicateRoute,

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid router configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Whether the error is the expected "no matching route" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, RouterError::RouteNotFound)
    }
}
