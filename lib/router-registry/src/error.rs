use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service not found")]
    NotFound,

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}
