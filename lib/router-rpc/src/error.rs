use router_api::ErrorResponse;
use router_core::RouterError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Router returned an error: {0}")]
    Status(ErrorResponse),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Router(e) if e.is_not_found())
    }
}
