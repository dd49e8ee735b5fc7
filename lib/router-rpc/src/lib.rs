//! HTTP transport for a router
//!
//! This library provides:
//! - A hyper handler exposing lookup, watch and table calls as JSON endpoints
//! - A server accept loop around the handler
//! - A client stub for a remote router and its table

pub mod client;
pub mod error;
pub mod handler;
pub mod server;

pub use client::{RemoteTable, RemoteWatcher, RouterClient};
pub use error::{Result, RpcError};
pub use handler::{ResponseBody, RouterHandler};
pub use server::RouterServer;
