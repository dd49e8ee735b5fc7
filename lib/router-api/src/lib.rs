//! Router API wire types
//!
//! This library defines the messages exchanged with a remote router:
//! - Route: a single dispatchable path to a service node
//! - Lookup, Watch and Table requests and responses
//! - Event: a routing table change
//! - ErrorResponse: the error envelope returned by the handler

pub mod error;
pub mod v1;

pub use error::ErrorResponse;
pub use v1::{
    Ack, Event, EventType, LookupOptions, LookupRequest, LookupResponse, ReadRequest,
    ReadResponse, Route, WatchRequest, DEFAULT_LINK, DEFAULT_METRIC,
};

/// Service id used in error envelopes
pub const SERVICE_ID: &str = "router";

/// Router endpoints
pub const LOOKUP_PATH: &str = "/router/lookup";
pub const WATCH_PATH: &str = "/router/watch";

/// Routing table endpoints
pub const TABLE_CREATE_PATH: &str = "/table/create";
pub const TABLE_UPDATE_PATH: &str = "/table/update";
pub const TABLE_DELETE_PATH: &str = "/table/delete";
pub const TABLE_READ_PATH: &str = "/table/read";

pub const METRICS_PATH: &str = "/metrics";
pub const HEALTH_PATH: &str = "/healthz";
