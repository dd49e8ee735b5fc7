/// API version v1 for router messages

pub mod event;
pub mod requests;
pub mod route;

pub use event::{Event, EventType};
pub use requests::{
    Ack, LookupOptions, LookupRequest, LookupResponse, ReadRequest, ReadResponse, WatchRequest,
};
pub use route::{Route, DEFAULT_LINK, DEFAULT_METRIC};
