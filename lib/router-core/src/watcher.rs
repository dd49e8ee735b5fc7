//! Routing table events and per-consumer watchers

use crate::route::{Route, WILDCARD};
use crate::{Result, RouterError};
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Type of routing table change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Event describes a single routing table change
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Monotonic per table
    pub id: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub route: Route,
}

/// Options for a table watcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Service to watch, `*` for every service
    pub service: String,
}

impl WatchOptions {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub(crate) fn wants(&self, route: &Route) -> bool {
        self.service == WILDCARD || self.service == route.service
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::service(WILDCARD)
    }
}

/// TableWatcher receives the events of one table, filtered by service.
///
/// Events are buffered up to the table's watch buffer size; events that
/// arrive while the buffer is full are dropped for this watcher.
pub struct TableWatcher {
    id: Uuid,
    options: WatchOptions,
    events: mpsc::Receiver<Event>,
}

impl TableWatcher {
    pub(crate) fn new(id: Uuid, options: WatchOptions, events: mpsc::Receiver<Event>) -> Self {
        Self {
            id,
            options,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Wait for the next event. Returns `WatcherStopped` once stopped and
    /// drained, or when the table is gone.
    pub async fn next(&mut self) -> Result<Event> {
        self.events.recv().await.ok_or(RouterError::WatcherStopped)
    }

    /// Stop receiving events. Buffered events can still be read.
    pub fn stop(&mut self) {
        self.events.close();
    }
}

impl fmt::Debug for TableWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableWatcher")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

impl From<EventType> for router_api::EventType {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Create => router_api::EventType::Create,
            EventType::Update => router_api::EventType::Update,
            EventType::Delete => router_api::EventType::Delete,
        }
    }
}

impl From<router_api::EventType> for EventType {
    fn from(t: router_api::EventType) -> Self {
        match t {
            router_api::EventType::Create => EventType::Create,
            router_api::EventType::Update => EventType::Update,
            router_api::EventType::Delete => EventType::Delete,
        }
    }
}

impl From<Event> for router_api::Event {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.into(),
            timestamp: event.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            route: event.route.into(),
        }
    }
}

impl From<router_api::Event> for Event {
    fn from(event: router_api::Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.into(),
            timestamp: DateTime::from_timestamp_nanos(event.timestamp),
            route: event.route.into(),
        }
    }
}
