use super::Route;
use serde::{Deserialize, Serialize};

/// Type of routing table change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// Event is the wire shape of a routing table change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic id assigned by the emitting table
    pub id: u64,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Unix timestamp in nanoseconds
    pub timestamp: i64,

    pub route: Route,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = Event {
            id: 7,
            event_type: EventType::Delete,
            timestamp: 1_700_000_000_000_000_000,
            route: Route {
                service: "foo".to_string(),
                address: "10.0.0.1:8080".to_string(),
                ..Default::default()
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "delete");
        assert_eq!(value["id"], 7);
        assert_eq!(value["route"]["service"], "foo");
        assert!(value["route"].get("metadata").is_none());

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
