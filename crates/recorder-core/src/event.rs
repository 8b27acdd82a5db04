// ABOUTME: Defines the Event type delivered by the host's event bus and its origin tag.
// ABOUTME: Events are immutable facts; the recorder persists them as they arrive.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fired whenever an entity's state is set or removed.
pub const EVENT_STATE_CHANGED: &str = "state_changed";

/// Fired by the host clock once per tick. Never recorded.
pub const EVENT_TIME_CHANGED: &str = "time_changed";

/// Fired once when the host has started. Marks the beginning of a run.
pub const EVENT_HOMEASSISTANT_START: &str = "homeassistant_start";

/// Fired once when the host is shutting down.
pub const EVENT_HOMEASSISTANT_STOP: &str = "homeassistant_stop";

/// Where an event was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

impl EventOrigin {
    /// The textual name stored in the `origin` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Local => "LOCAL",
            EventOrigin::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event origin: {0}")]
pub struct ParseOriginError(pub String);

impl FromStr for EventOrigin {
    type Err = ParseOriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(EventOrigin::Local),
            "remote" => Ok(EventOrigin::Remote),
            _ => Err(ParseOriginError(s.to_string())),
        }
    }
}

/// A typed occurrence on the event bus with an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub origin: EventOrigin,
    #[serde(default = "Utc::now")]
    pub time_fired: DateTime<Utc>,
}

impl Event {
    /// Create a local event fired now.
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
        }
    }

    /// Create a local event with an empty payload.
    pub fn bare(event_type: impl Into<String>) -> Self {
        Self::new(event_type, Map::new())
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_time_fired(mut self, time_fired: DateTime<Utc>) -> Self {
        self.time_fired = time_fired;
        self
    }

    pub fn is_time_tick(&self) -> bool {
        self.event_type == EVENT_TIME_CHANGED
    }

    pub fn is_state_change(&self) -> bool {
        self.event_type == EVENT_STATE_CHANGED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_displays_uppercase_name() {
        assert_eq!(EventOrigin::Local.to_string(), "LOCAL");
        assert_eq!(EventOrigin::Remote.to_string(), "REMOTE");
    }

    #[test]
    fn origin_parses_case_insensitively() {
        assert_eq!("LOCAL".parse::<EventOrigin>(), Ok(EventOrigin::Local));
        assert_eq!("remote".parse::<EventOrigin>(), Ok(EventOrigin::Remote));
        assert_eq!("Remote".parse::<EventOrigin>(), Ok(EventOrigin::Remote));
    }

    #[test]
    fn origin_rejects_unknown_text() {
        let err = "elsewhere".parse::<EventOrigin>().unwrap_err();
        assert_eq!(err, ParseOriginError("elsewhere".to_string()));
        assert!(err.to_string().contains("elsewhere"));
    }

    #[test]
    fn event_deserializes_with_defaults() {
        let event: Event = serde_json::from_value(json!({"event_type": "call_service"})).unwrap();
        assert_eq!(event.event_type, "call_service");
        assert!(event.data.is_empty());
        assert_eq!(event.origin, EventOrigin::Local);
    }

    #[test]
    fn event_deserializes_remote_origin() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "call_service",
            "data": {"domain": "light"},
            "origin": "REMOTE",
            "time_fired": "2024-03-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.origin, EventOrigin::Remote);
        assert_eq!(event.data["domain"], "light");
        assert_eq!(event.time_fired.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn event_classification_helpers() {
        assert!(Event::bare(EVENT_TIME_CHANGED).is_time_tick());
        assert!(Event::bare(EVENT_STATE_CHANGED).is_state_change());
        assert!(!Event::bare(EVENT_HOMEASSISTANT_START).is_state_change());
    }
}
