// ABOUTME: Defines the State of a single entity and extraction of state changes from events.
// ABOUTME: A state_changed event carries the entity id and the new state, or null on removal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{EVENT_STATE_CHANGED, Event};

/// The value and metadata of one addressable entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl State {
    /// Create a state whose last_changed and last_updated are both `at`.
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
            last_changed: at,
            last_updated: at,
        }
    }
}

/// Errors raised while reading a state change out of an event payload.
#[derive(Debug, Error)]
pub enum StateChangeError {
    #[error("event {0} is not a state change")]
    NotAStateChange(String),

    #[error("state change is missing a string entity_id")]
    MissingEntityId,

    #[error("malformed new_state for {entity_id}: {source}")]
    MalformedNewState {
        entity_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Wire shape of `new_state` inside a state_changed payload. Timestamps are
/// optional and fall back to the time the event fired.
#[derive(Debug, Deserialize)]
struct NewStatePayload {
    state: String,
    #[serde(default)]
    attributes: Map<String, Value>,
    last_changed: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
}

/// The entity id and new state carried by a state_changed event.
/// `new_state` is `None` when the entity was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_id: String,
    pub new_state: Option<State>,
}

impl StateChange {
    pub fn from_event(event: &Event) -> Result<Self, StateChangeError> {
        if event.event_type != EVENT_STATE_CHANGED {
            return Err(StateChangeError::NotAStateChange(event.event_type.clone()));
        }

        let entity_id = event
            .data
            .get("entity_id")
            .and_then(Value::as_str)
            .ok_or(StateChangeError::MissingEntityId)?
            .to_string();

        let new_state = match event.data.get("new_state") {
            None | Some(Value::Null) => None,
            Some(raw) => {
                let payload: NewStatePayload =
                    serde_json::from_value(raw.clone()).map_err(|source| {
                        StateChangeError::MalformedNewState {
                            entity_id: entity_id.clone(),
                            source,
                        }
                    })?;
                let last_changed = payload.last_changed.unwrap_or(event.time_fired);
                let last_updated = payload.last_updated.unwrap_or(last_changed);
                Some(State {
                    entity_id: entity_id.clone(),
                    state: payload.state,
                    attributes: payload.attributes,
                    last_changed,
                    last_updated,
                })
            }
        };

        Ok(Self {
            entity_id,
            new_state,
        })
    }
}
