// ABOUTME: Core library for the recorder, containing the event and entity state types.
// ABOUTME: These are the shapes the persistence engine consumes from the host's event bus.

pub mod event;
pub mod state;

pub use event::{
    EVENT_HOMEASSISTANT_START, EVENT_HOMEASSISTANT_STOP, EVENT_STATE_CHANGED, EVENT_TIME_CHANGED,
    Event, EventOrigin, ParseOriginError,
};
pub use state::{State, StateChange, StateChangeError};
