//! # vitrine-events
//!
//! Event envelope and wire format shared by the broker and the displays.
//!
//! Events are JSON objects carried on websocket text frames:
//!
//! ```json
//! { "type": "message", "source": "a", "target": "b", "token": "", "data": "\"hi\"" }
//! ```
//!
//! The `data` field is opaque to the broker: it is carried as raw JSON and
//! decoded per event kind only where a component actually needs the payload
//! (group names for attach/detach, datagrams for the time tunnel).

#![deny(unsafe_code)]

mod envelope;
mod kind;

pub use envelope::{Event, EventError};
pub use kind::EventKind;
