//! The event envelope and its wire codec.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::kind::EventKind;

/// Errors raised by envelope parsing and payload decoding.
#[derive(Debug, Error)]
pub enum EventError {
    /// The envelope could not be decoded from JSON.
    #[error("malformed event envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope decoded but carries an empty `type` tag.
    #[error("event has an empty type tag")]
    EmptyType,

    /// The event kind requires a payload but `data` is absent or null.
    #[error("missing payload for {kind} event")]
    MissingPayload {
        /// Kind of the offending event.
        kind: EventKind,
    },

    /// The payload does not decode to the shape the kind requires.
    #[error("payload of {kind} event has the wrong shape: {source}")]
    Payload {
        /// Kind of the offending event.
        kind: EventKind,
        /// Underlying decode failure.
        source: serde_json::Error,
    },

    /// A datagram payload is not valid base64.
    #[error("payload of {kind} event is not valid base64: {source}")]
    Datagram {
        /// Kind of the offending event.
        kind: EventKind,
        /// Underlying decode failure.
        source: base64::DecodeError,
    },
}

/// An immutable event envelope.
///
/// `source` is authoritative only once the broker has stamped or verified
/// it; `token` is an opaque correlation string passed through unchanged;
/// `data` is raw JSON typed by convention per [`EventKind`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Kind tag, see [`EventKind`].
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Display name of the originator.
    #[serde(default)]
    pub source: String,
    /// Display name or group name this event is addressed to; may be empty.
    #[serde(default)]
    pub target: String,
    /// Opaque correlation string, passed through unchanged.
    #[serde(default)]
    pub token: String,
    /// Opaque payload, raw JSON.
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl Event {
    /// Create an envelope from already-encoded payload JSON.
    pub fn new(
        kind: EventKind,
        source: impl Into<String>,
        target: impl Into<String>,
        token: impl Into<String>,
        data: Option<Box<RawValue>>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            token: token.into(),
            data,
        }
    }

    /// A passthrough `message` event carrying a string payload.
    pub fn message(
        source: impl Into<String>,
        target: impl Into<String>,
        text: &str,
    ) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(text)?;
        Ok(Self::new(EventKind::Message, source, target, "", Some(data)))
    }

    /// An `attach` event subscribing `source` to `group`.
    pub fn attach(source: impl Into<String>, group: &str) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(group)?;
        Ok(Self::new(EventKind::Attach, source, "", "", Some(data)))
    }

    /// A `detach` event unsubscribing `source` from `group`.
    pub fn detach(source: impl Into<String>, group: &str) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(group)?;
        Ok(Self::new(EventKind::Detach, source, "", "", Some(data)))
    }

    /// An `ntp-query` event tunneling a request datagram to the broker.
    pub fn ntp_query(source: impl Into<String>, datagram: &[u8]) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(&BASE64.encode(datagram))?;
        Ok(Self::new(EventKind::NtpQuery, source, "", "", Some(data)))
    }

    /// An `ntp-response` event tunneling a response datagram back to a display.
    pub fn ntp_response(target: impl Into<String>, datagram: &[u8]) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(&BASE64.encode(datagram))?;
        Ok(Self::new(EventKind::NtpResponse, "", target, "", Some(data)))
    }

    /// An `ntp-error` event carrying the time proxy's failure text.
    pub fn ntp_error(target: impl Into<String>, error: &str) -> Result<Self, EventError> {
        let data = serde_json::value::to_raw_value(error)?;
        Ok(Self::new(EventKind::NtpError, "", target, "", Some(data)))
    }

    /// Encode the envelope for a websocket text frame.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope from a websocket text frame.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let event: Event = serde_json::from_str(text)?;
        if event.kind.as_str().is_empty() {
            return Err(EventError::EmptyType);
        }
        Ok(event)
    }

    fn payload(&self) -> Result<&RawValue, EventError> {
        match &self.data {
            Some(raw) if raw.get() != "null" => Ok(raw),
            _ => Err(EventError::MissingPayload {
                kind: self.kind.clone(),
            }),
        }
    }

    /// Decode the payload as a JSON string (attach/detach group names,
    /// message bodies, time-proxy error text).
    pub fn text_payload(&self) -> Result<String, EventError> {
        let raw = self.payload()?;
        serde_json::from_str(raw.get()).map_err(|source| EventError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    /// Decode the payload as a tunneled datagram (base64 JSON string).
    pub fn datagram(&self) -> Result<Vec<u8>, EventError> {
        let encoded = self.text_payload()?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|source| EventError::Datagram {
                kind: self.kind.clone(),
                source,
            })
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.source == other.source
            && self.target == other.target
            && self.token == other.token
            && self.data.as_deref().map(RawValue::get) == other.data.as_deref().map(RawValue::get)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind, self.source, self.target)
    }
}
