//! Event kind vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind tag of an event envelope.
///
/// The broker acts on the closed vocabulary below; any other tag is carried
/// through unchanged as [`EventKind::Other`] and routed like a `message`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Subscribe the sending display to a named group.
    Attach,
    /// Unsubscribe the sending display from a named group.
    Detach,
    /// Time-protocol request datagram tunneled to the broker.
    NtpQuery,
    /// Time-protocol response datagram tunneled back to a display.
    NtpResponse,
    /// Time proxy failure, payload is the error text.
    NtpError,
    /// Passthrough application message.
    Message,
    /// URL for the display's browser to navigate to, passthrough.
    BrowserNavigate,
    /// Display-reported player status, passthrough.
    Status,
    /// Any tag outside the closed vocabulary; routed as-is.
    Other(String),
}

impl EventKind {
    /// Wire tag for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Attach => "attach",
            EventKind::Detach => "detach",
            EventKind::NtpQuery => "ntp-query",
            EventKind::NtpResponse => "ntp-response",
            EventKind::NtpError => "ntp-error",
            EventKind::Message => "message",
            EventKind::BrowserNavigate => "browser-navigate",
            EventKind::Status => "status",
            EventKind::Other(tag) => tag,
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "attach" => EventKind::Attach,
            "detach" => EventKind::Detach,
            "ntp-query" => EventKind::NtpQuery,
            "ntp-response" => EventKind::NtpResponse,
            "ntp-error" => EventKind::NtpError,
            "message" => EventKind::Message,
            "browser-navigate" => EventKind::BrowserNavigate,
            "status" => EventKind::Status,
            _ => EventKind::Other(tag),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
