//! # vitrine-display
//!
//! Display-side client for the vitrine broker: a websocket event channel
//! plus the tunneled time-sync endpoint.
//!
//! A display opens one outbound websocket to `wss://<broker>/ws/<name>`,
//! authenticated by its client certificate. Inbound events arrive on a
//! channel handed out at connect time; time-protocol responses are routed
//! to the [`TimeTunnel`] instead, which presents the broker tunnel as a
//! datagram-style endpoint to a time-sync client.

#![deny(unsafe_code)]

mod communication;
mod tunnel;

pub use communication::{ClientError, Communication};
pub use tunnel::{TimeTunnel, TunnelError};
