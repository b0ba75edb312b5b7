//! # vitrine-broker
//!
//! Mutually-authenticated websocket event broker for a fleet of named
//! display endpoints.
//!
//! - Connection registry keyed by display name, with secure-identity
//!   precedence (a TLS-authenticated record is never displaced by an
//!   anonymous one)
//! - Typed-event routing: direct delivery by display name and fan-out to
//!   named groups, driven by a bounded worker pool
//! - Tunneled time synchronization: `ntp-query` events are proxied to an
//!   upstream time server over UDP and answered on the querying session
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`
//!
//! The broker is not a durable queue: undeliverable events are logged and
//! dropped, and no state survives a restart.

#![deny(unsafe_code)]

pub mod config;
pub mod groups;
pub mod health;
pub mod identity;
pub mod registry;
pub mod router;
pub mod server;
mod session;
pub mod shutdown;
pub mod timeproxy;

pub use config::BrokerConfig;
pub use server::{Broker, ServerError};
