//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the broker.
///
/// Every field has a default so a partial config file (or none at all)
/// works. TLS material is not part of this struct; the caller loads it and
/// hands a ready `rustls::ServerConfig` to [`crate::Broker::listen`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address the listener binds.
    #[serde(default = "default_local_addr", rename = "localaddr")]
    pub local_addr: String,

    /// Advertised address, used when telling operators where displays
    /// should connect.
    #[serde(default = "default_local_addr", rename = "externaladdr")]
    pub external_addr: String,

    /// Upstream time server host queried by the time proxy.
    #[serde(default = "default_ntp", rename = "ntp")]
    pub ntp_host: String,

    /// Delivery worker count. With more than one worker, events from the
    /// same sender may be reordered across recipients.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Disable identity enforcement. Development only: displays may
    /// register under any name without a client certificate.
    #[serde(default)]
    pub debug: bool,

    /// Folder served under `/static`, if any.
    #[serde(default, rename = "web_folder")]
    pub web_folder: Option<PathBuf>,

    /// Seconds between keepalive pings to each connection.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Seconds without a pong before a connection is considered dead.
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,

    /// Deadline in seconds for a single websocket write.
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,

    /// Depth of the router's delivery queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_local_addr() -> String {
    "localhost:8080".into()
}

fn default_ntp() -> String {
    "localhost".into()
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

fn default_keepalive_secs() -> u64 {
    5
}

fn default_keepalive_timeout_secs() -> u64 {
    15
}

fn default_write_deadline_secs() -> u64 {
    5
}

fn default_queue_depth() -> usize {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            local_addr: default_local_addr(),
            external_addr: default_local_addr(),
            ntp_host: default_ntp(),
            num_workers: default_num_workers(),
            debug: false,
            web_folder: None,
            keepalive_secs: default_keepalive_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            write_deadline_secs: default_write_deadline_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl BrokerConfig {
    /// Keepalive ping period.
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Pong deadline.
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    /// Per-write deadline.
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}
