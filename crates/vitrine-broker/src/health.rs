//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the broker is running.
    pub status: String,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Registered display connections.
    pub connections: usize,
    /// Groups with at least one member.
    pub groups: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, groups: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        groups,
    }
}
