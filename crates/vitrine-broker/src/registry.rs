//! Connection registry: display name → live websocket connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vitrine_events::Event;

/// Rejected registry insertions.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A secure record may only be displaced by another secure record.
    #[error("cannot replace secure connection {name} with an insecure one")]
    InsecureReplacement {
        /// The contested display name.
        name: String,
    },
}

/// Handle to one registered websocket connection.
///
/// All writes to the underlying socket go through the bounded `outbound`
/// mailbox; exactly one writer task per connection drains it, so no two
/// tasks ever write the same socket concurrently.
pub struct ConnectionHandle {
    name: String,
    secure: bool,
    remote: SocketAddr,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    alive: AtomicBool,
    dropped: AtomicU64,
}

impl ConnectionHandle {
    /// Create a handle around a session's outbound mailbox.
    pub fn new(
        name: impl Into<String>,
        secure: bool,
        remote: SocketAddr,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            secure,
            remote,
            outbound,
            cancel,
            alive: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registered display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the peer proved this name with a client certificate.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Peer address, used to tell a stale record from its replacement.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Cancellation token covering the whole session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enqueue a raw websocket frame for the writer task.
    ///
    /// Returns `false` (and counts a drop) when the mailbox is full or the
    /// writer is gone; the caller never blocks.
    pub fn send_frame(&self, frame: Message) -> bool {
        if self.outbound.try_send(frame).is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an event and enqueue it as a text frame.
    pub fn send_event(&self, event: &Event) -> bool {
        match event.to_json() {
            Ok(json) => self.send_frame(Message::Text(json.into())),
            Err(err) => {
                warn!(name = %self.name, error = %err, "cannot serialize outbound event");
                false
            }
        }
    }

    /// Ask the session to go away: queue a normal close frame and cancel.
    pub fn close(&self) {
        let _ = self.send_frame(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })));
        self.cancel.cancel();
    }

    /// Whether [`ConnectionHandle::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record liveness (a pong or any other traffic arrived).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the liveness flag; the heartbeat calls this once per
    /// ping period.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Frames dropped because the mailbox was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Thread-safe map of registered connections, at most one per name.
#[derive(Default)]
pub struct Registry {
    conns: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its name.
    ///
    /// An existing record under the same name is closed and displaced,
    /// unless it is secure and the newcomer is not; that insertion is
    /// rejected and the existing record stays.
    pub fn add(&self, conn: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let mut conns = self.conns.lock();
        if let Some(existing) = conns.get(conn.name()) {
            if existing.secure() && !conn.secure() {
                return Err(RegistryError::InsecureReplacement {
                    name: conn.name().to_owned(),
                });
            }
            warn!(name = %conn.name(), old = %existing.remote(), new = %conn.remote(), "replacing connection");
            existing.close();
        }
        conns.insert(conn.name().to_owned(), conn);
        Ok(())
    }

    /// Look up the connection registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.conns.lock().get(name).cloned()
    }

    /// Remove whatever is registered under `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.conns.lock().remove(name)
    }

    /// Close and remove `conn` only if it is still the registered record
    /// for its name (same peer address). Returns whether a record was
    /// removed, so callers know whether per-name cleanup is theirs to do.
    pub fn close_if_same(&self, conn: &ConnectionHandle) -> bool {
        let mut conns = self.conns.lock();
        match conns.get(conn.name()) {
            Some(current) if current.remote() == conn.remote() => {
                let current = conns.remove(conn.name());
                if let Some(current) = current {
                    current.close();
                }
                true
            }
            _ => false,
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Remove and return every registered connection (shutdown path).
    pub fn drain(&self) -> Vec<Arc<ConnectionHandle>> {
        self.conns.lock().drain().map(|(_, conn)| conn).collect()
    }
}
