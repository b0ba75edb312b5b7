//! Tunneled time-sync endpoint.
//!
//! Adapts the event channel to the datagram-style contract a time-sync
//! client expects: `write` a request, `read` the response, deadlines bound
//! the wait. Responses arrive through a single-slot mailbox fed by the
//! connection's read pump; `close` detaches the endpoint so late replies
//! are ignored.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use vitrine_events::Event;

use crate::communication::{ClientError, Shared, TunnelReply};

/// Time-tunnel failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No reply arrived before the configured deadline.
    #[error("time tunnel read timed out")]
    Timeout,

    /// The endpoint was closed (or displaced by a newer one).
    #[error("time tunnel detached")]
    Detached,

    /// The broker's time proxy failed; payload of the `ntp-error` event.
    #[error("time server failure: {0}")]
    Upstream(String),

    /// The underlying connection failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Datagram-style endpoint for one display's time queries.
pub struct TimeTunnel {
    shared: Arc<Shared>,
    // Weak so the endpoint itself never keeps its reply channel alive;
    // once the connection drops its sender, reads report detachment.
    slot: mpsc::WeakSender<TunnelReply>,
    replies: AsyncMutex<mpsc::Receiver<TunnelReply>>,
    deadline: Mutex<Option<Instant>>,
}

impl TimeTunnel {
    pub(crate) fn attach(shared: Arc<Shared>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let slot = tx.downgrade();
        shared.set_ntp_receiver(tx);
        Self {
            shared,
            slot,
            replies: AsyncMutex::new(rx),
            deadline: Mutex::new(None),
        }
    }

    /// Tunnel one request datagram to the broker as an `ntp-query` event.
    pub async fn write(&self, datagram: &[u8]) -> Result<usize, TunnelError> {
        let event =
            Event::ntp_query(self.shared.name(), datagram).map_err(ClientError::Event)?;
        self.shared.send(event).await?;
        Ok(datagram.len())
    }

    /// Wait for the response datagram and copy it into `buf`.
    ///
    /// Blocks until a reply arrives, the deadline set via
    /// [`TimeTunnel::set_deadline`] passes, or the endpoint is detached. A
    /// proxy-side failure surfaces as [`TunnelError::Upstream`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let deadline = *self.deadline.lock();
        let mut replies = self.replies.lock().await;
        let reply = match deadline {
            None => replies.recv().await,
            Some(at) => {
                let at = tokio::time::Instant::from_std(at);
                match tokio::time::timeout_at(at, replies.recv()).await {
                    Ok(reply) => reply,
                    Err(_) => return Err(TunnelError::Timeout),
                }
            }
        };
        match reply {
            None => Err(TunnelError::Detached),
            Some(Err(text)) => Err(TunnelError::Upstream(text)),
            Some(Ok(bytes)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
        }
    }

    /// Bound subsequent [`TimeTunnel::read`] calls. `None` waits forever.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Detach the endpoint; replies arriving afterwards are dropped.
    pub fn close(&self) {
        if let Some(slot) = self.slot.upgrade() {
            self.shared.clear_ntp_receiver(&slot);
        }
    }
}

impl Drop for TimeTunnel {
    fn drop(&mut self) {
        self.close();
    }
}
