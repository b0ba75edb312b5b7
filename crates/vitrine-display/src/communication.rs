//! The display's event channel to the broker.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vitrine_events::{Event, EventError, EventKind};

use crate::tunnel::TimeTunnel;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound mailbox depth.
const OUTBOUND_BUFFER: usize = 64;

/// Inbound event channel depth.
const INBOUND_BUFFER: usize = 64;

/// Bound on the peer acknowledging our close frame.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Result of one tunneled time exchange, as delivered to the tunnel slot.
pub(crate) type TunnelReply = Result<Vec<u8>, String>;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Websocket-level failure.
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection is closed or closing; nothing can be sent.
    #[error("connection to broker is closed")]
    Closed,

    /// Envelope encode/decode failure.
    #[error(transparent)]
    Event(#[from] EventError),
}

pub(crate) struct Shared {
    name: String,
    outbound: mpsc::Sender<Message>,
    ntp_slot: Mutex<Option<mpsc::Sender<TunnelReply>>>,
    cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an event for the writer, stamping our own name as source.
    pub(crate) async fn send(&self, mut event: Event) -> Result<(), ClientError> {
        event.source = self.name.clone();
        let json = event.to_json()?;
        self.outbound
            .send(Message::text(json))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub(crate) fn set_ntp_receiver(&self, slot: mpsc::Sender<TunnelReply>) {
        *self.ntp_slot.lock() = Some(slot);
    }

    /// Clear the tunnel slot, but only if `slot` still owns it; a stale
    /// endpoint must not detach its replacement.
    pub(crate) fn clear_ntp_receiver(&self, slot: &mpsc::Sender<TunnelReply>) {
        let mut current = self.ntp_slot.lock();
        if current
            .as_ref()
            .is_some_and(|occupant| occupant.same_channel(slot))
        {
            *current = None;
        }
    }

    fn deliver_tunnel_reply(&self, reply: TunnelReply) {
        let slot = self.ntp_slot.lock();
        match slot.as_ref() {
            None => debug!(name = %self.name, "no time tunnel attached, dropping reply"),
            Some(tx) => {
                if tx.try_send(reply).is_err() {
                    warn!(name = %self.name, "time tunnel not reading, dropping reply");
                }
            }
        }
    }
}

/// A live connection to the broker.
///
/// Dropping the handle tears the connection down without ceremony; call
/// [`Communication::stop`] for a clean close.
pub struct Communication {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: JoinHandle<()>,
}

impl Communication {
    /// Connect to `url` (a full `ws://` or `wss://` endpoint including the
    /// `/ws/<name>` path) and start the read/write pumps.
    ///
    /// Returns the handle and the channel of inbound events. Time-tunnel
    /// replies are not surfaced here; they go to the [`TimeTunnel`].
    pub async fn connect(
        url: &str,
        name: &str,
        tls: Option<Connector>,
    ) -> Result<(Self, mpsc::Receiver<Event>), ClientError> {
        let (ws, _response) = connect_async_tls_with_config(url, None, false, tls).await?;
        info!(name, url, "connected to broker");
        Ok(Self::from_stream(ws, name))
    }

    /// Wrap an established websocket. Split out for tests.
    pub fn from_stream(ws: WsStream, name: &str) -> (Self, mpsc::Receiver<Event>) {
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(INBOUND_BUFFER);
        let shared = Arc::new(Shared {
            name: name.to_owned(),
            outbound: outbound_tx,
            ntp_slot: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let writer = tokio::spawn(write_pump(sink, outbound_rx, shared.cancel.clone()));
        let reader = tokio::spawn(read_pump(stream, shared.clone(), events_tx));

        (
            Self {
                shared,
                reader: Mutex::new(Some(reader)),
                writer,
            },
            events_rx,
        )
    }

    /// Registered display name.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Send an event to the broker. `source` is stamped with our name.
    pub async fn send(&self, event: Event) -> Result<(), ClientError> {
        self.shared.send(event).await
    }

    /// Create the time-tunnel endpoint backed by this connection.
    ///
    /// A new endpoint displaces any previous one; at most one time query
    /// is in flight per display.
    pub fn time_tunnel(&self) -> TimeTunnel {
        TimeTunnel::attach(self.shared.clone())
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Clean shutdown: send a normal close frame and wait up to ten
    /// seconds for the peer to acknowledge, then tear down regardless.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        self.shared
            .outbound
            .send(close)
            .await
            .map_err(|_| ClientError::Closed)?;

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if tokio::time::timeout(STOP_GRACE, reader).await.is_err() {
                warn!(name = %self.shared.name, "timeout waiting for close, dropping connection");
            }
        }
        self.shared.cancel.cancel();
        Ok(())
    }
}

impl Drop for Communication {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.writer.abort();
    }
}

/// Sole writer for the websocket; a written close frame ends the pump.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            () = cancel.cancelled() => None,
        };
        let Some(frame) = frame else {
            let _ = sink.send(Message::Close(None)).await;
            return;
        };
        let closing = matches!(frame, Message::Close(_));
        if sink.send(frame).await.is_err() {
            cancel.cancel();
            return;
        }
        if closing {
            return;
        }
    }
}

/// Reads until close or error, routing frames: tunnel replies to the
/// attached slot, everything else to the inbound event channel.
async fn read_pump(
    mut stream: futures::stream::SplitStream<WsStream>,
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
) {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = shared.cancel.cancelled() => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(name = %shared.name, error = %err, "read failed, closing");
                break;
            }
            None => break,
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => {
                debug!(name = %shared.name, "broker sent close frame");
                break;
            }
            // Pings are answered by the protocol layer on the next write.
            _ => continue,
        };
        let event = match Event::parse(text.as_str()) {
            Ok(event) => event,
            Err(err) => {
                warn!(name = %shared.name, error = %err, "dropping malformed event");
                continue;
            }
        };
        match event.kind {
            EventKind::NtpResponse => match event.datagram() {
                Ok(bytes) => shared.deliver_tunnel_reply(Ok(bytes)),
                Err(err) => {
                    warn!(name = %shared.name, error = %err, "bad time response payload");
                }
            },
            EventKind::NtpError => match event.text_payload() {
                Ok(text) => shared.deliver_tunnel_reply(Err(text)),
                Err(err) => {
                    warn!(name = %shared.name, error = %err, "bad time error payload");
                }
            },
            _ => {
                if events.send(event).await.is_err() {
                    debug!(name = %shared.name, "event receiver dropped, closing");
                    break;
                }
            }
        }
    }
    info!(name = %shared.name, "connection closed");
    shared.cancel.cancel();
}
