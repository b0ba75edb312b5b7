//! Per-connection session: registration, keepalive, read loop, dispatch.
//!
//! Write ownership: every frame bound for the peer goes through the
//! connection's bounded mailbox, and a single write pump per session owns
//! the websocket sink. The read loop, the heartbeat, the router's workers
//! and the time proxy only ever enqueue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vitrine_events::{Event, EventKind};

use crate::registry::ConnectionHandle;
use crate::server::Broker;

/// Outbound mailbox depth per connection.
const OUTBOUND_BUFFER: usize = 256;

/// Bound on flushing the final close frame at teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Run one display session from upgrade to teardown.
pub(crate) async fn run_session(
    socket: WebSocket,
    name: String,
    secure: bool,
    remote: SocketAddr,
    broker: Arc<Broker>,
) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let cancel = broker.cancel_token().child_token();
    let conn = Arc::new(ConnectionHandle::new(
        &name,
        secure,
        remote,
        outbound_tx,
        cancel.clone(),
    ));

    let writer = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        cancel.clone(),
        broker.config().write_deadline(),
    ));

    if let Err(err) = broker.registry().add(conn.clone()) {
        warn!(name, %remote, error = %err, "rejecting connection");
        let _ = conn.send_frame(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "registration rejected".into(),
        })));
        drop(conn);
        let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;
        return;
    }
    info!(name, %remote, secure, "display connected");

    let heartbeat = tokio::spawn(run_heartbeat(
        conn.clone(),
        broker.config().keepalive(),
        broker.config().keepalive_timeout(),
    ));

    read_loop(stream, &broker, &conn, &cancel).await;

    info!(name = %conn.name(), %remote, "display disconnected");
    heartbeat.abort();
    if broker.registry().close_if_same(&conn) {
        broker.groups().detach_all(conn.name());
    }
    conn.close();
    drop(conn);
    let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;
}

/// Read frames until the peer closes, the transport fails, or the session
/// is cancelled.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    broker: &Broker,
    conn: &Arc<ConnectionHandle>,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(name = %conn.name(), error = %err, "websocket read failed");
                return;
            }
            None => return,
        };
        match frame {
            Message::Text(text) => {
                conn.mark_alive();
                dispatch(broker, conn, text.as_str()).await;
            }
            Message::Binary(data) => {
                conn.mark_alive();
                match std::str::from_utf8(&data) {
                    Ok(text) => dispatch(broker, conn, text).await,
                    Err(_) => {
                        debug!(name = %conn.name(), len = data.len(), "ignoring non-UTF8 binary frame");
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => conn.mark_alive(),
            Message::Close(_) => {
                debug!(name = %conn.name(), "peer sent close frame");
                return;
            }
        }
    }
}

/// Classify one inbound event and act on it.
///
/// Per-event failures (malformed envelope, forged source, bad payload,
/// full queue) are logged and dropped; the session keeps running.
async fn dispatch(broker: &Broker, conn: &Arc<ConnectionHandle>, text: &str) {
    let mut event = match Event::parse(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(name = %conn.name(), error = %err, "dropping malformed event");
            return;
        }
    };
    debug!(name = %conn.name(), event = %event, "received event");
    match event.kind {
        EventKind::NtpQuery => {
            if verify_source(conn, &event) {
                handle_time_query(broker, conn, &event).await;
            }
        }
        EventKind::Attach => {
            if verify_source(conn, &event) {
                match event.text_payload() {
                    Ok(group) => {
                        broker.groups().attach(conn.name(), &group);
                        debug!(name = %conn.name(), group, "attached to group");
                    }
                    Err(err) => {
                        warn!(name = %conn.name(), error = %err, "dropping attach with bad payload");
                    }
                }
            }
        }
        EventKind::Detach => {
            if verify_source(conn, &event) {
                match event.text_payload() {
                    Ok(group) => {
                        broker.groups().detach(conn.name(), &group);
                        debug!(name = %conn.name(), group, "detached from group");
                    }
                    Err(err) => {
                        warn!(name = %conn.name(), error = %err, "dropping detach with bad payload");
                    }
                }
            }
        }
        _ => {
            // The broker, not the sender, is authoritative for `source`.
            event.source = conn.name().to_owned();
            if let Err(err) = broker.router().send(event) {
                warn!(name = %conn.name(), error = %err, "dropping undeliverable event");
            }
        }
    }
}

/// Self-addressed event kinds must carry the authenticated name.
fn verify_source(conn: &ConnectionHandle, event: &Event) -> bool {
    if event.source == conn.name() {
        true
    } else {
        warn!(
            name = %conn.name(),
            claimed = %event.source,
            kind = %event.kind,
            "source does not match authenticated name, dropping event"
        );
        false
    }
}

/// Proxy one tunneled time query and answer on this session's own
/// connection, as `ntp-response` on success or `ntp-error` on failure.
async fn handle_time_query(broker: &Broker, conn: &Arc<ConnectionHandle>, event: &Event) {
    let request = match event.datagram() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(name = %conn.name(), error = %err, "dropping time query with bad payload");
            return;
        }
    };
    let reply = match broker.time_proxy().query(&request).await {
        Ok(response) => Event::ntp_response(conn.name(), &response),
        Err(err) => {
            warn!(name = %conn.name(), error = %err, "time query failed");
            Event::ntp_error(conn.name(), &err.to_string())
        }
    };
    match reply {
        Ok(reply) => {
            if !conn.send_event(&reply) {
                warn!(name = %conn.name(), "cannot queue time reply");
            }
        }
        Err(err) => {
            warn!(name = %conn.name(), error = %err, "cannot encode time reply");
        }
    }
}

/// Sole writer for one websocket. Applies the per-write deadline; a failed
/// or timed-out write cancels the whole session.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    deadline: Duration,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Every handle is gone; say goodbye on the way out.
                    let _ = write_frame(&mut sink, Message::Close(None), deadline).await;
                    return;
                };
                let closing = matches!(frame, Message::Close(_));
                if write_frame(&mut sink, frame, deadline).await.is_err() {
                    cancel.cancel();
                    return;
                }
                if closing {
                    return;
                }
            }
            () = cancel.cancelled() => {
                // Flush whatever was queued before the cancel, the close
                // frame included.
                while let Ok(frame) = outbound.try_recv() {
                    let closing = matches!(frame, Message::Close(_));
                    if write_frame(&mut sink, frame, deadline).await.is_err() {
                        return;
                    }
                    if closing {
                        return;
                    }
                }
                let _ = write_frame(&mut sink, Message::Close(None), deadline).await;
                return;
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    deadline: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "websocket write failed");
            Err(())
        }
        Err(_) => {
            debug!("websocket write timed out");
            Err(())
        }
    }
}

/// Ping the peer every `interval`; close the connection after `timeout`
/// without any sign of life.
async fn run_heartbeat(conn: Arc<ConnectionHandle>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let interval_ms = interval.as_millis().max(1);
    #[allow(clippy::cast_possible_truncation)]
    let max_missed = ((timeout.as_millis() / interval_ms).max(1)) as u32;
    let mut missed: u32 = 0;
    let cancel = conn.cancel_token();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if conn.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        warn!(name = %conn.name(), "keepalive timed out, closing connection");
                        conn.close();
                        return;
                    }
                }
                if !conn.send_frame(Message::Ping(Bytes::from_static(b"ping"))) {
                    warn!(name = %conn.name(), "cannot queue keepalive ping, closing connection");
                    conn.close();
                    return;
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}
