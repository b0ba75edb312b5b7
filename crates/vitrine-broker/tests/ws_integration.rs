//! End-to-end routing tests over real websockets (debug mode, plaintext).

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use vitrine_broker::{Broker, BrokerConfig};
use vitrine_events::{Event, EventKind};

const WAIT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a debug-mode broker on an ephemeral port.
async fn boot(ntp_host: &str) -> (Arc<Broker>, std::net::SocketAddr) {
    let mut config = BrokerConfig::default();
    config.local_addr = "127.0.0.1:0".into();
    config.ntp_host = ntp_host.to_owned();
    config.num_workers = 2;
    config.debug = true;
    let broker = Broker::new(config);
    let (addr, _handle) = broker.listen(None).await.unwrap();
    (broker, addr)
}

async fn connect(addr: std::net::SocketAddr, name: &str) -> WsStream {
    let (ws, _resp) = connect_async(format!("ws://{addr}/ws/{name}"))
        .await
        .unwrap();
    ws
}

async fn send_event(ws: &mut WsStream, event: &Event) {
    ws.send(Message::text(event.to_json().unwrap()))
        .await
        .unwrap();
}

/// Next event frame, skipping keepalive control traffic.
async fn recv_event(ws: &mut WsStream) -> Event {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => return Event::parse(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Local UDP upstream answering every datagram with its bitwise complement.
async fn udp_upstream() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let reply: Vec<u8> = buf[..len].iter().map(|b| !b).collect();
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn direct_message_is_routed_with_stamped_source() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    // The sender claims no source at all; the broker stamps it.
    send_event(&mut a, &Event::message("", "b", "hi").unwrap()).await;

    let received = recv_event(&mut b).await;
    assert_eq!(received.kind, EventKind::Message);
    assert_eq!(received.source, "a");
    assert_eq!(received.target, "b");
    assert_eq!(received.text_payload().unwrap(), "hi");

    broker.stop().await;
}

#[tokio::test]
async fn forged_source_on_message_is_overwritten() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_event(&mut a, &Event::message("not-a", "b", "hello").unwrap()).await;

    let received = recv_event(&mut b).await;
    assert_eq!(received.source, "a");

    broker.stop().await;
}

#[tokio::test]
async fn group_attach_and_fan_out() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_event(&mut a, &Event::attach("a", "g1").unwrap()).await;
    // Wait for the subscription to land before publishing.
    timeout(WAIT, async {
        while !broker.groups().contains("g1", "a") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    send_event(&mut b, &Event::message("b", "g1", "hello").unwrap()).await;

    let received = recv_event(&mut a).await;
    assert_eq!(received.target, "g1");
    assert_eq!(received.source, "b");
    assert_eq!(received.text_payload().unwrap(), "hello");

    broker.stop().await;
}

#[tokio::test]
async fn detach_stops_group_delivery() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_event(&mut a, &Event::attach("a", "g1").unwrap()).await;
    timeout(WAIT, async {
        while !broker.groups().contains("g1", "a") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    send_event(&mut a, &Event::detach("a", "g1").unwrap()).await;
    timeout(WAIT, async {
        while broker.groups().contains("g1", "a") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // With the group gone, the message is addressed to a display named
    // "g1", which does not exist; `a` must not see it.
    send_event(&mut b, &Event::message("b", "g1", "late").unwrap()).await;
    send_event(&mut b, &Event::message("b", "a", "direct").unwrap()).await;
    let received = recv_event(&mut a).await;
    assert_eq!(received.text_payload().unwrap(), "direct");

    broker.stop().await;
}

#[tokio::test]
async fn forged_attach_is_rejected_and_session_survives() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    // Claim to be `b` while authenticated as `a`.
    send_event(&mut a, &Event::attach("b", "g1").unwrap()).await;

    // The session stays open and later traffic still flows.
    send_event(&mut a, &Event::message("a", "b", "still here").unwrap()).await;
    let received = recv_event(&mut b).await;
    assert_eq!(received.text_payload().unwrap(), "still here");

    // The authorization failure left the group index untouched.
    assert!(broker.groups().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn malformed_event_does_not_kill_session() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    a.send(Message::text("this is not an event")).await.unwrap();
    a.send(Message::text(r#"{"type":"","data":null}"#))
        .await
        .unwrap();

    send_event(&mut a, &Event::message("a", "b", "alive").unwrap()).await;
    let received = recv_event(&mut b).await;
    assert_eq!(received.text_payload().unwrap(), "alive");

    broker.stop().await;
}

#[tokio::test]
async fn time_query_round_trips_through_proxy() {
    let upstream = udp_upstream().await;
    let (broker, addr) = boot(&upstream.to_string()).await;
    let mut a = connect(addr, "a").await;

    let request: Vec<u8> = (0..48).collect();
    send_event(&mut a, &Event::ntp_query("a", &request).unwrap()).await;

    let reply = recv_event(&mut a).await;
    assert_eq!(reply.kind, EventKind::NtpResponse);
    assert_eq!(reply.target, "a");
    let datagram = reply.datagram().unwrap();
    let expected: Vec<u8> = request.iter().map(|b| !b).collect();
    assert_eq!(datagram, expected);

    broker.stop().await;
}

#[tokio::test]
async fn unreachable_time_server_yields_ntp_error() {
    // An empty upstream host cannot resolve.
    let (broker, addr) = boot("").await;
    let mut a = connect(addr, "a").await;

    send_event(&mut a, &Event::ntp_query("a", &[0u8; 48]).unwrap()).await;
    let reply = recv_event(&mut a).await;
    assert_eq!(reply.kind, EventKind::NtpError);
    assert_eq!(reply.target, "a");
    assert!(!reply.text_payload().unwrap().is_empty());

    // The session survives and a further query is attempted.
    send_event(&mut a, &Event::ntp_query("a", &[0u8; 48]).unwrap()).await;
    let reply = recv_event(&mut a).await;
    assert_eq!(reply.kind, EventKind::NtpError);

    broker.stop().await;
}

#[tokio::test]
async fn forged_time_query_is_dropped() {
    let upstream = udp_upstream().await;
    let (broker, addr) = boot(&upstream.to_string()).await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_event(&mut a, &Event::ntp_query("b", &[0u8; 48]).unwrap()).await;

    // No reply to either party; ordinary traffic still flows.
    send_event(&mut a, &Event::message("a", "b", "after").unwrap()).await;
    let received = recv_event(&mut b).await;
    assert_eq!(received.kind, EventKind::Message);

    broker.stop().await;
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let (broker, addr) = boot("localhost").await;
    let mut first = connect(addr, "a").await;
    let _second = connect(addr, "a").await;

    // The displaced connection observes a close frame.
    let got_close = timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap();
    assert!(got_close);
    assert_eq!(broker.registry().len(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn disconnect_cleans_groups() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;

    send_event(&mut a, &Event::attach("a", "g1").unwrap()).await;
    send_event(&mut a, &Event::attach("a", "g2").unwrap()).await;
    timeout(WAIT, async {
        while !(broker.groups().contains("g1", "a") && broker.groups().contains("g2", "a")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    a.close(None).await.unwrap();
    timeout(WAIT, async {
        while !broker.groups().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(broker.registry().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn echo_endpoint_echoes_frames() {
    let (broker, addr) = boot("localhost").await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/echo")).await.unwrap();

    ws.send(Message::text("ping me")).await.unwrap();
    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(frame, Message::text("ping me"));

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = frame {
            assert_eq!(data.as_ref(), &[1, 2, 3]);
            break;
        }
    }

    broker.stop().await;
}

#[tokio::test]
async fn shutdown_closes_connections_and_stops_router() {
    let (broker, addr) = boot("localhost").await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_event(&mut a, &Event::message("a", "b", "in flight").unwrap()).await;
    let _ = recv_event(&mut b).await;

    timeout(Duration::from_secs(10), broker.stop()).await.unwrap();
    assert!(broker.router().is_closed());
    assert_eq!(
        broker.router().send(Event::message("a", "b", "late").unwrap()),
        Err(vitrine_broker::router::RouterError::Shutdown)
    );

    // Both peers observe the close within the shutdown bound.
    for ws in [&mut a, &mut b] {
        let observed = timeout(Duration::from_secs(10), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => return true,
                }
            }
        })
        .await
        .unwrap();
        assert!(observed);
    }
}
