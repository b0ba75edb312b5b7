//! The broker object and its HTTP/websocket surface.
//!
//! `GET /ws/{name}` upgrades a display session (mutual TLS identity
//! enforced unless debug mode is on), `GET /echo` is a frame-echoing
//! diagnostic, `GET /health` reports live counters, and `GET /static/*`
//! serves a configured web folder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Extension;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::groups::GroupIndex;
use crate::health::{self, HealthResponse};
use crate::identity::PeerIdentity;
use crate::registry::Registry;
use crate::router::Router;
use crate::session::run_session;
use crate::timeproxy::{TimeProxy, TimeProxyConfig};

/// Bound on draining the delivery queue at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on connections observing their close frame at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fatal listener errors. Everything else the broker recovers from.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured address could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Configured listen address.
        addr: String,
        /// Underlying bind failure.
        source: std::io::Error,
    },

    /// Listener setup I/O failure.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// One broker instance: registry, group index, router, time proxy.
///
/// Owns all shared state so tests can run several independent brokers in
/// one process; sessions receive it by `Arc`.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<Registry>,
    groups: Arc<GroupIndex>,
    router: Router,
    time_proxy: TimeProxy,
    cancel: CancellationToken,
    sessions: TaskTracker,
    started: Instant,
}

impl Broker {
    /// Create a broker and start its delivery workers.
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let router = Router::start(
            registry.clone(),
            groups.clone(),
            config.num_workers,
            config.queue_depth,
        );
        let time_proxy = TimeProxy::new(TimeProxyConfig::from_spec(&config.ntp_host));
        Arc::new(Self {
            config,
            registry,
            groups,
            router,
            time_proxy,
            cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
            started: Instant::now(),
        })
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The group index.
    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    /// The event router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn time_proxy(&self) -> &TimeProxy {
        &self.time_proxy
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the axum application.
    pub fn app(self: &Arc<Self>) -> axum::Router {
        let mut app = axum::Router::new()
            .route("/ws/{name}", get(ws_upgrade))
            .route("/echo", get(echo_upgrade))
            .route("/health", get(health_endpoint))
            .with_state(self.clone());
        if let Some(folder) = &self.config.web_folder {
            app = app.nest_service("/static", ServeDir::new(folder));
        }
        app.layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and start serving.
    ///
    /// With `tls`, every connection is TLS-terminated by hand so the peer
    /// certificate identity is available to the upgrade handler; without
    /// it the broker serves plaintext (debug deployments and tests).
    ///
    /// Returns the bound address and the listener task handle.
    pub async fn listen(
        self: &Arc<Self>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(&self.config.local_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.local_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let handle = match tls {
            None => {
                info!(%addr, "broker listening (plaintext)");
                let app = self
                    .app()
                    .into_make_service_with_connect_info::<SocketAddr>();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { cancel.cancelled().await })
                        .await;
                    if let Err(err) = served {
                        error!(error = %err, "listener failed");
                    }
                    info!("listener stopped");
                })
            }
            Some(tls) => {
                info!(%addr, "broker listening (TLS)");
                let broker = self.clone();
                tokio::spawn(broker.accept_loop(listener, TlsAcceptor::from(tls)))
            }
        };
        Ok((addr, handle))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            let (stream, remote) = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let broker = self.clone();
            let acceptor = acceptor.clone();
            self.sessions.spawn(async move {
                broker.serve_tls_connection(stream, remote, acceptor).await;
            });
        }
        info!("listener stopped");
    }

    /// Terminate TLS, extract the peer identity, then serve HTTP on the
    /// stream with the identity attached to every request.
    async fn serve_tls_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        acceptor: TlsAcceptor,
    ) {
        let tls_stream = match acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(err) => {
                debug!(%remote, error = %err, "TLS handshake failed");
                return;
            }
        };
        let identity = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| PeerIdentity::from_certificate(cert.as_ref()));
        let identity = match identity {
            Some(Ok(identity)) => Some(identity),
            Some(Err(err)) => {
                warn!(%remote, error = %err, "cannot read peer certificate identity");
                None
            }
            None => None,
        };

        let app = self.app();
        let service = hyper::service::service_fn(
            move |mut request: hyper::Request<hyper::body::Incoming>| {
                request.extensions_mut().insert(ConnectInfo(remote));
                if let Some(identity) = identity.clone() {
                    request.extensions_mut().insert(identity);
                }
                let mut app = app.clone();
                async move { tower::Service::call(&mut app, request).await }
            },
        );
        let served = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
            .await;
        if let Err(err) = served {
            debug!(%remote, error = %err, "connection ended with error");
        }
    }

    /// Graceful shutdown: drain the delivery queue, close every
    /// registered connection with a normal close frame, then wait for the
    /// sessions (bounded by 10 s).
    pub async fn stop(&self) {
        info!("stopping broker");
        self.router.close(DRAIN_TIMEOUT).await;
        for conn in self.registry.drain() {
            conn.close();
        }
        self.cancel.cancel();
        self.sessions.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.sessions.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for connections to close");
        }
        info!("broker stopped");
    }
}

/// `GET /ws/{name}` — websocket upgrade for a display session.
async fn ws_upgrade(
    State(broker): State<Arc<Broker>>,
    Path(name): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    identity: Option<Extension<PeerIdentity>>,
    ws: WebSocketUpgrade,
) -> Response {
    let secure = identity
        .as_ref()
        .is_some_and(|identity| identity.0.allows(&name));
    if !secure && !broker.config.debug {
        let asserted: Vec<String> = identity
            .map(|identity| identity.0.names().to_vec())
            .unwrap_or_default();
        warn!(name, %remote, sans = ?asserted, "refusing websocket: no matching identity");
        return (
            StatusCode::NOT_FOUND,
            format!("name {name} not asserted by peer identity"),
        )
            .into_response();
    }

    let sessions = broker.sessions.clone();
    let broker = broker.clone();
    ws.on_upgrade(move |socket| {
        sessions.track_future(run_session(socket, name, secure, remote, broker))
    })
    .into_response()
}

/// `GET /echo` — diagnostic endpoint, echoes frames verbatim.
async fn echo_upgrade(State(broker): State<Arc<Broker>>, ws: WebSocketUpgrade) -> Response {
    let cancel = broker.cancel.child_token();
    let sessions = broker.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(run_echo(socket, cancel)))
        .into_response()
}

async fn run_echo(mut socket: WebSocket, cancel: CancellationToken) {
    debug!("echo connection established");
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            frame = socket.recv() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if socket.send(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "echo read failed");
                return;
            }
        }
    }
}

/// `GET /health`
async fn health_endpoint(State(broker): State<Arc<Broker>>) -> Json<HealthResponse> {
    Json(health::health_check(
        broker.started,
        broker.registry.len(),
        broker.groups.group_count(),
    ))
}
