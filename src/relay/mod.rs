//! Rendezvous relay
//!
//! Assigns each WebSocket connection a fresh peer id, keeps the live peer set,
//! broadcasts it after every connect and disconnect, and forwards signaling frames
//! by destination id with the sender's id injected.
//!
//! Routes:
//! - `GET /` or `GET /ws` with WebSocket upgrade - join the relay
//! - `GET /health` - `{"status":"ok","peers":<count>}`
//!
//! A failure on one connection never affects the others; each runs in its own task.

pub mod protocol;
mod store;

pub use protocol::ServerMessage;
pub use store::{PeerRegistry, PeerSink};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::types::Result;

type RelayStream = hyper_tungstenite::WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// Relay server bound to a socket
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    config: RelayConfig,
}

impl RelayServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(PeerRegistry::new(config.max_peers)),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            "Relay listening on {} (max {} peers, max frame {} bytes)",
            addr, self.config.max_peers, self.config.max_message_bytes
        );

        let config = Arc::new(self.config);
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let registry = Arc::clone(&registry);
                            let config = Arc::clone(&config);
                            async move { handle_request(registry, config, addr, req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            }
        }
    }
}

async fn handle_request(
    registry: Arc<PeerRegistry>,
    config: Arc<RelayConfig>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            format!(r#"{{"status":"ok","peers":{}}}"#, registry.peer_count()),
        ),
        (&Method::GET, "/" | "/ws") if hyper_tungstenite::is_upgrade_request(&req) => {
            handle_upgrade(registry, config, req, addr)
        }
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error": "Not found"}"#.to_string()),
    };

    Ok(response)
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Upgrade to WebSocket and hand the connection to its own task
fn handle_upgrade(
    registry: Arc<PeerRegistry>,
    config: Arc<RelayConfig>,
    req: Request<Incoming>,
    addr: SocketAddr,
) -> Response<Full<Bytes>> {
    if registry.is_at_capacity() {
        warn!("Relay: at capacity, rejecting {}", addr);
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error": "Relay at capacity"}"#.to_string(),
        );
    }

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!("Relay: WebSocket upgrade failed for {}: {}", addr, e);
            return json_response(
                StatusCode::BAD_REQUEST,
                format!(r#"{{"error": "WebSocket upgrade failed: {e}"}}"#),
            );
        }
    };

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => handle_connection(registry, ws, addr, config.max_message_bytes).await,
            Err(e) => warn!("Relay: WebSocket connection failed: {}", e),
        }
    });

    response.map(|_| Full::new(Bytes::new()))
}

/// Drive one established relay connection until it closes
async fn handle_connection(
    registry: Arc<PeerRegistry>,
    ws: RelayStream,
    addr: SocketAddr,
    max_message_bytes: usize,
) {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let Some(id) = registry.register(tx.clone(), Some(addr)) else {
        // Lost a race for the last slot after the upgrade was accepted
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Again,
            reason: "Relay at capacity".into(),
        })));
        drop(tx);
        let _ = writer.await;
        return;
    };

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %id, "Relay: read error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if text.len() > max_message_bytes {
                    warn!(peer = %id, bytes = text.len(), "Relay: oversized frame dropped");
                    continue;
                }
                registry.relay(&id, &text);
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }

    registry.deregister(&id);
    drop(tx);
    if let Err(e) = writer.await {
        debug!(peer = %id, "Relay: writer task ended abnormally: {}", e);
    }
}
