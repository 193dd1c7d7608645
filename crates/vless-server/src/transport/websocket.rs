//! WebSocket listener using tokio-tungstenite.
//!
//! The request head is read first: plain HTTP requests get a canned page on
//! the configured path and 401 elsewhere. The upgrade callback gates
//! connections on the request path and captures the `Sec-WebSocket-Protocol`
//! header, which carries early data. Each
//! accepted socket is split into a pump task feeding [`TransportEvent`]s and
//! a [`WsSink`] implementing the relay's send side.

use super::{read_request_head, Rewind, ServerStream};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use vless_core::{
    InboundSink, InboundStream, ReadyState, RelayError, RelayResult, TransportEvent,
    EVENT_QUEUE_CAPACITY,
};

pub type WsStream = WebSocketStream<Rewind<ServerStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    /// Raw `Sec-WebSocket-Protocol` value from the upgrade request.
    pub early_data: Option<String>,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections. Upgrades for any path other than `path` are refused.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    path: String,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, tls = tls.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let path: Arc<str> = path.into();

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let tls = tls.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(remote = %addr, error = %e, "failed to set TCP_NODELAY");
                        }
                        let mut stream = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(s) => ServerStream::Tls(Box::new(s)),
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => ServerStream::Plain(stream),
                        };

                        let head = match read_request_head(&mut stream).await {
                            Ok(head) => head,
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "failed to read request head");
                                return;
                            }
                        };
                        if let Some(reply) = plain_response(&head, &path) {
                            debug!(remote = %addr, "answered plain HTTP request");
                            if let Err(e) = stream.write_all(reply.as_bytes()).await {
                                debug!(remote = %addr, error = %e, "failed to write HTTP reply");
                            }
                            let _ = stream.shutdown().await;
                            return;
                        }
                        let stream = Rewind::new(head, stream);

                        let mut early_data = None;
                        let callback = |req: &Request, resp: Response| {
                            let (resp, early) = upgrade_response(req, resp, &path)?;
                            early_data = early;
                            Ok(resp)
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    early_data,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Body served on the relay path to requests that do not ask for an upgrade.
pub const NEED_UPGRADE_BODY: &str = "need Upgrade to ws";

/// Answer a request head that is not a WebSocket upgrade.
///
/// Returns `None` for upgrade requests and for heads httparse cannot parse,
/// which are left to the WebSocket handshake.
pub fn plain_response(head: &[u8], path: &str) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let upgrade = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && std::str::from_utf8(h.value)
                .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    });
    if upgrade {
        return None;
    }

    let target = req.path.unwrap_or("/");
    let request_path = target.split('?').next().unwrap_or(target);
    if request_path == path {
        Some(http_reply(
            "200 OK",
            "Content-Type: text/html; charset=utf-8\r\n",
            NEED_UPGRADE_BODY,
        ))
    } else {
        Some(http_reply("401 Unauthorized", "WWW-Authenticate: Basic\r\n", "Unauthorized"))
    }
}

fn http_reply(status: &str, headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Decide an upgrade request.
///
/// Accepts only `path`, returning the response to send and the early data
/// header. The header is echoed so clients that offered it as a subprotocol
/// accept the handshake.
pub fn upgrade_response(
    req: &Request,
    mut resp: Response,
    path: &str,
) -> Result<(Response, Option<String>), ErrorResponse> {
    if req.uri().path() != path {
        debug!(path = %req.uri().path(), "upgrade refused: unknown path");
        return Err(unauthorized());
    }

    let protocol = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL).cloned();
    let early_data = protocol
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Some(value) = protocol {
        resp.headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok((resp, early_data))
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("Unauthorized".to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    resp
}

/// Split an accepted connection into the relay's inbound stream and sink.
///
/// Spawns the pump task; it stops when the returned stream is dropped or
/// finished.
pub fn into_relay_halves(conn: WebSocketConnection) -> (InboundStream, WsSink) {
    let WebSocketConnection {
        ws_stream,
        early_data,
        ..
    } = conn;
    let (sink, stream) = ws_stream.split();
    let state = Arc::new(AtomicU8::new(ReadyState::Open as u8));
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    tokio::spawn(pump(stream, tx, state.clone()));

    (
        InboundStream::new(early_data.as_deref(), rx),
        WsSink { sink, state },
    )
}

/// Forward WebSocket messages as transport events until close or error.
async fn pump(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("inbound consumer gone, stopping pump");
                return;
            }
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(Message::Binary(data))) => TransportEvent::Message(data.to_vec()),
            Some(Ok(Message::Text(text))) => TransportEvent::Message(text.as_bytes().to_vec()),
            Some(Ok(Message::Close(_))) | None => {
                state.store(ReadyState::Closed as u8, Ordering::Release);
                let _ = tx.send(TransportEvent::Close).await;
                return;
            }
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                state.store(ReadyState::Closed as u8, Ordering::Release);
                let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Send half of an accepted WebSocket.
pub struct WsSink {
    sink: SplitSink<WsStream, Message>,
    state: Arc<AtomicU8>,
}

impl InboundSink for WsSink {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send(&mut self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            let state = self.ready_state();
            if state != ReadyState::Open {
                return Err(RelayError::TransportSend(format!("websocket is {state:?}")));
            }
            self.sink
                .send(Message::Binary(data.into()))
                .await
                .map_err(|e| RelayError::TransportSend(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
                return Ok(());
            }
            self.state.store(ReadyState::Closing as u8, Ordering::Release);
            self.sink
                .close()
                .await
                .map_err(|e| RelayError::Transport(format!("WS close failed: {e}")))
        })
    }
}
