//! WebSocket tunnel: dials the backend, forwards frames in both
//! directions under a per-direction write mutex, and enforces the
//! single-tunnel concurrency cap (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Shared;

/// The proxy tunnels at most one WebSocket connection at a time.
pub const MAX_CONCURRENT_TUNNELS: usize = 1;

/// How long `close_all` waits for a single tunnel to finish draining
/// after it has been signalled, before moving on to the next one.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const EXCLUDED_REQUEST_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-version",
    "upgrade",
    "connection",
];

pub(super) type TunnelRegistry = HashMap<u64, (oneshot::Sender<()>, oneshot::Receiver<()>)>;

#[derive(Default)]
pub(super) struct Tunnels {
    pub(super) open: parking_lot::Mutex<TunnelRegistry>,
    next_id: AtomicU64,
}

/// Attempt to reserve one of the tunnel slots. Returns the reserved id, a
/// receiver the forwarder awaits for a close request, and a sender the
/// forwarder fires once it has actually torn the tunnel down. Returns
/// `None` if the cap is already reached.
pub(super) fn reserve_slot(shared: &Shared) -> Option<(u64, oneshot::Receiver<()>, oneshot::Sender<()>)> {
    let mut open = shared.tunnels.open.lock();
    if open.len() >= MAX_CONCURRENT_TUNNELS {
        return None;
    }
    let id = shared.tunnels.next_id.fetch_add(1, Ordering::SeqCst);
    let (close_tx, close_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    open.insert(id, (close_tx, done_rx));
    Some((id, close_rx, done_tx))
}

/// Release a previously reserved slot without signalling it; used on the
/// error paths where the tunnel never actually started forwarding.
pub(super) fn release_slot(shared: &Shared, id: u64) {
    shared.tunnels.open.lock().remove(&id);
}

/// Sends a close request to every open tunnel and waits (briefly) for
/// each one to report that it has finished draining, so that by the time
/// `stop()` tears down the HTTP server, both ends of every tunnel have
/// already observed a normal-closure frame.
pub(super) async fn close_all(shared: &Shared) {
    let entries: Vec<_> = shared.tunnels.open.lock().drain().collect();
    for (_, (close_tx, done_rx)) in entries {
        let _ = close_tx.send(());
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, done_rx).await;
    }
}

pub(super) enum DialError {
    /// The backend responded to the upgrade attempt with a non-upgrade
    /// HTTP response; pass it back to the client verbatim.
    UpstreamResponse(Response<axum::body::Body>),
    Other(String),
}

type BackendStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial `backend`'s device-connect endpoint, forwarding all headers from
/// `original_headers` except the hop-by-hop upgrade headers. Returns the
/// open backend stream, the negotiated subprotocol (if any), and any
/// extra headers (`Sec-Websocket-Protocol`, `Set-Cookie`) to echo back to
/// the client's upgrade response.
pub(super) async fn dial_backend(
    backend: &str,
    original_headers: &HeaderMap,
) -> std::result::Result<(BackendStream, Option<String>, Vec<(axum::http::HeaderName, HeaderValue)>), DialError>
{
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let ws_url = to_ws_url(backend);
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| DialError::Other(e.to_string()))?;

    for (name, value) in original_headers {
        let lower = name.as_str().to_ascii_lowercase();
        if EXCLUDED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(name) = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = tokio_tungstenite::tungstenite::http::HeaderValue::from_bytes(value.as_bytes()) {
                request.headers_mut().insert(name, value);
            }
        }
    }

    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, response)) => {
            let negotiated = response
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let mut extra = Vec::new();
            if let Some(protocol) = response.headers().get("sec-websocket-protocol") {
                if let Ok(value) = HeaderValue::from_bytes(protocol.as_bytes()) {
                    extra.push((axum::http::header::SEC_WEBSOCKET_PROTOCOL, value));
                }
            }
            if let Some(cookie) = response.headers().get("set-cookie") {
                if let Ok(value) = HeaderValue::from_bytes(cookie.as_bytes()) {
                    extra.push((axum::http::header::SET_COOKIE, value));
                }
            }

            Ok((stream, negotiated, extra))
        }
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            Err(DialError::UpstreamResponse(status.into_response()))
        }
        Err(e) => Err(DialError::Other(e.to_string())),
    }
}

fn to_ws_url(backend: &str) -> String {
    let stripped = backend
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{stripped}/api/devices/v1/deviceconnect/connect")
}

/// Spawn two forwarders: client→backend and backend→client. Each reads a
/// frame and writes it to the other side. On a read error (or a close
/// frame), send a normal-closure frame to the peer preserving the
/// original close code if any, then terminate. If `close_rx` resolves
/// before either side closes on its own, both forwarders are cancelled
/// and each sends a normal-closure frame to the peer it owns the write
/// half for before returning.
pub(super) async fn forward(client_ws: WebSocket, backend_ws: BackendStream, close_rx: oneshot::Receiver<()>) {
    let (client_tx, mut client_rx) = client_ws.split();
    let (backend_tx, mut backend_rx) = backend_ws.split();
    let cancel = CancellationToken::new();

    let client_to_backend = {
        let cancel = cancel.clone();
        let mut backend_tx = backend_tx;
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = backend_tx
                            .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                                code: CloseCode::Normal,
                                reason: "proxy stopped".into(),
                            })))
                            .await;
                        break;
                    }
                    msg = client_rx.next() => {
                        match msg {
                            Some(Ok(AxumMessage::Close(frame))) => {
                                let _ = backend_tx
                                    .send(TungsteniteMessage::Close(frame.map(to_tungstenite_close)))
                                    .await;
                                break;
                            }
                            Some(Ok(msg)) => {
                                if backend_tx.send(to_tungstenite(msg)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(_)) => {
                                let _ = backend_tx
                                    .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "read error".into(),
                                    })))
                                    .await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    };

    let backend_to_client = {
        let cancel = cancel.clone();
        let mut client_tx = client_tx;
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = client_tx
                            .send(AxumMessage::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "proxy stopped".into(),
                            })))
                            .await;
                        break;
                    }
                    msg = backend_rx.next() => {
                        match msg {
                            Some(Ok(TungsteniteMessage::Close(frame))) => {
                                let _ = client_tx
                                    .send(AxumMessage::Close(frame.map(to_axum_close)))
                                    .await;
                                break;
                            }
                            Some(Ok(msg)) => {
                                if client_tx.send(to_axum(msg)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(_)) => {
                                let _ = client_tx
                                    .send(AxumMessage::Close(Some(CloseFrame {
                                        code: 1000,
                                        reason: "read error".into(),
                                    })))
                                    .await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    };

    let forwarding = async {
        tokio::join!(client_to_backend, backend_to_client);
    };
    tokio::pin!(forwarding);

    tokio::select! {
        _ = &mut forwarding => {}
        _ = close_rx => {
            cancel.cancel();
            forwarding.await;
        }
    }

    debug!("websocket tunnel closed");
}

fn to_tungstenite(msg: AxumMessage) -> TungsteniteMessage {
    match msg {
        AxumMessage::Text(t) => TungsteniteMessage::Text(t.as_str().into()),
        AxumMessage::Binary(b) => TungsteniteMessage::Binary(b),
        AxumMessage::Ping(p) => TungsteniteMessage::Ping(p),
        AxumMessage::Pong(p) => TungsteniteMessage::Pong(p),
        AxumMessage::Close(frame) => {
            TungsteniteMessage::Close(frame.map(to_tungstenite_close))
        }
    }
}

fn to_axum(msg: TungsteniteMessage) -> AxumMessage {
    match msg {
        TungsteniteMessage::Text(t) => AxumMessage::Text(t.as_str().to_string().into()),
        TungsteniteMessage::Binary(b) => AxumMessage::Binary(b),
        TungsteniteMessage::Ping(p) => AxumMessage::Ping(p),
        TungsteniteMessage::Pong(p) => AxumMessage::Pong(p),
        TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(to_axum_close)),
        TungsteniteMessage::Frame(_) => AxumMessage::Ping(Vec::new().into()),
    }
}

fn to_tungstenite_close(frame: CloseFrame) -> TungsteniteCloseFrame {
    TungsteniteCloseFrame {
        code: frame.code.into(),
        reason: frame.reason.as_str().into(),
    }
}

fn to_axum_close(frame: TungsteniteCloseFrame) -> CloseFrame {
    CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.as_str().to_string().into(),
    }
}
