//! Local Reverse Proxy: a loopback HTTP endpoint that lets on-device
//! clients reach the server without doing authentication themselves
//! (spec §4.4).
//!
//! Constant-time Bearer-token comparison and an
//! `Arc<parking_lot::Mutex<_>>`-guarded, start/stop/reconfigure-able
//! server handle, one task per accepted connection.

mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use tunnel::MAX_CONCURRENT_TUNNELS;

const AUTH_PREFIX: &str = "/api/devices/v1/authentication/";
const DEVICES_PREFIX: &str = "/api/devices/";
const CONNECT_PATH: &str = "/api/devices/v1/deviceconnect/connect";

#[derive(Debug, Clone, Default)]
struct ProxyConfig {
    backend: String,
    jwt: String,
}

struct Shared {
    config: Mutex<ProxyConfig>,
    tunnels: tunnel::Tunnels,
    http: reqwest::Client,
}

/// The proxy's public handle. Holds its own listener and background server
/// task; `start`/`stop`/`reconfigure` are idempotent as specified.
pub struct LocalReverseProxy {
    shared: Arc<Shared>,
    server: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl LocalReverseProxy {
    /// Build a proxy. If both `backend` and `jwt` are non-empty, binds an
    /// ephemeral loopback listener immediately and starts serving;
    /// otherwise returns an un-started instance.
    pub async fn new(
        http: reqwest::Client,
        backend: Option<String>,
        jwt: Option<String>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            config: Mutex::new(ProxyConfig {
                backend: backend.clone().unwrap_or_default(),
                jwt: jwt.clone().unwrap_or_default(),
            }),
            tunnels: tunnel::Tunnels::default(),
            http,
        });
        let proxy = Self {
            shared,
            server: Mutex::new(None),
        };
        if backend.is_some_and(|b| !b.is_empty()) && jwt.is_some_and(|j| !j.is_empty()) {
            proxy.start().await?;
        }
        Ok(proxy)
    }

    /// Reconfigure the backend and shared secret. Legal only while stopped.
    pub fn reconfigure(&self, backend: impl Into<String>, jwt: impl Into<String>) -> bool {
        if self.server.lock().is_some() {
            return false;
        }
        let mut config = self.shared.config.lock();
        config.backend = backend.into();
        config.jwt = jwt.into();
        true
    }

    /// `http://127.0.0.1:<ephemeral port>` while running, empty otherwise.
    #[must_use]
    pub fn get_server_url(&self) -> String {
        self.server
            .lock()
            .as_ref()
            .map(|s| format!("http://{}", s.local_addr))
            .unwrap_or_default()
    }

    /// Start serving on a fresh ephemeral loopback port. Idempotent: a
    /// second call while already running is a no-op.
    pub async fn start(&self) -> std::io::Result<()> {
        if self.server.lock().is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/{*path}", any(handle_request))
            .route("/", any(handle_request))
            .with_state(Arc::clone(&self.shared));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service());
            let graceful = serve.with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = graceful.await {
                warn!(error = %e, "local reverse proxy server exited with error");
            }
        });

        *self.server.lock() = Some(RunningServer {
            local_addr,
            shutdown_tx,
            join,
        });
        info!(%local_addr, "local reverse proxy listening");
        Ok(())
    }

    /// Stop serving. Closes all open tunnels with a normal-closure frame
    /// and waits up to 5 seconds for the HTTP server to shut down.
    pub async fn stop(&self) {
        let running = self.server.lock().take();
        let Some(running) = running else {
            return;
        };
        tunnel::close_all(&self.shared).await;
        let _ = running.shutdown_tx.send(());
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), running.join).await;
    }
}

async fn handle_request(State(shared): State<Arc<Shared>>, req: Request<Body>) -> Response {
    let uri = req.uri().clone();
    let path = uri.path();

    if path.starts_with(AUTH_PREFIX) {
        return StatusCode::FORBIDDEN.into_response();
    }

    if path == CONNECT_PATH {
        return handle_connect(shared, req).await;
    }

    if path.starts_with(DEVICES_PREFIX) {
        if let Err(resp) = check_authorization(&shared, req.headers()) {
            return resp;
        }
        return forward_http(&shared, req).await;
    }

    StatusCode::NOT_FOUND.into_response()
}

fn check_authorization(shared: &Shared, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let jwt = shared.config.lock().jwt.clone();
    if jwt.is_empty() {
        return Err(unauthorized("authmanager not authorized yet"));
    }

    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(unauthorized("missing Authorization header"));
    };
    let Ok(value) = value.to_str() else {
        return Err(unauthorized("malformed Authorization header"));
    };

    let Some((verb, token)) = value.split_once(' ') else {
        return Err(unauthorized("malformed Authorization header"));
    };
    if !verb.eq_ignore_ascii_case("bearer") || token.contains(' ') || token.is_empty() {
        return Err(unauthorized("malformed Authorization header"));
    }

    if token.as_bytes().ct_eq(jwt.as_bytes()).into() {
        Ok(())
    } else {
        Err(unauthorized("token mismatch"))
    }
}

fn unauthorized(msg: &str) -> Response {
    (StatusCode::UNAUTHORIZED, msg.to_string()).into_response()
}

async fn forward_http(shared: &Shared, req: Request<Body>) -> Response {
    let backend = shared.config.lock().backend.clone();
    if backend.is_empty() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let (parts, body) = req.into_parts();
    let url = format!("{}{}", backend.trim_end_matches('/'), path_and_query(&parts.uri));
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let mut builder = shared
        .http
        .request(parts.method.clone(), &url)
        .body(body_bytes.to_vec());
    for (name, value) in &parts.headers {
        if name == axum::http::header::HOST {
            continue;
        }
        builder = builder.header(name, value);
    }

    match builder.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut out = Response::builder().status(status);
            if let Some(headers) = out.headers_mut() {
                for (name, value) in resp.headers() {
                    headers.insert(name, value.clone());
                }
            }
            let bytes = resp.bytes().await.unwrap_or_default();
            out.body(Body::from(bytes)).unwrap_or_else(|_| {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
        }
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

async fn handle_connect(shared: Arc<Shared>, req: Request<Body>) -> Response {
    if let Err(resp) = check_authorization(&shared, req.headers()) {
        return resp;
    }

    let Some((tunnel_id, close_rx, done_tx)) = tunnel::reserve_slot(&shared) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let backend = shared.config.lock().backend.clone();
    let original_headers = req.headers().clone();

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(u) => u,
        Err(_) => {
            tunnel::release_slot(&shared, tunnel_id);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match tunnel::dial_backend(&backend, &original_headers).await {
        Ok((backend_ws, negotiated_protocol, extra_headers)) => {
            let shared_for_close = Arc::clone(&shared);
            let mut upgrade = upgrade;
            if let Some(protocol) = &negotiated_protocol {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    upgrade = upgrade.protocols([value]);
                }
            }
            let mut response = upgrade.on_upgrade(move |client_ws| async move {
                tunnel::forward(client_ws, backend_ws, close_rx).await;
                let _ = done_tx.send(());
                tunnel::release_slot(&shared_for_close, tunnel_id);
            });
            for (name, value) in extra_headers {
                response.headers_mut().insert(name, value);
            }
            response
        }
        Err(tunnel::DialError::UpstreamResponse(resp)) => {
            tunnel::release_slot(&shared, tunnel_id);
            resp
        }
        Err(tunnel::DialError::Other(_)) => {
            tunnel::release_slot(&shared, tunnel_id);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    fn shared_with_jwt(jwt: &str) -> Shared {
        Shared {
            config: Mutex::new(ProxyConfig {
                backend: String::new(),
                jwt: jwt.to_string(),
            }),
            tunnels: tunnel::Tunnels::default(),
            http: reqwest::Client::new(),
        }
    }

    #[test]
    fn empty_jwt_is_always_unauthorized() {
        let shared = shared_with_jwt("");
        let headers = headers_with_auth("Bearer anything");
        assert!(check_authorization(&shared, &headers).is_err());
    }

    #[test]
    fn matching_bearer_token_is_authorized() {
        let shared = shared_with_jwt("secret-token");
        let headers = headers_with_auth("Bearer secret-token");
        assert!(check_authorization(&shared, &headers).is_ok());
    }

    #[test]
    fn case_insensitive_verb_is_accepted() {
        let shared = shared_with_jwt("secret-token");
        let headers = headers_with_auth("bearer secret-token");
        assert!(check_authorization(&shared, &headers).is_ok());
    }

    #[test]
    fn mismatched_token_is_unauthorized() {
        let shared = shared_with_jwt("secret-token");
        let headers = headers_with_auth("Bearer wrong-token");
        assert!(check_authorization(&shared, &headers).is_err());
    }

    #[test]
    fn malformed_header_is_unauthorized() {
        let shared = shared_with_jwt("secret-token");
        let headers = headers_with_auth("Basic dXNlcjpwYXNz");
        assert!(check_authorization(&shared, &headers).is_err());

        let headers = headers_with_auth("Bearer two words");
        assert!(check_authorization(&shared, &headers).is_err());
    }

    #[tokio::test]
    async fn new_without_backend_does_not_start() {
        let proxy = LocalReverseProxy::new(reqwest::Client::new(), None, None)
            .await
            .unwrap();
        assert_eq!(proxy.get_server_url(), "");
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let proxy = LocalReverseProxy::new(reqwest::Client::new(), None, None)
            .await
            .unwrap();
        proxy.start().await.unwrap();
        assert!(!proxy.get_server_url().is_empty());
        proxy.start().await.unwrap();
        proxy.stop().await;
        proxy.stop().await;
        assert_eq!(proxy.get_server_url(), "");
    }

    #[tokio::test]
    async fn reconfigure_is_rejected_while_running() {
        let proxy = LocalReverseProxy::new(reqwest::Client::new(), None, None)
            .await
            .unwrap();
        proxy.start().await.unwrap();
        assert!(!proxy.reconfigure("http://example", "jwt"));
        proxy.stop().await;
        assert!(proxy.reconfigure("http://example", "jwt"));
    }
}
