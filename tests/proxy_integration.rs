//! End-to-end coverage of the Local Reverse Proxy (spec §4.4, §8) that a
//! unit test within `src/proxy` can't exercise: a real backend process,
//! real sockets, and a real WebSocket handshake.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as TungsteniteCloseCode;

use update_agent::proxy::LocalReverseProxy;

/// Starts a minimal backend standing in for the Mender server: it echoes
/// the `Authorization` header back as `X-Echo-Authorization` on
/// `/api/devices/...` and upgrades `/api/devices/v1/deviceconnect/connect`
/// to a WebSocket that echoes every frame it receives.
async fn start_backend() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/{*path}", any(backend_handler))
        .with_state(());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (addr, handle)
}

async fn backend_handler(
    State(()): State<()>,
    req: axum::extract::Request,
) -> Response {
    if req.uri().path() == "/api/devices/v1/deviceconnect/connect" {
        let upgrade = match WebSocketUpgrade::from_request(req, &()).await {
            Ok(u) => u,
            Err(_) => return axum::http::StatusCode::BAD_REQUEST.into_response(),
        };
        return upgrade.on_upgrade(|mut socket| async move {
            while let Some(Ok(msg)) = socket.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
        });
    }

    let auth = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    Response::builder()
        .status(204)
        .header("X-Echo-Authorization", auth)
        .body(axum::body::Body::empty())
        .unwrap()
}

#[tokio::test]
async fn proxy_forwards_authorization_header_and_backend_response_headers() {
    let (backend_addr, _backend) = start_backend().await;
    let backend_url = format!("http://{backend_addr}");

    let proxy = LocalReverseProxy::new(
        reqwest::Client::new(),
        Some(backend_url),
        Some("Beaver".to_string()),
    )
    .await
    .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/api/devices/v2/anything", proxy.get_server_url()))
        .header("Authorization", "Bearer Beaver")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert_eq!(
        response.headers().get("X-Echo-Authorization").unwrap(),
        "Bearer Beaver"
    );

    proxy.stop().await;
    _backend.abort();
}

#[tokio::test]
async fn brute_reconfigure_cycles_serve_one_request_each() {
    let (backend_addr, _backend) = start_backend().await;
    let backend_url = format!("http://{backend_addr}");

    let proxy = LocalReverseProxy::new(reqwest::Client::new(), None, None)
        .await
        .unwrap();
    let client = reqwest::Client::new();

    for _ in 0..50 {
        assert!(proxy.reconfigure(backend_url.clone(), "BringItOn"));
        proxy.start().await.unwrap();

        let response = client
            .get(format!("{}/api/devices/v2/anything", proxy.get_server_url()))
            .header("Authorization", "Bearer BringItOn")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);

        proxy.stop().await;
        assert_eq!(proxy.get_server_url(), "");
    }
    _backend.abort();
}

#[tokio::test]
async fn second_websocket_upgrade_is_rejected_while_one_tunnel_is_open() {
    let (backend_addr, _backend) = start_backend().await;
    let backend_url = format!("http://{backend_addr}");

    let proxy = LocalReverseProxy::new(
        reqwest::Client::new(),
        Some(backend_url),
        Some("secret".to_string()),
    )
    .await
    .unwrap();

    let ws_url = format!(
        "ws://{}/api/devices/v1/deviceconnect/connect",
        proxy.get_server_url().trim_start_matches("http://")
    );

    let mut request = ws_url.clone().into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        "Bearer secret".parse().unwrap(),
    );
    let (mut first_tunnel, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let mut second_request = ws_url.into_client_request().unwrap();
    second_request.headers_mut().insert(
        "Authorization",
        "Bearer secret".parse().unwrap(),
    );
    let second_attempt = tokio_tungstenite::connect_async(second_request).await;
    match second_attempt {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), 503);
        }
        other => panic!("expected an HTTP 503 upgrade rejection, got {other:?}"),
    }

    first_tunnel.close(None).await.ok();
    proxy.stop().await;
    _backend.abort();
}

#[tokio::test]
async fn stopping_the_proxy_closes_open_tunnels() {
    let (backend_addr, _backend) = start_backend().await;
    let backend_url = format!("http://{backend_addr}");

    let proxy = LocalReverseProxy::new(
        reqwest::Client::new(),
        Some(backend_url),
        Some("secret".to_string()),
    )
    .await
    .unwrap();

    let ws_url = format!(
        "ws://{}/api/devices/v1/deviceconnect/connect",
        proxy.get_server_url().trim_start_matches("http://")
    );
    let mut request = ws_url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        "Bearer secret".parse().unwrap(),
    );
    let (mut tunnel, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    proxy.stop().await;

    let code = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match tunnel.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(frame))) => {
                    return frame.map(|f| f.code);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("tunnel read errored instead of closing normally: {e}"),
                None => panic!(
                    "tunnel was dropped without ever receiving a close frame from the proxy"
                ),
            }
        }
    })
    .await
    .expect("tunnel should observe a close within the grace period");

    assert_eq!(code, Some(TungsteniteCloseCode::Normal));
    _backend.abort();
}
