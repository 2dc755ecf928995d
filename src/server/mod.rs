//! HTTP/Upgrade server.
//!
//! One listener serves both ordinary HTTP and every WebSocket endpoint.
//! [`ConnectionRouter`] makes the per-request decision; [`BoundServer`] is
//! the only type that can accept connections, and it can only be obtained
//! by binding, so no upgrade is ever accepted before the socket is bound.

pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{FromRequestParts, Request, State, ws::WebSocketUpgrade},
    http::{Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::errors::BootstrapError;
use crate::ws::{EndpointRegistry, SocketHandler, UpgradeRequest};
use upstream::RequestHandler;

/// Where a single request goes.
pub enum Route {
    /// Registered upgrade path; the handler takes the connection.
    Upgrade(Arc<dyn SocketHandler>),
    /// Upgrade attempt on a path nobody registered.
    UnknownUpgrade,
    /// Ordinary request for the external handler.
    Http,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Upgrade(handler) => write!(f, "Upgrade({})", handler.name()),
            Route::UnknownUpgrade => write!(f, "UnknownUpgrade"),
            Route::Http => write!(f, "Http"),
        }
    }
}

pub fn is_websocket_upgrade(parts: &Parts) -> bool {
    parts.method == Method::GET
        && parts
            .headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
}

/// Dispatches each request either to the HTTP handler or to exactly one
/// WebSocket handler.
pub struct ConnectionRouter {
    registry: Arc<EndpointRegistry>,
    http: Arc<dyn RequestHandler>,
}

impl ConnectionRouter {
    pub fn new(registry: Arc<EndpointRegistry>, http: Arc<dyn RequestHandler>) -> Self {
        Self { registry, http }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn classify(&self, parts: &Parts) -> Route {
        if !is_websocket_upgrade(parts) {
            return Route::Http;
        }
        match self.registry.get(parts.uri.path()) {
            Some(handler) => Route::Upgrade(handler),
            None => Route::UnknownUpgrade,
        }
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        let (mut parts, body) = req.into_parts();
        match self.classify(&parts) {
            Route::Http => self.http.handle(Request::from_parts(parts, body)).await,
            Route::UnknownUpgrade => {
                debug!(path = %parts.uri.path(), "Upgrade on unknown path");
                (StatusCode::NOT_FOUND, "Unknown WebSocket endpoint").into_response()
            }
            Route::Upgrade(handler) => {
                let request = UpgradeRequest::from_uri(&parts.uri);
                let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                    Ok(upgrade) => upgrade,
                    Err(rejection) => return rejection.into_response(),
                };
                let endpoint = handler.name();
                upgrade
                    .on_failed_upgrade(move |e| {
                        warn!(endpoint, error = %e, "WebSocket upgrade failed");
                    })
                    .on_upgrade(move |socket| async move {
                        debug!(endpoint, path = %request.path, "WebSocket connection opened");
                        handler.handle(socket, request).await;
                        debug!(endpoint, "WebSocket connection closed");
                    })
            }
        }
    }
}

async fn dispatch(State(router): State<Arc<ConnectionRouter>>, req: Request) -> Response {
    router.dispatch(req).await
}

/// Build the application with every request funnelled through `router`.
pub fn build_app(router: Arc<ConnectionRouter>, cors_permissive: bool) -> Router {
    let mut app = Router::new()
        .fallback(dispatch)
        .with_state(router)
        .layer(TraceLayer::new_for_http());
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// The process's single listening socket.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BootstrapError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BootstrapError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BootstrapError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, app: Router, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr, "Server started");
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Server error")?;
        info!("Server shut down gracefully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::RegistryBuilder;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ws::{Message, WebSocket};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    type Hits = Arc<Mutex<Vec<(&'static str, String)>>>;

    /// Sends its own tag as the first frame and records every connection it sees.
    struct Tagged {
        tag: &'static str,
        hits: Hits,
    }

    #[async_trait]
    impl SocketHandler for Tagged {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn handle(&self, mut socket: WebSocket, request: UpgradeRequest) {
            self.hits.lock().unwrap().push((self.tag, request.path.clone()));
            let _ = socket.send(Message::Text(self.tag.to_string().into())).await;
            // Hold the connection briefly so both sockets overlap.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    struct EchoPath;

    #[async_trait]
    impl RequestHandler for EchoPath {
        async fn handle(&self, req: Request) -> Response {
            format!("http:{}", req.uri().path()).into_response()
        }
    }

    fn test_router(hits: &Hits) -> Arc<ConnectionRouter> {
        let mut builder = RegistryBuilder::new();
        for tag in ["a", "b"] {
            builder
                .register(
                    &format!("/{}", tag),
                    Arc::new(Tagged {
                        tag,
                        hits: hits.clone(),
                    }),
                )
                .unwrap();
        }
        Arc::new(ConnectionRouter::new(
            Arc::new(builder.build()),
            Arc::new(EchoPath),
        ))
    }

    fn parts(method: Method, path: &str, upgrade: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(value) = upgrade {
            builder = builder
                .header(header::UPGRADE, value)
                .header(header::CONNECTION, "Upgrade");
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_classify_routes() {
        let hits = Hits::default();
        let router = test_router(&hits);

        assert!(matches!(
            router.classify(&parts(Method::GET, "/a", Some("websocket"))),
            Route::Upgrade(h) if h.name() == "a"
        ));
        assert!(matches!(
            router.classify(&parts(Method::GET, "/b", Some("WebSocket"))),
            Route::Upgrade(h) if h.name() == "b"
        ));
        assert!(matches!(
            router.classify(&parts(Method::GET, "/c", Some("websocket"))),
            Route::UnknownUpgrade
        ));
        // Registered path without an upgrade header is plain HTTP.
        assert!(matches!(
            router.classify(&parts(Method::GET, "/a", None)),
            Route::Http
        ));
        assert!(matches!(
            router.classify(&parts(Method::POST, "/a", Some("websocket"))),
            Route::Http
        ));
    }

    #[tokio::test]
    async fn test_plain_requests_forwarded_to_http_handler() {
        let hits = Hits::default();
        let app = build_app(test_router(&hits), false);
        let req = Request::builder()
            .uri("/dashboard/projects")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"http:/dashboard/projects");
        assert!(hits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_upgrade_path_is_404() {
        let hits = Hits::default();
        let app = build_app(test_router(&hits), false);
        let req = Request::builder()
            .uri("/nope")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = BoundServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = BoundServer::bind(first.local_addr()).await.err().unwrap();
        assert!(matches!(err, BootstrapError::Bind { .. }));
    }

    async fn open_socket(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            path
        );
        stream.write_all(req.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&head);
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake: {}", head);
        stream
    }

    /// Read one small unmasked text frame sent by the server.
    async fn read_text_frame(stream: &mut TcpStream) -> String {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0] & 0x0f, 0x1, "expected a text frame");
        let len = (header[1] & 0x7f) as usize;
        assert!(len < 126);
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        String::from_utf8(payload).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_upgrades_reach_only_their_handler() {
        let hits = Hits::default();
        let app = build_app(test_router(&hits), false);
        let bound = BoundServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = bound.local_addr();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(bound.serve(app, shutdown.clone()));

        let (mut a, mut b) = tokio::join!(open_socket(addr, "/a"), open_socket(addr, "/b"));
        let (frame_a, frame_b) = tokio::join!(read_text_frame(&mut a), read_text_frame(&mut b));
        assert_eq!(frame_a, "a");
        assert_eq!(frame_b, "b");

        let mut seen = hits.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![("a", "/a".to_string()), ("b", "/b".to_string())]
        );

        shutdown.cancel();
        drop((a, b));
        let _ = server.await;
    }
}
