//! External request handlers for ordinary (non-upgrade) HTTP traffic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The collaborator that owns routing and business logic for plain HTTP.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: Request) -> Response;
}

/// Answers every request with 404. Used when no dashboard upstream is set.
pub struct NotFoundHandler;

#[async_trait]
impl RequestHandler for NotFoundHandler {
    async fn handle(&self, _req: Request) -> Response {
        (StatusCode::NOT_FOUND, "Not found").into_response()
    }
}

/// Forwards requests verbatim to the dashboard application.
pub struct UpstreamHandler {
    client: reqwest::Client,
    base_url: String,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::PROXY_AUTHENTICATE
        || *name == header::PROXY_AUTHORIZATION
        || name.as_str() == "keep-alive"
}

impl UpstreamHandler {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Redirects are the browser's business, not the proxy's.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn target_url(&self, req: &Request) -> String {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn forward(&self, req: Request) -> Result<Response> {
        let url = self.target_url(&req);
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .context("Failed to read request body")?;

        let mut outbound = self.client.request(parts.method, &url);
        for (name, value) in parts.headers.iter() {
            if *name != header::HOST && !is_hop_by_hop(name) {
                outbound = outbound.header(name, value);
            }
        }
        let upstream = outbound
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Upstream request to {} failed", url))?;

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers().iter() {
            if !is_hop_by_hop(name) {
                response = response.header(name, value);
            }
        }
        // Streamed so server-sent events and chunked pages flow through.
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .context("Failed to build proxied response")
    }
}

#[async_trait]
impl RequestHandler for UpstreamHandler {
    async fn handle(&self, req: Request) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%method, %path, error = %format!("{:#}", e), "Upstream unavailable");
                (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
            }
        }
    }
}
