//! Passthrough to the backend application
//!
//! Every request that is not a render is replayed against the backend origin
//! with the same method, path, query, headers and body. The `Host` header is
//! dropped so the backend sees its own origin, and hop-by-hop headers are not
//! forwarded in either direction.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Largest request body buffered for forwarding
pub const MAX_FORWARDED_BODY: usize = 32 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Failed to read request body: {0}")]
    Body(#[source] axum::Error),

    #[error("Backend request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUrl(_) | ProxyError::Body(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Reverse proxy to a single backend origin
#[derive(Debug, Clone)]
pub struct BackendProxy {
    client: reqwest::Client,
    origin: String,
}

impl BackendProxy {
    /// Proxy to the origin of `backend`; any path on it is ignored
    pub fn new(backend: &Url) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            origin: backend.origin().ascii_serialization(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Forward `request` and relay the backend's response
    pub async fn forward(&self, request: Request) -> Response {
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Proxy error: {}", e);
                e.into_response()
            }
        }
    }

    async fn try_forward(&self, request: Request) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        // Concatenated rather than joined so `//host` paths stay on the backend.
        let url = Url::parse(&format!("{}{}", self.origin, path_and_query))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let body = axum::body::to_bytes(body, MAX_FORWARDED_BODY)
            .await
            .map_err(ProxyError::Body)?;

        debug!(method = %parts.method, url = %url, "Proxying request");

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
