//! HTTP front door
//!
//! `GET /render?url=<absolute-url>` renders through [`Renderer`]; every other
//! path and method goes to the backend through [`BackendProxy`].

use crate::proxy::BackendProxy;
use crate::render::{RenderRequest, Renderer};
use axum::extract::{ConnectInfo, RawQuery, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub renderer: Arc<Renderer>,
    pub proxy: Arc<BackendProxy>,
}

impl AppState {
    pub fn new(renderer: Arc<Renderer>, proxy: Arc<BackendProxy>) -> Self {
        Self { renderer, proxy }
    }
}

/// Build the service router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/render", get(render_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight connections
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Prerender proxy server listening at http://{}", addr);
    }

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Default bound on draining in-flight requests after a shutdown signal
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve until `signal` resolves, then drain for at most `drain_timeout`.
///
/// Requests still running when the drain times out are abandoned so the
/// caller can proceed to browser cleanup; a render stuck in navigation
/// cannot hold the process open.
pub async fn serve_until<F>(
    listener: TcpListener,
    state: AppState,
    signal: F,
    drain_timeout: Duration,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let draining = CancellationToken::new();
    let stop = draining.clone();
    let mut server = tokio::spawn(serve(listener, state, async move {
        stop.cancelled().await
    }));

    tokio::select! {
        finished = &mut server => return joined(finished),
        _ = signal => {}
    }

    draining.cancel();
    match tokio::time::timeout(drain_timeout, &mut server).await {
        Ok(finished) => joined(finished),
        Err(_) => {
            warn!(
                "In-flight requests still running after {:?}, abandoning them",
                drain_timeout
            );
            server.abort();
            Ok(())
        }
    }
}

fn joined(
    finished: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> std::io::Result<()> {
    finished.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Rejection for a render request that never reaches the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderInputError {
    MissingUrl,
    InvalidUrl,
}

impl IntoResponse for RenderInputError {
    fn into_response(self) -> Response {
        let message = match self {
            RenderInputError::MissingUrl => "Missing URL parameter",
            RenderInputError::InvalidUrl => "Invalid URL",
        };
        (StatusCode::BAD_REQUEST, message).into_response()
    }
}

/// Extract and validate the `url` query parameter
pub fn parse_target_url(query: Option<&str>) -> Result<Url, RenderInputError> {
    let raw = query
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "url")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|value| !value.is_empty())
        .ok_or(RenderInputError::MissingUrl)?;

    let url = Url::parse(&raw).map_err(|_| RenderInputError::InvalidUrl)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(RenderInputError::InvalidUrl),
    }
}

/// `X-Forwarded-For` as sent, else the peer address
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

async fn render_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let target_url = match parse_target_url(query.as_deref()) {
        Ok(url) => url,
        Err(rejection) => return rejection.into_response(),
    };

    let request = RenderRequest {
        target_url,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };

    match state.renderer.render(&request).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!(url = %request.target_url, "Prerendering failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Prerendering failed").into_response()
        }
    }
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    state.proxy.forward(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_url() {
        assert_eq!(parse_target_url(None), Err(RenderInputError::MissingUrl));
        assert_eq!(parse_target_url(Some("")), Err(RenderInputError::MissingUrl));
        assert_eq!(parse_target_url(Some("other=1")), Err(RenderInputError::MissingUrl));
        assert_eq!(parse_target_url(Some("url=")), Err(RenderInputError::MissingUrl));
    }

    #[test]
    fn test_invalid_url() {
        assert_eq!(parse_target_url(Some("url=not-a-url")), Err(RenderInputError::InvalidUrl));
        assert_eq!(parse_target_url(Some("url=%2Fpage")), Err(RenderInputError::InvalidUrl));
        assert_eq!(
            parse_target_url(Some("url=file%3A%2F%2F%2Fetc%2Fpasswd")),
            Err(RenderInputError::InvalidUrl)
        );
    }

    #[test]
    fn test_valid_url_is_decoded() {
        let url = parse_target_url(Some("url=https%3A%2F%2Fexample.com%2Fpage%3Fid%3D1")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/page?id=1");

        let url = parse_target_url(Some("x=1&url=http://example.com/")).unwrap();
        assert_eq!(url.as_str(), "http://example.com/");
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.5:51000".parse().unwrap();
        let mut headers = HeaderMap::new();

        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("10.0.0.5"));
        assert_eq!(client_ip(&headers, None), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(
            client_ip(&headers, Some(peer)).as_deref(),
            Some("203.0.113.7, 10.0.0.1")
        );
    }

    #[test]
    fn test_input_errors_are_bad_request() {
        let response = RenderInputError::MissingUrl.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = RenderInputError::InvalidUrl.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
