use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Settings, TRANSCODING_ENABLED};
use crate::encoder::OutputFormat;
use crate::error::{GatewayError, Result};
use crate::manifest::{self, HLS_CONTENT_TYPE};
use crate::segment_relay;
use crate::session_registry::{spawn_reaper, SessionEvent, SessionInfo, SharedSessionRegistry};
use crate::transcoder::TranscodeSupervisor;
use crate::upstream::UpstreamClient;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SharedSessionRegistry,
    pub upstream: UpstreamClient,
    pub transcoder: Arc<TranscodeSupervisor>,
    pub settings: Arc<dyn Settings>,
}

pub struct StreamingServer {
    addr: String,
    state: AppState,
    reap_interval: std::time::Duration,
}

impl StreamingServer {
    pub fn new(addr: String, state: AppState, reap_interval: std::time::Duration) -> Self {
        Self {
            addr,
            state,
            reap_interval,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let reaper = spawn_reaper(self.state.sessions.clone(), self.reap_interval);
        let app = build_router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;

        info!("Gateway listening on http://{}", self.addr);
        info!("API endpoints:");
        info!("  GET /proxy?url=<url>[&segment=true][&format=mp4|hls] - Proxy, relay or transcode");
        info!("  POST /session - Start or stop a preview session");
        info!("  GET /sessions - List preview sessions");
        info!("  POST /sessions/clear - Drop all preview sessions");
        info!("  GET /sessions/events - Session activity as server-sent events");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        reaper.abort();
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::RANGE, header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
        ]);

    Router::new()
        .route("/", get(root_handler))
        .route("/proxy", get(proxy_handler).options(preflight))
        .route("/session", post(session_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/clear", post(clear_sessions))
        .route("/sessions/events", get(session_events))
        .layer(cors)
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

/// Successful preflights never touch the upstream and answer 204. Unknown
/// paths and methods keep their 404/405.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if is_options && response.status().is_success() {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "IPTV Stream Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "proxy": "GET /proxy?url=<url>[&segment=true][&format=mp4|hls]",
            "session": "POST /session {action: start|stop, sessionId, title}",
            "sessions": "GET /sessions",
            "clear_sessions": "POST /sessions/clear",
            "session_events": "GET /sessions/events"
        }
    }))
}

// ------------------------------------------------------------------
// Gateway
// ------------------------------------------------------------------

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
    segment: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Segment,
    Manifest,
    Raw,
}

/// A classified gateway request. Derived per request, never stored.
#[derive(Debug)]
pub struct ProxyRequest {
    pub upstream_url: Url,
    pub is_manifest: bool,
    pub is_segment: bool,
    pub output_format: OutputFormat,
    pub range_header: Option<String>,
}

impl ProxyRequest {
    pub fn parse(
        url: Option<&str>,
        segment: Option<&str>,
        format: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Self> {
        let raw = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("missing url parameter".to_string()))?;
        let upstream_url = Url::parse(raw)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid url {}: {}", raw, e)))?;
        if !matches!(upstream_url.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported scheme {}",
                upstream_url.scheme()
            )));
        }

        let segment_flag = matches!(segment, Some("true") | Some("1"));
        let is_segment = segment_flag || segment_relay::is_segment_path(&upstream_url);
        let is_manifest = upstream_url.path().to_ascii_lowercase().ends_with(".m3u8");

        Ok(Self {
            is_manifest,
            is_segment,
            output_format: OutputFormat::from_query(format),
            range_header: headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            upstream_url,
        })
    }

    pub fn kind(&self) -> RequestKind {
        if self.is_segment {
            RequestKind::Segment
        } else if self.is_manifest {
            RequestKind::Manifest
        } else {
            RequestKind::Raw
        }
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    Query(params): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    match dispatch(&state, &params, &headers).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxy request failed: {}", e);
            e.into_response()
        }
    }
}

async fn dispatch(state: &AppState, params: &ProxyQuery, headers: &HeaderMap) -> Result<Response> {
    let request = ProxyRequest::parse(
        params.url.as_deref(),
        params.segment.as_deref(),
        params.format.as_deref(),
        headers,
    )?;
    let range = request.range_header.as_deref();
    debug!("Proxy {:?} request for {}", request.kind(), request.upstream_url);

    match request.kind() {
        RequestKind::Segment => {
            segment_relay::relay(&state.upstream, &request.upstream_url, range).await
        }
        RequestKind::Manifest => serve_manifest(&state.upstream, &request.upstream_url).await,
        RequestKind::Raw if state.settings.get_bool(TRANSCODING_ENABLED, true) => {
            state
                .transcoder
                .transcode(&request.upstream_url, request.output_format, range)
                .await
        }
        RequestKind::Raw => {
            debug!("Transcoding disabled, relaying {} as-is", request.upstream_url);
            segment_relay::relay(&state.upstream, &request.upstream_url, range).await
        }
    }
}

async fn serve_manifest(upstream: &UpstreamClient, url: &Url) -> Result<Response> {
    let fetched = upstream.fetch_text(url).await?;
    let rewritten = manifest::rewrite_playlist(&fetched.body, &fetched.final_url);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HLS_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(rewritten))
        .map_err(|e| GatewayError::UpstreamUnreachable(format!("response build failed: {}", e)))
}

// ------------------------------------------------------------------
// Preview sessions
// ------------------------------------------------------------------

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SessionAction {
    Start,
    Stop,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    action: SessionAction,
    session_id: Option<String>,
    title: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    success: bool,
    active: bool,
}

#[derive(Serialize)]
struct SessionListResponse {
    active: bool,
    count: usize,
    sessions: Vec<SessionInfo>,
}

#[derive(Serialize)]
struct ClearResponse {
    success: bool,
    cleared: usize,
}

async fn session_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected session request: {}", rejection.body_text());
        GatewayError::InvalidRequest(rejection.body_text())
    })?;
    let session_id = request
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("missing sessionId".to_string()))?;

    let mut sessions = state.sessions.write().await;
    match request.action {
        SessionAction::Start => {
            let title = request.title.unwrap_or_default();
            sessions.start(&session_id, &title);
        }
        SessionAction::Stop => {
            sessions.stop(&session_id);
        }
    }

    Ok(Json(SessionResponse {
        success: true,
        active: sessions.is_active(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.read().await;
    Json(SessionListResponse {
        active: sessions.is_active(),
        count: sessions.count(),
        sessions: sessions.list(),
    })
}

async fn clear_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.sessions.write().await.clear_all();
    Json(ClearResponse {
        success: true,
        cleared,
    })
}

async fn session_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.sessions.read().await.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|event| match event {
        Ok(event) => sse_event(&event),
        Err(e) => {
            warn!("Session event subscriber lagged: {}", e);
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &SessionEvent) -> Option<std::result::Result<Event, Infallible>> {
    let name = match event {
        SessionEvent::Active { .. } => "active",
        SessionEvent::Inactive { .. } => "inactive",
    };
    Event::default().event(name).json_data(event).ok().map(Ok)
}
