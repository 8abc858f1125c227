use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::Response,
};
use futures::stream::StreamExt;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamClient;

pub const MPEG_TS_CONTENT_TYPE: &str = "video/mp2t";

/// Content type by URL suffix; origins mislabel segments too often to trust.
pub fn content_type_for(url: &Url) -> Option<&'static str> {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".ts") {
        Some(MPEG_TS_CONTENT_TYPE)
    } else if path.ends_with(".aac") {
        Some("audio/aac")
    } else if path.ends_with(".m4s") {
        Some("video/iso.segment")
    } else if path.ends_with(".mp4") {
        Some("video/mp4")
    } else {
        None
    }
}

pub fn is_segment_path(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".ts") || path.ends_with(".aac") || path.ends_with(".m4s")
}

/// Stream one upstream resource straight through to the client.
///
/// Dropping the returned body (client gone) drops the upstream response,
/// which aborts the read.
pub async fn relay(upstream: &UpstreamClient, url: &Url, range: Option<&str>) -> Result<Response> {
    let fetched = upstream.fetch_stream(url, range).await?;
    debug!("Relaying {} ({})", url, fetched.status);

    let target = url.to_string();
    let stream = fetched.body.map(move |chunk| {
        chunk.map_err(|e| {
            // Headers are already out; ending the body is all that's left.
            warn!("Upstream read for {} failed mid-stream: {}", target, e);
            e
        })
    });

    let content_type = content_type_for(url)
        .map(str::to_string)
        .or(fetched.headers.content_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let mut builder = Response::builder()
        .status(fetched.status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(length) = fetched.headers.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if let Some(content_range) = fetched.headers.content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
        builder = builder.header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::UpstreamUnreachable(format!("invalid upstream headers: {}", e)))
}
