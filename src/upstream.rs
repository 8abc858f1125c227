use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use once_cell::sync::Lazy;
use reqwest::Client;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, Result};

/// User agent presented to origins. Many IPTV panels only answer players.
pub const PLAYER_USER_AGENT: &str = "VLC/3.0.20 LibVLC/3.0.20";

static PLAYER_HEADERS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("User-Agent", PLAYER_USER_AGENT),
        ("Accept", "*/*"),
        ("Accept-Language", "en-US,en;q=0.9"),
        // Bodies are relayed untouched, so never ask for compression.
        ("Accept-Encoding", "identity"),
    ]
});

/// A buffered manifest body together with the URL it was finally served from.
#[derive(Debug)]
pub struct TextResponse {
    pub body: String,
    pub final_url: Url,
}

/// Response headers relayed to the client for streamed bodies.
#[derive(Debug, Default, Clone)]
pub struct RelayHeaders {
    pub content_length: Option<String>,
    pub content_range: Option<String>,
    pub content_type: Option<String>,
}

pub struct StreamedResponse {
    pub status: StatusCode,
    pub headers: RelayHeaders,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// Outbound HTTP(S) client used for manifests, segments and raw passthrough.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| GatewayError::UpstreamUnreachable(format!("client setup: {}", e)))?;
        Ok(Self { client, timeout })
    }

    fn request(&self, url: &Url) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url.as_str());
        for (name, value) in PLAYER_HEADERS.iter() {
            request = request.header(*name, *value);
        }
        if let Some(referer) = referer_for(url) {
            request = request.header("Referer", referer);
        }
        request
    }

    /// Fetch a body as text, following redirects.
    pub async fn fetch_text(&self, url: &Url) -> Result<TextResponse> {
        debug!("Fetching manifest {}", url);
        let response = self.request(url).timeout(self.timeout).send().await?;

        let status = to_status(response.status());
        if !status.is_success() {
            warn!("Upstream {} returned {}", url, status);
            return Err(GatewayError::UpstreamBadStatus { status });
        }

        let final_url = response.url().clone();
        if final_url != *url {
            debug!("Manifest {} redirected to {}", url, final_url);
        }
        let body = response.text().await?;
        Ok(TextResponse { body, final_url })
    }

    /// Open a streamed body, forwarding `range` verbatim when present.
    ///
    /// The body has no total deadline, but a gap of more than the client
    /// timeout between chunks ends it with a `TimedOut` error.
    pub async fn fetch_stream(&self, url: &Url, range: Option<&str>) -> Result<StreamedResponse> {
        let mut request = self.request(url);
        if let Some(range) = range {
            request = request.header("Range", range);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                GatewayError::UpstreamUnreachable(format!("timed out waiting for {}", url))
            })??;

        let status = to_status(response.status());
        if !status.is_success() {
            warn!("Upstream {} returned {}", url, status);
            return Err(GatewayError::UpstreamBadStatus { status });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let headers = RelayHeaders {
            content_length: header("content-length"),
            content_range: header("content-range"),
            content_type: header("content-type"),
        };

        let idle = self.timeout;
        let target = url.to_string();
        let body = tokio_stream::StreamExt::timeout(response.bytes_stream(), idle)
            .map(move |item| match item {
                Ok(chunk) => chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data from {} for {:?}", target, idle),
                )),
            })
            .boxed();

        Ok(StreamedResponse {
            status,
            headers,
            body,
        })
    }
}

/// `scheme://host[:port]/` of the target, used as a plausible Referer.
pub fn referer_for(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
        None => format!("{}://{}/", url.scheme(), host),
    })
}

fn to_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}
