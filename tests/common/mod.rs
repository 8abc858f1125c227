//! Shared test harness for integration tests.
//!
//! Starts a mock IPTV origin and the gateway itself on random local ports.
//! The transcoder binary can be swapped for a shell script so process
//! lifecycle can be observed without a real ffmpeg.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};

use iptv_gateway::hardware::{HardwareCapability, HardwareProber, HardwareType, StaticProber};
use iptv_gateway::upstream::UpstreamClient;
use iptv_gateway::{
    build_router, AppState, GatewayConfig, SessionRegistry, TranscodeSupervisor,
};

pub const SIMPLE_PLAYLIST: &str = "#EXTM3U\n#EXTINF:10,\nhttp://origin/a.ts\n";
pub const SEGMENT_LEN: usize = 1000;
pub const EXPECTED_RANGE: &str = "bytes=100-200";

/// A running gateway plus handles to its internals.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::with_config(GatewayConfig::default(), "ffmpeg").await
    }

    pub async fn with_config(config: GatewayConfig, ffmpeg_path: &str) -> Self {
        let prober: Arc<dyn HardwareProber> = Arc::new(StaticProber(
            HardwareCapability::with_h264(HardwareType::Nvenc, "h264_nvenc"),
        ));
        let settings = Arc::new(config.clone());
        let state = AppState {
            sessions: SessionRegistry::new(config.session_timeout()).into_shared(),
            upstream: UpstreamClient::new(Duration::from_secs(5)).unwrap(),
            transcoder: Arc::new(TranscodeSupervisor::new(
                ffmpeg_path,
                prober,
                settings.clone(),
            )),
            settings,
        };

        let addr = serve(build_router(state.clone())).await;
        Self { addr, state }
    }

    pub fn proxy_url(&self, upstream: &str, extra: &str) -> String {
        format!(
            "http://{}/proxy?url={}{}",
            self.addr,
            urlencoding::encode(upstream),
            extra
        )
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Poll until no transcoder process is left, or panic after `within`.
    pub async fn wait_for_no_processes(&self, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while self.state.transcoder.live_processes() != 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "transcoder still running after {:?}",
                within
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ------------------------------------------------------------------
// Mock origin
// ------------------------------------------------------------------

/// Start the mock origin and return its address.
pub async fn start_origin() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/live.m3u8", get(|| async { playlist(SIMPLE_PLAYLIST) }))
        .route("/redirect.m3u8", get(redirect_to_cdn))
        .route(
            "/cdn/index.m3u8",
            get(|| async { playlist("#EXTM3U\n#EXTINF:4,\nchunk1.ts\n") }),
        )
        .route("/missing.m3u8", get(|| async { StatusCode::NOT_FOUND }))
        .route("/seg/a.ts", get(segment))
        .route("/raw/stream", get(|| async { "raw-bytes" }))
        .with_state(addr.port());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Sets its flag when the response body that owns it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Start an origin serving `/live/endless.ts`, a body that never ends.
///
/// The returned flag flips once the origin stops writing that body, which
/// only happens when the reader on the other side has gone away.
pub async fn start_endless_origin() -> (SocketAddr, Arc<AtomicBool>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));

    let flag = dropped.clone();
    let app = Router::new().route(
        "/live/endless.ts",
        get(move || {
            let guard = DropFlag(flag.clone());
            async move {
                let body = async_stream::stream! {
                    let _guard = guard;
                    loop {
                        yield Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"ts-packet-bytes"));
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                };
                ([(header::CONTENT_TYPE, "video/mp2t")], Body::from_stream(body))
            }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, dropped)
}

/// Poll `flag` until it is set, or panic after `within`.
pub async fn wait_for_flag(flag: &AtomicBool, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    while !flag.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "flag not set after {:?}",
            within
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn playlist(body: &'static str) -> Response {
    // Deliberately mislabelled; the gateway must not trust it.
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// Redirect to a different host name so relative segments must use the final URL.
async fn redirect_to_cdn(State(port): State<u16>) -> Redirect {
    Redirect::temporary(&format!("http://localhost:{}/cdn/index.m3u8", port))
}

/// Serves a fixed segment. Answers 403 unless the request looks like it came
/// from a media player with a Referer on the origin itself, and 416 for any
/// Range other than the exact one the tests send.
async fn segment(State(port): State<u16>, headers: HeaderMap) -> Response {
    let referer = header_str(&headers, header::REFERER);
    let user_agent = header_str(&headers, header::USER_AGENT);
    if referer != format!("http://127.0.0.1:{}/", port) || !user_agent.starts_with("VLC/") {
        return StatusCode::FORBIDDEN.into_response();
    }

    let data: Vec<u8> = (0..SEGMENT_LEN).map(|i| (i % 251) as u8).collect();
    match headers.get(header::RANGE) {
        Some(range) if range.to_str().ok() == Some(EXPECTED_RANGE) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_RANGE, format!("bytes 100-200/{}", SEGMENT_LEN)),
            ],
            data[100..=200].to_vec(),
        )
            .into_response(),
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Header value as a string, empty when absent.
pub fn header_of(resp: &reqwest::Response, name: &str) -> String {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

// ------------------------------------------------------------------
// Stand-in transcoder
// ------------------------------------------------------------------

/// Write an executable shell script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A transcoder that records its pid and arguments, then emits data forever.
#[cfg(unix)]
pub fn endless_transcoder(dir: &Path) -> PathBuf {
    let pid_file = dir.join("pid");
    let args_file = dir.join("args");
    write_script(
        dir,
        "fake-ffmpeg",
        &format!(
            "echo $$ > '{}'\necho \"$@\" > '{}'\nwhile :; do printf 'fmp4-fragment-bytes'; sleep 0.05; done",
            pid_file.display(),
            args_file.display()
        ),
    )
}

/// A transcoder that fails before producing any output.
#[cfg(unix)]
pub fn failing_transcoder(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "broken-ffmpeg",
        "echo \"[vost#0:0] Unknown encoder 'h264_nvenc'\" >&2\nexit 1",
    )
}

/// A transcoder whose stderr carries a Latin-1 line ahead of the fatal one.
#[cfg(unix)]
pub fn latin1_failing_transcoder(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "latin1-ffmpeg",
        "printf '\\377\\376 Cha\\356ne indisponible\\n' >&2\n\
         echo \"[vost#0:0] Unknown encoder 'h264_nvenc'\" >&2\n\
         exit 1",
    )
}

/// A transcoder that records its pid, then stalls before writing anything.
///
/// `exec` keeps the recorded pid on the process the gateway must kill.
#[cfg(unix)]
pub fn slow_start_transcoder(dir: &Path) -> PathBuf {
    let pid_file = dir.join("pid");
    write_script(
        dir,
        "slow-ffmpeg",
        &format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()),
    )
}
