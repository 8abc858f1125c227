use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{Settings, DEFAULT_STRICT_CONTENT_LENGTH, STRICT_CONTENT_LENGTH};
use crate::encoder::{EncoderProfile, OutputFormat};
use crate::error::{GatewayError, Result};
use crate::hardware::HardwareProber;

const READ_CHUNK: usize = 64 * 1024;

/// Stderr fragments that indicate the encode cannot succeed.
const FATAL_MARKERS: &[&str] = &[
    "Unknown encoder",
    "Unknown decoder",
    "Encoder not found",
    "Decoder not found",
    "Invalid data found when processing input",
    "could not find codec parameters",
    "Error opening input",
    "Error while opening encoder",
    "Server returned",
    "Connection refused",
    "No such file or directory",
    "Conversion failed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeState {
    Idle,
    Probing,
    Spawned,
    Streaming,
    Completed,
    Killed,
    Errored,
}

/// One transcoder child owned by exactly one client connection.
///
/// Dropping it before the child has been reaped kills the child.
struct TranscodeProcess {
    id: Uuid,
    child: Option<Child>,
    state: TranscodeState,
    live: Arc<AtomicUsize>,
}

impl TranscodeProcess {
    fn transition(&mut self, next: TranscodeState) {
        debug!("Transcode {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Wait for the child after its stdout closed.
    async fn finish(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let status = child.wait().await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        match status {
            Ok(status) if status.success() => {
                self.transition(TranscodeState::Completed);
                Some(status)
            }
            Ok(status) => {
                self.transition(TranscodeState::Errored);
                Some(status)
            }
            Err(e) => {
                error!("Transcode {}: failed to reap transcoder: {}", self.id, e);
                self.transition(TranscodeState::Errored);
                None
            }
        }
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Transcode {}: released before exit, killing transcoder", self.id);
        self.state = TranscodeState::Killed;
        let _ = child.start_kill();

        let live = self.live.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = child.wait().await;
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(_) => {
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Spawns and supervises one transcoder per raw-stream request.
pub struct TranscodeSupervisor {
    ffmpeg_path: String,
    prober: Arc<dyn HardwareProber>,
    settings: Arc<dyn Settings>,
    live: Arc<AtomicUsize>,
}

impl TranscodeSupervisor {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        prober: Arc<dyn HardwareProber>,
        settings: Arc<dyn Settings>,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            prober,
            settings,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transcoder processes that have been spawned and not yet reaped.
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn transcode(
        &self,
        url: &Url,
        format: OutputFormat,
        range: Option<&str>,
    ) -> Result<Response> {
        let id = Uuid::new_v4();
        let mut state = TranscodeState::Idle;
        if let Some(range) = range {
            info!("Transcode {}: ignoring Range {} on a live feed", id, range);
        }

        debug!("Transcode {}: {:?} -> {:?}", id, state, TranscodeState::Probing);
        state = TranscodeState::Probing;
        let capability = self.prober.detect().await;
        let profile = EncoderProfile::select(&capability, format);
        info!(
            "Transcode {}: {} with {} ({:?} output, hardware {:?})",
            id,
            url,
            profile.encoder_name(),
            format,
            capability.kind
        );

        let mut child = Command::new(&self.ffmpeg_path)
            .args(profile.command_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Transcode {}: failed to spawn {}: {}", id, self.ffmpeg_path, e);
                GatewayError::EncoderSpawnFailure(format!(
                    "{}: {}. Make sure FFmpeg is installed and in PATH",
                    self.ffmpeg_path, e
                ))
            })?;
        self.live.fetch_add(1, Ordering::SeqCst);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut process = TranscodeProcess {
            id,
            child: Some(child),
            state,
            live: self.live.clone(),
        };
        process.transition(TranscodeState::Spawned);

        let mut stdout = stdout.ok_or_else(|| {
            GatewayError::EncoderSpawnFailure("failed to capture transcoder stdout".to_string())
        })?;
        let stderr_scan = stderr.map(|stderr| tokio::spawn(scan_stderr(id, stderr)));

        // Hold headers back until there is output, so an immediate failure is
        // still reportable as a JSON error.
        let mut buffer = vec![0u8; READ_CHUNK];
        let first = match stdout.read(&mut buffer).await {
            Ok(n) if n > 0 => Bytes::copy_from_slice(&buffer[..n]),
            Ok(_) => {
                let status = process.finish().await;
                let fatal = first_fatal_line(stderr_scan).await;
                let message = match (fatal, status) {
                    (Some(line), _) => line,
                    (None, Some(status)) => format!("transcoder exited with {} and no output", status),
                    (None, None) => "transcoder exited without output".to_string(),
                };
                error!("Transcode {}: {}", id, message);
                return Err(GatewayError::EncoderRuntimeFailure(message));
            }
            Err(e) => {
                error!("Transcode {}: failed reading transcoder output: {}", id, e);
                return Err(GatewayError::EncoderRuntimeFailure(e.to_string()));
            }
        };

        process.transition(TranscodeState::Streaming);
        let body = Body::from_stream(pipe_output(process, stdout, buffer, first));

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::ACCEPT_RANGES, "none")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("X-Content-Type-Options", "nosniff");
        if format == OutputFormat::StrictMp4 {
            builder = builder.header(
                header::CONTENT_LENGTH,
                strict_content_length(self.settings.as_ref()),
            );
        }

        builder
            .body(body)
            .map_err(|e| GatewayError::EncoderRuntimeFailure(format!("response build failed: {}", e)))
    }
}

fn strict_content_length(settings: &dyn Settings) -> u64 {
    settings.get_u64(STRICT_CONTENT_LENGTH, DEFAULT_STRICT_CONTENT_LENGTH)
}

/// Forward transcoder stdout chunk by chunk. Each read only happens when the
/// client pulls, so a slow client stalls the encoder through the OS pipe.
fn pipe_output(
    mut process: TranscodeProcess,
    mut stdout: ChildStdout,
    mut buffer: Vec<u8>,
    first: Bytes,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        yield Ok::<_, std::io::Error>(first);

        loop {
            match stdout.read(&mut buffer).await {
                Ok(0) => {
                    match process.finish().await {
                        Some(status) if status.success() => {
                            info!("Transcode {}: stream ended", process.id);
                        }
                        Some(status) => {
                            // Bytes already sent stay sent; the client sees a truncated stream.
                            error!("Transcode {}: transcoder exited with {}", process.id, status);
                        }
                        None => {}
                    }
                    break;
                }
                Ok(n) => {
                    yield Ok(Bytes::copy_from_slice(&buffer[..n]));
                }
                Err(e) => {
                    error!("Transcode {}: error reading transcoder output: {}", process.id, e);
                    process.transition(TranscodeState::Errored);
                    break;
                }
            }
        }
    }
}

/// Log fatal stderr lines and return the first one. Progress chatter is dropped.
///
/// Lines are decoded lossily and the pipe is drained to EOF, so a stray
/// non-UTF-8 byte never stops the scan or leaves the transcoder writing into
/// a closed pipe.
async fn scan_stderr<R>(id: Uuid, stderr: R) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    let mut first_fatal = None;
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&raw);
                let line = decoded.trim_end_matches(['\r', '\n']);
                if is_fatal(line) {
                    error!("Transcode {}: {}", id, line);
                    if first_fatal.is_none() {
                        first_fatal = Some(line.to_string());
                    }
                } else {
                    trace!("Transcode {}: {}", id, line);
                }
            }
            Err(e) => {
                warn!("Transcode {}: stderr read failed: {}", id, e);
                break;
            }
        }
    }
    first_fatal
}

async fn first_fatal_line(scan: Option<JoinHandle<Option<String>>>) -> Option<String> {
    let scan = scan?;
    match tokio::time::timeout(std::time::Duration::from_secs(2), scan).await {
        Ok(Ok(line)) => line,
        _ => None,
    }
}

fn is_fatal(line: &str) -> bool {
    FATAL_MARKERS.iter().any(|marker| line.contains(marker))
}
