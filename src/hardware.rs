use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    Software,
    VideoToolbox,
    Nvenc,
    Vaapi,
    Unavailable,
}

/// Snapshot of what the local transcoder can do. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareCapability {
    #[serde(rename = "type")]
    pub kind: HardwareType,
    /// Codec name (e.g. `h264`) to encoder name (e.g. `h264_nvenc`).
    pub encoders: HashMap<String, String>,
}

impl HardwareCapability {
    pub fn software() -> Self {
        Self::with_h264(HardwareType::Software, "libx264")
    }

    pub fn unavailable() -> Self {
        Self {
            kind: HardwareType::Unavailable,
            encoders: HashMap::new(),
        }
    }

    pub fn with_h264(kind: HardwareType, encoder: &str) -> Self {
        let mut encoders = HashMap::new();
        encoders.insert("h264".to_string(), encoder.to_string());
        Self { kind, encoders }
    }

    pub fn h264_encoder(&self) -> Option<&str> {
        self.encoders.get("h264").map(String::as_str)
    }
}

#[async_trait]
pub trait HardwareProber: Send + Sync {
    async fn detect(&self) -> HardwareCapability;
}

/// Always reports the same capability.
pub struct StaticProber(pub HardwareCapability);

#[async_trait]
impl HardwareProber for StaticProber {
    async fn detect(&self) -> HardwareCapability {
        self.0.clone()
    }
}

/// Candidate hardware encoders in preference order.
const HARDWARE_CANDIDATES: &[(&str, HardwareType)] = &[
    ("h264_nvenc", HardwareType::Nvenc),
    ("h264_vaapi", HardwareType::Vaapi),
    ("h264_videotoolbox", HardwareType::VideoToolbox),
];

pub const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Upper bound on each detection command. A wedged driver must not hold up
/// every transcode waiting on the cached result.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes the ffmpeg binary once and caches the answer.
pub struct FfmpegProber {
    ffmpeg_path: String,
    cached: OnceCell<HardwareCapability>,
    timeout: Duration,
}

impl FfmpegProber {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            cached: OnceCell::new(),
            timeout: DETECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn probe(&self) -> HardwareCapability {
        let listing = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, listing).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Transcoder {} not runnable: {}", self.ffmpeg_path, e);
                return HardwareCapability::unavailable();
            }
            Err(_) => {
                warn!(
                    "Transcoder {} did not list encoders within {:?}",
                    self.ffmpeg_path, self.timeout
                );
                return HardwareCapability::unavailable();
            }
        };

        let listing = String::from_utf8_lossy(&output.stdout);
        let listed = listed_encoders(&listing);

        for (encoder, kind) in HARDWARE_CANDIDATES {
            if !listed.iter().any(|name| name == encoder) {
                continue;
            }
            if self.trial_encode(encoder).await {
                info!("Hardware encoder {} is usable", encoder);
                return HardwareCapability::with_h264(*kind, encoder);
            }
            debug!("Hardware encoder {} is listed but failed a trial encode", encoder);
        }

        info!("No usable hardware encoder, falling back to libx264");
        HardwareCapability::software()
    }

    /// Encode a single synthetic frame to prove the device actually works.
    async fn trial_encode(&self, encoder: &str) -> bool {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        if encoder == "h264_vaapi" {
            cmd.args(["-vaapi_device", VAAPI_DEVICE]);
        }
        cmd.args(["-f", "lavfi", "-i", "color=c=black:s=256x144:d=0.1"]);
        if encoder == "h264_vaapi" {
            cmd.args(["-vf", "format=nv12,hwupload"]);
        }
        cmd.args(["-frames:v", "1", "-c:v", encoder, "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // On timeout the status future is dropped, and kill_on_drop ends the child.
        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("Trial encode with {} hung for {:?}", encoder, self.timeout);
                false
            }
        }
    }
}

#[async_trait]
impl HardwareProber for FfmpegProber {
    async fn detect(&self) -> HardwareCapability {
        self.cached.get_or_init(|| self.probe()).await.clone()
    }
}

/// Encoder names from `ffmpeg -encoders` output.
fn listed_encoders(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            // Capability columns look like "V....D"; the legend and header don't.
            let is_row = flags.len() == 6
                && flags.starts_with(['V', 'A', 'S'])
                && name != "="
                && !name.starts_with("Encoders");
            is_row.then(|| name.to_string())
        })
        .collect()
}
