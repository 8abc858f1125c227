use crate::hardware::{HardwareCapability, VAAPI_DEVICE};
use url::Url;

use crate::upstream::{referer_for, PLAYER_USER_AGENT};

/// Output flavour requested through `format=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Fragmented MP4 for MSE-capable browsers (`format=hls` or absent).
    #[default]
    Browser,
    /// Baseline, software-encoded fMP4 for strict decoders (`format=mp4`).
    StrictMp4,
}

impl OutputFormat {
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("mp4") => OutputFormat::StrictMp4,
            _ => OutputFormat::Browser,
        }
    }
}

/// One H.264 encoder family and the arguments it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderProfile {
    Nvenc,
    Vaapi,
    VideoToolbox,
    Software,
}

const OUTPUT_HEIGHT: u32 = 720;

impl EncoderProfile {
    /// Pick the profile for a capability snapshot. Strict clients always get
    /// the software encoder; GPU baseline output is not reliable enough.
    pub fn select(capability: &HardwareCapability, format: OutputFormat) -> Self {
        if format == OutputFormat::StrictMp4 {
            return EncoderProfile::Software;
        }
        match capability.h264_encoder() {
            Some("h264_nvenc") => EncoderProfile::Nvenc,
            Some("h264_vaapi") => EncoderProfile::Vaapi,
            Some("h264_videotoolbox") => EncoderProfile::VideoToolbox,
            _ => EncoderProfile::Software,
        }
    }

    pub fn encoder_name(&self) -> &'static str {
        match self {
            EncoderProfile::Nvenc => "h264_nvenc",
            EncoderProfile::Vaapi => "h264_vaapi",
            EncoderProfile::VideoToolbox => "h264_videotoolbox",
            EncoderProfile::Software => "libx264",
        }
    }

    /// Arguments that must precede `-i`.
    fn hwaccel_args(&self) -> Vec<String> {
        match self {
            EncoderProfile::Nvenc => args(&["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]),
            EncoderProfile::Vaapi => args(&["-vaapi_device", VAAPI_DEVICE]),
            EncoderProfile::VideoToolbox | EncoderProfile::Software => Vec::new(),
        }
    }

    fn video_args(&self) -> Vec<String> {
        let mut out = args(&["-c:v", self.encoder_name()]);
        match self {
            EncoderProfile::Nvenc => {
                out.extend(args(&["-vf", &format!("scale_cuda=-2:{}", OUTPUT_HEIGHT)]));
                out.extend(args(&[
                    "-preset", "p1", "-tune", "ll", "-rc", "constqp", "-qp", "23",
                ]));
            }
            EncoderProfile::Vaapi => {
                out.extend(args(&[
                    "-vf",
                    &format!("format=nv12|vaapi,hwupload,scale_vaapi=w=-2:h={}", OUTPUT_HEIGHT),
                ]));
                out.extend(args(&[
                    "-profile:v", "constrained_baseline", "-level", "31", "-bf", "0", "-qp", "24",
                ]));
            }
            EncoderProfile::VideoToolbox => {
                out.extend(args(&[
                    "-realtime", "1", "-pix_fmt", "yuv420p", "-b:v", "4M",
                ]));
            }
            EncoderProfile::Software => {
                out.extend(args(&[
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "zerolatency",
                    "-profile:v",
                    "baseline",
                    "-level",
                    "3.1",
                    "-pix_fmt",
                    "yuv420p",
                    "-crf",
                    "23",
                    "-x264-params",
                    "bframes=0:ref=1:me=dia:subme=0:rc-lookahead=0",
                ]));
            }
        }
        // Regular keyframes let playback start soon after joining.
        out.extend(args(&["-g", "50"]));
        out
    }

    /// Full transcoder command line for `input`, writing fMP4 to stdout.
    pub fn command_args(&self, input: &Url) -> Vec<String> {
        let mut out = args(&["-hide_banner", "-nostats", "-loglevel", "warning", "-nostdin"]);
        out.extend(self.hwaccel_args());
        out.extend(args(&[
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_on_network_error",
            "1",
            "-reconnect_delay_max",
            "5",
            "-analyzeduration",
            "1000000",
            "-probesize",
            "1000000",
            "-fflags",
            "+genpts+discardcorrupt",
            "-user_agent",
            PLAYER_USER_AGENT,
        ]));
        // Same origin-derived Referer the relay sends; many panels check it.
        if let Some(referer) = referer_for(input) {
            out.push("-headers".to_string());
            out.push(format!("Referer: {}\r\n", referer));
        }
        out.push("-i".to_string());
        out.push(input.to_string());
        out.extend(self.video_args());
        out.extend(args(&["-c:a", "aac", "-b:a", "128k", "-ac", "2"]));
        out.extend(args(&[
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof+faststart",
            "-frag_duration",
            "1000000",
            "pipe:1",
        ]));
        out
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
