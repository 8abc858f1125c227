use clap::Parser;
use std::time::Duration;

use crate::session_registry::{DEFAULT_REAP_INTERVAL, DEFAULT_SESSION_TIMEOUT};

/// Setting key for the global transcoding switch.
pub const TRANSCODING_ENABLED: &str = "transcoding_enabled";
/// Setting key for the placeholder length sent to strict clients.
pub const STRICT_CONTENT_LENGTH: &str = "strict_content_length";

/// Placeholder `Content-Length` for strict clients. Large enough that no
/// player reaches it before the live stream is closed.
pub const DEFAULT_STRICT_CONTENT_LENGTH: u64 = 9_999_999_999;

/// Read-only key/value settings consumed by the gateway.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "iptv-gateway")]
#[command(about = "Live stream gateway: HLS proxy, segment relay and on-demand transcoder", long_about = None)]
pub struct GatewayConfig {
    /// HTTP server port
    #[arg(short, long, env = "GATEWAY_PORT", default_value = "5000")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Transcoder binary, also used for hardware probing
    #[arg(long, env = "GATEWAY_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// Relay raw origins untouched instead of transcoding them
    #[arg(long, env = "GATEWAY_NO_TRANSCODE")]
    pub no_transcode: bool,

    /// Content-Length placeholder sent with the strict-client mp4 format
    #[arg(
        long,
        env = "GATEWAY_STRICT_CONTENT_LENGTH",
        default_value_t = DEFAULT_STRICT_CONTENT_LENGTH
    )]
    pub strict_content_length: u64,

    /// Seconds after which a preview session without a fresh start ping is dropped
    #[arg(long, env = "GATEWAY_SESSION_TIMEOUT_SECS", default_value = "600")]
    pub session_timeout_secs: u64,

    /// Seconds between session reaper runs
    #[arg(long, env = "GATEWAY_REAP_INTERVAL_SECS", default_value = "120")]
    pub reap_interval_secs: u64,

    /// Connect and header timeout for upstream requests
    #[arg(long, env = "GATEWAY_UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    pub upstream_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,
}

impl GatewayConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            host: "0.0.0.0".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            no_transcode: false,
            strict_content_length: DEFAULT_STRICT_CONTENT_LENGTH,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT.as_secs(),
            reap_interval_secs: DEFAULT_REAP_INTERVAL.as_secs(),
            upstream_timeout_secs: 30,
            log_level: tracing::Level::INFO,
        }
    }
}

impl Settings for GatewayConfig {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            TRANSCODING_ENABLED => Some((!self.no_transcode).to_string()),
            STRICT_CONTENT_LENGTH => Some(self.strict_content_length.to_string()),
            _ => None,
        }
    }
}
