use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use iptv_gateway::hardware::FfmpegProber;
use iptv_gateway::upstream::UpstreamClient;
use iptv_gateway::{AppState, GatewayConfig, SessionRegistry, StreamingServer, TranscodeSupervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    info!("Starting IPTV stream gateway");
    info!("Server will listen on {}", config.bind_addr());

    let settings = Arc::new(config.clone());
    let prober = Arc::new(FfmpegProber::new(config.ffmpeg_path.clone()));
    let state = AppState {
        sessions: SessionRegistry::new(config.session_timeout()).into_shared(),
        upstream: UpstreamClient::new(config.upstream_timeout())?,
        transcoder: Arc::new(TranscodeSupervisor::new(
            config.ffmpeg_path.clone(),
            prober,
            settings.clone(),
        )),
        settings,
    };

    let server = StreamingServer::new(config.bind_addr(), state, config.reap_interval());
    server.run().await?;

    Ok(())
}
