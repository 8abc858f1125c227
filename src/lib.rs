//! Live stream gateway: proxies and rewrites HLS playlists, relays media
//! segments, and transcodes raw live feeds to fragmented MP4 on demand while
//! tracking which previews are currently being watched.

pub mod config;
pub mod encoder;
pub mod error;
pub mod hardware;
pub mod manifest;
pub mod segment_relay;
pub mod session_registry;
pub mod streaming_server;
pub mod transcoder;
pub mod upstream;

pub use config::{GatewayConfig, Settings};
pub use error::GatewayError;
pub use session_registry::{SessionEvent, SessionRegistry};
pub use streaming_server::{build_router, AppState, StreamingServer};
pub use transcoder::TranscodeSupervisor;
