//! Thin CLI shell: parses flags, loads config, calls [`twilight_stream::run_server`]
//! (spec §6.3).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use twilight_stream::capture::{FrameSource, Scaler};
use twilight_stream::codec::{AudioEncoder, HostCaps, VideoCodec, VideoCodecMask, VideoEncoder};
use twilight_stream::config::ServerConfig;
use twilight_stream::rational::Rational;
use twilight_stream::server::capture_pipeline::StreamConfig;
use twilight_stream::server::connection::StreamFactory;

#[derive(Parser)]
#[command(name = "twilight-server", about = "Low-latency remote desktop streamer, server side")]
struct Cli {
    /// Overrides `bind_addr` from the config file.
    #[arg(long)]
    bind_addr: Option<String>,
    /// Overrides `port` from the config file.
    #[arg(long)]
    port: Option<u16>,
    /// Directory for the persisted identity, known-clients store, and
    /// `twilight.toml` config (default: current directory).
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,
    /// Overrides `log_filter` from the config file.
    #[arg(long)]
    log_filter: Option<String>,
}

/// Capture/scale/encode back-ends are OS-specific external collaborators
/// (spec §1 "Deliberately out of scope"); this crate ships only the
/// protocol, pipeline orchestration, and trust establishment around them.
/// This stand-in answers `QueryHostCaps` with a plausible default but fails
/// `StartStream` until a real [`StreamFactory`] is wired in by an embedder.
struct UnimplementedStreamFactory;

impl StreamFactory for UnimplementedStreamFactory {
    fn host_caps(&self, _codec: VideoCodec) -> HostCaps {
        HostCaps {
            native_width: 1920,
            native_height: 1080,
            native_fps: Rational::new(60, 1),
            max_width: 1920,
            max_height: 1080,
            supported_video: VideoCodecMask::empty().with(VideoCodec::H264),
        }
    }

    fn build_source(&self) -> anyhow::Result<Box<dyn FrameSource>> {
        anyhow::bail!("no desktop capture back-end wired into this build (spec §1 external collaborator)")
    }

    fn build_scaler(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn Scaler>> {
        anyhow::bail!("no scaler back-end wired into this build (spec §1 external collaborator)")
    }

    fn build_video_encoder(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
        anyhow::bail!("no video encoder back-end wired into this build (spec §1 external collaborator)")
    }

    fn build_audio_encoder(&self) -> anyhow::Result<Box<dyn AudioEncoder>> {
        anyhow::bail!("no audio encoder back-end wired into this build (spec §1 external collaborator)")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(&cli.state_dir.join("twilight.toml"))?;
    config.state_dir = cli.state_dir;
    if let Some(addr) = cli.bind_addr {
        config.bind_addr = addr;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(filter) = cli.log_filter {
        config.log_filter = filter;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    twilight_stream::run_server(config, Arc::new(UnimplementedStreamFactory)).await
}
