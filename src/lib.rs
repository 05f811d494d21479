//! Remote desktop streamer: server captures/encodes/transports, client
//! dials/decodes/presents (spec §1, §6.3).
//!
//! This crate is library-first: [`run_server`] and [`connect_to_host`] are
//! the two entry points the thin `twilight-server`/`twilight-client`
//! binaries call into after parsing their CLI flags. Concrete capture/codec
//! back-ends are external collaborators (spec §1 "Deliberately out of
//! scope") supplied by the caller through [`server::connection::StreamFactory`]
//! and [`client::decode_pipeline::DecodeFactory`] — this crate owns the
//! protocol, pipelines, and trust establishment around them, not the pixels.

pub mod arena;
pub mod capture;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod local_cert;
pub mod protocol;
pub mod rate_timer;
pub mod rational;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use client::host_list::{HostEntry, HostList};
use client::session::{ClientEvent, ClientSession, StdoutPinDisplay};
use codec::VideoCodec;
use config::{ClientConfig, ServerConfig};
use local_cert::LocalCert;
use server::connection::{PinPrompt, StdinPinPrompt, StreamFactory};
use server::known_clients::KnownClients;
use server::listener::Listener;

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Binds and runs the server until `Ctrl-C` triggers graceful shutdown
/// (spec §6.3; SPEC_FULL.md §D.4 "graceful listener shutdown"). Blocks a
/// single client at a time (spec §1 Non-goal "multi-client fan-out").
pub async fn run_server(config: ServerConfig, stream_factory: Arc<dyn StreamFactory>) -> anyhow::Result<()> {
    run_server_with_pin_prompt(config, stream_factory, Arc::new(StdinPinPrompt)).await
}

/// Same as [`run_server`], with the PIN prompt swappable — the real binary
/// uses [`StdinPinPrompt`], embedders with their own UI supply their own.
pub async fn run_server_with_pin_prompt(
    config: ServerConfig,
    stream_factory: Arc<dyn StreamFactory>,
    pin_prompt: Arc<dyn PinPrompt>,
) -> anyhow::Result<()> {
    let identity = Arc::new(LocalCert::load_or_generate(
        &config.privkey_path(),
        &config.cert_path(),
        &config.brand,
        &local_hostname(),
    )?);
    let known_clients = Arc::new(KnownClients::load(&config.known_clients_path())?);
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port).parse()?;

    let listener = Listener::bind(addr, identity, known_clients, pin_prompt, stream_factory).await?;
    let shutdown = listener.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down listener");
            shutdown.trigger();
        }
    });

    listener.run().await
}

/// Dials `target` — an existing host-list nickname, or a bare `host[:port]`
/// address for a first-time pairing — and keeps the session alive until the
/// connection drops or `Ctrl-C` is pressed (spec §6.3). Newly-learned
/// certificates from a fresh pairing are persisted back to the host list
/// (spec §4.9).
///
/// Presentation (decoding frames to a screen, playing audio) is an external
/// collaborator's job (spec §1 Non-goal "on-screen rendering surfaces"):
/// this entry point exercises the full dial/pair/command/media-receive path
/// and logs what it sees, matching a headless connectivity check. An
/// embedder that wants to actually show the stream drives
/// [`ClientSession::dial`] and a [`client::decode_pipeline::DecodePipeline`]
/// directly instead of calling this function.
pub async fn connect_to_host(config: ClientConfig, target: &str) -> anyhow::Result<()> {
    let identity = Arc::new(LocalCert::load_or_generate(
        &config.state_dir.join("client-privkey.der"),
        &config.state_dir.join("client-cert.der"),
        "twilight-client",
        &local_hostname(),
    )?);
    let hosts = HostList::load(&config.hosts_path())?;

    let entry = hosts.find(target).unwrap_or_else(|| {
        let addr = if target.contains(':') { target.to_string() } else { format!("{target}:{}", protocol::DEFAULT_PORT) };
        HostEntry { nickname: target.to_string(), addresses: vec![addr], last_connected: None, server_cert_der: Vec::new(), client_cert_der: Vec::new() }
    });

    let (session, entry, mut events) =
        ClientSession::dial(identity, entry, target.to_string(), Arc::new(StdoutPinDisplay)).await?;
    hosts.upsert_and_save(entry)?;

    match session.query_host_caps(VideoCodec::H264).await {
        Ok(caps) => info!(
            native_width = caps.native_width,
            native_height = caps.native_height,
            native_fps = caps.native_fps.as_f64(),
            "host capabilities"
        ),
        Err(e) => warn!(error = %e, "host caps query failed"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received; disconnecting");
                session.disconnect();
                break;
            }
            event = events.recv() => {
                match event {
                    Some(ClientEvent::Video { frame, .. }) => info!(key_frame = frame.is_key_frame, "video frame"),
                    Some(ClientEvent::CursorShape(shape)) => info!(w = shape.w, h = shape.h, "cursor shape changed"),
                    Some(ClientEvent::Audio(_)) => {}
                    Some(ClientEvent::PerfReport(sample)) => {
                        info!(capture_avg = sample.capture_avg, encoder_avg = sample.encoder_avg, "server perf report")
                    }
                    None => {
                        info!("session closed by peer");
                        break;
                    }
                }
            }
        }
    }

    if !session.is_closed() {
        error!("connect_to_host exiting with session still marked open");
    }
    Ok(())
}
