//! Per-client protocol state machine (spec §4.4, §5 server threads 2-6).
//!
//! `Connection::run` owns one client's entire lifetime: version check,
//! pairing handshake (if the peer certificate isn't yet known), and then the
//! post-authorization command surface (`QueryHostCaps`/`ConfigureStream`/
//! `StartStream`/`StopStream`/`Ping`) that drives a [`CapturePipeline`]
//! (SPEC_FULL.md §D.2). A single write-side mutex around the packet writer
//! is the one shared resource every outbound packet funnels through — the
//! control-plane responses from this task and the media frames from the
//! capture pipeline's output channel both take the same lock, giving total
//! order on the wire (spec §5 "Writer... the wire is a shared resource").

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, instrument, warn};

use crate::arena::FrameArena;
use crate::capture::{FrameSource, Scaler};
use crate::clock::LocalClock;
use crate::codec::{AudioEncoder, HostCaps, VideoCodec, VideoEncoder};
use crate::error::{AuthError, ProtocolError, SessionError};
use crate::frame::{CursorPos, PixelFormat};
use crate::local_cert::{fingerprint_of, LocalCert};
use crate::protocol::message::{
    AuthResponseStatus, CapsStatus, ConfigureStatus, ServerIntroStatus, StartStatus, StopStatus,
};
use crate::protocol::pin::{derive_pin, format_pin, partial_hash};
use crate::protocol::{Packet, PacketReader, PacketWriter, PROTOCOL_VERSION};
use crate::rational::Rational;

use super::capture_pipeline::{CapturePipeline, EncodedOutput, StreamConfig};
use super::known_clients::KnownClients;

/// Minimum client nonce length the protocol accepts (spec §4.4 step 3).
const MIN_NONCE_LEN: u32 = 16;
/// Server's own nonce length; the protocol leaves this to the sender (spec
/// §9 open question c), recommended >= 16.
const SERVER_NONCE_LEN: usize = 32;
/// Fixed audio channel count. The protocol negotiates no audio format beyond
/// this wire field; stereo matches `AudioFrame.channels` and the client's
/// ring buffer sizing (spec §4.3 "~4x 960-sample stereo frames").
const AUDIO_CHANNELS: u32 = 2;

/// Asks the human at the keyboard to confirm the PIN shown on the client's
/// screen (spec §4.4 step 9). Swappable so tests can script a response
/// without blocking on real stdin.
pub trait PinPrompt: Send + Sync {
    fn prompt(&self, pin_display: &str) -> Option<u32>;
}

/// Reads one line from stdin and parses it as an 8-digit PIN (spaces
/// allowed), for the real server binary.
pub struct StdinPinPrompt;

impl PinPrompt for StdinPinPrompt {
    fn prompt(&self, pin_display: &str) -> Option<u32> {
        println!("Enter the PIN shown on the client ({pin_display} expected format): ");
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return None;
        }
        line.retain(|c| c.is_ascii_digit());
        line.parse::<u32>().ok()
    }
}

/// Builds the external collaborators a stream needs, once a client requests
/// capture (spec §9 "codec back-ends as capabilities"; SPEC_FULL.md §D.2
/// wires `ConfigureStreamRequest`/`StartStreamRequest` to this).
pub trait StreamFactory: Send + Sync {
    fn host_caps(&self, codec: VideoCodec) -> HostCaps;
    fn build_source(&self) -> anyhow::Result<Box<dyn FrameSource>>;
    fn build_scaler(&self, cfg: StreamConfig) -> anyhow::Result<Box<dyn Scaler>>;
    fn build_video_encoder(&self, cfg: StreamConfig) -> anyhow::Result<Box<dyn VideoEncoder>>;
    fn build_audio_encoder(&self) -> anyhow::Result<Box<dyn AudioEncoder>>;
}

pub struct Connection {
    identity: Arc<LocalCert>,
    known_clients: Arc<KnownClients>,
    pin_prompt: Arc<dyn PinPrompt>,
    stream_factory: Arc<dyn StreamFactory>,
    clock: Arc<LocalClock>,
    arena: StdMutex<Option<FrameArena>>,
    pipeline: CapturePipeline,
}

impl Connection {
    pub fn new(
        identity: Arc<LocalCert>,
        known_clients: Arc<KnownClients>,
        pin_prompt: Arc<dyn PinPrompt>,
        stream_factory: Arc<dyn StreamFactory>,
        clock: Arc<LocalClock>,
    ) -> Self {
        let pipeline = CapturePipeline::new(clock.clone());
        Connection { identity, known_clients, pin_prompt, stream_factory, clock, arena: StdMutex::new(None), pipeline }
    }

    /// Drives one client's session end to end. Any error tears this
    /// connection down without affecting the listener (spec §7
    /// "the connection owns its own error and tears itself down").
    #[instrument(skip_all)]
    pub async fn run<S>(&self, stream: S, peer_cert_der: Vec<u8>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let writer = Arc::new(AsyncMutex::new(PacketWriter::new(write_half)));

        let (packet, _extra) = reader.read_packet().await?;
        let client_protocol_version = match packet {
            Packet::ClientIntro { protocol_version } => protocol_version,
            other => {
                return Err(ProtocolError::UnexpectedMessage { state: "Greeted", got: other.kind_name() }.into())
            }
        };

        if client_protocol_version != PROTOCOL_VERSION {
            self.send(&writer, Packet::ServerIntro {
                protocol_version: PROTOCOL_VERSION,
                commit_name: env!("CARGO_PKG_VERSION").to_string(),
                status: ServerIntroStatus::VersionMismatch,
            }, &[]).await?;
            return Err(ProtocolError::VersionMismatch { server: PROTOCOL_VERSION, client: client_protocol_version }.into());
        }

        let fingerprint = fingerprint_of(&peer_cert_der);
        if self.known_clients.contains(&fingerprint) {
            self.send(&writer, Packet::ServerIntro {
                protocol_version: PROTOCOL_VERSION,
                commit_name: env!("CARGO_PKG_VERSION").to_string(),
                status: ServerIntroStatus::Ok,
            }, &[]).await?;
        } else {
            self.send(&writer, Packet::ServerIntro {
                protocol_version: PROTOCOL_VERSION,
                commit_name: env!("CARGO_PKG_VERSION").to_string(),
                status: ServerIntroStatus::AuthRequired,
            }, &[]).await?;
            self.run_pairing(&mut reader, &writer, &peer_cert_der).await?;
        }

        info!("client authorized; entering command loop");
        let result = self.command_loop(&mut reader, &writer).await;
        if self.pipeline.is_streaming() {
            self.pipeline.stop().await;
        }
        result
    }

    async fn send<W>(&self, writer: &AsyncMutex<PacketWriter<W>>, packet: Packet, extra: &[u8]) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.lock().await.write_packet(&packet, extra).await
    }

    /// Spec §4.4 steps 3-9: nonce exchange, partial-hash commitments, PIN
    /// derivation and operator confirmation. Any message arriving out of the
    /// expected order or with a length mismatch aborts the handshake (spec
    /// §4.4 "Concurrency": "any packet arriving out of the expected order
    /// aborts the in-progress handshake").
    async fn run_pairing<R, W>(
        &self,
        reader: &mut PacketReader<R>,
        writer: &AsyncMutex<PacketWriter<W>>,
        client_cert: &[u8],
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (packet, extra) = reader.read_packet().await?;
        let (hostname, client_nonce_len) = match packet {
            Packet::AuthRequest { hostname, client_nonce_len } => (hostname, client_nonce_len),
            other => return Err(ProtocolError::UnexpectedMessage { state: "Unauthorized", got: other.kind_name() }.into()),
        };

        if client_nonce_len < MIN_NONCE_LEN {
            self.send(writer, Packet::AuthResponse { status: AuthResponseStatus::NonceTooShort }, &[]).await?;
            return Err(SessionError::Auth(AuthError::NonceTooShort));
        }
        if extra.len() != 48 {
            return Err(ProtocolError::ExtraDataLengthMismatch { declared: 48, got: extra.len() as u32 }.into());
        }
        let client_partial_claim = extra;

        let server_cert = self.identity.cert_der.clone();
        let server_nonce = random_bytes(SERVER_NONCE_LEN);
        let server_partial = partial_hash(&server_cert, client_cert, &server_nonce);
        self.send(writer, Packet::ServerPartialHashNotify { server_nonce_len: server_nonce.len() as u32 }, &server_partial).await?;

        let (packet, client_nonce) = reader.read_packet().await?;
        match packet {
            Packet::ClientNonceNotify {} => {}
            other => return Err(ProtocolError::UnexpectedMessage { state: "Unauthorized", got: other.kind_name() }.into()),
        }
        if client_nonce.len() as u32 != client_nonce_len {
            return Err(ProtocolError::ExtraDataLengthMismatch { declared: client_nonce_len, got: client_nonce.len() as u32 }.into());
        }

        let recomputed_client_partial = partial_hash(&server_cert, client_cert, &client_nonce);
        if recomputed_client_partial.as_slice() != client_partial_claim.as_slice() {
            self.send(writer, Packet::AuthResponse { status: AuthResponseStatus::UnknownError }, &[]).await?;
            return Err(SessionError::Auth(AuthError::HashMismatch));
        }

        self.send(writer, Packet::ServerNonceNotify {}, &server_nonce).await?;

        let pin = derive_pin(&server_cert, client_cert, &server_nonce, &client_nonce);
        let display = format_pin(pin);
        info!(%hostname, pin = %display, "pairing PIN ready; waiting for operator confirmation");

        let prompt = self.pin_prompt.clone();
        let display_for_prompt = display.clone();
        let typed = tokio::task::spawn_blocking(move || prompt.prompt(&display_for_prompt)).await.unwrap_or(None);

        if typed == Some(pin) {
            let fingerprint = fingerprint_of(client_cert);
            self.known_clients
                .insert_and_save(fingerprint)
                .map_err(|e| SessionError::Closed(std::io::Error::other(e)))?;
            self.send(writer, Packet::AuthResponse { status: AuthResponseStatus::Ok }, &[]).await?;
            Ok(())
        } else {
            self.send(writer, Packet::AuthResponse { status: AuthResponseStatus::IncorrectPin }, &[]).await?;
            Err(SessionError::Auth(AuthError::IncorrectPin))
        }
    }

    /// Post-authorization command surface (SPEC_FULL.md §D.2): caps query,
    /// stream configure/start/stop, and the ping responder.
    async fn command_loop<R, W>(&self, reader: &mut PacketReader<R>, writer: &Arc<AsyncMutex<PacketWriter<W>>>) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let (packet, _extra) = match reader.read_packet().await {
                Ok(v) => v,
                Err(e) => {
                    info!(error = %e, "client read loop ending");
                    return Ok(());
                }
            };

            match packet {
                Packet::PingRequest { id, .. } => {
                    self.send(writer, Packet::PingResponse { id, time: self.clock.time() as u64 }, &[]).await?;
                }
                Packet::QueryHostCapsRequest { codec } => {
                    let caps = self.stream_factory.host_caps(codec);
                    self.send(writer, Packet::QueryHostCapsResponse {
                        native_w: caps.native_width,
                        native_h: caps.native_height,
                        native_fps_num: caps.native_fps.num() as u32,
                        native_fps_den: caps.native_fps.den() as u32,
                        max_w: caps.max_width,
                        max_h: caps.max_height,
                        status: CapsStatus::Ok,
                    }, &[]).await?;
                }
                Packet::ConfigureStreamRequest { width, height, fps_num, fps_den, codec } => {
                    let status = self.handle_configure(width, height, fps_num, fps_den, codec);
                    self.send(writer, Packet::ConfigureStreamResponse { status }, &[]).await?;
                }
                Packet::StartStreamRequest {} => {
                    let status = self.handle_start(writer.clone()).await;
                    self.send(writer, Packet::StartStreamResponse { status }, &[]).await?;
                }
                Packet::StopStreamRequest {} => {
                    let status = if self.pipeline.is_streaming() { StopStatus::Ok } else { StopStatus::NotStreaming };
                    self.pipeline.stop().await;
                    self.send(writer, Packet::StopStreamResponse { status }, &[]).await?;
                }
                other => {
                    warn!(kind = other.kind_name(), "unexpected packet after authorization; ignoring");
                }
            }
        }
    }

    fn handle_configure(&self, width: u32, height: u32, fps_num: u32, fps_den: u32, codec: VideoCodec) -> ConfigureStatus {
        if fps_num == 0 || fps_den == 0 {
            return ConfigureStatus::InvalidDimensions;
        }
        let framerate = Rational::new(fps_num as i64, fps_den as i64);
        match self.pipeline.configure(width, height, framerate, codec) {
            Ok(()) => {
                let mut arena_guard = self.arena.lock().unwrap();
                let new_arena = match arena_guard.take() {
                    Some(old) => old.reconfigure(width, height, PixelFormat::Bgra8),
                    None => FrameArena::open(width, height, PixelFormat::Bgra8),
                };
                *arena_guard = Some(new_arena);
                ConfigureStatus::Ok
            }
            Err(crate::error::ConfigError::AlreadyStreaming) => ConfigureStatus::AlreadyStreaming,
            Err(crate::error::ConfigError::InvalidDimensions { .. }) => ConfigureStatus::InvalidDimensions,
            Err(crate::error::ConfigError::UnsupportedCodec(_)) => ConfigureStatus::UnsupportedCodec,
            Err(crate::error::ConfigError::InvalidFramerate(_)) => ConfigureStatus::InvalidDimensions,
        }
    }

    async fn handle_start<W>(&self, writer: Arc<AsyncMutex<PacketWriter<W>>>) -> StartStatus
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(cfg) = self.pipeline.current_config() else { return StartStatus::NotConfigured };
        if self.pipeline.is_streaming() {
            return StartStatus::AlreadyStreaming;
        }
        let Some(arena) = self.arena.lock().unwrap().clone() else { return StartStatus::NotConfigured };

        let source = match self.stream_factory.build_source() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to build frame source");
                return StartStatus::NotConfigured;
            }
        };
        let scaler = match self.stream_factory.build_scaler(cfg) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to build scaler");
                return StartStatus::NotConfigured;
            }
        };
        let video_encoder = match self.stream_factory.build_video_encoder(cfg) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to build video encoder");
                return StartStatus::NotConfigured;
            }
        };
        let audio_encoder = match self.stream_factory.build_audio_encoder() {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "failed to build audio encoder");
                return StartStatus::NotConfigured;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<EncodedOutput>();
        tokio::spawn(forward_outputs(rx, writer));

        let on_output: Arc<dyn Fn(EncodedOutput) + Send + Sync> = Arc::new(move |output| {
            let _ = tx.send(output);
        });

        match self.pipeline.start(arena, source, scaler, video_encoder, audio_encoder, on_output) {
            Ok(()) => StartStatus::Ok,
            Err(crate::error::ConfigError::AlreadyStreaming) => StartStatus::AlreadyStreaming,
            Err(_) => StartStatus::NotConfigured,
        }
    }
}

/// The server's writer task (spec §5 server thread 6): drains encoded media
/// from the capture pipeline and serializes it onto the shared connection
/// writer, tracking the last cursor position/shape so `DesktopFrame` always
/// carries the latest known values even on frames with no fresh update
/// (spec §5 "Cursor shape updates are sticky").
async fn forward_outputs<W>(mut rx: mpsc::UnboundedReceiver<EncodedOutput>, writer: Arc<AsyncMutex<PacketWriter<W>>>)
where
    W: AsyncWrite + Unpin,
{
    let mut last_pos = CursorPos { visible: false, x: 0, y: 0, x_scale: Rational::new(1, 1), y_scale: Rational::new(1, 1) };
    let mut last_shape_sent: Option<*const crate::frame::CursorShape> = None;

    while let Some(output) = rx.recv().await {
        match output {
            EncodedOutput::Video(frame) => {
                if let Some(pos) = &frame.cursor_pos {
                    last_pos = (**pos).clone();
                }
                if let Some(shape) = &frame.cursor_shape {
                    let ptr = Arc::as_ptr(shape);
                    if last_shape_sent != Some(ptr) {
                        last_shape_sent = Some(ptr);
                        let packet = Packet::CursorShape {
                            width: shape.w,
                            height: shape.h,
                            hotspot_x: shape.hotspot_x,
                            hotspot_y: shape.hotspot_y,
                            format: shape.format.into(),
                        };
                        if writer.lock().await.write_packet(&packet, &shape.image).await.is_err() {
                            return;
                        }
                    }
                }

                let packet = Packet::DesktopFrame {
                    time_captured: frame.time_captured,
                    time_encoded: frame.time_encoded,
                    cursor_visible: last_pos.visible,
                    cursor_x: last_pos.x,
                    cursor_y: last_pos.y,
                    is_key_frame: frame.is_key_frame,
                };
                if writer.lock().await.write_packet(&packet, &frame.payload).await.is_err() {
                    return;
                }
            }
            EncodedOutput::Audio(frame) => {
                let packet = Packet::AudioFrame { channels: AUDIO_CHANNELS };
                if writer.lock().await.write_packet(&packet, &frame.payload).await.is_err() {
                    return;
                }
            }
            EncodedOutput::PerfReport(sample) => {
                let packet = Packet::ServerPerfReport {
                    capture_min: sample.capture_min,
                    capture_avg: sample.capture_avg,
                    capture_max: sample.capture_max,
                    encoder_min: sample.encoder_min,
                    encoder_avg: sample.encoder_avg,
                    encoder_max: sample.encoder_max,
                };
                if writer.lock().await.write_packet(&packet, &[]).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VideoCodecMask;

    /// Reads the PIN back out of the display string handed to the operator,
    /// the way a human copying the digits on screen would.
    struct EchoPin;
    impl PinPrompt for EchoPin {
        fn prompt(&self, pin_display: &str) -> Option<u32> {
            pin_display.replace(' ', "").parse().ok()
        }
    }

    struct WrongPin;
    impl PinPrompt for WrongPin {
        fn prompt(&self, _pin_display: &str) -> Option<u32> {
            Some(99_999_999)
        }
    }

    struct NoopStreamFactory;
    impl StreamFactory for NoopStreamFactory {
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
            anyhow::bail!("not implemented in test double")
        }
        fn build_scaler(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn Scaler>> {
            anyhow::bail!("not implemented in test double")
        }
        fn build_video_encoder(&self, _cfg: StreamConfig) -> anyhow::Result<Box<dyn VideoEncoder>> {
            anyhow::bail!("not implemented in test double")
        }
        fn build_audio_encoder(&self) -> anyhow::Result<Box<dyn AudioEncoder>> {
            anyhow::bail!("not implemented in test double")
        }
    }

    fn test_tempdir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("twilight-connection-test-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_identity(tag: &str) -> Arc<LocalCert> {
        let dir = test_tempdir(tag);
        Arc::new(LocalCert::load_or_generate(&dir.join("key.der"), &dir.join("cert.der"), "twilight-test", "localhost").unwrap())
    }

    fn test_connection(tag: &str, pin_prompt: Arc<dyn PinPrompt>) -> (Connection, Arc<LocalCert>) {
        let identity = test_identity(tag);
        let dir = test_tempdir(tag);
        let known_clients = Arc::new(KnownClients::load(&dir.join("clients.toml")).unwrap());
        let conn = Connection::new(
            identity.clone(),
            known_clients,
            pin_prompt,
            Arc::new(NoopStreamFactory),
            Arc::new(LocalClock::new()),
        );
        (conn, identity)
    }

    /// Drives the client side of `Connection::run_pairing` by hand: send
    /// `AuthRequest`, read the server's partial hash, send the client nonce,
    /// read the server's nonce. Returns the reader/writer so callers can
    /// keep driving (reading `AuthResponse`) after the handshake concludes.
    async fn drive_client_handshake<R, W>(
        reader: &mut PacketReader<R>,
        writer: &mut PacketWriter<W>,
        server_cert: &[u8],
        client_cert: &[u8],
        client_nonce: &[u8],
    ) -> Vec<u8>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let client_partial = partial_hash(server_cert, client_cert, client_nonce);
        writer
            .write_packet(
                &Packet::AuthRequest { hostname: "test-client".to_string(), client_nonce_len: client_nonce.len() as u32 },
                &client_partial,
            )
            .await
            .unwrap();

        let (packet, server_partial) = reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::ServerPartialHashNotify { .. }));
        assert_eq!(server_partial.len(), 48);

        writer.write_packet(&Packet::ClientNonceNotify {}, client_nonce).await.unwrap();

        let (packet, server_nonce) = reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::ServerNonceNotify {}));
        server_nonce
    }

    #[tokio::test]
    async fn pairing_succeeds_with_correct_pin_and_persists_fingerprint() {
        let (conn, server_identity) = test_connection("ok", Arc::new(EchoPin));
        let client_identity = test_identity("ok-client");
        let client_cert = client_identity.cert_der.clone();
        let client_fingerprint = client_identity.fingerprint();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut client_reader = PacketReader::new(client_read);
        let mut client_writer = PacketWriter::new(client_write);

        let client_cert_for_server = client_cert.clone();
        let server_task = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(server_io);
            let mut reader = PacketReader::new(read_half);
            let writer = AsyncMutex::new(PacketWriter::new(write_half));
            conn.run_pairing(&mut reader, &writer, &client_cert_for_server).await
        });

        let client_nonce = vec![7u8; 32];
        drive_client_handshake(&mut client_reader, &mut client_writer, &server_identity.cert_der, &client_cert, &client_nonce).await;

        let (packet, _) = client_reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::AuthResponse { status: AuthResponseStatus::Ok }));

        let result = server_task.await.unwrap();
        assert!(result.is_ok());

        let dir = test_tempdir("ok");
        let reloaded = KnownClients::load(&dir.join("clients.toml")).unwrap();
        assert!(reloaded.contains(&client_fingerprint));
    }

    #[tokio::test]
    async fn pairing_rejects_incorrect_pin_without_persisting() {
        let (conn, server_identity) = test_connection("badpin", Arc::new(WrongPin));
        let client_identity = test_identity("badpin-client");
        let client_cert = client_identity.cert_der.clone();
        let client_fingerprint = client_identity.fingerprint();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut client_reader = PacketReader::new(client_read);
        let mut client_writer = PacketWriter::new(client_write);

        let client_cert_for_server = client_cert.clone();
        let server_task = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(server_io);
            let mut reader = PacketReader::new(read_half);
            let writer = AsyncMutex::new(PacketWriter::new(write_half));
            conn.run_pairing(&mut reader, &writer, &client_cert_for_server).await
        });

        let client_nonce = vec![9u8; 32];
        drive_client_handshake(&mut client_reader, &mut client_writer, &server_identity.cert_der, &client_cert, &client_nonce).await;

        let (packet, _) = client_reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::AuthResponse { status: AuthResponseStatus::IncorrectPin }));

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Auth(AuthError::IncorrectPin))));

        let dir = test_tempdir("badpin");
        let reloaded = KnownClients::load(&dir.join("clients.toml")).unwrap();
        assert!(!reloaded.contains(&client_fingerprint));
    }

    #[tokio::test]
    async fn pairing_rejects_nonce_shorter_than_minimum() {
        let (conn, _server_identity) = test_connection("shortnonce", Arc::new(EchoPin));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut client_reader = PacketReader::new(client_read);
        let mut client_writer = PacketWriter::new(client_write);

        let server_task = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(server_io);
            let mut reader = PacketReader::new(read_half);
            let writer = AsyncMutex::new(PacketWriter::new(write_half));
            conn.run_pairing(&mut reader, &writer, b"irrelevant-client-cert").await
        });

        client_writer
            .write_packet(&Packet::AuthRequest { hostname: "short".to_string(), client_nonce_len: 4 }, &[0u8; 48])
            .await
            .unwrap();

        let (packet, _) = client_reader.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::AuthResponse { status: AuthResponseStatus::NonceTooShort }));

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Auth(AuthError::NonceTooShort))));
    }

    #[test]
    fn handle_configure_rejects_zero_framerate() {
        let (conn, _identity) = test_connection("cfg-fps", Arc::new(EchoPin));
        let status = conn.handle_configure(1920, 1080, 0, 1, VideoCodec::H264);
        assert!(matches!(status, ConfigureStatus::InvalidDimensions));
    }

    #[test]
    fn handle_configure_accepts_valid_parameters() {
        let (conn, _identity) = test_connection("cfg-ok", Arc::new(EchoPin));
        let status = conn.handle_configure(1920, 1080, 60, 1, VideoCodec::H264);
        assert!(matches!(status, ConfigureStatus::Ok));
        assert!(conn.pipeline.current_config().is_some());
    }
}
