//! Dial, TLS, pairing handshake, and the full-duplex ping/receive loops
//! (spec §4.5).
//!
//! `ClientSession::dial` iterates a host's address list in order (first
//! successful TCP+TLS connect wins), performs the client side of the spec
//! §4.4 handshake when the server reports `AUTH_REQUIRED`, then hands back a
//! running session plus a channel of decoded-from-the-wire events for a
//! [`super::decode_pipeline::DecodePipeline`] to consume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::clock::NetworkClock;
use crate::codec::{Bitstream, VideoCodec};
use crate::error::{AuthError, ConfigError, ProtocolError, SessionError};
use crate::frame::{CursorShape, Frame, Micros};
use crate::local_cert::LocalCert;
use crate::protocol::message::{
    AuthResponseStatus, CapsStatus, ConfigureStatus, ServerIntroStatus, StartStatus, StopStatus,
};
use crate::protocol::pin::{derive_pin, format_pin, partial_hash};
use crate::protocol::{Packet, PacketReader, PacketWriter, PROTOCOL_VERSION};
use crate::rational::Rational;

use super::host_list::HostEntry;
use super::tls::{build_connector, server_name_for};

/// Client nonce length this build sends (spec §4.4 step 3 requires only
/// `>= 16`; 32 matches the server's own recommended nonce width).
const CLIENT_NONCE_LEN: usize = 32;

/// Shows the PIN on the client's own screen for the operator to read off and
/// type into the server (spec §4.4 step 9: "The human on the server side
/// enters the PIN displayed on the client").
pub trait PinDisplay: Send + Sync {
    fn show(&self, pin_display: &str);
}

/// Prints the PIN to stdout, for the real client binary.
pub struct StdoutPinDisplay;

impl PinDisplay for StdoutPinDisplay {
    fn show(&self, pin_display: &str) {
        println!("Pairing PIN: {pin_display}");
    }
}

/// One decoded-from-the-wire event dispatched to a [`super::decode_pipeline::DecodePipeline`]
/// (spec §4.5 "Receive loop: demuxes Packet records; dispatches
/// DesktopFrame/CursorShape/AudioFrame/ServerPerfReport/PingResponse").
pub enum ClientEvent {
    Video { frame: Frame<Bitstream>, cursor_visible: bool, cursor_x: i32, cursor_y: i32 },
    CursorShape(Arc<CursorShape>),
    Audio(Frame<Bitstream>),
    PerfReport(ServerPerfSample),
}

/// Informational latency figures from `ServerPerfReport` (spec §4.5: "is
/// informational (observed encode/capture latencies)").
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerPerfSample {
    pub capture_min: Micros,
    pub capture_avg: Micros,
    pub capture_max: Micros,
    pub encoder_min: Micros,
    pub encoder_avg: Micros,
    pub encoder_max: Micros,
}

/// The host's capabilities as reported by `QueryHostCapsResponse` (spec
/// §6.1). Distinct from [`crate::codec::HostCaps`]: the wire reply doesn't
/// carry a codec support mask, only the dimensions/framerate for the codec
/// that was queried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteHostCaps {
    pub native_width: u32,
    pub native_height: u32,
    pub native_fps: Rational,
    pub max_width: u32,
    pub max_height: u32,
}

/// A correlated reply to the post-authorization command surface (spec §6.1
/// `QueryHostCaps`/`ConfigureStream`/`StartStream`/`StopStream`). Kept
/// separate from [`ClientEvent`], which carries unsolicited media/sideband
/// traffic, since these answer exactly one outstanding request.
enum CommandResponse {
    HostCaps(RemoteHostCaps),
    Configure(ConfigureStatus),
    Start(StartStatus),
    Stop(StopStatus),
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A running client session: owns the network clock and the cancellation
/// flag shared by the ping loop and receive loop (spec §4.5 "Cancellation"),
/// plus the single writer mutex and command-response channel the post-auth
/// request methods below use.
pub struct ClientSession {
    network_clock: Arc<NetworkClock>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    writer: Arc<tokio::sync::Mutex<PacketWriter<BoxedWriter>>>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandResponse>>,
}

impl ClientSession {
    /// Dials every address in `entry.addresses` in order; the first
    /// successful TCP+TLS connect is used. Returns the running session, the
    /// (possibly newly-pinned) host entry, and the inbound event stream.
    pub async fn dial(
        identity: Arc<LocalCert>,
        entry: HostEntry,
        hostname: String,
        pin_display: Arc<dyn PinDisplay>,
    ) -> Result<(ClientSession, HostEntry, mpsc::UnboundedReceiver<ClientEvent>), SessionError> {
        let mut last_err = None;
        for addr in entry.addresses.clone() {
            match dial_one(&addr, &identity, &entry).await {
                Ok(tls) => {
                    return handshake_and_spawn(tls, identity, entry, hostname, pin_display).await;
                }
                Err(e) => {
                    warn!(address = %addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SessionError::Closed(std::io::Error::new(std::io::ErrorKind::NotFound, "host has no addresses"))
        }))
    }

    pub fn network_clock(&self) -> &Arc<NetworkClock> {
        &self.network_clock
    }

    /// Closes the session. Both the ping loop and receive loop observe this
    /// and exit. Idempotent (spec §4.5 "Double-disconnect is idempotent").
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends `QueryHostCapsRequest` and awaits its reply (spec §6.1). Only
    /// one command should be outstanding at a time; a second call while one
    /// is already in flight would race on `commands`.
    pub async fn query_host_caps(&self, codec: VideoCodec) -> Result<RemoteHostCaps, SessionError> {
        self.writer.lock().await.write_packet(&Packet::QueryHostCapsRequest { codec }, &[]).await?;
        match self.recv_command().await? {
            CommandResponse::HostCaps(caps) => Ok(caps),
            _ => Err(ProtocolError::UnexpectedMessage { state: "Streaming", got: "wrong command reply" }.into()),
        }
    }

    /// Sends `ConfigureStreamRequest` and awaits its reply (spec §6.1).
    pub async fn configure_stream(&self, width: u32, height: u32, fps: Rational, codec: VideoCodec) -> Result<(), SessionError> {
        self.writer
            .lock()
            .await
            .write_packet(
                &Packet::ConfigureStreamRequest { width, height, fps_num: fps.num() as u32, fps_den: fps.den() as u32, codec },
                &[],
            )
            .await?;
        match self.recv_command().await? {
            CommandResponse::Configure(ConfigureStatus::Ok) => Ok(()),
            CommandResponse::Configure(ConfigureStatus::UnsupportedCodec) => {
                Err(ConfigError::UnsupportedCodec(format!("{codec:?}")).into())
            }
            CommandResponse::Configure(ConfigureStatus::InvalidDimensions) => Err(ConfigError::InvalidDimensions { width, height }.into()),
            CommandResponse::Configure(ConfigureStatus::AlreadyStreaming) => Err(ConfigError::AlreadyStreaming.into()),
            _ => Err(ProtocolError::UnexpectedMessage { state: "Streaming", got: "wrong command reply" }.into()),
        }
    }

    /// Sends `StartStreamRequest` and awaits its reply (spec §6.1).
    pub async fn start_stream(&self) -> Result<(), SessionError> {
        self.writer.lock().await.write_packet(&Packet::StartStreamRequest {}, &[]).await?;
        match self.recv_command().await? {
            CommandResponse::Start(StartStatus::Ok) => Ok(()),
            CommandResponse::Start(StartStatus::NotConfigured) => Err(ConfigError::NotConfigured.into()),
            CommandResponse::Start(StartStatus::AlreadyStreaming) => Err(ConfigError::AlreadyStreaming.into()),
            _ => Err(ProtocolError::UnexpectedMessage { state: "Streaming", got: "wrong command reply" }.into()),
        }
    }

    /// Sends `StopStreamRequest` and awaits its reply (spec §6.1).
    pub async fn stop_stream(&self) -> Result<(), SessionError> {
        self.writer.lock().await.write_packet(&Packet::StopStreamRequest {}, &[]).await?;
        match self.recv_command().await? {
            CommandResponse::Stop(StopStatus::Ok) => Ok(()),
            CommandResponse::Stop(StopStatus::NotStreaming) => Err(ConfigError::NotStreaming.into()),
            _ => Err(ProtocolError::UnexpectedMessage { state: "Streaming", got: "wrong command reply" }.into()),
        }
    }

    async fn recv_command(&self) -> Result<CommandResponse, SessionError> {
        self.commands
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SessionError::Closed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed while awaiting command response")))
    }
}

async fn dial_one(addr: &str, identity: &LocalCert, entry: &HostEntry) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SessionError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(SessionError::Closed)?;
    let pinned = if entry.server_cert_der.is_empty() { None } else { Some(entry.server_cert_der.as_slice()) };
    let connector = build_connector(identity, pinned).map_err(|e| SessionError::Closed(std::io::Error::other(e)))?;
    let host_only = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let server_name = server_name_for(host_only).map_err(|e| SessionError::Closed(std::io::Error::other(e)))?;
    connector.connect(server_name, tcp).await.map_err(SessionError::Closed)
}

async fn handshake_and_spawn<S>(
    tls: S,
    identity: Arc<LocalCert>,
    mut entry: HostEntry,
    hostname: String,
    pin_display: Arc<dyn PinDisplay>,
) -> Result<(ClientSession, HostEntry, mpsc::UnboundedReceiver<ClientEvent>), SessionError>
where
    S: AsyncRead + AsyncWrite + PeerCert + Send + 'static,
{
    let server_cert = tls.peer_cert_der().ok_or_else(|| {
        SessionError::Closed(std::io::Error::new(std::io::ErrorKind::InvalidData, "server presented no certificate"))
    })?;

    let (read_half, write_half) = tokio::io::split(tls);
    let mut reader = PacketReader::new(read_half);
    let boxed_write_half: BoxedWriter = Box::new(write_half);
    let mut writer = PacketWriter::new(boxed_write_half);

    writer.write_packet(&Packet::ClientIntro { protocol_version: PROTOCOL_VERSION }, &[]).await?;
    let (packet, _) = reader.read_packet().await?;
    let (server_protocol_version, status) = match packet {
        Packet::ServerIntro { protocol_version, status, .. } => (protocol_version, status),
        other => return Err(ProtocolError::UnexpectedMessage { state: "Greeted", got: other.kind_name() }.into()),
    };

    match status {
        ServerIntroStatus::VersionMismatch => {
            return Err(ProtocolError::VersionMismatch { server: server_protocol_version, client: PROTOCOL_VERSION }.into());
        }
        ServerIntroStatus::Ok => {}
        ServerIntroStatus::AuthRequired => {
            run_client_pairing(&mut reader, &mut writer, &identity, &server_cert, &hostname, pin_display.as_ref()).await?;
            entry.server_cert_der = server_cert.clone();
            entry.client_cert_der = identity.cert_der.clone();
            entry.last_connected = Some(now_unix_seconds());
        }
    }

    info!(%hostname, "session authorized; entering media loop");

    let network_clock = Arc::new(NetworkClock::new());
    let closed = Arc::new(AtomicBool::new(false));
    let close_notify = Arc::new(Notify::new());
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    tokio::spawn(ping_loop(network_clock.clone(), writer.clone(), closed.clone(), close_notify.clone()));
    tokio::spawn(receive_loop(reader, network_clock.clone(), event_tx, command_tx, closed.clone(), close_notify.clone()));

    Ok((
        ClientSession { network_clock, closed, close_notify, writer, commands: tokio::sync::Mutex::new(command_rx) },
        entry,
        event_rx,
    ))
}

/// Client side of spec §4.4 steps 3-9.
async fn run_client_pairing<R, W>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
    identity: &LocalCert,
    server_cert: &[u8],
    hostname: &str,
    pin_display: &dyn PinDisplay,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let client_cert = &identity.cert_der;
    let client_nonce = random_bytes(CLIENT_NONCE_LEN);
    let client_partial = partial_hash(server_cert, client_cert, &client_nonce);

    writer
        .write_packet(
            &Packet::AuthRequest { hostname: hostname.to_string(), client_nonce_len: client_nonce.len() as u32 },
            &client_partial,
        )
        .await?;

    let (packet, _server_partial) = reader.read_packet().await?;
    match packet {
        Packet::ServerPartialHashNotify { .. } => {}
        other => return Err(ProtocolError::UnexpectedMessage { state: "Unauthorized", got: other.kind_name() }.into()),
    }

    writer.write_packet(&Packet::ClientNonceNotify {}, &client_nonce).await?;

    let (packet, server_nonce) = reader.read_packet().await?;
    match packet {
        Packet::ServerNonceNotify {} => {}
        other => return Err(ProtocolError::UnexpectedMessage { state: "Unauthorized", got: other.kind_name() }.into()),
    }

    let pin = derive_pin(server_cert, client_cert, &server_nonce, &client_nonce);
    pin_display.show(&format_pin(pin));

    let (packet, _) = reader.read_packet().await?;
    match packet {
        Packet::AuthResponse { status: AuthResponseStatus::Ok } => Ok(()),
        Packet::AuthResponse { status: AuthResponseStatus::IncorrectPin } => Err(SessionError::Auth(AuthError::IncorrectPin)),
        Packet::AuthResponse { status: AuthResponseStatus::NonceTooShort } => Err(SessionError::Auth(AuthError::NonceTooShort)),
        Packet::AuthResponse { status: AuthResponseStatus::UnknownError } => Err(SessionError::Auth(AuthError::HashMismatch)),
        other => Err(ProtocolError::UnexpectedMessage { state: "Unauthorized", got: other.kind_name() }.into()),
    }
}

/// Sends `PingRequest` on the cadence `NetworkClock::generate_ping` dictates
/// and exits as soon as `closed` flips (spec §4.5 "Ping loop").
async fn ping_loop<W>(
    clock: Arc<NetworkClock>,
    writer: Arc<tokio::sync::Mutex<PacketWriter<W>>>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }
        let id = clock.generate_ping();
        if id != 0 {
            let packet = Packet::PingRequest { id, latency: clock.latency().max(0) as u32 };
            if writer.lock().await.write_packet(&packet, &[]).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = close_notify.notified() => return,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
        }
    }
}

/// Demuxes inbound packets and dispatches them to `event_tx`, feeding
/// `PingResponse` straight into the network clock rather than forwarding it
/// (spec §4.5 "Responses feed the NetworkClock").
async fn receive_loop<R>(
    mut reader: PacketReader<R>,
    clock: Arc<NetworkClock>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    command_tx: mpsc::UnboundedSender<CommandResponse>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
{
    let mut last_shape: Option<Arc<CursorShape>> = None;

    loop {
        let next = tokio::select! {
            _ = close_notify.notified() => break,
            res = reader.read_packet() => res,
        };

        let (packet, extra) = match next {
            Ok(v) => v,
            Err(e) => {
                info!(error = %e, "receive loop ending");
                break;
            }
        };

        match packet {
            Packet::PingResponse { id, time } => {
                clock.adjust(id, time as Micros);
            }
            Packet::DesktopFrame { time_captured, time_encoded, cursor_visible, cursor_x, cursor_y, is_key_frame } => {
                let mut frame = Frame::new(extra);
                frame.time_captured = time_captured;
                frame.time_encoded = time_encoded;
                frame.time_received = clock.time();
                frame.is_key_frame = is_key_frame;
                if let Some(shape) = &last_shape {
                    frame.cursor_shape = Some(shape.clone());
                }
                let _ = event_tx.send(ClientEvent::Video { frame, cursor_visible, cursor_x, cursor_y });
            }
            Packet::CursorShape { width, height, hotspot_x, hotspot_y, format } => {
                let shape = Arc::new(CursorShape {
                    w: width,
                    h: height,
                    hotspot_x,
                    hotspot_y,
                    format: format.into(),
                    image: extra.into(),
                });
                last_shape = Some(shape.clone());
                let _ = event_tx.send(ClientEvent::CursorShape(shape));
            }
            Packet::AudioFrame { .. } => {
                let mut frame = Frame::new(extra);
                frame.time_received = clock.time();
                let _ = event_tx.send(ClientEvent::Audio(frame));
            }
            Packet::ServerPerfReport { capture_min, capture_avg, capture_max, encoder_min, encoder_avg, encoder_max } => {
                let _ = event_tx.send(ClientEvent::PerfReport(ServerPerfSample {
                    capture_min,
                    capture_avg,
                    capture_max,
                    encoder_min,
                    encoder_avg,
                    encoder_max,
                }));
            }
            Packet::QueryHostCapsResponse { native_w, native_h, native_fps_num, native_fps_den, max_w, max_h, status: CapsStatus::Ok } => {
                let _ = command_tx.send(CommandResponse::HostCaps(RemoteHostCaps {
                    native_width: native_w,
                    native_height: native_h,
                    native_fps: Rational::new(native_fps_num as i64, native_fps_den as i64),
                    max_width: max_w,
                    max_height: max_h,
                }));
            }
            Packet::ConfigureStreamResponse { status } => {
                let _ = command_tx.send(CommandResponse::Configure(status));
            }
            Packet::StartStreamResponse { status } => {
                let _ = command_tx.send(CommandResponse::Start(status));
            }
            Packet::StopStreamResponse { status } => {
                let _ = command_tx.send(CommandResponse::Stop(status));
            }
            other => {
                warn!(kind = other.kind_name(), "unexpected packet on client receive loop; ignoring");
            }
        }
    }

    closed.store(true, Ordering::Release);
}

/// Gives `handshake_and_spawn` access to the TLS layer's peer certificate
/// without depending on a concrete stream type, so it works uniformly over
/// `tokio_rustls::client::TlsStream<TcpStream>` in production and an
/// in-memory duplex stream in tests.
trait PeerCert {
    fn peer_cert_der(&self) -> Option<Vec<u8>>;
}

impl PeerCert for tokio_rustls::client::TlsStream<TcpStream> {
    fn peer_cert_der(&self) -> Option<Vec<u8>> {
        self.get_ref().1.peer_certificates().and_then(|certs| certs.first()).map(|c| c.as_ref().to_vec())
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn now_unix_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let (client, _server) = tokio::io::duplex(1024);
        let boxed: BoxedWriter = Box::new(client);
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let session = ClientSession {
            network_clock: Arc::new(NetworkClock::new()),
            closed: closed.clone(),
            close_notify: notify,
            writer: Arc::new(tokio::sync::Mutex::new(PacketWriter::new(boxed))),
            commands: tokio::sync::Mutex::new(command_rx),
        };
        assert!(!session.is_closed());
        session.disconnect();
        assert!(session.is_closed());
        session.disconnect();
        assert!(session.is_closed());
    }
}
