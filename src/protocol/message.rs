//! The `Packet` tagged union (spec §6.1).
//!
//! Every packet carries its type-specific fields plus an implicit
//! `extra_data_len`, which [`super::framing`] tracks alongside the header
//! rather than inside this enum — it describes a byte range that follows
//! the header on the wire, not a field of the logical message.

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerIntroStatus {
    Ok,
    AuthRequired,
    VersionMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthResponseStatus {
    Ok,
    IncorrectPin,
    NonceTooShort,
    UnknownError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsStatus {
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigureStatus {
    Ok,
    UnsupportedCodec,
    InvalidDimensions,
    AlreadyStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartStatus {
    Ok,
    NotConfigured,
    AlreadyStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopStatus {
    Ok,
    NotStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorShapeFormatWire {
    Rgba,
    RgbaXor,
    Monochrome,
}

impl From<crate::frame::CursorShapeFormat> for CursorShapeFormatWire {
    fn from(f: crate::frame::CursorShapeFormat) -> Self {
        match f {
            crate::frame::CursorShapeFormat::Rgba => CursorShapeFormatWire::Rgba,
            crate::frame::CursorShapeFormat::RgbaXor => CursorShapeFormatWire::RgbaXor,
            crate::frame::CursorShapeFormat::Monochrome => CursorShapeFormatWire::Monochrome,
        }
    }
}

impl From<CursorShapeFormatWire> for crate::frame::CursorShapeFormat {
    fn from(f: CursorShapeFormatWire) -> Self {
        match f {
            CursorShapeFormatWire::Rgba => crate::frame::CursorShapeFormat::Rgba,
            CursorShapeFormatWire::RgbaXor => crate::frame::CursorShapeFormat::RgbaXor,
            CursorShapeFormatWire::Monochrome => crate::frame::CursorShapeFormat::Monochrome,
        }
    }
}

/// One wire message. Variants that carry extra-data are documented with the
/// contents of that byte range; the range itself travels alongside, not
/// inside, this struct (see [`super::framing::PacketWriter`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Packet {
    /// C->S. No extra-data.
    ClientIntro { protocol_version: u32 },
    /// S->C. No extra-data.
    ServerIntro { protocol_version: u32, commit_name: String, status: ServerIntroStatus },
    /// C->S. Extra-data: 48-byte client partial hash.
    AuthRequest { hostname: String, client_nonce_len: u32 },
    /// S->C. Extra-data: 48-byte server partial hash.
    ServerPartialHashNotify { server_nonce_len: u32 },
    /// C->S. Extra-data: the client nonce.
    ClientNonceNotify {},
    /// S->C. Extra-data: the server nonce.
    ServerNonceNotify {},
    /// S->C. No extra-data.
    AuthResponse { status: AuthResponseStatus },
    /// C->S. No extra-data.
    PingRequest { id: u32, latency: u32 },
    /// S->C. No extra-data.
    PingResponse { id: u32, time: u64 },
    /// C->S. No extra-data.
    QueryHostCapsRequest { codec: VideoCodec },
    /// S->C. No extra-data.
    QueryHostCapsResponse {
        native_w: u32,
        native_h: u32,
        native_fps_num: u32,
        native_fps_den: u32,
        max_w: u32,
        max_h: u32,
        status: CapsStatus,
    },
    /// C->S. No extra-data.
    ConfigureStreamRequest { width: u32, height: u32, fps_num: u32, fps_den: u32, codec: VideoCodec },
    /// S->C. No extra-data.
    ConfigureStreamResponse { status: ConfigureStatus },
    /// C->S. No extra-data.
    StartStreamRequest {},
    /// S->C. No extra-data.
    StartStreamResponse { status: StartStatus },
    /// C->S. No extra-data.
    StopStreamRequest {},
    /// S->C. No extra-data.
    StopStreamResponse { status: StopStatus },
    /// S->C. Extra-data: encoded video payload.
    DesktopFrame {
        time_captured: i64,
        time_encoded: i64,
        cursor_visible: bool,
        cursor_x: i32,
        cursor_y: i32,
        is_key_frame: bool,
    },
    /// S->C. Extra-data: RGBA/XOR/mono cursor image bytes.
    CursorShape { width: u32, height: u32, hotspot_x: i32, hotspot_y: i32, format: CursorShapeFormatWire },
    /// S->C. Extra-data: encoded audio payload.
    AudioFrame { channels: u32 },
    /// S->C. No extra-data.
    ServerPerfReport {
        capture_min: i64,
        capture_avg: i64,
        capture_max: i64,
        encoder_min: i64,
        encoder_avg: i64,
        encoder_max: i64,
    },
}

impl Packet {
    /// Name used in protocol error messages and logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::ClientIntro { .. } => "ClientIntro",
            Packet::ServerIntro { .. } => "ServerIntro",
            Packet::AuthRequest { .. } => "AuthRequest",
            Packet::ServerPartialHashNotify { .. } => "ServerPartialHashNotify",
            Packet::ClientNonceNotify {} => "ClientNonceNotify",
            Packet::ServerNonceNotify {} => "ServerNonceNotify",
            Packet::AuthResponse { .. } => "AuthResponse",
            Packet::PingRequest { .. } => "PingRequest",
            Packet::PingResponse { .. } => "PingResponse",
            Packet::QueryHostCapsRequest { .. } => "QueryHostCapsRequest",
            Packet::QueryHostCapsResponse { .. } => "QueryHostCapsResponse",
            Packet::ConfigureStreamRequest { .. } => "ConfigureStreamRequest",
            Packet::ConfigureStreamResponse { .. } => "ConfigureStreamResponse",
            Packet::StartStreamRequest {} => "StartStreamRequest",
            Packet::StartStreamResponse { .. } => "StartStreamResponse",
            Packet::StopStreamRequest {} => "StopStreamRequest",
            Packet::StopStreamResponse { .. } => "StopStreamResponse",
            Packet::DesktopFrame { .. } => "DesktopFrame",
            Packet::CursorShape { .. } => "CursorShape",
            Packet::AudioFrame { .. } => "AudioFrame",
            Packet::ServerPerfReport { .. } => "ServerPerfReport",
        }
    }
}
