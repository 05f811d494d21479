//! Error taxonomy (spec §7).
//!
//! Categories, not exhaustive type names: protocol errors close the
//! connection, auth errors map to a typed `AuthResponse.status`, transient
//! I/O is retried internally, fatal I/O ends the session, resource errors
//! are programming bugs that fail fast, and configuration errors are
//! rejected before any state changes.

use thiserror::Error;

/// Malformed wire data or a message arriving in the wrong connection state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet header too large: {0} bytes")]
    HeaderTooLarge(u32),
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),
    #[error("extra-data length mismatch: header declared {declared}, got {got}")]
    ExtraDataLengthMismatch { declared: u32, got: u32 },
    #[error("unexpected message {got} in state {state}")]
    UnexpectedMessage { state: &'static str, got: &'static str },
    #[error("protocol version mismatch: server={server}, client={client}")]
    VersionMismatch { server: u32, client: u32 },
}

/// Failures during the pairing handshake of spec §4.4. These map onto an
/// `AuthResponse.status` rather than necessarily closing the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("PIN did not match")]
    IncorrectPin,
    #[error("client nonce shorter than 16 bytes")]
    NonceTooShort,
    #[error("partial hash did not match recomputed value")]
    HashMismatch,
}

/// Arena exhaustion or double-free: both are programming errors that
/// indicate a broken invariant elsewhere, not a recoverable runtime
/// condition (spec §7 "Resource errors").
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("arena exhausted: {0}")]
    ArenaExhausted(String),
    #[error("double-free of arena slot")]
    DoubleFree,
}

/// Rejected at `ConfigureStreamRequest`/config load time; no state change
/// occurs (spec §7 "Configuration errors").
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid framerate: {0}")]
    InvalidFramerate(String),
    #[error("a stream is already configured or running")]
    AlreadyStreaming,
    #[error("no stream has been configured yet")]
    NotConfigured,
    #[error("no stream is currently running")]
    NotStreaming,
}

/// Top-level error a `Connection` or `ClientSession` tears itself down with.
/// Protocol/auth/config errors are typed; I/O and TLS failures fall through
/// to `anyhow` at the process boundary, matching spec §7's instruction that
/// fatal I/O is "surfaced" rather than classified further.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed: {0}")]
    Auth(AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("connection closed: {0}")]
    Closed(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}
