//! Recognition session core
//!
//! Drives one long-lived service connection through the lifecycle of a
//! recognition: dial and authenticate, send `speech.config` and
//! `speech.context`, pump audio upstream while dispatching downstream
//! events, and survive credential expiry and mid-stream disconnects
//! without surfacing them to the caller.
//!
//! # Architecture
//!
//! ```text
//! AudioSource ──▶ ReplayableAudioStream ──▶ upstream pump ─┐
//!                                                          ▼
//!                                                   Transport (WS)
//!                                                          │
//!        SessionEvent channel ◀── downstream dispatch ◀────┘
//!                 │                      │
//!                 ▼                      ▼
//!              caller          RecognizerAdapter (typed results)
//! ```
//!
//! Both loops run concurrently on the same task via `tokio::join!` and
//! share the single connection; the connection and configured-connection
//! futures are single-flight, so concurrent fetches observe one identity.

mod connection;
mod controller;
mod dispatch;
mod pump;
mod request_session;

pub use controller::SpeechSession;
pub use request_session::RequestSession;

use crate::transport::MessageFrame;
use uuid::Uuid;

/// Mint an opaque 32-character lowercase hex id (no dashes).
pub(crate) fn new_hex_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Why a recognition was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// Something went wrong mid-session
    Error,
    /// The audio stream ended and the service confirmed the final turn
    EndOfStream,
}

/// Machine-readable cancellation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationErrorCode {
    NoError,
    AuthenticationFailure,
    ConnectionFailure,
    RuntimeError,
}

/// Errors surfaced by the session core
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Construction-time validation failure
    InvalidArgument(String),
    /// Credential fetch failed; fatal to the recognition
    AuthFailure(String),
    /// The transport could not be opened
    ConnectionFailure {
        status: Option<u16>,
        endpoint: String,
        reason: String,
    },
    /// A transport send or receive failed mid-session
    Transport(String),
    /// The audio source failed
    Audio(String),
    /// A payload could not be serialized or parsed
    Protocol(String),
    /// The core was disposed
    Disposed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            SessionError::AuthFailure(e) => write!(f, "Authentication failed: {}", e),
            SessionError::ConnectionFailure {
                status,
                endpoint,
                reason,
            } => match status {
                Some(code) => write!(
                    f,
                    "Unable to contact server. StatusCode: {}, {} Reason: {}",
                    code, endpoint, reason
                ),
                None => write!(
                    f,
                    "Unable to contact server. {} Reason: {}",
                    endpoint, reason
                ),
            },
            SessionError::Transport(e) => write!(f, "Connection error: {}", e),
            SessionError::Audio(e) => write!(f, "Audio source error: {}", e),
            SessionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SessionError::Disposed => write!(f, "Session core has been disposed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Events delivered to the session's caller, in occurrence order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
    },
    SessionStopped {
        session_id: String,
    },
    /// The service detected the start of speech; offset in 100-ns ticks.
    SpeechStartDetected {
        session_id: String,
        offset: u64,
    },
    /// The service detected the end of speech; the offset is
    /// session-relative (absolute across turns).
    SpeechEndDetected {
        session_id: String,
        offset: u64,
    },
    Canceled {
        session_id: String,
        request_id: String,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: String,
    },
    ConnectionEstablished {
        connection_id: String,
    },
    ConnectionClosed {
        connection_id: String,
        status: Option<u16>,
        reason: String,
    },
}

/// Recognizer-specific message handling, injected into the core.
///
/// The dispatcher hands over every downstream frame it does not consume
/// itself (hypotheses, phrases, translations, …). Implementations must not
/// assume ordering beyond what the protocol provides, and have no access
/// to connection or pump state.
pub trait RecognizerAdapter: Send + Sync {
    fn process_message(&self, frame: &MessageFrame) -> Result<(), SessionError>;

    /// Map a cancellation to recognizer-specific results and events.
    fn cancel_recognition(
        &self,
        session_id: &str,
        request_id: &str,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: &str,
    );
}
