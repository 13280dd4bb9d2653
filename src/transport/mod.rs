//! Transport seam between the session core and the wire
//!
//! The core drives a [`Transport`] as a framed duplex message channel:
//! `open` performs the handshake and reports the HTTP status, `send` and
//! `read` move [`frame::MessageFrame`]s, and a broadcast stream surfaces
//! connection events for telemetry. A production WebSocket implementation
//! lives in [`websocket`]; tests script their own.

pub mod frame;
pub mod websocket;

pub use frame::{MessageFrame, MessageType};
pub use websocket::WebSocketTransportFactory;

use crate::auth::AuthInfo;
use crate::config::RecognizerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Events a transport publishes while alive.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established {
        connection_id: String,
    },
    Closed {
        connection_id: String,
        status: Option<u16>,
        reason: String,
    },
    MessageReceived {
        connection_id: String,
        path: String,
    },
    MessageSent {
        connection_id: String,
        path: String,
    },
}

impl ConnectionEvent {
    /// Stable label used as the telemetry key for this event.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionEvent::Established { .. } => "connection.established",
            ConnectionEvent::Closed { .. } => "connection.closed",
            ConnectionEvent::MessageReceived { .. } => "connection.messagereceived",
            ConnectionEvent::MessageSent { .. } => "connection.messagesent",
        }
    }
}

/// Errors from the transport layer
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The endpoint URL is missing or unusable
    Endpoint(String),
    /// The handshake failed before any HTTP status was produced
    Handshake(String),
    /// `send`/`read` called before `open`, or after disposal
    NotOpen,
    /// A send failed mid-connection
    Send(String),
    /// A receive failed mid-connection
    Receive(String),
    /// A received frame could not be decoded
    Frame(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Endpoint(e) => write!(f, "Bad endpoint: {}", e),
            TransportError::Handshake(e) => write!(f, "Connection handshake failed: {}", e),
            TransportError::NotOpen => write!(f, "Connection is not open"),
            TransportError::Send(e) => write!(f, "Failed to send message: {}", e),
            TransportError::Receive(e) => write!(f, "Failed to receive message: {}", e),
            TransportError::Frame(e) => write!(f, "Bad frame from service: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// A framed duplex message channel to the service.
///
/// `send` calls are serialized by the implementation: two awaited sends
/// reach the wire in call order. `read` yields `Ok(None)` when the read
/// queue drains after a graceful close.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Client-generated connection id, echoed by the service.
    fn id(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Perform the handshake. Returns the HTTP status the service answered
    /// with (200 on success); transport-level failures with no status are
    /// `Err`.
    async fn open(&self) -> Result<u16, TransportError>;

    async fn send(&self, frame: MessageFrame) -> Result<(), TransportError>;

    async fn read(&self) -> Result<Option<MessageFrame>, TransportError>;

    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn dispose(&self, reason: &str);
}

/// Creates unopened transports for the session core; one per dial.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &RecognizerConfig,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
