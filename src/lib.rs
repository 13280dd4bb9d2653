//! Client-side session engine for cloud speech recognition
//!
//! `speechlink` drives a bidirectional, long-lived WebSocket connection to
//! a speech-recognition service: it authenticates and dials, negotiates
//! the session with `speech.config` and per-turn `speech.context`
//! messages, streams audio upstream with fast-lane-then-throttled pacing,
//! and dispatches downstream events and phrase results.
//!
//! # Lifecycle
//!
//! 1. Build a [`RecognizerConfig`] (endpoint, language, tunables).
//! 2. Pick an auth provider, a transport factory, an audio source, and a
//!    [`RecognizerAdapter`] for the recognizer-specific result paths.
//! 3. `SpeechSession::new(...)` returns the session plus an event channel.
//! 4. `recognize(mode)` runs one recognition to completion; `stop_recognizing`
//!    ends it early. Credential expiry (403) and mid-stream disconnects are
//!    absorbed internally: the engine re-authenticates, redials, re-sends
//!    the handshake messages, and replays buffered audio.
//!
//! ```no_run
//! use speechlink::{
//!     AudioFormat, PushAudioSource, RecognitionMode, RecognizerConfig, SpeechSession,
//!     SubscriptionKeyAuth, WebSocketTransportFactory, properties,
//! };
//! use std::sync::Arc;
//!
//! # struct NoopAdapter;
//! # impl speechlink::RecognizerAdapter for NoopAdapter {
//! #     fn process_message(&self, _: &speechlink::MessageFrame) -> Result<(), speechlink::SessionError> { Ok(()) }
//! #     fn cancel_recognition(&self, _: &str, _: &str, _: speechlink::CancellationReason,
//! #         _: speechlink::CancellationErrorCode, _: &str) {}
//! # }
//! # async fn run() -> Result<(), speechlink::SessionError> {
//! let config = RecognizerConfig::new()
//!     .with_property(properties::ENDPOINT, "wss://speech.example.com/reco/v1")
//!     .with_property(properties::RECO_LANGUAGE, "en-US");
//! let source = Arc::new(PushAudioSource::new("mic-0", AudioFormat::default()));
//! let (session, mut events) = SpeechSession::new(
//!     config,
//!     Arc::new(SubscriptionKeyAuth::new("key")),
//!     Arc::new(WebSocketTransportFactory::new()),
//!     source.clone(),
//!     Arc::new(NoopAdapter),
//! )?;
//! session.recognize(RecognitionMode::SingleShot).await?;
//! # Ok(()) }
//! ```

pub mod audio;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use audio::{
    AudioChunk, AudioDeviceInfo, AudioError, AudioFormat, AudioSource, AudioSourceEvent,
    AudioStreamNode, PushAudioSource, ReplayableAudioStream,
};
pub use auth::{AuthError, AuthInfo, AuthProvider, SubscriptionKeyAuth, TokenExchangeAuth};
pub use config::{properties, RecognitionMode, RecognizerConfig};
pub use protocol::{DynamicGrammarBuilder, SpeechContext};
pub use session::{
    CancellationErrorCode, CancellationReason, RecognizerAdapter, SessionError, SessionEvent,
    SpeechSession,
};
pub use transport::{
    ConnectionEvent, ConnectionState, MessageFrame, MessageType, Transport, TransportError,
    TransportFactory, WebSocketTransportFactory,
};
