//! Public session controller
//!
//! [`SpeechSession`] owns the shared core state and sequences a
//! recognition: connect, configure, then run the upstream pump and the
//! downstream dispatcher concurrently until the session ends. `stop`,
//! `disconnect`, and a superseding `recognize` interrupt the loops
//! cooperatively through a watch channel; the loops re-check their
//! termination predicates whenever it fires.

use super::{dispatch, new_hex_id, pump};
use super::{
    CancellationErrorCode, CancellationReason, RecognizerAdapter, RequestSession, SessionError,
    SessionEvent,
};
use crate::audio::{AudioDeviceInfo, AudioSource, ReplayableAudioStream};
use crate::auth::AuthProvider;
use crate::config::{RecognitionMode, RecognizerConfig};
use crate::protocol::{paths, DynamicGrammarBuilder};
use crate::transport::{MessageFrame, Transport, TransportFactory};
use futures_util::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};

/// Single-flight future resolving to an open (or configured) connection.
pub(crate) type ConnectFuture =
    Shared<BoxFuture<'static, Result<Arc<dyn Transport>, SessionError>>>;

/// State shared by the controller, the connection manager, and both loops.
pub(crate) struct SessionCore {
    pub(crate) config: RecognizerConfig,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) source: Arc<dyn AudioSource>,
    pub(crate) adapter: Arc<dyn RecognizerAdapter>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) session: Mutex<RequestSession>,
    pub(crate) grammar: Mutex<DynamicGrammarBuilder>,
    pub(crate) device: Mutex<Option<AudioDeviceInfo>>,
    pub(crate) connection_slot: Mutex<Option<ConnectFuture>>,
    pub(crate) configured_slot: Mutex<Option<ConnectFuture>>,
    /// Connection id that already received `speech.config`.
    pub(crate) config_sent_on: Mutex<Option<String>>,
    pub(crate) mode: Mutex<RecognitionMode>,
    pub(crate) disposed: AtomicBool,
    /// Bumped on stop/cancel/supersede; loops select on it to wake up.
    pub(crate) interrupt: watch::Sender<u64>,
}

impl SessionCore {
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn mode(&self) -> RecognitionMode {
        *self.mode.lock().unwrap()
    }

    /// Wake both loops so they re-check their termination predicates.
    pub(crate) fn signal_interrupt(&self) {
        self.interrupt.send_modify(|v| *v += 1);
    }

    pub(crate) fn interrupt_watch(&self) -> watch::Receiver<u64> {
        self.interrupt.subscribe()
    }

    /// Upload accumulated telemetry on the `telemetry` path. Empty flushes
    /// are suppressed; a failed flush is logged, never fatal.
    pub(crate) async fn flush_telemetry(&self, conn: &Arc<dyn Transport>) {
        let (payload, request_id) = {
            let mut session = self.session.lock().unwrap();
            let request_id = session.request_id().to_string();
            (session.drain_telemetry(), request_id)
        };
        let Some(payload) = payload else {
            return;
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Telemetry: serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = conn
            .send(MessageFrame::text(paths::TELEMETRY, &request_id, body))
            .await
        {
            log::warn!("Telemetry: flush failed: {}", e);
        }
    }

    /// Stop the active recognition locally and report the cancellation to
    /// the adapter and the event stream. A no-op when nothing is
    /// recognizing, so repeated causes collapse into one cancellation.
    pub(crate) async fn cancel_local(
        &self,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: &str,
    ) {
        let cancelling = {
            let mut session = self.session.lock().unwrap();
            if session.is_recognizing() {
                session.on_stop_recognizing();
                true
            } else {
                false
            }
        };
        if !cancelling {
            return;
        }
        self.signal_interrupt();

        if let Some(conn) = self.settled_connection() {
            self.flush_telemetry(&conn).await;
        }

        let (session_id, request_id) = {
            let session = self.session.lock().unwrap();
            (
                session.session_id().to_string(),
                session.request_id().to_string(),
            )
        };
        log::info!(
            "Session {}: cancelled locally ({:?}/{:?}): {}",
            session_id,
            reason,
            code,
            message
        );
        self.adapter
            .cancel_recognition(&session_id, &request_id, reason, code, message);
        self.emit(SessionEvent::Canceled {
            session_id,
            request_id,
            reason,
            code,
            message: message.to_string(),
        });
    }
}

/// Client-side engine for one speech-recognition session.
///
/// Construction wires together the configuration, credential provider,
/// transport factory, audio source, and the recognizer adapter that maps
/// typed service messages to user-facing results. Session lifecycle events
/// arrive on the channel returned from [`SpeechSession::new`].
pub struct SpeechSession {
    core: Arc<SessionCore>,
}

impl SpeechSession {
    pub fn new(
        config: RecognizerConfig,
        auth: Arc<dyn AuthProvider>,
        factory: Arc<dyn TransportFactory>,
        source: Arc<dyn AudioSource>,
        adapter: Arc<dyn RecognizerAdapter>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        match config.endpoint() {
            Some(endpoint) if !endpoint.is_empty() => {}
            _ => {
                return Err(SessionError::InvalidArgument(
                    "endpoint is not configured".to_string(),
                ))
            }
        }
        if source.id().is_empty() {
            return Err(SessionError::InvalidArgument(
                "audio source has an empty id".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = RequestSession::new(source.id(), config.telemetry_enabled());
        let (interrupt, _) = watch::channel(0u64);

        let core = Arc::new(SessionCore {
            config,
            auth,
            factory,
            source,
            adapter,
            events: events_tx,
            session: Mutex::new(session),
            grammar: Mutex::new(DynamicGrammarBuilder::new()),
            device: Mutex::new(None),
            connection_slot: Mutex::new(None),
            configured_slot: Mutex::new(None),
            config_sent_on: Mutex::new(None),
            mode: Mutex::new(RecognitionMode::SingleShot),
            disposed: AtomicBool::new(false),
            interrupt,
        });

        Ok((Self { core }, events_rx))
    }

    /// Current session id; changes on every `recognize`.
    pub fn session_id(&self) -> String {
        self.core.session.lock().unwrap().session_id().to_string()
    }

    /// Bias recognition towards a phrase; takes effect on the next turn.
    pub fn add_phrase(&self, phrase: impl Into<String>) {
        self.core.grammar.lock().unwrap().add_phrase(phrase);
    }

    pub fn add_reference_grammar(&self, grammar: impl Into<String>) {
        self.core.grammar.lock().unwrap().add_reference_grammar(grammar);
    }

    pub fn clear_grammars(&self) {
        self.core.grammar.lock().unwrap().clear();
    }

    /// Establish (or reuse) the connection eagerly, before any audio flows.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.core.is_disposed() {
            return Err(SessionError::Disposed);
        }
        self.core.connect().await.map(|_| ())
    }

    /// Cancel any active recognition and drop the stored connection.
    pub async fn disconnect(&self) {
        self.core
            .cancel_local(
                CancellationReason::Error,
                CancellationErrorCode::NoError,
                "Disconnecting",
            )
            .await;
        self.core.dispose_connections("Disconnecting").await;
    }

    /// Run one recognition to completion.
    ///
    /// Resolves `Ok(true)` when the session ended normally. Errors during
    /// setup (audio attach, connect, configure) are returned; errors after
    /// the session started surface as a `Canceled` event and an adapter
    /// callback, and resolve `Ok(false)`.
    ///
    /// Calling `recognize` while a previous recognition is active
    /// supersedes it: the prior pump exits before sending another frame.
    pub async fn recognize(&self, mode: RecognitionMode) -> Result<bool, SessionError> {
        if self.core.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let core = &self.core;

        // Force config + context onto the wire for the new recognition.
        core.reset_configured();
        *core.mode.lock().unwrap() = mode;
        let recog_number = {
            let mut session = core.session.lock().unwrap();
            session.start_new_recognition();
            session.recog_number()
        };
        // Wake any loops from a superseded recognition.
        core.signal_interrupt();

        if let Some(mut audio_events) = core.source.events() {
            let listener = Arc::clone(core);
            tokio::spawn(async move {
                loop {
                    match audio_events.recv().await {
                        Ok(event) => {
                            let mut session = listener.session.lock().unwrap();
                            if session.recog_number() != recog_number {
                                break;
                            }
                            session.on_service_event(event.label());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // Warm up the connection while the audio node attaches.
        let warm = Arc::clone(core);
        tokio::spawn(async move {
            let _ = warm.connect().await;
        });

        let node_id = new_hex_id();
        let node = core
            .source
            .attach(&node_id)
            .await
            .map_err(|e| SessionError::Audio(e.to_string()))?;
        let format = core.source.format();
        let replay_budget = u64::from(format.avg_bytes_per_sec())
            * core.config.transmit_length_before_throttle_ms()
            / 1000;
        let audio = Arc::new(ReplayableAudioStream::new(node, replay_budget));
        core.session
            .lock()
            .unwrap()
            .on_audio_source_attach_completed(audio.id(), false);

        let device = core.source.device_info().await;
        *core.device.lock().unwrap() = Some(device);

        if let Err(e) = core.configure().await {
            core.cancel_local(
                CancellationReason::Error,
                CancellationErrorCode::ConnectionFailure,
                &e.to_string(),
            )
            .await;
            return Err(e);
        }

        let session_id = core.session.lock().unwrap().session_id().to_string();
        core.emit(SessionEvent::SessionStarted { session_id });

        // Either loop failing cancels the recognition, which interrupts the
        // other loop at its next checkpoint.
        let pump_core = Arc::clone(core);
        let pump_audio = Arc::clone(&audio);
        let upstream = async move {
            let result = pump::run_upstream(Arc::clone(&pump_core), pump_audio).await;
            if let Err(e) = &result {
                pump_core
                    .cancel_local(
                        CancellationReason::Error,
                        CancellationErrorCode::RuntimeError,
                        &format!("audio upload failed: {}", e),
                    )
                    .await;
            }
            result
        };

        let dispatch_core = Arc::clone(core);
        let dispatch_audio = Arc::clone(&audio);
        let downstream = async move {
            let result = dispatch::run_downstream(Arc::clone(&dispatch_core), dispatch_audio).await;
            if let Err(e) = &result {
                dispatch_core
                    .cancel_local(
                        CancellationReason::Error,
                        CancellationErrorCode::RuntimeError,
                        &format!("message dispatch failed: {}", e),
                    )
                    .await;
            }
            result
        };

        let (pump_result, dispatch_result) = tokio::join!(upstream, downstream);

        // A failure in either loop was reported as a cancellation above;
        // the resolution has to say so too.
        match (pump_result, dispatch_result) {
            (Ok(()), Ok(done)) => Ok(done),
            _ => Ok(false),
        }
    }

    /// Stop an active recognition: flush telemetry, turn the audio source
    /// off, and signal end-of-audio to the service.
    pub async fn stop_recognizing(&self) -> Result<(), SessionError> {
        let core = &self.core;
        let stopping = {
            let mut session = core.session.lock().unwrap();
            if session.is_recognizing() {
                session.on_stop_recognizing();
                true
            } else {
                false
            }
        };
        if !stopping {
            return Ok(());
        }
        core.signal_interrupt();

        let request_id = core.session.lock().unwrap().request_id().to_string();
        let conn = core.settled_connection();

        if let Some(conn) = &conn {
            core.flush_telemetry(conn).await;
        }

        core.source
            .turn_off()
            .await
            .map_err(|e| SessionError::Audio(e.to_string()))?;

        if let Some(conn) = &conn {
            if let Err(e) = conn
                .send(MessageFrame::binary(paths::AUDIO, &request_id, Vec::new()))
                .await
            {
                log::warn!("Stop: failed to send end-of-audio frame: {}", e);
            }
        }
        Ok(())
    }

    /// Cancel the active recognition locally.
    pub async fn cancel_recognition_local(
        &self,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: &str,
    ) {
        self.core.cancel_local(reason, code, message).await;
    }

    /// Mark the core disposed and release the connection. Further calls to
    /// `recognize`/`connect` fail with [`SessionError::Disposed`].
    pub async fn dispose(&self, reason: &str) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.session.lock().unwrap().on_stop_recognizing();
        self.core.signal_interrupt();
        self.core.dispose_connections(reason).await;
    }
}
