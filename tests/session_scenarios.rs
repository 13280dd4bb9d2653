//! End-to-end scenarios for the session core
//!
//! These tests drive a full recognition against a scripted in-memory
//! transport: the harness records every frame the client sends and lets
//! the test inject service responses, kill the live connection, or make
//! the handshake fail with a chosen status.
//!
//! ## Running
//!
//! ```bash
//! cargo test --test session_scenarios
//! ```

use async_trait::async_trait;
use speechlink::{
    AudioFormat, AuthError, AuthInfo, AuthProvider, CancellationErrorCode, CancellationReason,
    ConnectionEvent, ConnectionState, MessageFrame, PushAudioSource, RecognitionMode,
    RecognizerAdapter, RecognizerConfig, SessionError, SessionEvent, SpeechSession, Transport,
    TransportError, TransportFactory, properties,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

static LOG_INIT: Once = Once::new();

/// Opt into log output with `RUST_LOG=debug cargo test`.
fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    });
}

// ============================================================================
// Scripted service
// ============================================================================

#[derive(Clone)]
struct SentFrame {
    connection_id: String,
    frame: MessageFrame,
}

struct MockService {
    /// Handshake statuses to hand out, in order; empty means 200.
    open_statuses: Mutex<VecDeque<u16>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    sent: Mutex<Vec<SentFrame>>,
}

impl MockService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open_statuses: Mutex::new(VecDeque::new()),
            transports: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn script_open_statuses(&self, statuses: &[u16]) {
        *self.open_statuses.lock().unwrap() = statuses.iter().copied().collect();
    }

    fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    fn latest_transport(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .expect("no transport created yet")
            .clone()
    }

    /// Deliver a service frame on the most recent connection.
    fn respond(&self, frame: MessageFrame) {
        self.latest_transport().push_server(frame);
    }

    /// Wait until the n-th frame matching the predicate has been sent.
    async fn wait_for_nth<F>(&self, n: usize, pred: F) -> SentFrame
    where
        F: Fn(&SentFrame) -> bool,
    {
        timeout(WAIT, async {
            loop {
                {
                    let sent = self.sent.lock().unwrap();
                    if let Some(hit) = sent.iter().filter(|f| pred(f)).nth(n - 1) {
                        return hit.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a sent frame")
    }

    async fn wait_for<F>(&self, pred: F) -> SentFrame
    where
        F: Fn(&SentFrame) -> bool,
    {
        self.wait_for_nth(1, pred).await
    }
}

struct MockTransport {
    connection_id: String,
    service: Arc<MockService>,
    state: Mutex<ConnectionState>,
    /// When set, sends fail while the connection still reports Connected.
    fail_sends: AtomicBool,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<MessageFrame>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageFrame>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MockTransport {
    fn new(connection_id: &str, service: Arc<MockService>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connection_id: connection_id.to_string(),
            service,
            state: Mutex::new(ConnectionState::None),
            fail_sends: AtomicBool::new(false),
            incoming_tx: Mutex::new(Some(tx)),
            incoming_rx: tokio::sync::Mutex::new(rx),
            events,
        })
    }

    fn push_server(&self, frame: MessageFrame) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Simulate an abrupt mid-stream disconnect.
    fn kill(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.incoming_tx.lock().unwrap().take();
        let _ = self.events.send(ConnectionEvent::Closed {
            connection_id: self.connection_id.clone(),
            status: None,
            reason: "connection dropped".to_string(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.connection_id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn open(&self) -> Result<u16, TransportError> {
        let status = self
            .service
            .open_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(200);
        if status == 200 {
            *self.state.lock().unwrap() = ConnectionState::Connected;
            let _ = self.events.send(ConnectionEvent::Established {
                connection_id: self.connection_id.clone(),
            });
        } else {
            *self.state.lock().unwrap() = ConnectionState::Disconnected;
        }
        Ok(status)
    }

    async fn send(&self, frame: MessageFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::Send("connection is not open".to_string()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected send failure".to_string()));
        }
        self.service.sent.lock().unwrap().push(SentFrame {
            connection_id: self.connection_id.clone(),
            frame,
        });
        Ok(())
    }

    async fn read(&self) -> Result<Option<MessageFrame>, TransportError> {
        Ok(self.incoming_rx.lock().await.recv().await)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self, _reason: &str) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.incoming_tx.lock().unwrap().take();
    }
}

struct MockFactory {
    service: Arc<MockService>,
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        _config: &RecognizerConfig,
        _auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = MockTransport::new(connection_id, self.service.clone());
        self.service
            .transports
            .lock()
            .unwrap()
            .push(transport.clone());
        Ok(transport)
    }
}

struct MockAuth {
    fetches: AtomicU32,
    expiry_fetches: AtomicU32,
}

impl MockAuth {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicU32::new(0),
            expiry_fetches: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn fetch(&self, _id: &str) -> Result<AuthInfo, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AuthInfo {
            header_name: "Authorization".to_string(),
            token: "Bearer token-1".to_string(),
        })
    }

    async fn fetch_on_expiry(&self, _id: &str) -> Result<AuthInfo, AuthError> {
        self.expiry_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AuthInfo {
            header_name: "Authorization".to_string(),
            token: "Bearer token-2".to_string(),
        })
    }
}

#[derive(Default)]
struct CollectingAdapter {
    frames: Mutex<Vec<MessageFrame>>,
    cancels: Mutex<Vec<(CancellationReason, CancellationErrorCode, String)>>,
    /// When set, `process_message` fails on this path.
    fail_on: Mutex<Option<String>>,
}

impl RecognizerAdapter for CollectingAdapter {
    fn process_message(&self, frame: &MessageFrame) -> Result<(), SessionError> {
        if let Some(path) = self.fail_on.lock().unwrap().as_deref() {
            if frame.path.eq_ignore_ascii_case(path) {
                return Err(SessionError::Protocol(format!(
                    "injected failure on {}",
                    path
                )));
            }
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn cancel_recognition(
        &self,
        _session_id: &str,
        _request_id: &str,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: &str,
    ) {
        self.cancels
            .lock()
            .unwrap()
            .push((reason, code, message.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    service: Arc<MockService>,
    auth: Arc<MockAuth>,
    adapter: Arc<CollectingAdapter>,
    source: Arc<PushAudioSource>,
    session: Arc<SpeechSession>,
}

impl Harness {
    fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        init_logging();
        let service = MockService::new();
        let auth = MockAuth::new();
        let adapter = Arc::new(CollectingAdapter::default());
        let source = Arc::new(PushAudioSource::new("source-0", AudioFormat::default()));
        let config = RecognizerConfig::new()
            .with_property(properties::ENDPOINT, "wss://speech.test.local/reco/v1")
            .with_property(properties::RECO_LANGUAGE, "en-US");

        let (session, events) = SpeechSession::new(
            config,
            auth.clone(),
            Arc::new(MockFactory {
                service: service.clone(),
            }),
            source.clone(),
            adapter.clone(),
        )
        .expect("session construction");

        (
            Self {
                service,
                auth,
                adapter,
                source,
                session: Arc::new(session),
            },
            events,
        )
    }

    fn spawn_recognize(
        &self,
        mode: RecognitionMode,
    ) -> tokio::task::JoinHandle<Result<bool, SessionError>> {
        let session = self.session.clone();
        tokio::spawn(async move { session.recognize(mode).await })
    }

    /// Feed one second of 16 kHz/16-bit mono audio in 100 ms chunks, each
    /// filled with its index so replays can be told apart.
    fn write_one_second(&self) {
        for i in 0..10u8 {
            self.source.write(vec![i; 3200]).unwrap();
        }
    }

    /// Script the service side of a complete turn ending the session.
    fn respond_full_turn(&self, request_id: &str, end_offset: u64) {
        self.service.respond(turn_start(request_id));
        self.service
            .respond(detected(speechlink::protocol::paths::SPEECH_START_DETECTED, request_id, 0));
        self.service.respond(MessageFrame::text(
            "speech.phrase",
            request_id,
            r#"{"RecognitionStatus":"Success","DisplayText":"hello world","Offset":0,"Duration":9500000}"#,
        ));
        self.service.respond(detected(
            speechlink::protocol::paths::SPEECH_END_DETECTED,
            request_id,
            end_offset,
        ));
        self.service.respond(turn_end(request_id));
    }
}

fn turn_start(request_id: &str) -> MessageFrame {
    MessageFrame::text(
        speechlink::protocol::paths::TURN_START,
        request_id,
        r#"{"context":{"serviceTag":"mock"}}"#,
    )
}

fn turn_end(request_id: &str) -> MessageFrame {
    MessageFrame::text(speechlink::protocol::paths::TURN_END, request_id, "")
}

fn detected(path: &str, request_id: &str, offset: u64) -> MessageFrame {
    MessageFrame::text(path, request_id, format!(r#"{{"Offset":{}}}"#, offset))
}

fn is_audio(frame: &SentFrame) -> bool {
    frame.frame.path == "audio" && !frame.frame.body.is_empty()
}

fn is_path(frame: &SentFrame, path: &str) -> bool {
    frame.frame.path == path
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn single_shot_happy_path() {
    let (h, mut events) = Harness::new();
    h.write_one_second();
    h.source.close();

    let recognize = h.spawn_recognize(RecognitionMode::SingleShot);

    let eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    let request_id = eos.frame.request_id.clone();
    h.respond_full_turn(&request_id, 10_000_000);

    let done = recognize.await.unwrap().unwrap();
    assert!(done);

    // Handshake ordering: config first, then context, then audio.
    let sent = h.service.sent_frames();
    let config_idx = sent.iter().position(|f| is_path(f, "speech.config")).unwrap();
    let context_idx = sent
        .iter()
        .position(|f| is_path(f, "speech.context"))
        .unwrap();
    let first_audio_idx = sent.iter().position(is_audio).unwrap();
    assert!(config_idx < context_idx);
    assert!(context_idx < first_audio_idx);
    assert_eq!(sent[0].frame.path, "speech.config");

    // One config, one context, ten audio frames, one end-of-audio marker.
    assert_eq!(sent.iter().filter(|f| is_path(f, "speech.config")).count(), 1);
    assert_eq!(sent.iter().filter(|f| is_path(f, "speech.context")).count(), 1);
    assert_eq!(sent.iter().filter(|f| is_audio(f)).count(), 10);
    assert_eq!(
        sent.iter().filter(|f| f.frame.is_end_of_audio()).count(),
        1
    );

    // Event order as observed by the caller.
    let events = drain_events(&mut events);
    let interesting: Vec<&SessionEvent> = events
        .iter()
        .filter(|e| {
            !matches!(
                e,
                SessionEvent::ConnectionEstablished { .. } | SessionEvent::ConnectionClosed { .. }
            )
        })
        .collect();
    assert!(matches!(interesting[0], SessionEvent::SessionStarted { .. }));
    assert!(
        matches!(interesting[1], SessionEvent::SpeechStartDetected { offset: 0, .. }),
        "expected speech start, got {:?}",
        interesting[1]
    );
    assert!(matches!(
        interesting[2],
        SessionEvent::SpeechEndDetected {
            offset: 10_000_000,
            ..
        }
    ));
    assert!(matches!(interesting[3], SessionEvent::Canceled { .. }));
    assert!(matches!(
        interesting.last().unwrap(),
        SessionEvent::SessionStopped { .. }
    ));

    // The phrase went to the adapter, and end-of-stream was reported once.
    assert_eq!(h.adapter.frames.lock().unwrap().len(), 1);
    let cancels = h.adapter.cancels.lock().unwrap();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, CancellationReason::EndOfStream);
    assert_eq!(cancels[0].1, CancellationErrorCode::NoError);
}

#[tokio::test]
async fn continuous_two_turns_accumulates_offsets() {
    let (h, mut events) = Harness::new();
    h.write_one_second();

    let recognize = h.spawn_recognize(RecognitionMode::Continuous);

    // Turn 1: all ten audio frames out, then the service ends the turn.
    let context1 = h.service.wait_for(|f| is_path(f, "speech.context")).await;
    let request1 = context1.frame.request_id.clone();
    h.service.wait_for_nth(10, is_audio).await;
    h.service.respond(turn_start(&request1));
    h.service.respond(detected(
        speechlink::protocol::paths::SPEECH_END_DETECTED,
        &request1,
        10_000_000,
    ));
    h.service.respond(turn_end(&request1));

    // The client rolls into turn 2 with a fresh request id and context.
    let context2 = h
        .service
        .wait_for_nth(2, |f| is_path(f, "speech.context"))
        .await;
    let request2 = context2.frame.request_id.clone();
    assert_ne!(request1, request2);

    // Turn 2: another second of audio, then end-of-stream.
    h.write_one_second();
    h.source.close();
    let _eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    h.service.respond(turn_start(&request2));
    h.service.respond(detected(
        speechlink::protocol::paths::SPEECH_END_DETECTED,
        &request2,
        10_000_000,
    ));
    h.service.respond(turn_end(&request2));

    let done = recognize.await.unwrap().unwrap();
    assert!(done);

    // Exactly one config on the surviving connection, one context per turn.
    let sent = h.service.sent_frames();
    assert_eq!(sent.iter().filter(|f| is_path(f, "speech.config")).count(), 1);
    assert_eq!(sent.iter().filter(|f| is_path(f, "speech.context")).count(), 2);

    // The second end-of-speech event is session-relative.
    let offsets: Vec<u64> = drain_events(&mut events)
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SpeechEndDetected { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![10_000_000, 20_000_000]);
}

#[tokio::test]
async fn forbidden_then_ok_refreshes_credentials_once() {
    let (h, _events) = Harness::new();
    h.service.script_open_statuses(&[403, 200]);
    h.write_one_second();
    h.source.close();

    let recognize = h.spawn_recognize(RecognitionMode::SingleShot);

    let eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    h.respond_full_turn(&eos.frame.request_id, 10_000_000);

    let done = recognize.await.unwrap().unwrap();
    assert!(done);

    // One plain fetch, one expiry fetch, two distinct connections.
    assert_eq!(h.auth.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.auth.expiry_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.service.transport_count(), 2);
    let transports = h.service.transports.lock().unwrap();
    assert_ne!(transports[0].connection_id, transports[1].connection_id);

    // No user-visible error was reported.
    let cancels = h.adapter.cancels.lock().unwrap();
    assert!(cancels
        .iter()
        .all(|(reason, _, _)| *reason == CancellationReason::EndOfStream));
}

#[tokio::test]
async fn mid_stream_disconnect_redials_and_replays() {
    let (h, _events) = Harness::new();
    h.write_one_second();

    let recognize = h.spawn_recognize(RecognitionMode::SingleShot);

    // Let a few frames out, then drop the connection under the client.
    h.service.wait_for_nth(3, is_audio).await;
    let first_connection = h.service.latest_transport().connection_id.clone();
    h.service.latest_transport().kill();

    // A second connection is dialed and fully re-configured.
    let config2 = h
        .service
        .wait_for(|f| is_path(f, "speech.config") && f.connection_id != first_connection)
        .await;
    let second_connection = config2.connection_id.clone();
    h.service
        .wait_for(|f| is_path(f, "speech.context") && f.connection_id == second_connection)
        .await;

    // Finish the stream so the pump drains everything onto the new
    // connection.
    h.source.close();

    // Replay: the new connection starts again from the first chunk.
    let first_on_old = h.service.wait_for(is_audio).await;
    let first_on_new = h
        .service
        .wait_for(|f| is_audio(f) && f.connection_id == second_connection)
        .await;
    assert_eq!(first_on_old.frame.body, first_on_new.frame.body);

    let eos = h
        .service
        .wait_for(|f| f.frame.is_end_of_audio() && f.connection_id == second_connection)
        .await;
    h.respond_full_turn(&eos.frame.request_id, 10_000_000);

    let done = recognize.await.unwrap().unwrap();
    assert!(done);

    // Invisible to the user: nothing but the end-of-stream report.
    let cancels = h.adapter.cancels.lock().unwrap();
    assert!(cancels
        .iter()
        .all(|(reason, _, _)| *reason == CancellationReason::EndOfStream));
}

#[tokio::test]
async fn stop_recognizing_sends_final_frame_and_settles() {
    let (h, _events) = Harness::new();
    h.write_one_second();

    let recognize = h.spawn_recognize(RecognitionMode::Continuous);
    h.service.wait_for_nth(3, is_audio).await;

    h.session.stop_recognizing().await.unwrap();

    // Both loops settle promptly.
    let done = timeout(WAIT, recognize).await.unwrap().unwrap().unwrap();
    assert!(done);

    // Telemetry flushed, then the end-of-audio marker.
    let sent = h.service.sent_frames();
    let telemetry_idx = sent.iter().position(|f| is_path(f, "telemetry")).unwrap();
    let eos_idx = sent
        .iter()
        .position(|f| f.frame.is_end_of_audio())
        .unwrap();
    assert!(telemetry_idx < eos_idx);

    // Nothing further leaves the client.
    let count = sent.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.sent_frames().len(), count);
}

#[tokio::test]
async fn superseding_recognize_stops_prior_pump() {
    let (h, _events) = Harness::new();
    h.write_one_second();

    let first = h.spawn_recognize(RecognitionMode::Continuous);
    let context1 = h.service.wait_for(|f| is_path(f, "speech.context")).await;
    h.service.wait_for_nth(3, is_audio).await;
    let first_session_id = h.session.session_id();

    // Supersede while the first recognition is mid-stream.
    let second = h.spawn_recognize(RecognitionMode::Continuous);

    // The first recognize future settles without an error.
    let first_done = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert!(first_done);
    assert_ne!(h.session.session_id(), first_session_id);

    // The new recognition re-establishes the configured connection: a
    // second context with a fresh request id.
    let context2 = h
        .service
        .wait_for_nth(2, |f| is_path(f, "speech.context"))
        .await;
    assert_ne!(context1.frame.request_id, context2.frame.request_id);

    // Wind the second recognition down.
    h.source.close();
    let eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    assert_eq!(eos.frame.request_id, context2.frame.request_id);
    h.respond_full_turn(&eos.frame.request_id, 10_000_000);
    let second_done = timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    assert!(second_done);
}

#[tokio::test]
async fn upstream_send_failure_resolves_false_with_runtime_error() {
    let (h, mut events) = Harness::new();
    h.source.write(vec![0u8; 3200]).unwrap();

    let recognize = h.spawn_recognize(RecognitionMode::Continuous);

    // Let one frame through, then make sends fail while the connection
    // still looks healthy, so the pump cannot recover by redialing.
    h.service.wait_for(is_audio).await;
    h.service
        .latest_transport()
        .fail_sends
        .store(true, Ordering::SeqCst);
    h.source.write(vec![1u8; 3200]).unwrap();

    let done = timeout(WAIT, recognize).await.unwrap().unwrap().unwrap();
    assert!(!done, "a failed recognition must not resolve true");

    let cancels = h.adapter.cancels.lock().unwrap();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, CancellationReason::Error);
    assert_eq!(cancels[0].1, CancellationErrorCode::RuntimeError);
    drop(cancels);

    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::Canceled {
            code: CancellationErrorCode::RuntimeError,
            ..
        }
    )));
}

#[tokio::test]
async fn adapter_failure_resolves_false_with_runtime_error() {
    let (h, _events) = Harness::new();
    h.adapter
        .fail_on
        .lock()
        .unwrap()
        .replace("speech.phrase".to_string());
    h.write_one_second();
    h.source.close();

    let recognize = h.spawn_recognize(RecognitionMode::SingleShot);
    let eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    h.respond_full_turn(&eos.frame.request_id, 10_000_000);

    let done = timeout(WAIT, recognize).await.unwrap().unwrap().unwrap();
    assert!(!done, "a failed recognition must not resolve true");

    let cancels = h.adapter.cancels.lock().unwrap();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, CancellationReason::Error);
    assert_eq!(cancels[0].1, CancellationErrorCode::RuntimeError);
}

#[tokio::test]
async fn concurrent_connects_share_one_dial() {
    let (h, _events) = Harness::new();
    let a = h.session.clone();
    let b = h.session.clone();
    let (ra, rb) = tokio::join!(a.connect(), b.connect());
    ra.unwrap();
    rb.unwrap();
    assert_eq!(h.service.transport_count(), 1);
}

#[tokio::test]
async fn stale_request_ids_are_ignored() {
    let (h, mut events) = Harness::new();
    h.write_one_second();
    h.source.close();

    let recognize = h.spawn_recognize(RecognitionMode::SingleShot);
    let eos = h.service.wait_for(|f| f.frame.is_end_of_audio()).await;
    let request_id = eos.frame.request_id.clone();

    // A leftover event from some other turn must not reach the caller.
    h.service.respond(detected(
        speechlink::protocol::paths::SPEECH_START_DETECTED,
        "ffffffffffffffffffffffffffffffff",
        42,
    ));
    h.respond_full_turn(&request_id, 10_000_000);

    assert!(recognize.await.unwrap().unwrap());
    let starts: Vec<u64> = drain_events(&mut events)
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SpeechStartDetected { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![0]);
}

#[tokio::test]
async fn construction_requires_endpoint() {
    init_logging();
    let service = MockService::new();
    let result = SpeechSession::new(
        RecognizerConfig::new(), // endpoint missing
        MockAuth::new(),
        Arc::new(MockFactory { service }),
        Arc::new(PushAudioSource::new("source-0", AudioFormat::default())),
        Arc::new(CollectingAdapter::default()),
    );
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
}
