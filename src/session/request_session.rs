//! Per-recognition state
//!
//! Pure in-memory record of the active recognition: identifiers, counters,
//! flags, and the telemetry accumulator. No I/O; every operation is short
//! and non-suspending, so the owning mutex is never held across an await.

use super::new_hex_id;
use crate::telemetry::{TelemetryCollector, TelemetryPayload};

/// State of the recognition currently driving the session.
///
/// Created once with the core and reused: `start_new_recognition` resets it
/// and bumps `recog_number`, which in-flight pumps use to detect that they
/// have been superseded.
pub struct RequestSession {
    audio_source_id: String,
    session_id: String,
    request_id: String,
    audio_node_id: Option<String>,
    recog_number: u64,
    bytes_sent: u64,
    current_turn_audio_offset: u64,
    is_recognizing: bool,
    is_speech_ended: bool,
    telemetry_enabled: bool,
    telemetry: TelemetryCollector,
}

impl RequestSession {
    pub fn new(audio_source_id: impl Into<String>, telemetry_enabled: bool) -> Self {
        Self {
            audio_source_id: audio_source_id.into(),
            session_id: new_hex_id(),
            request_id: new_hex_id(),
            audio_node_id: None,
            recog_number: 0,
            bytes_sent: 0,
            current_turn_audio_offset: 0,
            is_recognizing: false,
            is_speech_ended: false,
            telemetry_enabled,
            telemetry: TelemetryCollector::new(telemetry_enabled),
        }
    }

    pub fn audio_source_id(&self) -> &str {
        &self.audio_source_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn recog_number(&self) -> u64 {
        self.recog_number
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Audio offset (100-ns ticks) accumulated across concluded turns of
    /// one continuous recognition.
    pub fn current_turn_audio_offset(&self) -> u64 {
        self.current_turn_audio_offset
    }

    pub fn is_recognizing(&self) -> bool {
        self.is_recognizing
    }

    pub fn is_speech_ended(&self) -> bool {
        self.is_speech_ended
    }

    /// Begin a fresh recognition: new ids, reset counters and flags, and a
    /// bumped `recog_number` that invalidates any in-flight pump.
    pub fn start_new_recognition(&mut self) {
        self.session_id = new_hex_id();
        self.request_id = new_hex_id();
        self.audio_node_id = None;
        self.recog_number += 1;
        self.bytes_sent = 0;
        self.current_turn_audio_offset = 0;
        self.is_recognizing = true;
        self.is_speech_ended = false;
        self.telemetry = TelemetryCollector::new(self.telemetry_enabled);
        log::info!(
            "Session {}: recognition {} started (request {})",
            self.session_id,
            self.recog_number,
            self.request_id
        );
    }

    pub fn on_pre_connection_start(&mut self, auth_fetch_event_id: &str, connection_id: &str) {
        self.telemetry.auth_started(auth_fetch_event_id);
        self.telemetry.connection_started(connection_id);
    }

    pub fn on_auth_completed(&mut self, error: Option<&str>) {
        self.telemetry.auth_completed(error);
    }

    pub fn on_connection_establish_completed(&mut self, status: u16, reason: Option<&str>) {
        self.telemetry.connection_completed(status, reason);
    }

    pub fn on_audio_source_attach_completed(&mut self, node_id: &str, is_replay: bool) {
        self.audio_node_id = Some(node_id.to_string());
        self.telemetry.service_event(if is_replay {
            "audio.nodereattached"
        } else {
            "audio.nodeattached"
        });
    }

    pub fn on_audio_sent(&mut self, bytes: u64) {
        if self.bytes_sent == 0 && bytes > 0 {
            self.telemetry.first_audio_sent();
        }
        self.bytes_sent += bytes;
    }

    /// Advance the session-relative audio offset after the service reported
    /// the end of speech for a turn (continuous mode only).
    pub fn on_service_recognized(&mut self, offset_ticks: u64) {
        self.current_turn_audio_offset += offset_ticks;
    }

    /// React to `turn.end`: continuous recognitions roll into a new turn
    /// with a fresh request id; single-shot (or speech-ended) recognitions
    /// stop.
    pub fn on_service_turn_end_response(&mut self, continuous: bool) {
        if continuous && !self.is_speech_ended {
            self.request_id = new_hex_id();
            self.bytes_sent = 0;
            self.telemetry.reset_turn();
            log::debug!(
                "Session {}: new turn, request {}",
                self.session_id,
                self.request_id
            );
        } else {
            self.is_recognizing = false;
        }
    }

    pub fn on_speech_ended(&mut self) {
        self.is_speech_ended = true;
    }

    pub fn on_stop_recognizing(&mut self) {
        self.is_recognizing = false;
    }

    pub fn on_message_received(&mut self, path: &str) {
        self.telemetry.message_received(path);
        if path.to_ascii_lowercase().ends_with(".phrase") {
            self.telemetry.phrase_received();
        }
    }

    /// Record a transport or audio-source event observed while listening.
    pub fn on_service_event(&mut self, label: &str) {
        self.telemetry.service_event(label);
    }

    /// Take the accumulated telemetry; `None` when there is nothing to
    /// flush.
    pub fn drain_telemetry(&mut self) -> Option<TelemetryPayload> {
        self.telemetry.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> RequestSession {
        let mut session = RequestSession::new("source-0", true);
        session.start_new_recognition();
        session
    }

    #[test]
    fn test_ids_are_32_hex() {
        let session = started();
        for id in [session.session_id(), session.request_id()] {
            assert_eq!(id.len(), 32);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_start_new_recognition_resets() {
        let mut session = started();
        session.on_audio_sent(1000);
        session.on_speech_ended();
        let first_session_id = session.session_id().to_string();
        let first_recog = session.recog_number();

        session.start_new_recognition();
        assert_ne!(session.session_id(), first_session_id);
        assert_eq!(session.recog_number(), first_recog + 1);
        assert_eq!(session.bytes_sent(), 0);
        assert!(session.is_recognizing());
        assert!(!session.is_speech_ended());
    }

    #[test]
    fn test_turn_end_single_shot_stops() {
        let mut session = started();
        session.on_service_turn_end_response(false);
        assert!(!session.is_recognizing());
    }

    #[test]
    fn test_turn_end_continuous_rolls_request_id() {
        let mut session = started();
        let first_request = session.request_id().to_string();
        session.on_audio_sent(500);

        session.on_service_turn_end_response(true);
        assert!(session.is_recognizing());
        assert_ne!(session.request_id(), first_request);
        assert_eq!(session.bytes_sent(), 0);
    }

    #[test]
    fn test_turn_end_continuous_after_speech_end_stops() {
        let mut session = started();
        session.on_speech_ended();
        session.on_service_turn_end_response(true);
        assert!(!session.is_recognizing());
    }

    #[test]
    fn test_turn_offset_accumulates_across_turns() {
        let mut session = started();
        // Two turns, each ending 1 s into its audio
        session.on_service_recognized(10_000_000);
        session.on_service_turn_end_response(true);
        assert_eq!(session.current_turn_audio_offset(), 10_000_000);

        session.on_service_recognized(10_000_000);
        assert_eq!(session.current_turn_audio_offset(), 20_000_000);
    }

    #[test]
    fn test_phrase_path_marks_telemetry() {
        let mut session = started();
        session.on_message_received("speech.Phrase");
        let payload = session.drain_telemetry().unwrap();
        assert!(payload
            .metrics
            .iter()
            .any(|m| m.name == crate::telemetry::metrics::PHRASE));
    }
}
