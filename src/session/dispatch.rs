//! Downstream message dispatch
//!
//! Reads framed messages off the connection and routes the protocol
//! control paths; everything else goes to the recognizer adapter.
//! Resolves `true` when the turn (single-shot) or the session (continuous)
//! ends, or when the core is disposed. Messages for a request id other
//! than the current one belong to a past turn and are dropped.

use super::controller::SessionCore;
use super::{CancellationErrorCode, CancellationReason, SessionError, SessionEvent};
use crate::audio::ReplayableAudioStream;
use crate::config::RecognitionMode;
use crate::protocol::{paths, DetectedSpeech};
use crate::transport::ConnectionState;
use std::sync::Arc;

pub(crate) async fn run_downstream(
    core: Arc<SessionCore>,
    audio: Arc<ReplayableAudioStream>,
) -> Result<bool, SessionError> {
    let format = core.source.format();
    let start_recog = core.session.lock().unwrap().recog_number();
    let mut interrupts = core.interrupt_watch();
    let mut must_report_end_of_stream = false;

    loop {
        if core.is_disposed() {
            return Ok(true);
        }
        if core.session.lock().unwrap().recog_number() != start_recog {
            // A newer recognition took over; its own loops serve it.
            return Ok(true);
        }

        let conn = core.configure().await?;

        let message = tokio::select! {
            read = conn.read() => match read {
                Ok(message) => message,
                Err(e) => {
                    let recognizing = core.session.lock().unwrap().is_recognizing();
                    if recognizing && conn.state() == ConnectionState::Disconnected {
                        log::warn!("Downstream: read failed on a dead connection, redialing: {}", e);
                        continue;
                    }
                    return Err(SessionError::Transport(e.to_string()));
                }
            },
            _ = interrupts.changed() => {
                let session = core.session.lock().unwrap();
                if !session.is_recognizing() || session.recog_number() != start_recog {
                    return Ok(true);
                }
                continue;
            }
        };

        let Some(frame) = message else {
            // The read queue is draining. Done if no longer recognizing;
            // otherwise keep listening (the next configure redials).
            if !core.session.lock().unwrap().is_recognizing() {
                return Ok(true);
            }
            continue;
        };

        {
            let mut session = core.session.lock().unwrap();
            session.on_message_received(&frame.path);
            if !frame.request_id.eq_ignore_ascii_case(session.request_id()) {
                log::debug!(
                    "Downstream: dropping {} for stale request {}",
                    frame.path,
                    frame.request_id
                );
                continue;
            }
        }

        let path = frame.path.to_ascii_lowercase();
        match path.as_str() {
            paths::TURN_START => {
                must_report_end_of_stream = true;
            }

            paths::SPEECH_START_DETECTED => {
                let detected = DetectedSpeech::parse(&frame.body_text());
                let session_id = core.session.lock().unwrap().session_id().to_string();
                core.emit(SessionEvent::SpeechStartDetected {
                    session_id,
                    offset: detected.offset,
                });
            }

            paths::SPEECH_END_DETECTED => {
                let detected = DetectedSpeech::parse(&frame.body_text());
                let continuous = core.mode() == RecognitionMode::Continuous;
                let (session_id, absolute_offset) = {
                    let mut session = core.session.lock().unwrap();
                    // Emit the session-relative offset, then roll the turn
                    // base forward for the next turn.
                    let absolute = session.current_turn_audio_offset() + detected.offset;
                    if continuous {
                        session.on_service_recognized(detected.offset);
                    }
                    (session.session_id().to_string(), absolute)
                };
                // Everything up to the detected end has been heard; the
                // replay buffer no longer needs it.
                audio.shrink(format.ticks_to_bytes(absolute_offset));
                core.emit(SessionEvent::SpeechEndDetected {
                    session_id,
                    offset: absolute_offset,
                });
            }

            paths::TURN_END => {
                core.flush_telemetry(&conn).await;

                let continuous = core.mode() == RecognitionMode::Continuous;
                let speech_ended = core.session.lock().unwrap().is_speech_ended();

                if speech_ended && must_report_end_of_stream {
                    must_report_end_of_stream = false;
                    core.cancel_local(
                        CancellationReason::EndOfStream,
                        CancellationErrorCode::NoError,
                        "end of audio stream reached",
                    )
                    .await;
                }

                core.session
                    .lock()
                    .unwrap()
                    .on_service_turn_end_response(continuous);

                if !continuous || speech_ended {
                    let session_id = core.session.lock().unwrap().session_id().to_string();
                    core.signal_interrupt();
                    core.emit(SessionEvent::SessionStopped { session_id });
                    return Ok(true);
                }

                // Next turn: the fresh request id needs its context on the
                // wire, via the configurator so that a silently-replaced
                // connection gets its config re-sent too.
                core.reset_configured();
                core.configure().await?;
            }

            _ => {
                core.adapter.process_message(&frame)?;
            }
        }
    }
}
