//! Upstream audio pump
//!
//! Reads chunks from the replayable stream and uploads them as binary
//! frames until end-of-stream, cancellation, or supersession. The first
//! fast-lane bytes go out unpaced so the service warms up quickly; after
//! that, non-realtime sources are throttled towards twice real-time.
//! Realtime sources are never delayed by a timer: a coalesced timer in a
//! backgrounded host would starve the pump and inflate latency without
//! bound.

use super::controller::SessionCore;
use super::SessionError;
use crate::audio::ReplayableAudioStream;
use crate::protocol::paths;
use crate::transport::{ConnectionState, MessageFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Delay after sending `len` bytes so the stream tracks twice real-time.
/// The factor of two keeps a mild prefetch ahead of the service.
fn pace_delay_ms(len: u64, avg_bytes_per_sec: u64) -> u64 {
    if avg_bytes_per_sec == 0 {
        return 0;
    }
    len * 1000 / (avg_bytes_per_sec * 2)
}

pub(crate) async fn run_upstream(
    core: Arc<SessionCore>,
    audio: Arc<ReplayableAudioStream>,
) -> Result<(), SessionError> {
    let format = core.source.format();
    let realtime = core.source.is_realtime();
    let avg_bytes = u64::from(format.avg_bytes_per_sec());
    let fast_lane_bytes = avg_bytes * core.config.transmit_length_before_throttle_ms() / 1000;

    let start_recog = core.session.lock().unwrap().recog_number();
    let mut interrupts = core.interrupt_watch();
    let mut last_connection_id: Option<String> = None;
    let mut next_send = Instant::now();

    log::debug!(
        "Upstream: starting (fast lane {} bytes, realtime: {})",
        fast_lane_bytes,
        realtime
    );

    loop {
        if core.is_disposed() {
            return Ok(());
        }
        {
            let session = core.session.lock().unwrap();
            if session.is_speech_ended()
                || !session.is_recognizing()
                || session.recog_number() != start_recog
            {
                return Ok(());
            }
        }

        let chunk = tokio::select! {
            read = audio.read() => match read {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Once the stream has ended, a failing read is only the
                    // source draining.
                    if core.session.lock().unwrap().is_speech_ended() {
                        return Ok(());
                    }
                    return Err(SessionError::Audio(e.to_string()));
                }
            },
            _ = interrupts.changed() => continue,
        };

        // A stop or supersession that landed during the read must not
        // produce another frame.
        {
            let session = core.session.lock().unwrap();
            if session.is_speech_ended()
                || !session.is_recognizing()
                || session.recog_number() != start_recog
            {
                return Ok(());
            }
        }

        let bytes_sent = core.session.lock().unwrap().bytes_sent();
        if !realtime && !chunk.is_end && bytes_sent > fast_lane_bytes {
            tokio::select! {
                _ = tokio::time::sleep_until(next_send) => {}
                _ = interrupts.changed() => continue,
            }
        }

        let conn = core.configure().await?;

        let replaced = last_connection_id
            .as_deref()
            .is_some_and(|previous| previous != conn.id());
        last_connection_id = Some(conn.id().to_string());
        if replaced {
            // The connection was replaced underneath us; rewind so the
            // service receives everything it missed. The chunk just read
            // is buffered and comes back on the next cycle.
            log::info!("Upstream: connection replaced, replaying buffered audio");
            audio.replay();
            continue;
        }

        let request_id = core.session.lock().unwrap().request_id().to_string();

        if chunk.is_end {
            conn.send(MessageFrame::binary(paths::AUDIO, &request_id, Vec::new()))
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            core.session.lock().unwrap().on_speech_ended();
            log::info!("Upstream: end of audio stream signalled");
            return Ok(());
        }

        let len = chunk.buffer.len() as u64;
        if let Err(e) = conn
            .send(MessageFrame::binary(paths::AUDIO, &request_id, chunk.buffer))
            .await
        {
            if conn.state() == ConnectionState::Disconnected {
                // The chunk stays in the replay buffer; the next cycle
                // redials and rewinds.
                log::warn!("Upstream: send failed on a dead connection, redialing: {}", e);
                continue;
            }
            return Err(SessionError::Transport(e.to_string()));
        }
        core.session.lock().unwrap().on_audio_sent(len);

        next_send = Instant::now() + Duration::from_millis(pace_delay_ms(len, avg_bytes));
    }
}
