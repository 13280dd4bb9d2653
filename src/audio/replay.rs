//! Replay wrapper over an attached audio node
//!
//! Buffers recently-read chunks so that audio already uploaded on a
//! connection that died can be re-read and re-sent on the next one. The
//! buffer is bounded by the fast-lane byte budget; chunks the service has
//! acknowledged are dropped via `shrink`.

use super::{AudioChunk, AudioError, AudioStreamNode};
use std::collections::VecDeque;
use std::sync::Mutex;

struct Buffered {
    buffer: Vec<u8>,
    /// Absolute offset of the chunk's first byte since attach.
    start_offset: u64,
}

struct ReplayState {
    chunks: VecDeque<Buffered>,
    buffered_bytes: u64,
    next_offset: u64,
    /// Index into `chunks` of the next chunk to replay, when replaying.
    replay_cursor: Option<usize>,
}

/// Read-through buffer with rewind.
///
/// `read` serves replayed chunks first, then pulls from the wrapped node,
/// retaining each data chunk until it falls out of the byte budget or is
/// shrunk away.
pub struct ReplayableAudioStream {
    id: String,
    node: tokio::sync::Mutex<Box<dyn AudioStreamNode>>,
    state: Mutex<ReplayState>,
    max_buffered_bytes: u64,
}

impl ReplayableAudioStream {
    pub fn new(node: Box<dyn AudioStreamNode>, max_buffered_bytes: u64) -> Self {
        let id = node.id().to_string();
        Self {
            id,
            node: tokio::sync::Mutex::new(node),
            state: Mutex::new(ReplayState {
                chunks: VecDeque::new(),
                buffered_bytes: 0,
                next_offset: 0,
                replay_cursor: None,
            }),
            max_buffered_bytes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk: a buffered one while replaying, otherwise a fresh read
    /// from the wrapped node.
    pub async fn read(&self) -> Result<AudioChunk, AudioError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(i) = state.replay_cursor {
                if let Some(buffered) = state.chunks.get(i) {
                    let chunk = AudioChunk::data(buffered.buffer.clone());
                    state.replay_cursor = Some(i + 1);
                    return Ok(chunk);
                }
                state.replay_cursor = None;
            }
        }

        let chunk = self.node.lock().await.read().await?;

        if !chunk.is_end && !chunk.buffer.is_empty() {
            let mut state = self.state.lock().unwrap();
            let len = chunk.buffer.len() as u64;
            let start_offset = state.next_offset;
            state.chunks.push_back(Buffered {
                buffer: chunk.buffer.clone(),
                start_offset,
            });
            state.next_offset += len;
            state.buffered_bytes += len;
            while state.buffered_bytes > self.max_buffered_bytes {
                match state.chunks.pop_front() {
                    Some(old) => state.buffered_bytes -= old.buffer.len() as u64,
                    None => break,
                }
            }
        }

        Ok(chunk)
    }

    /// Rewind to the oldest buffered chunk; subsequent reads re-deliver the
    /// buffer before pulling fresh audio.
    pub fn replay(&self) {
        let mut state = self.state.lock().unwrap();
        state.replay_cursor = Some(0);
        log::debug!(
            "Replay: rewound to {} buffered chunks ({} bytes)",
            state.chunks.len(),
            state.buffered_bytes
        );
    }

    /// Drop buffered chunks the service has acknowledged up to the given
    /// absolute byte offset.
    pub fn shrink(&self, acknowledged_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        loop {
            let front_end = match state.chunks.front() {
                Some(front) => front.start_offset + front.buffer.len() as u64,
                None => break,
            };
            if front_end > acknowledged_bytes {
                break;
            }
            if let Some(old) = state.chunks.pop_front() {
                state.buffered_bytes -= old.buffer.len() as u64;
                if let Some(cursor) = state.replay_cursor.as_mut() {
                    *cursor = cursor.saturating_sub(1);
                }
            }
        }
    }

    #[cfg(test)]
    fn buffered_bytes(&self) -> u64 {
        self.state.lock().unwrap().buffered_bytes
    }
}
