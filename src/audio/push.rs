//! Channel-backed audio source
//!
//! Lets the application feed PCM bytes directly: `write` queues a chunk,
//! `close` marks end-of-stream. Attached nodes drain the shared queue, so a
//! reconnect within one recognition keeps reading where the last node
//! stopped.

use super::{
    AudioChunk, AudioDeviceInfo, AudioError, AudioFormat, AudioSource, AudioSourceEvent,
    AudioStreamNode,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 32;

struct Inner {
    id: String,
    format: AudioFormat,
    realtime: bool,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    end_delivered: AtomicBool,
    events: broadcast::Sender<AudioSourceEvent>,
}

/// Application-fed audio source.
///
/// Reports a "Stream" device by default; [`PushAudioSource::realtime`]
/// builds a microphone-style source the pump will never pace with timers.
pub struct PushAudioSource {
    inner: Arc<Inner>,
}

impl PushAudioSource {
    pub fn new(id: impl Into<String>, format: AudioFormat) -> Self {
        Self::build(id.into(), format, false)
    }

    /// A source whose production rate is bounded by wall clock, like a
    /// microphone callback.
    pub fn realtime(id: impl Into<String>, format: AudioFormat) -> Self {
        Self::build(id.into(), format, true)
    }

    fn build(id: String, format: AudioFormat, realtime: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id,
                format,
                realtime,
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                end_delivered: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Queue a chunk of PCM bytes.
    pub fn write(&self, buffer: Vec<u8>) -> Result<(), AudioError> {
        let guard = self.inner.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(buffer)
                .map_err(|_| AudioError::Closed("receiver dropped".to_string())),
            None => Err(AudioError::Closed("source closed".to_string())),
        }
    }

    /// Mark end-of-stream. Pending chunks are still delivered, then readers
    /// observe an end chunk.
    pub fn close(&self) {
        self.inner.tx.lock().unwrap().take();
    }
}

struct PushAudioNode {
    inner: Arc<Inner>,
    node_id: String,
}

#[async_trait]
impl AudioStreamNode for PushAudioNode {
    fn id(&self) -> &str {
        &self.node_id
    }

    async fn read(&mut self) -> Result<AudioChunk, AudioError> {
        let mut rx = self.inner.rx.lock().await;
        match rx.recv().await {
            Some(buffer) => Ok(AudioChunk::data(buffer)),
            None => {
                if self.inner.end_delivered.swap(true, Ordering::SeqCst) {
                    Err(AudioError::Closed("stream already ended".to_string()))
                } else {
                    Ok(AudioChunk::end())
                }
            }
        }
    }
}

#[async_trait]
impl AudioSource for PushAudioSource {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn format(&self) -> AudioFormat {
        self.inner.format
    }

    fn is_realtime(&self) -> bool {
        self.inner.realtime
    }

    async fn device_info(&self) -> AudioDeviceInfo {
        if self.inner.realtime {
            AudioDeviceInfo {
                kind: "Microphones".to_string(),
                ..AudioDeviceInfo::stream(self.inner.format)
            }
        } else {
            AudioDeviceInfo::stream(self.inner.format)
        }
    }

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError> {
        let _ = self.inner.events.send(AudioSourceEvent::NodeAttaching {
            node_id: node_id.to_string(),
        });
        let node = PushAudioNode {
            inner: Arc::clone(&self.inner),
            node_id: node_id.to_string(),
        };
        let _ = self.inner.events.send(AudioSourceEvent::NodeAttached {
            node_id: node_id.to_string(),
        });
        Ok(Box::new(node))
    }

    async fn turn_off(&self) -> Result<(), AudioError> {
        self.close();
        let _ = self.inner.events.send(AudioSourceEvent::SourceOff);
        Ok(())
    }

    fn events(&self) -> Option<broadcast::Receiver<AudioSourceEvent>> {
        Some(self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let source = PushAudioSource::new("mem", AudioFormat::default());
        source.write(vec![1, 2, 3]).unwrap();
        source.write(vec![4, 5]).unwrap();

        let mut node = source.attach("node0").await.unwrap();
        let chunk = node.read().await.unwrap();
        assert_eq!(chunk.buffer, vec![1, 2, 3]);
        assert!(!chunk.is_end);
        let chunk = node.read().await.unwrap();
        assert_eq!(chunk.buffer, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_close_delivers_end_chunk_once() {
        let source = PushAudioSource::new("mem", AudioFormat::default());
        source.write(vec![9]).unwrap();
        source.close();

        let mut node = source.attach("node0").await.unwrap();
        assert_eq!(node.read().await.unwrap().buffer, vec![9]);

        let end = node.read().await.unwrap();
        assert!(end.is_end);
        assert!(end.buffer.is_empty());

        // A second read past the end is an error
        assert!(node.read().await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let source = PushAudioSource::new("mem", AudioFormat::default());
        source.close();
        assert!(source.write(vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_turn_off_emits_event() {
        let source = PushAudioSource::new("mem", AudioFormat::default());
        let mut events = source.events().unwrap();
        source.turn_off().await.unwrap();
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, AudioSourceEvent::SourceOff));
    }

    #[test]
    fn test_realtime_flag() {
        let source = PushAudioSource::realtime("mic", AudioFormat::default());
        assert!(source.is_realtime());
        let source = PushAudioSource::new("mem", AudioFormat::default());
        assert!(!source.is_realtime());
    }
}
