//! Audio-source abstractions consumed by the session core
//!
//! Capture and decoding live outside this crate; the core only needs a
//! stream of binary chunks plus format and device metadata. The traits here
//! are the seam: `AudioSource` hands out `AudioStreamNode`s, and the session
//! wraps each node in a [`ReplayableAudioStream`] so a mid-stream reconnect
//! can re-send bytes the service never saw.

mod push;
mod replay;

pub use push::PushAudioSource;
pub use replay::ReplayableAudioStream;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// PCM format of the upstream audio, used for pacing arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct AudioFormat {
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        // 16 kHz 16-bit mono PCM, the service's preferred input
        Self {
            samples_per_sec: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Nominal byte rate of the stream.
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.samples_per_sec * u32::from(self.bits_per_sample) / 8 * u32::from(self.channels)
    }

    /// Convert a service offset (100-ns ticks) into a byte offset.
    pub fn ticks_to_bytes(&self, ticks: u64) -> u64 {
        ticks * u64::from(self.avg_bytes_per_sec()) / 10_000_000
    }
}

/// Device descriptor installed under `audio.source` in the context and
/// config payloads.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// Device category, e.g. "Microphones", "File", "Stream".
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub connectivity: String,
    pub manufacturer: String,
    pub samplerate: u32,
    pub bitspersample: u16,
    pub channelcount: u16,
}

impl AudioDeviceInfo {
    /// Descriptor for a non-device stream with the given format.
    pub fn stream(format: AudioFormat) -> Self {
        Self {
            kind: "Stream".to_string(),
            model: String::new(),
            connectivity: String::new(),
            manufacturer: String::new(),
            samplerate: format.samples_per_sec,
            bitspersample: format.bits_per_sample,
            channelcount: format.channels,
        }
    }
}

/// One read result from an audio node. `is_end` marks end-of-stream; the
/// buffer may be empty in that case.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub buffer: Vec<u8>,
    pub is_end: bool,
}

impl AudioChunk {
    pub fn data(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            is_end: false,
        }
    }

    pub fn end() -> Self {
        Self {
            buffer: Vec::new(),
            is_end: true,
        }
    }
}

/// Lifecycle events a source may publish; the session records them in
/// telemetry.
#[derive(Debug, Clone)]
pub enum AudioSourceEvent {
    SourceReady,
    NodeAttaching { node_id: String },
    NodeAttached { node_id: String },
    NodeDetached { node_id: String },
    SourceOff,
    SourceError { message: String },
}

impl AudioSourceEvent {
    /// Stable label used as the telemetry key for this event.
    pub fn label(&self) -> &'static str {
        match self {
            AudioSourceEvent::SourceReady => "audio.sourceready",
            AudioSourceEvent::NodeAttaching { .. } => "audio.nodeattaching",
            AudioSourceEvent::NodeAttached { .. } => "audio.nodeattached",
            AudioSourceEvent::NodeDetached { .. } => "audio.nodedetached",
            AudioSourceEvent::SourceOff => "audio.sourceoff",
            AudioSourceEvent::SourceError { .. } => "audio.sourceerror",
        }
    }
}

/// Errors surfaced by audio sources and nodes
#[derive(Debug, Clone)]
pub enum AudioError {
    /// The stream was closed or turned off
    Closed(String),
    /// The underlying device or feed failed
    Source(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::Closed(e) => write!(f, "Audio stream closed: {}", e),
            AudioError::Source(e) => write!(f, "Audio source error: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// A single attached read stream. `read` must be cancel-safe: a dropped
/// `read` future must not lose a chunk.
#[async_trait]
pub trait AudioStreamNode: Send {
    fn id(&self) -> &str;

    /// Next chunk, or a chunk with `is_end` once the stream is exhausted.
    async fn read(&mut self) -> Result<AudioChunk, AudioError>;

    /// Release the node. Default is a no-op.
    async fn detach(&mut self) {}
}

/// An audio input the session can attach to once per recognition.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Stable identifier of this source.
    fn id(&self) -> &str;

    fn format(&self) -> AudioFormat;

    /// Realtime sources (microphones) produce at wall-clock rate and must
    /// never be paced with timers.
    fn is_realtime(&self) -> bool {
        false
    }

    async fn device_info(&self) -> AudioDeviceInfo;

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError>;

    /// Stop producing audio. Attached nodes observe end-of-stream.
    async fn turn_off(&self) -> Result<(), AudioError>;

    /// Lifecycle event stream, when the source publishes one.
    fn events(&self) -> Option<broadcast::Receiver<AudioSourceEvent>> {
        None
    }
}
