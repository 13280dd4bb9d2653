//! Protocol payloads and message paths
//!
//! Typed serde models for everything the core puts on (or parses off) the
//! wire: the `speech.config` document, the per-turn `speech.context`, and
//! the detected-speech bodies. Message paths are compared
//! case-insensitively on receive.

mod context;

pub use context::{DynamicGrammar, DynamicGrammarBuilder, SpeechContext};

use crate::audio::AudioDeviceInfo;
use serde::{Deserialize, Serialize};

/// Outbound and inbound message paths handled by the core.
pub mod paths {
    pub const SPEECH_CONFIG: &str = "speech.config";
    pub const SPEECH_CONTEXT: &str = "speech.context";
    pub const TELEMETRY: &str = "telemetry";
    pub const AUDIO: &str = "audio";
    pub const TURN_START: &str = "turn.start";
    pub const TURN_END: &str = "turn.end";
    pub const SPEECH_START_DETECTED: &str = "speech.startdetected";
    pub const SPEECH_END_DETECTED: &str = "speech.enddetected";
}

/// `audio.source` wrapper shared by the config and context documents.
#[derive(Debug, Clone, Serialize)]
pub struct AudioSourceBlock {
    pub source: AudioDeviceInfo,
}

/// Client/system description sent in `speech.config`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub build: String,
    pub lang: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: "Rust".to_string(),
            lang: "Rust".to_string(),
        }
    }
}

/// Host description sent in `speech.config`.
#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub platform: String,
    pub name: String,
    pub version: String,
}

impl OsInfo {
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            name: std::env::consts::ARCH.to_string(),
            version: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConfigContext {
    system: SystemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<OsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<AudioSourceBlock>,
}

/// The `speech.config` document, sent once per physical connection.
///
/// With telemetry disabled the document reduces to the system block alone.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechServiceConfig {
    context: ConfigContext,
}

impl SpeechServiceConfig {
    pub fn new(device: Option<AudioDeviceInfo>, telemetry_enabled: bool) -> Self {
        let context = if telemetry_enabled {
            ConfigContext {
                system: SystemInfo::current(),
                os: Some(OsInfo::current()),
                audio: device.map(|source| AudioSourceBlock { source }),
            }
        } else {
            ConfigContext {
                system: SystemInfo::current(),
                os: None,
                audio: None,
            }
        };
        Self { context }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Body of `speech.startdetected` / `speech.enddetected`: an offset in
/// 100-ns ticks from the start of the turn's audio.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DetectedSpeech {
    #[serde(rename = "Offset", default)]
    pub offset: u64,
}

impl DetectedSpeech {
    /// Parse a detected-speech body; an empty or unreadable body means
    /// offset zero.
    pub fn parse(body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(body).unwrap_or_else(|e| {
            log::warn!("Unreadable detected-speech body ({}), assuming offset 0", e);
            Self::default()
        })
    }
}
