//! Recognizer configuration
//!
//! A flat string property bag with typed accessors, mirroring the property
//! names the service contract uses. The transport factory reads the endpoint
//! and the query-parameter properties from here; the upstream pump reads the
//! throttle tunable.

use std::collections::HashMap;

/// Well-known property keys.
///
/// The names are contractual; `TRANSMIT_LENGTH_BEFORE_THROTTLE_MS` keeps the
/// historical spelling used by existing client configurations.
pub mod properties {
    pub const ENDPOINT: &str = "SpeechServiceConnection_Endpoint";
    pub const RECO_LANGUAGE: &str = "SpeechServiceConnection_RecoLanguage";
    pub const TRANSLATION_FROM: &str = "SpeechServiceConnection_TranslationFrom";
    pub const TRANSLATION_TO: &str = "SpeechServiceConnection_TranslationTo";
    pub const DEPLOYMENT_ID: &str = "SpeechServiceConnection_DeploymentId";
    pub const OUTPUT_FORMAT: &str = "SpeechServiceResponse_OutputFormat";
    pub const PROFANITY: &str = "SpeechServiceResponse_Profanity";
    pub const STORE_AUDIO: &str = "SpeechServiceConnection_StoreAudio";
    pub const WORD_LEVEL_TIMESTAMPS: &str = "SpeechServiceResponse_WordLevelTimestamps";
    pub const INITIAL_SILENCE_TIMEOUT_MS: &str = "SpeechServiceConnection_InitialSilenceTimeoutMs";
    pub const END_SILENCE_TIMEOUT_MS: &str = "SpeechServiceConnection_EndSilenceTimeoutMs";
    pub const STABLE_INTERMEDIATE_THRESHOLD: &str =
        "SpeechServiceResponse_StableIntermediateThreshold";
    pub const STABLE_TRANSLATION: &str = "SpeechServiceResponse_StableTranslation";
    pub const TEST_HOOKS: &str = "SpeechServiceConnection_TestHooks";
    pub const TRANSMIT_LENGTH_BEFORE_THROTTLE_MS: &str = "SPEECH-TransmitLengthBeforThrottleMs";
}

/// Default fast-lane length: audio within this many milliseconds of the
/// stream head is uploaded without pacing.
pub const DEFAULT_TRANSMIT_BEFORE_THROTTLE_MS: u64 = 5000;

/// How a recognition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// The session ends after the first phrase and its `turn.end`.
    SingleShot,
    /// The session survives turns until stopped or the audio ends.
    Continuous,
}

/// Property bag driving connection, protocol, and pacing behavior.
#[derive(Debug, Clone, Default)]
pub struct RecognizerConfig {
    values: HashMap<String, String>,
    telemetry_disabled: bool,
}

impl RecognizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property; chainable for construction.
    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The service endpoint URL. Required before any connection attempt;
    /// also quoted in connection error messages.
    pub fn endpoint(&self) -> Option<&str> {
        self.property(properties::ENDPOINT)
    }

    /// Fast-lane length in milliseconds. Falls back to the default when the
    /// property is unset or unparseable.
    pub fn transmit_length_before_throttle_ms(&self) -> u64 {
        self.property(properties::TRANSMIT_LENGTH_BEFORE_THROTTLE_MS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRANSMIT_BEFORE_THROTTLE_MS)
    }

    /// When telemetry is disabled the `speech.config` payload is reduced to
    /// the system block and no `telemetry` messages are flushed.
    pub fn telemetry_enabled(&self) -> bool {
        !self.telemetry_disabled
    }

    pub fn set_telemetry_enabled(&mut self, enabled: bool) {
        self.telemetry_disabled = !enabled;
    }

    /// Connection query parameters, in the order the service documents them.
    /// Only parameters with a configured value are emitted.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        const MAPPING: &[(&str, &str)] = &[
            ("testhooks", properties::TEST_HOOKS),
            ("cid", properties::DEPLOYMENT_ID),
            ("format", properties::OUTPUT_FORMAT),
            ("language", properties::RECO_LANGUAGE),
            ("from", properties::TRANSLATION_FROM),
            ("to", properties::TRANSLATION_TO),
            ("profanity", properties::PROFANITY),
            ("storeAudio", properties::STORE_AUDIO),
            ("wordLevelTimestamps", properties::WORD_LEVEL_TIMESTAMPS),
            ("initialSilenceTimeoutMs", properties::INITIAL_SILENCE_TIMEOUT_MS),
            ("endSilenceTimeoutMs", properties::END_SILENCE_TIMEOUT_MS),
            (
                "stableIntermediateThreshold",
                properties::STABLE_INTERMEDIATE_THRESHOLD,
            ),
            ("stableTranslation", properties::STABLE_TRANSLATION),
        ];

        MAPPING
            .iter()
            .filter_map(|(param, key)| {
                self.property(key).map(|v| (*param, v.to_string()))
            })
            .collect()
    }
}
