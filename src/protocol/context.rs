//! Per-turn `speech.context` document
//!
//! Carries the dynamic grammar (phrase hints and reference grammars) and
//! the audio device descriptor. Re-sent at the start of every turn.

use super::AudioSourceBlock;
use crate::audio::AudioDeviceInfo;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GrammarItem {
    #[serde(rename = "Text")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrammarGroup {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Items")]
    pub items: Vec<GrammarItem>,
}

/// The `dgi` block of the context document.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicGrammar {
    #[serde(rename = "ReferenceGrammars", skip_serializing_if = "Vec::is_empty")]
    pub reference_grammars: Vec<String>,
    #[serde(rename = "Groups", skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GrammarGroup>,
}

/// Accumulates phrase hints and reference grammars between recognitions.
#[derive(Debug, Clone, Default)]
pub struct DynamicGrammarBuilder {
    phrases: Vec<String>,
    reference_grammars: Vec<String>,
}

impl DynamicGrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a phrase the recognizer should be biased towards.
    pub fn add_phrase(&mut self, phrase: impl Into<String>) {
        self.phrases.push(phrase.into());
    }

    pub fn add_reference_grammar(&mut self, grammar: impl Into<String>) {
        self.reference_grammars.push(grammar.into());
    }

    pub fn clear(&mut self) {
        self.phrases.clear();
        self.reference_grammars.clear();
    }

    /// The grammar block, or `None` when nothing was added.
    pub fn build(&self) -> Option<DynamicGrammar> {
        if self.phrases.is_empty() && self.reference_grammars.is_empty() {
            return None;
        }
        let groups = if self.phrases.is_empty() {
            Vec::new()
        } else {
            vec![GrammarGroup {
                kind: "Generic".to_string(),
                items: self
                    .phrases
                    .iter()
                    .map(|p| GrammarItem { text: p.clone() })
                    .collect(),
            }]
        };
        Some(DynamicGrammar {
            reference_grammars: self.reference_grammars.clone(),
            groups,
        })
    }
}

/// The `speech.context` document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeechContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dgi: Option<DynamicGrammar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSourceBlock>,
}

impl SpeechContext {
    pub fn new(dgi: Option<DynamicGrammar>, device: Option<AudioDeviceInfo>) -> Self {
        Self {
            dgi,
            audio: device.map(|source| AudioSourceBlock { source }),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
