//! Session telemetry
//!
//! Collects phase timings (auth, connection, first audio, first phrase) and
//! observed service events, then drains them into the JSON document the
//! core uploads on the `telemetry` path at each turn boundary. The
//! collector is owned by the request session; nothing here is global.
//! When telemetry is disabled every record call is a no-op and `drain`
//! never produces a payload.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Metric names used in the flushed document.
pub mod metrics {
    pub const AUTHENTICATION: &str = "Authentication";
    pub const CONNECTION: &str = "Connection";
    pub const MICROPHONE: &str = "Microphone";
    pub const PHRASE: &str = "Phrase";
}

/// One timed phase in the telemetry document.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Start", skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(rename = "End", skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The document flushed on the `telemetry` path.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    #[serde(rename = "ReceivedMessages", skip_serializing_if = "BTreeMap::is_empty")]
    pub received_messages: BTreeMap<String, Vec<String>>,
    #[serde(rename = "Metrics", skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
}

impl TelemetryPayload {
    pub fn is_empty(&self) -> bool {
        self.received_messages.is_empty() && self.metrics.is_empty()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accumulates telemetry between flushes.
#[derive(Debug)]
pub struct TelemetryCollector {
    enabled: bool,
    received: BTreeMap<String, Vec<String>>,
    metrics: Vec<Metric>,
    open_auth: Option<usize>,
    open_connection: Option<usize>,
    first_audio_recorded: bool,
    phrase_recorded: bool,
}

impl TelemetryCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            received: BTreeMap::new(),
            metrics: Vec::new(),
            open_auth: None,
            open_connection: None,
            first_audio_recorded: false,
            phrase_recorded: false,
        }
    }

    fn push_open(&mut self, name: &str, id: Option<String>) -> Option<usize> {
        self.metrics.push(Metric {
            name: name.to_string(),
            id,
            start: Some(now()),
            end: None,
            error: None,
        });
        Some(self.metrics.len() - 1)
    }

    fn close(&mut self, index: Option<usize>, error: Option<&str>) {
        if let Some(metric) = index.and_then(|i| self.metrics.get_mut(i)) {
            metric.end = Some(now());
            metric.error = error.map(str::to_string);
        }
    }

    pub fn auth_started(&mut self, auth_fetch_event_id: &str) {
        if !self.enabled {
            return;
        }
        self.open_auth = self.push_open(
            metrics::AUTHENTICATION,
            Some(auth_fetch_event_id.to_string()),
        );
    }

    pub fn auth_completed(&mut self, error: Option<&str>) {
        if !self.enabled {
            return;
        }
        let index = self.open_auth.take();
        self.close(index, error);
    }

    pub fn connection_started(&mut self, connection_id: &str) {
        if !self.enabled {
            return;
        }
        self.open_connection =
            self.push_open(metrics::CONNECTION, Some(connection_id.to_string()));
    }

    pub fn connection_completed(&mut self, status: u16, error: Option<&str>) {
        if !self.enabled {
            return;
        }
        let index = self.open_connection.take();
        let detail = match error {
            Some(e) => Some(format!("{}: {}", status, e)),
            None if status == 200 => None,
            None => Some(status.to_string()),
        };
        self.close(index, detail.as_deref());
    }

    /// Timestamp of the first audio byte leaving the client, once per turn.
    pub fn first_audio_sent(&mut self) {
        if !self.enabled || self.first_audio_recorded {
            return;
        }
        self.first_audio_recorded = true;
        self.metrics.push(Metric {
            name: metrics::MICROPHONE.to_string(),
            id: None,
            start: Some(now()),
            end: None,
            error: None,
        });
    }

    /// Timestamp of the first phrase-bearing message, once per turn.
    pub fn phrase_received(&mut self) {
        if !self.enabled || self.phrase_recorded {
            return;
        }
        self.phrase_recorded = true;
        self.metrics.push(Metric {
            name: metrics::PHRASE.to_string(),
            id: None,
            start: Some(now()),
            end: None,
            error: None,
        });
    }

    /// Record one received service message under its path.
    pub fn message_received(&mut self, path: &str) {
        if !self.enabled {
            return;
        }
        self.received
            .entry(path.to_ascii_lowercase())
            .or_default()
            .push(now());
    }

    /// Record a transport or audio-source event under its label.
    pub fn service_event(&mut self, label: &str) {
        if !self.enabled {
            return;
        }
        self.received.entry(label.to_string()).or_default().push(now());
    }

    /// Re-arm the once-per-turn marks at a turn boundary.
    pub fn reset_turn(&mut self) {
        self.first_audio_recorded = false;
        self.phrase_recorded = false;
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty() && self.metrics.is_empty()
    }

    /// Take everything recorded so far; `None` when there is nothing to
    /// flush (or telemetry is disabled).
    pub fn drain(&mut self) -> Option<TelemetryPayload> {
        if self.is_empty() {
            return None;
        }
        self.open_auth = None;
        self.open_connection = None;
        let payload = TelemetryPayload {
            received_messages: std::mem::take(&mut self.received),
            metrics: std::mem::take(&mut self.metrics),
        };
        Some(payload)
    }
}
