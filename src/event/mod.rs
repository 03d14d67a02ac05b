pub mod decode;

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::decode::DecodeError;

/// Envelope key marking a pre-batched frame.
pub const BATCHED_EVENT_ID: &str = "batched_events";

/// EventKind identifies the kind of experiment telemetry event.
/// Names must match the wire protocol's `event_type` field (lower-cased).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobStatus,
    JobScheduled,
    EvaluationResult,
    ExperimentConfig,
    ExperimentStatus,
}

impl EventKind {
    /// Returns the canonical wire/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobStatus => "job_status",
            Self::JobScheduled => "job_scheduled",
            Self::EvaluationResult => "evaluation_result",
            Self::ExperimentConfig => "experiment_config",
            Self::ExperimentStatus => "experiment_status",
        }
    }

    /// Convert from the canonical wire name. Matching is exact on the
    /// lower-cased name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "job_status" => Some(Self::JobStatus),
            "job_scheduled" => Some(Self::JobScheduled),
            "evaluation_result" => Some(Self::EvaluationResult),
            "experiment_config" => Some(Self::ExperimentConfig),
            "experiment_status" => Some(Self::ExperimentStatus),
            _ => None,
        }
    }

    /// Return all event kinds.
    pub fn all() -> &'static [Self] {
        &[
            Self::JobStatus,
            Self::JobScheduled,
            Self::EvaluationResult,
            Self::ExperimentConfig,
            Self::ExperimentStatus,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Experiment identifier. The wire sends either a JSON number or a string;
/// both normalize to the same key so aggregation never splits one experiment
/// into two rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExperimentId(String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExperimentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Self(s)),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(de::Error::custom(format!(
                "experiment_id must be a string or number, got {other}"
            ))),
        }
    }
}

impl Serialize for ExperimentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Numeric ids round-trip as numbers so consumer-side keys match the
        // producer's.
        if let Ok(n) = self.0.parse::<i64>() {
            serializer.serialize_i64(n)
        } else {
            serializer.serialize_str(&self.0)
        }
    }
}

/// One inbound event envelope, exactly as delivered on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    /// Producer-side creation time, unix seconds as float.
    #[serde(default)]
    pub creation_ts: f64,
    #[serde(default)]
    pub payload: Value,
}

/// Parses one text frame into raw events, unwrapping at most one level of
/// batching. A batch nested inside a batch is a protocol violation.
pub fn decode_frame(text: &str) -> Result<Vec<RawEvent>, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::MalformedFrame)?;

    if value.get("event_id").and_then(Value::as_str) == Some(BATCHED_EVENT_ID) {
        let Some(entries) = value.get("data").and_then(Value::as_array) else {
            return Err(DecodeError::InvalidEnvelope("batched frame without data array"));
        };

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.get("event_id").and_then(Value::as_str) == Some(BATCHED_EVENT_ID) {
                return Err(DecodeError::NestedBatch);
            }
            events.push(decode_envelope(entry)?);
        }
        return Ok(events);
    }

    Ok(vec![decode_envelope(&value)?])
}

fn decode_envelope(value: &Value) -> Result<RawEvent, DecodeError> {
    if value.get("event_type").is_none() {
        return Err(DecodeError::InvalidEnvelope("missing event_type"));
    }
    serde_json::from_value(value.clone()).map_err(DecodeError::MalformedFrame)
}
