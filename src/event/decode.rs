use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{EventKind, ExperimentId, RawEvent};

/// Errors raised while turning wire frames into normalized events.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("batched frame contains a nested batch")]
    NestedBatch,

    #[error("unknown event kind `{0}`")]
    UnknownKind(String),

    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Short label used for error counters.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::NestedBatch => "nested_batch",
            Self::UnknownKind(_) => "unknown_kind",
            Self::Payload { .. } => "payload",
        }
    }
}

/// One event after kind dispatch and payload validation.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    JobStatus(JobStatusEvent),
    /// Scheduling notice. Logged, never merged.
    JobScheduled,
    EvaluationResult(EvaluationResultEvent),
    /// Static experiment configuration. Logged, never merged.
    ExperimentConfig,
    ExperimentStatus(ExperimentStatusEvent),
}

/// Job lifecycle update. `grid_search_id` is deliberately absent: it is
/// constant across every row of one session and is stripped before merging.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusEvent {
    pub experiment_id: ExperimentId,
    #[serde(default)]
    pub job_id: Option<Value>,
    #[serde(default)]
    pub job_type: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub starting_time: Option<Value>,
    #[serde(default)]
    pub finishing_time: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub stacktrace: Option<Value>,
    #[serde(default)]
    pub device: Option<Value>,
}

/// Training-loop progress update for one experiment.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentStatusEvent {
    pub experiment_id: ExperimentId,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub num_epochs: Option<f64>,
    #[serde(default)]
    pub current_epoch: Option<f64>,
    #[serde(default)]
    pub current_split: Option<Value>,
    #[serde(default)]
    pub num_batches: Option<f64>,
    #[serde(default)]
    pub current_batch: Option<f64>,
}

/// Per-epoch metric and loss scores for one experiment.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationResultEvent {
    pub experiment_id: ExperimentId,
    pub epoch: u64,
    #[serde(default)]
    pub metric_scores: Vec<MetricScore>,
    #[serde(default)]
    pub loss_scores: Vec<LossScore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricScore {
    pub metric: String,
    pub split: String,
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LossScore {
    pub loss: String,
    pub split: String,
    pub score: f64,
}

impl RawEvent {
    /// Dispatches on `event_type` and validates the payload into a typed
    /// event. Unknown kinds are reported, never silently coerced.
    pub fn normalize(&self) -> Result<NormalizedEvent, DecodeError> {
        let name = self.event_type.to_lowercase();
        let kind = EventKind::from_name(&name).ok_or(DecodeError::UnknownKind(name))?;

        match kind {
            EventKind::JobStatus => {
                let payload = decode_payload(kind, &self.payload)?;
                Ok(NormalizedEvent::JobStatus(payload))
            }
            EventKind::JobScheduled => Ok(NormalizedEvent::JobScheduled),
            EventKind::EvaluationResult => {
                let payload = decode_payload(kind, &self.payload)?;
                Ok(NormalizedEvent::EvaluationResult(payload))
            }
            EventKind::ExperimentConfig => Ok(NormalizedEvent::ExperimentConfig),
            EventKind::ExperimentStatus => {
                let payload = decode_payload(kind, &self.payload)?;
                Ok(NormalizedEvent::ExperimentStatus(payload))
            }
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    payload: &Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload.clone()).map_err(|source| DecodeError::Payload { kind, source })
}
