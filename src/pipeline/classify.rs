use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::event::decode::{
    EvaluationResultEvent, ExperimentStatusEvent, JobStatusEvent, NormalizedEvent,
};

use super::store::AggregationStore;

/// Merges one normalized event into the store's in-flight delta.
///
/// Mutation is confined to the single experiment the event concerns, so
/// merges for different experiments commute within one flush.
pub fn apply(store: &mut AggregationStore, event: &NormalizedEvent) {
    match event {
        NormalizedEvent::JobStatus(job) => apply_job_status(store, job),
        NormalizedEvent::ExperimentStatus(status) => apply_experiment_status(store, status),
        NormalizedEvent::EvaluationResult(eval) => apply_evaluation_result(store, eval),
        NormalizedEvent::JobScheduled => {
            debug!("job scheduled, nothing to merge");
        }
        NormalizedEvent::ExperimentConfig => {
            debug!("experiment config received, nothing to merge");
        }
    }
}

/// `status` is renamed to `job_status` so it cannot collide with the
/// experiment's own status when both land in the same row.
fn apply_job_status(store: &mut AggregationStore, job: &JobStatusEvent) {
    let mut patch = BTreeMap::new();
    insert_opt(&mut patch, "job_id", &job.job_id);
    insert_opt(&mut patch, "job_type", &job.job_type);
    insert_opt(&mut patch, "job_status", &job.status);
    insert_opt(&mut patch, "starting_time", &job.starting_time);
    insert_opt(&mut patch, "finishing_time", &job.finishing_time);
    insert_opt(&mut patch, "error", &job.error);
    insert_opt(&mut patch, "stacktrace", &job.stacktrace);
    insert_opt(&mut patch, "device", &job.device);

    store.merge_row(&job.experiment_id, patch);
}

/// `status` is renamed to `model_status`; progress ratios are derived and
/// omitted entirely when the denominator is zero or absent, never emitted
/// as NaN.
fn apply_experiment_status(store: &mut AggregationStore, status: &ExperimentStatusEvent) {
    let mut patch = BTreeMap::new();
    insert_opt(&mut patch, "model_status", &status.status);
    insert_num(&mut patch, "num_epochs", status.num_epochs);
    insert_num(&mut patch, "current_epoch", status.current_epoch);
    insert_opt(&mut patch, "current_split", &status.current_split);
    insert_num(&mut patch, "num_batches", status.num_batches);
    insert_num(&mut patch, "current_batch", status.current_batch);

    if let Some(progress) = ratio(status.current_epoch, status.num_epochs) {
        insert_num(&mut patch, "epoch_progress", Some(progress));
    }
    if let Some(progress) = ratio(status.current_batch, status.num_batches) {
        insert_num(&mut patch, "batch_progress", Some(progress));
    }

    store.merge_row(&status.experiment_id, patch);
}

/// Each metric/loss entry produces a chart point under the series key
/// `"{split}_{name}"` plus a flat scalar of the same name in the row, so
/// the latest score is always visible in tabular form while the full
/// history lives in the chart store.
fn apply_evaluation_result(store: &mut AggregationStore, eval: &EvaluationResultEvent) {
    let mut patch = BTreeMap::new();

    for entry in &eval.metric_scores {
        let key = series_key(&entry.split, &entry.metric);
        store.merge_chart_point(&key, &eval.experiment_id, eval.epoch, entry.score);
        insert_num(&mut patch, &key, Some(entry.score));
    }

    for entry in &eval.loss_scores {
        let key = series_key(&entry.split, &entry.loss);
        store.merge_chart_point(&key, &eval.experiment_id, eval.epoch, entry.score);
        insert_num(&mut patch, &key, Some(entry.score));
    }

    store.merge_row(&eval.experiment_id, patch);
}

fn series_key(split: &str, name: &str) -> String {
    format!("{split}_{name}")
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0.0 => Some(n / d),
        _ => None,
    }
}

fn insert_opt(patch: &mut BTreeMap<String, Value>, field: &str, value: &Option<Value>) {
    if let Some(value) = value {
        patch.insert(field.to_string(), value.clone());
    }
}

fn insert_num(patch: &mut BTreeMap<String, Value>, field: &str, value: Option<f64>) {
    if let Some(v) = value {
        if let Some(n) = serde_json::Number::from_f64(v) {
            patch.insert(field.to_string(), Value::Number(n));
        }
    }
}
