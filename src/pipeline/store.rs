use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::event::ExperimentId;
use crate::output::{ChartPointUpdate, PublishUpdate, Row};

use super::color::palette_color;

/// One chart line: `(epoch, score)` pairs kept sorted by epoch with no
/// duplicate epochs. A revision for an already-seen epoch overwrites the
/// stored score.
#[derive(Debug, Default, Clone)]
pub struct Series {
    points: Vec<(u64, f64)>,
}

impl Series {
    fn upsert(&mut self, epoch: u64, score: f64) {
        match self.points.binary_search_by_key(&epoch, |(e, _)| *e) {
            Ok(idx) => self.points[idx].1 = score,
            Err(idx) => self.points.insert(idx, (epoch, score)),
        }
    }

    pub fn points(&self) -> &[(u64, f64)] {
        &self.points
    }
}

/// Per-flush delta accumulator, cleared after every publish.
#[derive(Debug, Default)]
struct FlushDelta {
    changed_rows: BTreeSet<ExperimentId>,
    /// De-duplicated within the flush: a re-sent `(chart, experiment,
    /// epoch)` keeps only the latest score.
    chart_points: BTreeMap<(String, ExperimentId, u64), f64>,
    headers_grown: bool,
}

impl FlushDelta {
    fn is_empty(&self) -> bool {
        self.changed_rows.is_empty() && self.chart_points.is_empty() && !self.headers_grown
    }

    fn clear(&mut self) {
        self.changed_rows.clear();
        self.chart_points.clear();
        self.headers_grown = false;
    }
}

/// Cumulative aggregation state: table rows keyed by experiment, chart
/// series keyed by chart then experiment, the monotone header set, and the
/// stable color assignment.
///
/// The store is owned by the pipeline task alone; all cross-component access
/// goes through published deltas, never shared references.
pub struct AggregationStore {
    rows: HashMap<ExperimentId, BTreeMap<String, Value>>,
    headers: BTreeSet<String>,
    /// BTreeMaps keep both chart ids and per-chart experiment ids sorted,
    /// giving the consumer a stable legend ordering.
    charts: BTreeMap<String, BTreeMap<ExperimentId, Series>>,
    colors: HashMap<ExperimentId, String>,
    color_seq: usize,
    delta: FlushDelta,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
            headers: BTreeSet::new(),
            charts: BTreeMap::new(),
            colors: HashMap::new(),
            color_seq: 0,
            delta: FlushDelta::default(),
        }
    }

    /// Drops all cumulative state. Called on an intentional reconnect with
    /// new parameters, never on transient errors.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.headers.clear();
        self.charts.clear();
        self.colors.clear();
        self.color_seq = 0;
        self.delta.clear();
    }

    /// Folds a sparse patch into the experiment's row. Fields present in the
    /// patch overwrite; absent fields are preserved. New field names grow
    /// the global header set.
    pub fn merge_row(&mut self, experiment_id: &ExperimentId, patch: BTreeMap<String, Value>) {
        if patch.is_empty() {
            return;
        }

        let row = self.rows.entry(experiment_id.clone()).or_insert_with(|| {
            // The key column becomes a header as soon as the first row exists.
            BTreeMap::new()
        });
        if self.headers.insert("experiment_id".to_string()) {
            self.delta.headers_grown = true;
        }

        for (field, value) in patch {
            if self.headers.insert(field.clone()) {
                self.delta.headers_grown = true;
            }
            row.insert(field, value);
        }

        self.delta.changed_rows.insert(experiment_id.clone());
    }

    /// Inserts or revises one chart point, assigning the experiment's color
    /// on first sight across all charts.
    pub fn merge_chart_point(
        &mut self,
        chart_id: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
        score: f64,
    ) {
        if !self.colors.contains_key(experiment_id) {
            let color = palette_color(self.color_seq);
            self.color_seq += 1;
            self.colors.insert(experiment_id.clone(), color);
        }

        self.charts
            .entry(chart_id.to_string())
            .or_default()
            .entry(experiment_id.clone())
            .or_default()
            .upsert(epoch, score);

        self.delta
            .chart_points
            .insert((chart_id.to_string(), experiment_id.clone(), epoch), score);
    }

    /// Builds the consolidated delta for this flush and clears it. Returns
    /// `None` when nothing changed, so empty updates are never published.
    pub fn take_update(&mut self) -> Option<PublishUpdate> {
        if self.delta.is_empty() {
            return None;
        }

        let table_headers = self
            .delta
            .headers_grown
            .then(|| self.headers.iter().cloned().collect());

        let table_data = self
            .delta
            .changed_rows
            .iter()
            .filter_map(|id| {
                self.rows.get(id).map(|fields| Row {
                    experiment_id: id.clone(),
                    fields: fields.clone(),
                })
            })
            .collect();

        let charts_updates = self
            .delta
            .chart_points
            .iter()
            .map(|((chart_id, exp_id, epoch), score)| ChartPointUpdate {
                chart_id: chart_id.clone(),
                exp_id: exp_id.clone(),
                epoch: *epoch,
                score: *score,
            })
            .collect();

        self.delta.clear();

        Some(PublishUpdate {
            table_headers,
            table_data,
            charts_updates,
        })
    }

    pub fn row(&self, experiment_id: &ExperimentId) -> Option<&BTreeMap<String, Value>> {
        self.rows.get(experiment_id)
    }

    pub fn headers(&self) -> &BTreeSet<String> {
        &self.headers
    }

    pub fn series(&self, chart_id: &str, experiment_id: &ExperimentId) -> Option<&Series> {
        self.charts.get(chart_id)?.get(experiment_id)
    }

    /// Experiment ids with points in the given chart, in stable order.
    pub fn chart_experiments(&self, chart_id: &str) -> Vec<&ExperimentId> {
        self.charts
            .get(chart_id)
            .map(|by_exp| by_exp.keys().collect())
            .unwrap_or_default()
    }

    pub fn color(&self, experiment_id: &ExperimentId) -> Option<&str> {
        self.colors.get(experiment_id).map(String::as_str)
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}
