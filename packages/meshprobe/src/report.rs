use crate::bus::BusStats;
use crate::config::{Experiment, ExperimentConfig};
use crate::error::Result;
use crate::metrics::{loss_timeline, summarize, LossSample, PointSummary};
use crate::reader::ReaderSummary;
use crate::types::{LineEvent, SweepPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Result records of one experiment run
///
/// `points` are the source of truth; `summaries` and `loss_timeline` are
/// derived and can be rebuilt with [`ExperimentReport::recompute_summaries`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub id: Uuid,
    pub experiment: String,
    pub config: ExperimentConfig,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Stopped before every planned trial ran
    #[serde(default)]
    pub cancelled: bool,
    pub points: Vec<SweepPoint>,
    #[serde(default)]
    pub summaries: Vec<PointSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loss_timeline: Vec<LossSample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<LineEvent>,
    #[serde(default)]
    pub bus: BusStats,
    #[serde(default)]
    pub readers: Vec<ReaderSummary>,
}

impl ExperimentReport {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment: config.experiment.kind().to_string(),
            config,
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            points: Vec::new(),
            summaries: Vec::new(),
            loss_timeline: Vec::new(),
            transcript: Vec::new(),
            bus: BusStats::default(),
            readers: Vec::new(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn total_trials(&self) -> usize {
        self.points.iter().map(SweepPoint::attempted).sum()
    }

    pub fn successful_trials(&self) -> usize {
        self.points.iter().map(SweepPoint::succeeded).sum()
    }

    /// Rebuild everything derived from the trial records
    pub fn recompute_summaries(&mut self) {
        self.summaries = summarize(&self.points);
        self.loss_timeline = match self.config.experiment {
            Experiment::Reliability(_) => self
                .points
                .first()
                .map(|point| loss_timeline(&point.trials))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
    }

    /// True when the stored summaries are what the trials produce
    pub fn summaries_consistent(&self) -> bool {
        summarize(&self.points) == self.summaries
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
