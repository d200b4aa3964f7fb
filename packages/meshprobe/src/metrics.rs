// Metrics aggregation
//
// Pure functions from trial records to summaries. Summaries are never stored
// independently: a saved report recomputes them from its trials and must get
// the same numbers.

use crate::error::{ProbeError, Result};
use crate::types::{SweepKey, SweepPoint, TrialResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A numeric field of TrialResult that can be summarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalLatencyMs,
    EncryptionMs,
    DecryptionMs,
    TransitMs,
    RoundTripMs,
    ReceivedCount,
    DurationMs,
    ThroughputPerSec,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::TotalLatencyMs,
        Metric::EncryptionMs,
        Metric::DecryptionMs,
        Metric::TransitMs,
        Metric::RoundTripMs,
        Metric::ReceivedCount,
        Metric::DurationMs,
        Metric::ThroughputPerSec,
    ];

    pub fn extract(&self, trial: &TrialResult) -> Option<f64> {
        match self {
            Metric::TotalLatencyMs => trial.total_latency_ms,
            Metric::EncryptionMs => trial.encryption_ms,
            Metric::DecryptionMs => trial.decryption_ms,
            Metric::TransitMs => trial.transit_ms,
            Metric::RoundTripMs => trial.round_trip_ms,
            Metric::ReceivedCount => trial.received_count.map(f64::from),
            Metric::DurationMs => trial.duration_ms,
            Metric::ThroughputPerSec => trial.throughput_per_sec,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::TotalLatencyMs => "total latency (ms)",
            Metric::EncryptionMs => "encryption (ms)",
            Metric::DecryptionMs => "decryption (ms)",
            Metric::TransitMs => "transit (ms)",
            Metric::RoundTripMs => "round trip (ms)",
            Metric::ReceivedCount => "received",
            Metric::DurationMs => "duration (ms)",
            Metric::ThroughputPerSec => "throughput (msg/s)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub count: usize,
}

impl SummaryStat {
    /// None for an empty sample set
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            min: sorted[0],
            max: sorted[count - 1],
            mean: sorted.iter().sum::<f64>() / count as f64,
            median,
            count,
        })
    }
}

/// Percentage of `lost` out of `attempted`
pub fn loss_rate(attempted: usize, lost: usize) -> Result<f64> {
    if attempted == 0 {
        return Err(ProbeError::EmptySweepPoint(
            "loss rate of zero attempts".to_string(),
        ));
    }
    Ok(lost as f64 / attempted as f64 * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSummary {
    pub key: SweepKey,
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed trials, or for bursts undelivered messages, as a percentage
    pub loss_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_received: Option<u64>,
    pub metrics: BTreeMap<Metric, SummaryStat>,
}

/// Summarize one point. Errors if the point has no trials.
pub fn summarize_point(point: &SweepPoint) -> Result<PointSummary> {
    let attempted = point.attempted();
    if attempted == 0 {
        return Err(ProbeError::EmptySweepPoint(point.key.to_string()));
    }
    let succeeded = point.succeeded();

    let sent: u64 = point
        .trials
        .iter()
        .filter_map(|t| t.sent_count.map(u64::from))
        .sum();
    let received: u64 = point
        .trials
        .iter()
        .filter_map(|t| t.received_count.map(u64::from))
        .sum();
    let is_burst = point.trials.iter().any(|t| t.sent_count.is_some());

    let loss_pct = if is_burst && sent > 0 {
        loss_rate(sent as usize, sent.saturating_sub(received) as usize)?
    } else {
        loss_rate(attempted, attempted - succeeded)?
    };

    let metrics = Metric::ALL
        .iter()
        .filter_map(|metric| {
            let values = point.successful_values(|t| metric.extract(t));
            SummaryStat::from_samples(&values).map(|stat| (*metric, stat))
        })
        .collect();

    Ok(PointSummary {
        key: point.key,
        attempted,
        succeeded,
        loss_pct,
        messages_sent: is_burst.then_some(sent),
        messages_received: is_burst.then_some(received),
        metrics,
    })
}

/// Summaries for every point with data, ordered by key. Points without
/// trials are left out.
pub fn summarize(points: &[SweepPoint]) -> Vec<PointSummary> {
    let mut summaries: Vec<PointSummary> = points
        .par_iter()
        .filter_map(|point| match summarize_point(point) {
            Ok(summary) => Some(summary),
            Err(e) => {
                log::debug!("Skipping point: {}", e);
                None
            }
        })
        .collect();

    summaries.sort_by_key(|s| s.key);
    summaries
}

/// Running loss after each trial of a fixed-rate run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSample {
    pub packets_sent: usize,
    pub loss_pct: f64,
}

pub fn loss_timeline(trials: &[TrialResult]) -> Vec<LossSample> {
    let mut lost = 0;
    trials
        .iter()
        .enumerate()
        .map(|(i, trial)| {
            if !trial.success {
                lost += 1;
            }
            let packets_sent = i + 1;
            LossSample {
                packets_sent,
                loss_pct: lost as f64 / packets_sent as f64 * 100.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrialFailure;

    fn latency(ms: f64) -> TrialResult {
        TrialResult {
            success: true,
            total_latency_ms: Some(ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_of_three_samples() {
        let stat = SummaryStat::from_samples(&[10.0, 20.0, 30.0]).unwrap();
        assert_eq!(stat.min, 10.0);
        assert_eq!(stat.median, 20.0);
        assert_eq!(stat.mean, 20.0);
        assert_eq!(stat.max, 30.0);
        assert_eq!(stat.count, 3);
    }

    #[test]
    fn test_median_of_even_count_and_unsorted_input() {
        let stat = SummaryStat::from_samples(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stat.median, 2.5);
        assert_eq!(stat.min, 1.0);
        assert_eq!(stat.max, 4.0);
        assert!(SummaryStat::from_samples(&[]).is_none());
    }

    #[test]
    fn test_loss_rate_of_nothing_is_an_error() {
        assert!(matches!(loss_rate(0, 0), Err(ProbeError::EmptySweepPoint(_))));
        assert_eq!(loss_rate(4, 1).unwrap(), 25.0);
    }

    #[test]
    fn test_failed_trials_count_as_loss_but_not_in_stats() {
        let mut point = SweepPoint::new(SweepKey::length(10));
        point.push(latency(10.0));
        point.push(TrialResult::failed(TrialFailure::Timeout));
        point.push(latency(30.0));
        point.push(TrialResult::failed(TrialFailure::Timeout));

        let summary = summarize_point(&point).unwrap();
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.loss_pct, 50.0);
        let stat = summary.metrics[&Metric::TotalLatencyMs];
        assert_eq!(stat.count, 2);
        assert_eq!(stat.mean, 20.0);
        assert!(!summary.metrics.contains_key(&Metric::TransitMs));
    }

    #[test]
    fn test_all_failed_point_is_reported_with_full_loss() {
        let mut dead = SweepPoint::new(SweepKey::length(90));
        dead.push(TrialResult::failed(TrialFailure::Timeout));
        dead.push(TrialResult::failed(TrialFailure::Timeout));
        let empty = SweepPoint::new(SweepKey::length(100));
        let mut ok = SweepPoint::new(SweepKey::length(80));
        ok.push(latency(5.0));

        let summaries = summarize(&[dead, empty, ok]);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].key, SweepKey::length(80));
        assert_eq!(summaries[1].key, SweepKey::length(90));
        assert_eq!(summaries[1].loss_pct, 100.0);
        assert!(summaries[1].metrics.is_empty());
    }

    #[test]
    fn test_burst_loss_uses_message_counts() {
        let mut point = SweepPoint::new(SweepKey::length_and_frequency(50, 10));
        point.push(TrialResult {
            success: true,
            sent_count: Some(10),
            received_count: Some(8),
            duration_ms: Some(1000.0),
            throughput_per_sec: Some(8.0),
            ..Default::default()
        });

        let summary = summarize_point(&point).unwrap();
        assert_eq!(summary.loss_pct, 20.0);
        assert_eq!(summary.messages_sent, Some(10));
        assert_eq!(summary.messages_received, Some(8));
        assert_eq!(summary.metrics[&Metric::ThroughputPerSec].max, 8.0);
    }

    #[test]
    fn test_loss_timeline() {
        let trials = vec![
            latency(1.0),
            TrialResult::failed(TrialFailure::Timeout),
            latency(1.0),
            latency(1.0),
        ];
        let timeline = loss_timeline(&trials);
        assert_eq!(timeline.len(), 4);
        assert_eq!(timeline[0].loss_pct, 0.0);
        assert_eq!(timeline[1].loss_pct, 50.0);
        assert_eq!(timeline[3].packets_sent, 4);
        assert_eq!(timeline[3].loss_pct, 25.0);
    }

    #[test]
    fn test_summaries_serialize_with_metric_names() {
        let mut point = SweepPoint::new(SweepKey::length(10));
        point.push(latency(10.0));
        let json = serde_json::to_value(summarize(&[point])).unwrap();
        assert_eq!(json[0]["metrics"]["total_latency_ms"]["count"], 1);
    }
}
