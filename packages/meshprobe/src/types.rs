use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of one line source (one node endpoint), e.g. "sender" or "COM13"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One line received from a source, stamped with the host clock at receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEvent {
    pub source: SourceId,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LineEvent {
    pub fn new(source: SourceId, timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            source,
            timestamp,
            text: text.into(),
        }
    }

    /// Stamp a freshly received line with the current host time
    pub fn now(source: SourceId, text: impl Into<String>) -> Self {
        Self::new(source, Utc::now(), text)
    }

    pub fn is_from(&self, source: &SourceId) -> bool {
        &self.source == source
    }
}

/// How a command asks the firmware to handle its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommandMode {
    Plaintext,
    Encrypted,
    RoundTripProbe { length: usize },
    ThroughputBurst {
        encrypted: bool,
        frequency: u32,
        iterations: u32,
    },
    /// On-device encrypt/decrypt benchmark, no radio involved
    EncryptionBench,
}

/// A command written to one line source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub target_source: SourceId,
    pub node_id: u64,
    pub payload: String,
    pub mode: CommandMode,
}

impl Command {
    pub fn plaintext(target_source: SourceId, node_id: u64, payload: impl Into<String>) -> Self {
        Self {
            target_source,
            node_id,
            payload: payload.into(),
            mode: CommandMode::Plaintext,
        }
    }

    pub fn encrypted(target_source: SourceId, node_id: u64, payload: impl Into<String>) -> Self {
        Self {
            target_source,
            node_id,
            payload: payload.into(),
            mode: CommandMode::Encrypted,
        }
    }

    pub fn unicast(
        target_source: SourceId,
        node_id: u64,
        payload: impl Into<String>,
        encrypted: bool,
    ) -> Self {
        if encrypted {
            Self::encrypted(target_source, node_id, payload)
        } else {
            Self::plaintext(target_source, node_id, payload)
        }
    }

    pub fn round_trip(target_source: SourceId, node_id: u64, length: usize) -> Self {
        Self {
            target_source,
            node_id,
            payload: String::new(),
            mode: CommandMode::RoundTripProbe { length },
        }
    }

    pub fn burst(
        target_source: SourceId,
        node_id: u64,
        payload: impl Into<String>,
        encrypted: bool,
        frequency: u32,
        iterations: u32,
    ) -> Self {
        Self {
            target_source,
            node_id,
            payload: payload.into(),
            mode: CommandMode::ThroughputBurst {
                encrypted,
                frequency,
                iterations,
            },
        }
    }

    pub fn encryption_bench(target_source: SourceId, plaintext: impl Into<String>) -> Self {
        Self {
            target_source,
            node_id: 0,
            payload: plaintext.into(),
            mode: CommandMode::EncryptionBench,
        }
    }
}

/// Serializes to the firmware's `hirg` command line, without the line ending
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            CommandMode::Plaintext => write!(f, "hirg -r {} -p {}", self.node_id, self.payload),
            CommandMode::Encrypted => write!(f, "hirg -r {} -s {}", self.node_id, self.payload),
            CommandMode::RoundTripProbe { length } => {
                write!(f, "hirg -r {} -l {}", self.node_id, length)
            }
            CommandMode::ThroughputBurst {
                encrypted,
                frequency,
                iterations,
            } => write!(
                f,
                "hirg -r {} -{} {} -t {} -i {}",
                self.node_id,
                if *encrypted { 's' } else { 'p' },
                self.payload,
                frequency,
                iterations
            ),
            CommandMode::EncryptionBench => write!(f, "hirg -e {}", self.payload),
        }
    }
}

/// Why a trial did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TrialFailure {
    /// No event satisfied the target predicate before the deadline
    Timeout,
    /// The target matched but a field the trial needs never showed up
    IncompleteMetrics(String),
    /// A burst ended without a single message reaching the receiver
    NothingReceived,
}

impl fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialFailure::Timeout => f.write_str("timeout"),
            TrialFailure::IncompleteMetrics(missing) => write!(f, "incomplete metrics ({})", missing),
            TrialFailure::NothingReceived => f.write_str("nothing received"),
        }
    }
}

/// Outcome of one send/await cycle. Fields are populated depending on the trial type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrialResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TrialFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_per_sec: Option<f64>,
}

impl TrialResult {
    pub fn failed(failure: TrialFailure) -> Self {
        Self {
            success: false,
            failure: Some(failure),
            ..Default::default()
        }
    }
}

/// Sweep parameter a group of trials was run under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SweepKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_len: Option<usize>,
}

impl SweepKey {
    pub fn length(payload_len: usize) -> Self {
        Self {
            frequency: None,
            payload_len: Some(payload_len),
        }
    }

    pub fn length_and_frequency(payload_len: usize, frequency: u32) -> Self {
        Self {
            frequency: Some(frequency),
            payload_len: Some(payload_len),
        }
    }
}

impl fmt::Display for SweepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.payload_len, self.frequency) {
            (Some(len), Some(freq)) => write!(f, "length {} @ {} msg/s", len, freq),
            (Some(len), None) => write!(f, "length {}", len),
            (None, Some(freq)) => write!(f, "{} msg/s", freq),
            (None, None) => f.write_str("all"),
        }
    }
}

/// All trials run for one sweep key, in the order they ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub key: SweepKey,
    pub trials: Vec<TrialResult>,
}

impl SweepPoint {
    pub fn new(key: SweepKey) -> Self {
        Self {
            key,
            trials: Vec::new(),
        }
    }

    pub fn push(&mut self, trial: TrialResult) {
        self.trials.push(trial);
    }

    pub fn attempted(&self) -> usize {
        self.trials.len()
    }

    pub fn succeeded(&self) -> usize {
        self.trials.iter().filter(|t| t.success).count()
    }

    /// Values of one metric across the successful trials
    pub fn successful_values<F>(&self, metric: F) -> Vec<f64>
    where
        F: Fn(&TrialResult) -> Option<f64>,
    {
        self.trials
            .iter()
            .filter(|t| t.success)
            .filter_map(|t| metric(t))
            .collect()
    }
}
