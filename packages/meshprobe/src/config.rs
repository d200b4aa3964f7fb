use crate::error::{ProbeError, Result};
use crate::source::LineSourceConfig;
use crate::types::{SourceId, SweepKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn default_reader_poll_ms() -> u64 {
    50
}

fn default_bus_poll_ms() -> u64 {
    100
}

fn default_tests_per_point() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_latency_pacing_ms() -> u64 {
    500
}

fn default_encryption_pacing_ms() -> u64 {
    100
}

fn default_throughput_pacing_ms() -> u64 {
    1_000
}

fn default_iterations() -> u32 {
    10
}

fn default_packets() -> u32 {
    100
}

fn default_reliability_length() -> u32 {
    20
}

fn default_reliability_interval_ms() -> u64 {
    100
}

fn default_max_outstanding() -> usize {
    5
}

/// Everything one experiment run needs, passed to the runner at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub nodes: Vec<NodeConfig>,
    /// Upper bound of a single read attempt in the reader tasks
    #[serde(default = "default_reader_poll_ms")]
    pub reader_poll_ms: u64,
    /// Bus poll interval of the correlator's wait loop
    #[serde(default = "default_bus_poll_ms")]
    pub bus_poll_ms: u64,
    /// Seed for payload generation; random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub experiment: Experiment,
}

/// One mesh node. Nodes without a source are addressed by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: SourceId,
    pub node_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LineSourceConfig>,
}

/// Inclusive range with a fixed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSweep {
    pub min: u32,
    pub max: u32,
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_step() -> u32 {
    1
}

impl RangeSweep {
    pub fn single(value: u32) -> Self {
        Self {
            min: value,
            max: value,
            step: 1,
        }
    }

    pub fn values(&self) -> Vec<u32> {
        if self.step == 0 || self.min > self.max {
            return Vec::new();
        }
        (self.min..=self.max).step_by(self.step as usize).collect()
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.step == 0 {
            return Err(ProbeError::InvalidConfig(format!("{}: step must be > 0", what)));
        }
        if self.min == 0 {
            return Err(ProbeError::InvalidConfig(format!("{}: min must be > 0", what)));
        }
        if self.min > self.max {
            return Err(ProbeError::InvalidConfig(format!(
                "{}: empty range {}..={}",
                what, self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Experiment {
    /// Unicast latency from OUTBOUND/INBOUND markers, swept over payload length
    OneWayLatency(OneWayLatencyConfig),
    /// Device-measured round trip, swept over probe length
    RoundTrip(RoundTripConfig),
    /// On-device encrypt/decrypt benchmark, swept over plaintext length
    Encryption(EncryptionConfig),
    /// Bursts swept over payload length x frequency
    Throughput(ThroughputConfig),
    /// Fixed-rate probes with a running loss rate
    Reliability(ReliabilityConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneWayLatencyConfig {
    pub sender: SourceId,
    pub receiver: SourceId,
    #[serde(default)]
    pub encrypted: bool,
    pub lengths: RangeSweep,
    #[serde(default = "default_tests_per_point")]
    pub tests_per_point: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_latency_pacing_ms")]
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTripConfig {
    pub sender: SourceId,
    pub receiver: SourceId,
    pub lengths: RangeSweep,
    #[serde(default = "default_tests_per_point")]
    pub tests_per_point: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_latency_pacing_ms")]
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub node: SourceId,
    pub lengths: RangeSweep,
    #[serde(default = "default_tests_per_point")]
    pub tests_per_point: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_encryption_pacing_ms")]
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputConfig {
    pub sender: SourceId,
    pub receiver: SourceId,
    #[serde(default)]
    pub encrypted: bool,
    pub lengths: RangeSweep,
    pub frequencies: RangeSweep,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Bursts per (length, frequency) point
    #[serde(default = "default_bursts")]
    pub bursts_per_point: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_throughput_pacing_ms")]
    pub pacing_ms: u64,
}

fn default_bursts() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    pub sender: SourceId,
    pub receiver: SourceId,
    #[serde(default = "default_packets")]
    pub packets: u32,
    #[serde(default = "default_reliability_length")]
    pub length: u32,
    /// Time between probe starts
    #[serde(default = "default_reliability_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout; defaults to the interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: ReliabilityMode,
    /// Payload mode: sent payloads still credited when they arrive late
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

/// What a reliability packet is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityMode {
    /// Round-trip request answered on the sender's console
    #[default]
    RoundTrip,
    /// Plaintext unicast, delivery seen as `msg=<payload>` on the receiver's console
    Payload,
}

impl ReliabilityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(self.interval_ms))
    }
}

/// Sweep points and trial counts of an experiment, known before it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub kind: String,
    pub points: Vec<SweepKey>,
    pub trials_per_point: usize,
    pub total_trials: usize,
    /// Lower bound from timeouts-free pacing alone
    pub min_duration_ms: u64,
}

impl Experiment {
    pub fn kind(&self) -> &'static str {
        match self {
            Experiment::OneWayLatency(_) => "one_way_latency",
            Experiment::RoundTrip(_) => "round_trip",
            Experiment::Encryption(_) => "encryption",
            Experiment::Throughput(_) => "throughput",
            Experiment::Reliability(_) => "reliability",
        }
    }

    /// Sweep keys in the order the runner visits them
    pub fn points(&self) -> Vec<SweepKey> {
        let by_length = |lengths: &RangeSweep| -> Vec<SweepKey> {
            lengths
                .values()
                .into_iter()
                .map(|len| SweepKey::length(len as usize))
                .collect()
        };

        match self {
            Experiment::OneWayLatency(c) => by_length(&c.lengths),
            Experiment::RoundTrip(c) => by_length(&c.lengths),
            Experiment::Encryption(c) => by_length(&c.lengths),
            Experiment::Throughput(c) => {
                let mut keys = Vec::new();
                for len in c.lengths.values() {
                    for freq in c.frequencies.values() {
                        keys.push(SweepKey::length_and_frequency(len as usize, freq));
                    }
                }
                keys
            }
            Experiment::Reliability(c) => vec![SweepKey::length(c.length as usize)],
        }
    }

    pub fn trials_per_point(&self) -> usize {
        match self {
            Experiment::OneWayLatency(c) => c.tests_per_point,
            Experiment::RoundTrip(c) => c.tests_per_point,
            Experiment::Encryption(c) => c.tests_per_point,
            Experiment::Throughput(c) => c.bursts_per_point,
            Experiment::Reliability(c) => c.packets as usize,
        }
    }

    fn pacing_ms(&self) -> u64 {
        match self {
            Experiment::OneWayLatency(c) => c.pacing_ms,
            Experiment::RoundTrip(c) => c.pacing_ms,
            Experiment::Encryption(c) => c.pacing_ms,
            Experiment::Throughput(c) => c.pacing_ms,
            Experiment::Reliability(c) => c.interval_ms,
        }
    }

    /// Nodes whose console output the experiment reads, paired with their role
    fn roles(&self) -> Vec<(&'static str, &SourceId)> {
        match self {
            Experiment::OneWayLatency(c) => vec![("sender", &c.sender), ("receiver", &c.receiver)],
            Experiment::RoundTrip(c) => vec![("sender", &c.sender)],
            Experiment::Encryption(c) => vec![("node", &c.node)],
            Experiment::Throughput(c) => vec![("sender", &c.sender), ("receiver", &c.receiver)],
            Experiment::Reliability(c) => match c.mode {
                ReliabilityMode::RoundTrip => vec![("sender", &c.sender)],
                ReliabilityMode::Payload => {
                    vec![("sender", &c.sender), ("receiver", &c.receiver)]
                }
            },
        }
    }

    /// Nodes only addressed by id
    fn addressed(&self) -> Vec<(&'static str, &SourceId)> {
        match self {
            Experiment::RoundTrip(c) => vec![("receiver", &c.receiver)],
            Experiment::Reliability(c) if c.mode == ReliabilityMode::RoundTrip => {
                vec![("receiver", &c.receiver)]
            }
            _ => Vec::new(),
        }
    }
}

impl ExperimentConfig {
    /// Load from `.json`, `.yaml` or `.yml`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let config = match extension.as_deref() {
            Some("json") => Self::from_json_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            _ => {
                return Err(ProbeError::InvalidConfig(format!(
                    "{}: expected a .json, .yaml or .yml file",
                    path.display()
                )))
            }
        };

        log::debug!(
            "Loaded {} experiment with {} nodes from {}",
            config.experiment.kind(),
            config.nodes.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn node(&self, name: &SourceId) -> Result<&NodeConfig> {
        self.nodes
            .iter()
            .find(|n| &n.name == name)
            .ok_or_else(|| ProbeError::UnknownSource(name.to_string()))
    }

    /// Nodes that have a line source to open
    pub fn connected_nodes(&self) -> impl Iterator<Item = (&NodeConfig, &LineSourceConfig)> {
        self.nodes
            .iter()
            .filter_map(|n| n.source.as_ref().map(|source| (n, source)))
    }

    pub fn reader_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms)
    }

    pub fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ProbeError::InvalidConfig("no nodes configured".to_string()));
        }
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(&node.name) {
                return Err(ProbeError::InvalidConfig(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }
        if self.reader_poll_ms == 0 || self.bus_poll_ms == 0 {
            return Err(ProbeError::InvalidConfig(
                "poll intervals must be > 0".to_string(),
            ));
        }

        for (role, name) in self.experiment.roles() {
            let node = self.node(name)?;
            if node.source.is_none() {
                return Err(ProbeError::InvalidConfig(format!(
                    "{} '{}' needs a source to read its output",
                    role, name
                )));
            }
        }
        for (_, name) in self.experiment.addressed() {
            self.node(name)?;
        }

        match &self.experiment {
            Experiment::OneWayLatency(c) => {
                check_distinct(&c.sender, &c.receiver)?;
                c.lengths.validate("lengths")?;
                check_positive("tests_per_point", c.tests_per_point as u64)?;
                check_positive("timeout_ms", c.timeout_ms)?;
            }
            Experiment::RoundTrip(c) => {
                c.lengths.validate("lengths")?;
                check_positive("tests_per_point", c.tests_per_point as u64)?;
                check_positive("timeout_ms", c.timeout_ms)?;
            }
            Experiment::Encryption(c) => {
                c.lengths.validate("lengths")?;
                check_positive("tests_per_point", c.tests_per_point as u64)?;
                check_positive("timeout_ms", c.timeout_ms)?;
            }
            Experiment::Throughput(c) => {
                check_distinct(&c.sender, &c.receiver)?;
                c.lengths.validate("lengths")?;
                c.frequencies.validate("frequencies")?;
                check_positive("iterations", c.iterations as u64)?;
                check_positive("bursts_per_point", c.bursts_per_point as u64)?;
                check_positive("timeout_ms", c.timeout_ms)?;
            }
            Experiment::Reliability(c) => {
                check_positive("packets", c.packets as u64)?;
                check_positive("length", c.length as u64)?;
                if c.mode == ReliabilityMode::Payload {
                    check_distinct(&c.sender, &c.receiver)?;
                }
                check_positive("interval_ms", c.interval_ms)?;
                check_positive("timeout_ms", c.probe_timeout().as_millis() as u64)?;
            }
        }

        Ok(())
    }

    pub fn plan(&self) -> ExperimentPlan {
        let points = self.experiment.points();
        let trials_per_point = self.experiment.trials_per_point();
        let total_trials = points.len() * trials_per_point;
        ExperimentPlan {
            kind: self.experiment.kind().to_string(),
            min_duration_ms: total_trials as u64 * self.experiment.pacing_ms(),
            points,
            trials_per_point,
            total_trials,
        }
    }
}

fn check_distinct(sender: &SourceId, receiver: &SourceId) -> Result<()> {
    if sender == receiver {
        return Err(ProbeError::InvalidConfig(format!(
            "sender and receiver are both '{}'",
            sender
        )));
    }
    Ok(())
}

fn check_positive(what: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ProbeError::InvalidConfig(format!("{} must be > 0", what)));
    }
    Ok(())
}
