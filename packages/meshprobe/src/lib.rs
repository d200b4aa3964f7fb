pub mod bus;
pub mod config;
pub mod correlator;
pub mod error;
pub mod metrics;
pub mod reader;
pub mod report;
pub mod runner;
pub mod source;
pub mod types;

pub use bus::{BusStats, Consumed, EventBus, EventFilter, Subscription};
pub use config::{
    Experiment, ExperimentConfig, ExperimentPlan, NodeConfig, RangeSweep, ReliabilityMode,
};
pub use correlator::{
    Correlator, Expectation, Field, PayloadWindow, SideProbe, Target, TrialTracker,
};
pub use error::{ProbeError, Result};
pub use metrics::{summarize, Metric, PointSummary, SummaryStat};
pub use reader::{ReaderExit, ReaderHandle, ReaderState, ReaderTask};
pub use report::ExperimentReport;
pub use runner::ExperimentRunner;
pub use source::{LineReader, LineSource, LineSourceConfig, LineWriter};
pub use types::*;
