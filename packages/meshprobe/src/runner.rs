use crate::bus::{EventBus, EventFilter, Subscription};
use crate::config::{Experiment, ExperimentConfig, ReliabilityMode};
use crate::correlator::{burst_deadline, Correlator, Expectation, PayloadWindow};
use crate::error::{ProbeError, Result};
use crate::metrics::summarize_point;
use crate::reader::{ReaderHandle, ReaderState, ReaderSummary, ReaderTask};
use crate::report::ExperimentReport;
use crate::source::{LineSource, LineWriter};
use crate::types::{Command, SourceId, SweepKey, SweepPoint, TrialResult};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Experiment Runner
///
/// Owns the configuration of one run. `run` opens every node's line source,
/// starts one reader task per source, walks the sweep points issuing trials
/// one at a time, and always stops the readers and closes the sources before
/// returning.
pub struct ExperimentRunner {
    config: ExperimentConfig,
    cancel: CancellationToken,
    record_transcript: bool,
    provided: HashMap<SourceId, LineSource>,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            record_transcript: false,
            provided: HashMap::new(),
        })
    }

    /// Use already open sources instead of opening the configured transport
    /// for nodes with the same name
    pub fn with_sources<I>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = LineSource>,
    {
        for source in sources {
            self.provided.insert(source.id().clone(), source);
        }
        self
    }

    /// Keep every line seen during the run in the report
    pub fn record_transcript(mut self, enabled: bool) -> Self {
        self.record_transcript = enabled;
        self
    }

    /// Cancelling this token stops the run after the current read/trial step;
    /// completed points are kept and the report is marked cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<ExperimentReport> {
        let mut report = ExperimentReport::new(self.config.clone());
        let plan = self.config.plan();
        log::info!(
            "Starting {} experiment {}: {} points x {} trials",
            plan.kind,
            report.id,
            plan.points.len(),
            plan.trials_per_point
        );

        let provided = std::mem::take(&mut self.provided);
        let mut session = Session::open(&self.config, provided, &self.cancel).await?;

        let transcript = self
            .record_transcript
            .then(|| session.bus.subscribe(EventFilter::All));

        let outcome = self.execute(&mut session, &mut report).await;

        let (readers, bus) = session.shutdown().await;
        report.readers = readers;
        report.bus = bus;
        if let Some(transcript) = transcript {
            report.transcript = transcript.drain();
        }
        report.finished_at = Some(chrono::Utc::now());
        report.recompute_summaries();

        match outcome {
            Ok(()) => {
                log::info!(
                    "Experiment {} finished: {}/{} trials succeeded",
                    report.id,
                    report.successful_trials(),
                    report.total_trials()
                );
                Ok(report)
            }
            Err(ProbeError::Cancelled) => {
                log::warn!(
                    "Experiment {} cancelled after {} trials",
                    report.id,
                    report.total_trials()
                );
                report.cancelled = true;
                Ok(report)
            }
            Err(e) => {
                log::error!("Experiment {} aborted: {}", report.id, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, session: &mut Session, report: &mut ExperimentReport) -> Result<()> {
        let correlator = Correlator::new(
            session.bus.clone(),
            self.config.bus_poll_interval(),
            self.cancel.clone(),
        );
        let mut payloads = PayloadGenerator::new(self.config.seed);
        let mut wait = Duration::ZERO;

        for key in self.config.experiment.points() {
            log::info!("--- Testing {} ---", key);
            let mut point = SweepPoint::new(key);
            let mut deliveries = self.deliveries(session);

            let outcome = self
                .run_point(
                    key,
                    session,
                    &correlator,
                    &mut payloads,
                    &mut wait,
                    &mut point,
                    deliveries.as_mut(),
                )
                .await;

            // whatever was sent is accounted for, even when the point ends early
            if let Some(deliveries) = deliveries {
                for result in deliveries.window.finish() {
                    point.push(result);
                }
            }

            if outcome.is_ok() {
                if let Ok(summary) = summarize_point(&point) {
                    log::info!(
                        "{}: {}/{} succeeded, loss {:.2}%",
                        key,
                        summary.succeeded,
                        summary.attempted,
                        summary.loss_pct
                    );
                }
            }
            report.points.push(point);
            outcome?;
        }

        Ok(())
    }

    /// Issue every trial of one sweep point into `point`
    #[allow(clippy::too_many_arguments)]
    async fn run_point(
        &self,
        key: SweepKey,
        session: &mut Session,
        correlator: &Correlator,
        payloads: &mut PayloadGenerator,
        wait: &mut Duration,
        point: &mut SweepPoint,
        mut deliveries: Option<&mut Deliveries>,
    ) -> Result<()> {
        let trials_per_point = self.config.experiment.trials_per_point();

        for n in 1..=trials_per_point {
            self.pace(*wait).await?;
            session.check_readers()?;

            let trial = self.plan_trial(key, payloads)?;
            let started = Instant::now();
            let writer = session.writer(&trial.command.target_source)?;
            let result = trial
                .execute(correlator, writer, n, deliveries.as_deref_mut())
                .await?;

            if let Some(result) = result {
                log_trial(key, n, trials_per_point, &result);
                point.push(result);
            }
            *wait = self.pacing_after(started.elapsed());
        }

        Ok(())
    }

    /// Delivery tracking for experiments whose results settle at the receiver
    /// rather than per trial
    fn deliveries(&self, session: &Session) -> Option<Deliveries> {
        match &self.config.experiment {
            Experiment::Reliability(c) if c.mode == ReliabilityMode::Payload => Some(Deliveries {
                subscription: session.bus.subscribe(EventFilter::sources([c.receiver.clone()])),
                window: PayloadWindow::new(c.receiver.clone(), c.max_outstanding),
            }),
            _ => None,
        }
    }

    fn plan_trial(&self, key: SweepKey, payloads: &mut PayloadGenerator) -> Result<PlannedTrial> {
        let length = key.payload_len.unwrap_or_default();

        let trial = match &self.config.experiment {
            Experiment::OneWayLatency(c) => {
                let receiver = self.config.node(&c.receiver)?;
                let payload = payloads.generate(length);
                PlannedTrial {
                    expect: Expect::Response(Expectation::one_way(
                        &c.sender,
                        &c.receiver,
                        &payload,
                        c.encrypted,
                        Duration::from_millis(c.timeout_ms),
                    )),
                    command: Command::unicast(
                        c.sender.clone(),
                        receiver.node_id,
                        payload,
                        c.encrypted,
                    ),
                }
            }
            Experiment::RoundTrip(c) => {
                let receiver = self.config.node(&c.receiver)?;
                PlannedTrial {
                    command: Command::round_trip(c.sender.clone(), receiver.node_id, length),
                    expect: Expect::Response(Expectation::round_trip(
                        &c.sender,
                        Duration::from_millis(c.timeout_ms),
                    )),
                }
            }
            Experiment::Encryption(c) => PlannedTrial {
                command: Command::encryption_bench(c.node.clone(), payloads.generate(length)),
                expect: Expect::Response(Expectation::encryption_bench(
                    &c.node,
                    Duration::from_millis(c.timeout_ms),
                )),
            },
            Experiment::Throughput(c) => {
                let receiver = self.config.node(&c.receiver)?;
                let frequency = key.frequency.unwrap_or(1);
                PlannedTrial {
                    command: Command::burst(
                        c.sender.clone(),
                        receiver.node_id,
                        payloads.generate(length),
                        c.encrypted,
                        frequency,
                        c.iterations,
                    ),
                    expect: Expect::Burst {
                        receiver: c.receiver.clone(),
                        iterations: c.iterations,
                        deadline: burst_deadline(
                            c.iterations,
                            frequency,
                            Duration::from_millis(c.timeout_ms),
                        ),
                    },
                }
            }
            Experiment::Reliability(c) => {
                let receiver = self.config.node(&c.receiver)?;
                match c.mode {
                    ReliabilityMode::RoundTrip => PlannedTrial {
                        command: Command::round_trip(c.sender.clone(), receiver.node_id, length),
                        expect: Expect::Response(Expectation::round_trip(
                            &c.sender,
                            c.probe_timeout(),
                        )),
                    },
                    ReliabilityMode::Payload => PlannedTrial {
                        command: Command::plaintext(
                            c.sender.clone(),
                            receiver.node_id,
                            payloads.generate(length),
                        ),
                        expect: Expect::Delivery {
                            listen: c.probe_timeout(),
                        },
                    },
                }
            }
        };
        Ok(trial)
    }

    /// Delay before the next trial given how long the last one took
    fn pacing_after(&self, elapsed: Duration) -> Duration {
        match &self.config.experiment {
            // fixed send rate: the interval runs from probe start to probe start
            Experiment::Reliability(c) => Duration::from_millis(c.interval_ms).saturating_sub(elapsed),
            Experiment::OneWayLatency(c) => Duration::from_millis(c.pacing_ms),
            Experiment::RoundTrip(c) => Duration::from_millis(c.pacing_ms),
            Experiment::Encryption(c) => Duration::from_millis(c.pacing_ms),
            Experiment::Throughput(c) => Duration::from_millis(c.pacing_ms),
        }
    }

    /// Sleep that ends early with `Cancelled`
    async fn pace(&self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return if self.cancel.is_cancelled() {
                Err(ProbeError::Cancelled)
            } else {
                Ok(())
            };
        }

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(ProbeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn log_trial(key: SweepKey, n: usize, of: usize, result: &TrialResult) {
    if let Some(failure) = &result.failure {
        log::info!("{} trial {}/{}: failed ({})", key, n, of, failure);
    } else if let Some(throughput) = result.throughput_per_sec {
        log::info!("{} trial {}/{}: {:.2} msg/s", key, n, of, throughput);
    } else if let Some(latency) = result.total_latency_ms {
        log::info!("{} trial {}/{}: {:.2} ms", key, n, of, latency);
    }
}

enum Expect {
    Response(Expectation),
    Burst {
        receiver: SourceId,
        iterations: u32,
        deadline: Duration,
    },
    /// Settled through the point's `PayloadWindow`, not per trial
    Delivery { listen: Duration },
}

struct Deliveries {
    subscription: Subscription,
    window: PayloadWindow,
}

struct PlannedTrial {
    command: Command,
    expect: Expect,
}

impl PlannedTrial {
    /// Run the trial; `None` when its result is settled later by `deliveries`
    async fn execute(
        &self,
        correlator: &Correlator,
        writer: &mut LineWriter,
        index: usize,
        deliveries: Option<&mut Deliveries>,
    ) -> Result<Option<TrialResult>> {
        match &self.expect {
            Expect::Response(expectation) => correlator
                .correlate(writer, &self.command, expectation)
                .await
                .map(Some),
            Expect::Burst {
                receiver,
                iterations,
                deadline,
            } => correlator
                .collect_burst(writer, &self.command, receiver, *iterations, *deadline)
                .await
                .map(Some),
            Expect::Delivery { listen } => {
                let deliveries = deliveries.ok_or_else(|| {
                    ProbeError::InvalidConfig("delivery trial without a payload window".to_string())
                })?;
                correlator
                    .listen_for_deliveries(
                        writer,
                        &self.command,
                        &deliveries.subscription,
                        &mut deliveries.window,
                        index,
                        *listen,
                    )
                    .await?;
                Ok(None)
            }
        }
    }
}

/// Random alphanumeric payloads, reproducible when seeded
pub struct PayloadGenerator {
    rng: StdRng,
}

impl PayloadGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn generate(&mut self, length: usize) -> String {
        (0..length)
            .map(|_| char::from(self.rng.sample(Alphanumeric)))
            .collect()
    }
}

/// Open sources, their reader tasks and the bus between them
struct Session {
    bus: EventBus,
    writers: HashMap<SourceId, LineWriter>,
    readers: Vec<ReaderHandle>,
    cancel: CancellationToken,
}

impl Session {
    /// Open every source first; reader tasks only start once all are open
    async fn open(
        config: &ExperimentConfig,
        mut provided: HashMap<SourceId, LineSource>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let mut opened = Vec::new();

        for node in &config.nodes {
            let source = match (provided.remove(&node.name), &node.source) {
                (Some(source), _) => source,
                (None, Some(source_config)) => {
                    let result = tokio::select! {
                        biased;

                        _ = parent.cancelled() => Err(ProbeError::Cancelled),
                        result = source_config.open(&node.name) => result,
                    };
                    match result {
                        Ok(source) => source,
                        Err(e) => {
                            close_all(opened.into_iter().map(|s: LineSource| s.split().1)).await;
                            return Err(e);
                        }
                    }
                }
                (None, None) => continue,
            };
            opened.push(source);
        }

        let bus = EventBus::new();
        let cancel = parent.child_token();
        let mut writers = HashMap::new();
        let mut readers = Vec::new();

        for source in opened {
            let id = source.id().clone();
            let (reader, writer) = source.split();
            readers.push(ReaderTask::spawn(
                reader,
                bus.clone(),
                cancel.child_token(),
                config.reader_poll_interval(),
            ));
            writers.insert(id, writer);
        }

        log::info!("{} line sources open, readers running", writers.len());
        Ok(Self {
            bus,
            writers,
            readers,
            cancel,
        })
    }

    /// Fails once any reader has stopped; trials after that could only time out
    fn check_readers(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        match self.readers.iter().find(|r| r.state() == ReaderState::Stopped) {
            Some(reader) => {
                log::warn!(
                    "Reader for '{}' is no longer running, ending the run",
                    reader.source_id()
                );
                Err(ProbeError::SourceClosed(reader.source_id().to_string()))
            }
            None => Ok(()),
        }
    }

    fn writer(&mut self, id: &SourceId) -> Result<&mut LineWriter> {
        self.writers
            .get_mut(id)
            .ok_or_else(|| ProbeError::UnknownSource(id.to_string()))
    }

    /// Stop and join every reader, then close the write halves
    async fn shutdown(mut self) -> (Vec<ReaderSummary>, crate::bus::BusStats) {
        for reader in &self.readers {
            reader.stop();
        }

        let mut summaries = Vec::new();
        for reader in std::mem::take(&mut self.readers) {
            let source = reader.source_id().clone();
            match reader.join().await {
                Ok((_, summary)) => summaries.push(summary),
                Err(e) => log::error!("Reader for '{}' did not shut down cleanly: {}", source, e),
            }
        }

        let writers = std::mem::take(&mut self.writers);
        close_all(writers.into_values()).await;

        log::info!("All line sources closed");
        (summaries, self.bus.stats())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // readers are detached tasks; make sure they never outlive the session
        self.cancel.cancel();
    }
}

async fn close_all<I>(writers: I)
where
    I: IntoIterator<Item = LineWriter>,
{
    for mut writer in writers {
        if let Err(e) = writer.close().await {
            log::debug!("Closing '{}': {}", writer.source_id(), e);
        }
    }
}
