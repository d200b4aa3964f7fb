// Command/response correlation
//
// A trial writes one command and then watches the bus until the event that
// completes it shows up or the deadline passes. Everything seen on the way is
// offered to the trial's side probes, which pull timing fields out of the
// firmware's debug output.
//
// The bookkeeping lives in TrialTracker / BurstTracker, which only look at the
// events they are fed. Feeding the same events again gives the same result, so
// recorded transcripts can be replayed without hardware.

use crate::bus::{Consumed, EventBus, EventFilter, Subscription};
use crate::error::{ProbeError, Result};
use crate::source::LineWriter;
use crate::types::{Command, LineEvent, SourceId, TrialFailure, TrialResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timing fields the firmware prints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    EncryptionTime,
    DecryptionTime,
    RoundTripLatency,
    Outbound,
    Inbound,
}

impl Field {
    pub fn marker(&self) -> &'static str {
        match self {
            Field::EncryptionTime => "Encryption time /us:",
            Field::DecryptionTime => "Decryption time /us:",
            Field::RoundTripLatency => "Round-trip latency /us:",
            Field::Outbound => "OUTBOUND",
            Field::Inbound => "INBOUND",
        }
    }

    /// Microsecond counters carry a value; markers only carry their arrival time
    pub fn carries_value(&self) -> bool {
        matches!(
            self,
            Field::EncryptionTime | Field::DecryptionTime | Field::RoundTripLatency
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::EncryptionTime => "encryption time",
            Field::DecryptionTime => "decryption time",
            Field::RoundTripLatency => "round-trip latency",
            Field::Outbound => "OUTBOUND marker",
            Field::Inbound => "INBOUND marker",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observed {
    Millis(f64),
    At(DateTime<Utc>),
}

/// Parse the integer microsecond count following `marker` and convert it to milliseconds
pub fn parse_micros(text: &str, marker: &str) -> Result<f64> {
    let malformed = || ProbeError::MalformedResponse {
        field: marker.trim_end_matches(':').to_string(),
        text: text.to_string(),
    };

    let (_, rest) = text.split_once(marker).ok_or_else(malformed)?;
    let micros: i64 = rest
        .split_whitespace()
        .next()
        .ok_or_else(malformed)?
        .parse()
        .map_err(|_| malformed())?;

    Ok(micros as f64 / 1000.0)
}

/// Extracts one field from events, optionally only from one source
#[derive(Debug, Clone, PartialEq)]
pub struct SideProbe {
    pub field: Field,
    pub source: Option<SourceId>,
}

impl SideProbe {
    pub fn new(field: Field, source: Option<SourceId>) -> Self {
        Self { field, source }
    }

    /// A present but unparseable value is logged and treated as absent
    pub fn extract(&self, event: &LineEvent) -> Option<Observed> {
        if let Some(source) = &self.source {
            if !event.is_from(source) {
                return None;
            }
        }
        if !event.text.contains(self.field.marker()) {
            return None;
        }

        if self.field.carries_value() {
            match parse_micros(&event.text, self.field.marker()) {
                Ok(ms) => Some(Observed::Millis(ms)),
                Err(e) => {
                    log::warn!("Ignoring {} from '{}': {}", self.field, event.source, e);
                    None
                }
            }
        } else {
            Some(Observed::At(event.timestamp))
        }
    }
}

type Predicate = Arc<dyn Fn(&LineEvent) -> bool + Send + Sync>;

/// Decides which event completes a trial
#[derive(Clone)]
pub struct Target {
    description: String,
    predicate: Predicate,
}

impl Target {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&LineEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// The receiver printing `Decrypted message...: <payload>` for exactly this payload
    pub fn decrypted_payload(receiver: SourceId, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let description = format!("'{}' decrypts {}", receiver, payload);
        Self::new(description, move |event| {
            event.is_from(&receiver) && is_decrypted_payload(&event.text, &payload)
        })
    }

    /// A parseable occurrence of `field`, from `source` if given
    pub fn field(field: Field, source: Option<SourceId>) -> Self {
        let probe = SideProbe::new(field, source);
        let description = match &probe.source {
            Some(source) => format!("{} from '{}'", field, source),
            None => field.to_string(),
        };
        Self::new(description, move |event| {
            let marker = probe.field.marker();
            probe.source.as_ref().map_or(true, |s| event.is_from(s))
                && event.text.contains(marker)
                && (!probe.field.carries_value() || parse_micros(&event.text, marker).is_ok())
        })
    }

    pub fn matches(&self, event: &LineEvent) -> bool {
        (self.predicate)(event)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

fn is_decrypted_payload(text: &str, payload: &str) -> bool {
    text.strip_prefix("Decrypted message")
        .and_then(|rest| rest.split_once(": "))
        .map_or(false, |(_, received)| received.trim_end() == payload)
}

/// How a matched trial turns its observations into metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    /// `encryption + transit + decryption`, transit from OUTBOUND to INBOUND
    OneWay { encrypted: bool },
    /// Device-measured round trip; one-way latency is half of it
    RoundTrip,
    /// On-device encrypt/decrypt timings only
    EncryptionBench,
}

/// Everything the correlator needs to know about one trial's response
#[derive(Debug, Clone)]
pub struct Expectation {
    pub target: Target,
    pub probes: Vec<SideProbe>,
    pub derivation: Derivation,
    pub timeout: Duration,
}

impl Expectation {
    pub fn one_way(
        sender: &SourceId,
        receiver: &SourceId,
        payload: &str,
        encrypted: bool,
        timeout: Duration,
    ) -> Self {
        let mut probes = vec![
            SideProbe::new(Field::Outbound, Some(sender.clone())),
            SideProbe::new(Field::Inbound, Some(receiver.clone())),
        ];
        if encrypted {
            probes.push(SideProbe::new(Field::EncryptionTime, Some(sender.clone())));
            probes.push(SideProbe::new(Field::DecryptionTime, Some(receiver.clone())));
        }

        Self {
            target: Target::decrypted_payload(receiver.clone(), payload),
            probes,
            derivation: Derivation::OneWay { encrypted },
            timeout,
        }
    }

    pub fn round_trip(sender: &SourceId, timeout: Duration) -> Self {
        Self {
            target: Target::field(Field::RoundTripLatency, Some(sender.clone())),
            probes: vec![SideProbe::new(Field::RoundTripLatency, Some(sender.clone()))],
            derivation: Derivation::RoundTrip,
            timeout,
        }
    }

    /// Completes once both timings are in, whichever the node prints first
    pub fn encryption_bench(node: &SourceId, timeout: Duration) -> Self {
        let bench_node = node.clone();
        let target = Target::new(
            format!("encryption and decryption time from '{}'", node),
            move |event| {
                event.is_from(&bench_node)
                    && [Field::EncryptionTime, Field::DecryptionTime]
                        .iter()
                        .any(|field| parse_micros(&event.text, field.marker()).is_ok())
            },
        );
        Self {
            target,
            probes: vec![
                SideProbe::new(Field::EncryptionTime, Some(node.clone())),
                SideProbe::new(Field::DecryptionTime, Some(node.clone())),
            ],
            derivation: Derivation::EncryptionBench,
            timeout,
        }
    }
}

/// Observation state of one trial
pub struct TrialTracker<'a> {
    expectation: &'a Expectation,
    observed: BTreeMap<Field, Observed>,
    matched: Option<DateTime<Utc>>,
}

impl<'a> TrialTracker<'a> {
    pub fn new(expectation: &'a Expectation) -> Self {
        Self {
            expectation,
            observed: BTreeMap::new(),
            matched: None,
        }
    }

    /// Feed one event; returns true once the target has matched.
    /// Events after the match are ignored.
    pub fn observe(&mut self, event: &LineEvent) -> bool {
        if self.matched.is_some() {
            return true;
        }

        for probe in &self.expectation.probes {
            if self.observed.contains_key(&probe.field) {
                continue;
            }
            if let Some(value) = probe.extract(event) {
                self.observed.insert(probe.field, value);
            }
        }

        if self.expectation.target.matches(event) && self.has_required_fields() {
            self.matched = Some(event.timestamp);
        }
        self.matched.is_some()
    }

    /// Timing-only derivations need every field before they complete
    fn has_required_fields(&self) -> bool {
        match self.expectation.derivation {
            Derivation::EncryptionBench => [Field::EncryptionTime, Field::DecryptionTime]
                .iter()
                .all(|field| self.observed.contains_key(field)),
            Derivation::OneWay { .. } | Derivation::RoundTrip => true,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched.is_some()
    }

    /// Build the trial's result. Unmatched trials keep none of their observations.
    pub fn finish(self) -> TrialResult {
        if self.matched.is_none() {
            return TrialResult::failed(TrialFailure::Timeout);
        }

        match self.derive() {
            Ok(result) => result,
            Err(missing) => {
                log::warn!(
                    "Target '{}' matched but {} was never observed",
                    self.expectation.target.description(),
                    missing
                );
                TrialResult::failed(TrialFailure::IncompleteMetrics(missing.to_string()))
            }
        }
    }

    fn millis(&self, field: Field) -> std::result::Result<f64, Field> {
        match self.observed.get(&field) {
            Some(Observed::Millis(ms)) => Ok(*ms),
            _ => Err(field),
        }
    }

    fn instant(&self, field: Field) -> std::result::Result<DateTime<Utc>, Field> {
        match self.observed.get(&field) {
            Some(Observed::At(at)) => Ok(*at),
            _ => Err(field),
        }
    }

    fn derive(&self) -> std::result::Result<TrialResult, Field> {
        let result = match self.expectation.derivation {
            Derivation::OneWay { encrypted } => {
                let outbound = self.instant(Field::Outbound)?;
                let inbound = self.instant(Field::Inbound)?;
                let (encryption, decryption) = if encrypted {
                    (
                        self.millis(Field::EncryptionTime)?,
                        self.millis(Field::DecryptionTime)?,
                    )
                } else {
                    (0.0, 0.0)
                };

                let transit = transit_ms(outbound, inbound);
                TrialResult {
                    success: true,
                    total_latency_ms: Some(encryption + transit + decryption),
                    encryption_ms: Some(encryption),
                    decryption_ms: Some(decryption),
                    transit_ms: Some(transit),
                    ..Default::default()
                }
            }
            Derivation::RoundTrip => {
                let round_trip = self.millis(Field::RoundTripLatency)?;
                TrialResult {
                    success: true,
                    round_trip_ms: Some(round_trip),
                    total_latency_ms: Some(round_trip / 2.0),
                    ..Default::default()
                }
            }
            Derivation::EncryptionBench => {
                let encryption = self.millis(Field::EncryptionTime)?;
                let decryption = self.millis(Field::DecryptionTime)?;
                TrialResult {
                    success: true,
                    total_latency_ms: Some(encryption + decryption),
                    encryption_ms: Some(encryption),
                    decryption_ms: Some(decryption),
                    ..Default::default()
                }
            }
        };
        Ok(result)
    }
}

/// Wall-clock delta between the two markers, clamped at zero
pub fn transit_ms(outbound: DateTime<Utc>, inbound: DateTime<Utc>) -> f64 {
    let delta = inbound.signed_duration_since(outbound);
    let ms = match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    };

    if ms < 0.0 {
        log::warn!(
            "Negative transit time ({:.3} ms, INBOUND before OUTBOUND); clamping to 0",
            ms
        );
        0.0
    } else {
        ms
    }
}

/// Receiver-side counting for a throughput burst
pub struct BurstTracker {
    receiver: SourceId,
    iterations: u32,
    seen: HashSet<u64>,
}

impl BurstTracker {
    pub fn new(receiver: SourceId, iterations: u32) -> Self {
        Self {
            receiver,
            iterations,
            seen: HashSet::new(),
        }
    }

    /// Count a `Received ... msg=<json>` line once per `message_number`.
    /// Returns true when every message of the burst has been seen.
    pub fn observe(&mut self, event: &LineEvent) -> bool {
        if event.is_from(&self.receiver) {
            if let Some(number) = message_number(&event.text) {
                if !self.seen.insert(number) {
                    log::debug!("Duplicate message number {} from '{}'", number, event.source);
                }
            }
        }
        self.is_complete()
    }

    pub fn received(&self) -> u32 {
        self.seen.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received() >= self.iterations
    }

    /// Result for a burst that ran for `elapsed`
    pub fn finish(self, elapsed: Duration) -> TrialResult {
        let received = self.received();
        let seconds = elapsed.as_secs_f64();
        let throughput = if seconds > 0.0 {
            received as f64 / seconds
        } else {
            0.0
        };

        let mut result = if received > 0 {
            TrialResult {
                success: true,
                ..Default::default()
            }
        } else {
            TrialResult::failed(TrialFailure::NothingReceived)
        };
        result.sent_count = Some(self.iterations);
        result.received_count = Some(received);
        result.duration_ms = Some(seconds * 1000.0);
        result.throughput_per_sec = Some(throughput);
        result
    }
}

fn message_number(text: &str) -> Option<u64> {
    if !text.contains("Received") {
        return None;
    }
    let (_, content) = text.split_once("msg=")?;
    let content = content.trim();
    if content.eq_ignore_ascii_case("null") {
        log::trace!("Null message body: {}", text);
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Undecodable message body '{}': {}", content, e);
            return None;
        }
    };

    match value.get("message_number") {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => {
            log::warn!("Message body without message_number: {}", content);
            None
        }
    }
}

/// How long to wait for a burst: twice its nominal duration, but at least `timeout`
pub fn burst_deadline(iterations: u32, frequency: u32, timeout: Duration) -> Duration {
    if frequency == 0 {
        return timeout;
    }
    let nominal = Duration::from_secs_f64(2.0 * iterations as f64 / frequency as f64);
    nominal.max(timeout)
}

/// Payloads sent but not yet seen at the receiver, oldest first
///
/// A delivery is credited to whichever outstanding payload it carries, so a
/// packet arriving after later ones were sent still counts. Once more than
/// `capacity` payloads are outstanding the oldest are written off as lost.
pub struct PayloadWindow {
    receiver: SourceId,
    capacity: usize,
    outstanding: VecDeque<Outstanding>,
    settled: BTreeMap<usize, TrialResult>,
}

struct Outstanding {
    index: usize,
    payload: String,
    sent_at: DateTime<Utc>,
}

impl PayloadWindow {
    pub fn new(receiver: SourceId, capacity: usize) -> Self {
        Self {
            receiver,
            capacity,
            outstanding: VecDeque::new(),
            settled: BTreeMap::new(),
        }
    }

    /// Track packet number `index`, sent at `sent_at`
    pub fn sent(&mut self, index: usize, payload: impl Into<String>, sent_at: DateTime<Utc>) {
        self.outstanding.push_back(Outstanding {
            index,
            payload: payload.into(),
            sent_at,
        });
    }

    /// Credit a `msg=<payload>` line from the receiver. Returns true if it
    /// settled an outstanding packet.
    pub fn observe(&mut self, event: &LineEvent) -> bool {
        if !event.is_from(&self.receiver) {
            return false;
        }
        let Some((_, received)) = event.text.split_once("msg=") else {
            return false;
        };
        let received = received.trim();

        let Some(pos) = self.outstanding.iter().position(|o| o.payload == received) else {
            log::debug!("Unexpected payload at '{}': {}", event.source, received);
            return false;
        };
        let Some(packet) = self.outstanding.remove(pos) else {
            return false;
        };

        let latency = transit_ms(packet.sent_at, event.timestamp);
        log::info!("Packet {} delivered after {:.2} ms", packet.index, latency);
        self.settled.insert(
            packet.index,
            TrialResult {
                success: true,
                total_latency_ms: Some(latency),
                ..Default::default()
            },
        );
        true
    }

    /// Write off the oldest packets beyond the window capacity
    pub fn evict_overflow(&mut self) {
        while self.outstanding.len() > self.capacity {
            if let Some(lost) = self.outstanding.pop_front() {
                log::warn!("Packet {} lost: {}", lost.index, lost.payload);
                self.settled
                    .insert(lost.index, TrialResult::failed(TrialFailure::Timeout));
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn delivered(&self) -> usize {
        self.settled.values().filter(|r| r.success).count()
    }

    /// One result per sent packet in send order; anything still outstanding is lost
    pub fn finish(mut self) -> Vec<TrialResult> {
        for lost in self.outstanding.drain(..) {
            self.settled
                .insert(lost.index, TrialResult::failed(TrialFailure::Timeout));
        }
        self.settled.into_values().collect()
    }
}

/// Runs trials against the bus. Only one correlation runs at a time per runner.
pub struct Correlator {
    bus: EventBus,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Correlator {
    pub fn new(bus: EventBus, poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            bus,
            poll_interval,
            cancel,
        }
    }

    /// Send `command` and wait for `expectation` to be met
    ///
    /// Trial-level failures come back as a failed `TrialResult`. Errors are
    /// reserved for a failed write (the run cannot continue) and cancellation.
    pub async fn correlate(
        &self,
        writer: &mut LineWriter,
        command: &Command,
        expectation: &Expectation,
    ) -> Result<TrialResult> {
        // subscribe before writing so no response can slip past
        let subscription = self.bus.subscribe(EventFilter::All);
        let mut tracker = TrialTracker::new(expectation);

        let deadline = self.send(writer, command).await? + expectation.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let consumed = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(ProbeError::Cancelled),
                consumed = subscription.consume(remaining.min(self.poll_interval)) => consumed,
            };

            if let Consumed::Event(event) = consumed {
                if tracker.observe(&event) {
                    break;
                }
            }
        }

        if !tracker.is_matched() {
            log::warn!(
                "Timed out after {:?} waiting for {}",
                expectation.timeout,
                expectation.target.description()
            );
        }
        Ok(tracker.finish())
    }

    /// Send a burst command and count what `receiver` gets until all
    /// `iterations` arrive or `deadline` passes
    pub async fn collect_burst(
        &self,
        writer: &mut LineWriter,
        command: &Command,
        receiver: &SourceId,
        iterations: u32,
        deadline: Duration,
    ) -> Result<TrialResult> {
        let subscription = self.bus.subscribe(EventFilter::sources([receiver.clone()]));
        let mut tracker = BurstTracker::new(receiver.clone(), iterations);

        let started = self.send(writer, command).await?;
        let ends_at = started + deadline;

        while !tracker.is_complete() {
            let remaining = ends_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let consumed = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(ProbeError::Cancelled),
                consumed = subscription.consume(remaining.min(self.poll_interval)) => consumed,
            };

            if let Consumed::Event(event) = consumed {
                tracker.observe(&event);
            }
        }

        let elapsed = started.elapsed();
        log::info!(
            "Burst to '{}': {}/{} received in {:.2} s",
            receiver,
            tracker.received(),
            iterations,
            elapsed.as_secs_f64()
        );
        Ok(tracker.finish(elapsed))
    }

    /// Send one packet tracked by `window`, then listen for deliveries of any
    /// outstanding packet for `listen`
    ///
    /// `subscription` must outlive the whole series so deliveries landing
    /// between two calls are still seen.
    pub async fn listen_for_deliveries(
        &self,
        writer: &mut LineWriter,
        command: &Command,
        subscription: &Subscription,
        window: &mut PayloadWindow,
        index: usize,
        listen: Duration,
    ) -> Result<()> {
        let sent_at = Utc::now();
        let issued = self.send(writer, command).await?;
        window.sent(index, command.payload.clone(), sent_at);
        let ends_at = issued + listen;

        loop {
            let remaining = ends_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let consumed = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(ProbeError::Cancelled),
                consumed = subscription.consume(remaining.min(self.poll_interval)) => consumed,
            };

            if let Consumed::Event(event) = consumed {
                window.observe(&event);
            }
        }

        window.evict_overflow();
        Ok(())
    }

    async fn send(&self, writer: &mut LineWriter, command: &Command) -> Result<Instant> {
        if writer.source_id() != &command.target_source {
            return Err(ProbeError::UnknownSource(format!(
                "command for '{}' handed to writer of '{}'",
                command.target_source,
                writer.source_id()
            )));
        }

        let line = command.to_string();
        log::info!(
            "[{}][{} OUT] {}",
            Utc::now().format("%H:%M:%S%.3f"),
            command.target_source,
            line
        );
        let issued = Instant::now();
        writer.write_line(&line).await?;
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LineReader;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn event(source: &str, ms: i64, text: &str) -> LineEvent {
        LineEvent::new(SourceId::from(source), at(ms), text)
    }

    fn sender() -> SourceId {
        SourceId::from("sender")
    }

    fn receiver() -> SourceId {
        SourceId::from("receiver")
    }

    fn replay(expectation: &Expectation, events: &[LineEvent]) -> TrialResult {
        let mut tracker = TrialTracker::new(expectation);
        for event in events {
            if tracker.observe(event) {
                break;
            }
        }
        tracker.finish()
    }

    #[test]
    fn test_parse_micros() {
        assert_eq!(
            parse_micros("Encryption time /us:1500", Field::EncryptionTime.marker()).unwrap(),
            1.5
        );
        assert_eq!(
            parse_micros(
                "I (1234) mesh: Round-trip latency /us: 32000 ",
                Field::RoundTripLatency.marker()
            )
            .unwrap(),
            32.0
        );
        assert!(matches!(
            parse_micros("Decryption time /us:abc", Field::DecryptionTime.marker()),
            Err(ProbeError::MalformedResponse { .. })
        ));
        assert!(parse_micros("Decryption time /us:", Field::DecryptionTime.marker()).is_err());
    }

    #[test]
    fn test_unencrypted_one_way_trial() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "ABCXYZ", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 2, "OUTBOUND"),
                event("receiver", 18, "INBOUND"),
                event("receiver", 19, "Decrypted message: ABCXYZ"),
            ],
        );

        assert!(result.success);
        assert_eq!(result.transit_ms, Some(16.0));
        assert_eq!(result.encryption_ms, Some(0.0));
        assert_eq!(result.decryption_ms, Some(0.0));
        assert_eq!(result.total_latency_ms, Some(16.0));
    }

    #[test]
    fn test_encrypted_one_way_trial_sums_components() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "k3y", true, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 0, "Encryption time /us:1200"),
                event("sender", 1, "OUTBOUND"),
                event("receiver", 31, "INBOUND"),
                event("receiver", 32, "Decryption time /us:800"),
                event("receiver", 33, "Decrypted message (AES): k3y"),
            ],
        );

        assert!(result.success);
        assert_eq!(result.encryption_ms, Some(1.2));
        assert_eq!(result.decryption_ms, Some(0.8));
        assert_eq!(result.transit_ms, Some(30.0));
        assert_eq!(result.total_latency_ms, Some(1.2 + 30.0 + 0.8));
    }

    #[test]
    fn test_negative_transit_is_clamped() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "p", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 100, "OUTBOUND"),
                event("receiver", 95, "INBOUND"),
                event("receiver", 101, "Decrypted message: p"),
            ],
        );

        assert!(result.success);
        assert_eq!(result.transit_ms, Some(0.0));
    }

    #[test]
    fn test_first_observation_wins() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "p", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 10, "OUTBOUND"),
                event("sender", 40, "OUTBOUND"),
                event("receiver", 50, "INBOUND"),
                event("receiver", 51, "Decrypted message: p"),
            ],
        );
        assert_eq!(result.transit_ms, Some(40.0));
    }

    #[test]
    fn test_replay_is_identical() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "abc", true, Duration::from_secs(5));
        let events = vec![
            event("sender", 0, "Encryption time /us:950"),
            event("receiver", 3, "noise"),
            event("sender", 4, "OUTBOUND"),
            event("receiver", 27, "INBOUND"),
            event("receiver", 28, "Decryption time /us:1010"),
            event("receiver", 29, "Decrypted message: abc"),
            event("receiver", 30, "INBOUND"),
        ];

        let first = replay(&expectation, &events);
        let second = replay(&expectation, &events);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_unmatched_trial_discards_observations() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "lost", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 1, "OUTBOUND"),
                event("receiver", 9, "INBOUND"),
                event("receiver", 10, "Decrypted message: other"),
            ],
        );
        assert_eq!(result, TrialResult::failed(TrialFailure::Timeout));
    }

    #[test]
    fn test_target_from_wrong_source_does_not_match() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "p", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("sender", 1, "OUTBOUND"),
                event("receiver", 9, "INBOUND"),
                event("sender", 10, "Decrypted message: p"),
            ],
        );
        assert!(!result.success);
    }

    #[test]
    fn test_missing_marker_is_incomplete() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "p", false, Duration::from_secs(5));
        let result = replay(
            &expectation,
            &[
                event("receiver", 9, "INBOUND"),
                event("receiver", 10, "Decrypted message: p"),
            ],
        );
        assert_eq!(
            result.failure,
            Some(TrialFailure::IncompleteMetrics("OUTBOUND marker".to_string()))
        );
    }

    #[test]
    fn test_malformed_field_is_treated_as_absent() {
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "p", true, Duration::from_secs(5));
        let events = [
            event("sender", 0, "Encryption time /us:12x"),
            event("sender", 1, "OUTBOUND"),
            event("receiver", 5, "INBOUND"),
            event("receiver", 6, "Decryption time /us:700"),
            event("receiver", 7, "Decrypted message: p"),
        ];
        let result = replay(&expectation, &events);
        assert!(!result.success);
        assert_eq!(
            result.failure,
            Some(TrialFailure::IncompleteMetrics("encryption time".to_string()))
        );

        // a later well-formed line still counts
        let mut events = events.to_vec();
        events.insert(1, event("sender", 0, "Encryption time /us:1000"));
        let result = replay(&expectation, &events);
        assert!(result.success);
        assert_eq!(result.encryption_ms, Some(1.0));
    }

    #[test]
    fn test_round_trip_halves_latency() {
        let expectation = Expectation::round_trip(&sender(), Duration::from_secs(10));
        let result = replay(
            &expectation,
            &[
                event("sender", 0, "Round-trip latency /us:bogus"),
                event("sender", 5, "Round-trip latency /us:48000"),
            ],
        );
        assert!(result.success);
        assert_eq!(result.round_trip_ms, Some(48.0));
        assert_eq!(result.total_latency_ms, Some(24.0));
    }

    #[test]
    fn test_encryption_bench() {
        let expectation = Expectation::encryption_bench(&sender(), Duration::from_secs(10));
        let result = replay(
            &expectation,
            &[
                event("sender", 0, "Encryption time /us:350"),
                event("sender", 1, "Decryption time /us:410"),
            ],
        );
        assert!(result.success);
        assert_eq!(result.encryption_ms, Some(0.35));
        assert_eq!(result.decryption_ms, Some(0.41));
    }

    #[test]
    fn test_encryption_bench_accepts_either_order() {
        let expectation = Expectation::encryption_bench(&sender(), Duration::from_secs(10));
        let result = replay(
            &expectation,
            &[
                event("sender", 0, "Decryption time /us:410"),
                event("sender", 1, "Encryption time /us:350"),
            ],
        );
        assert!(result.success);
        assert_eq!(result.encryption_ms, Some(0.35));
        assert_eq!(result.decryption_ms, Some(0.41));

        let mut tracker = TrialTracker::new(&expectation);
        assert!(!tracker.observe(&event("sender", 0, "Decryption time /us:410")));
        assert!(!tracker.observe(&event("receiver", 1, "Encryption time /us:350")));
        assert!(tracker.observe(&event("sender", 2, "Encryption time /us:350")));
    }

    #[test]
    fn test_encryption_bench_with_one_timing_times_out() {
        let expectation = Expectation::encryption_bench(&sender(), Duration::from_secs(10));
        let result = replay(&expectation, &[event("sender", 0, "Decryption time /us:410")]);
        assert_eq!(result.failure, Some(TrialFailure::Timeout));
    }

    #[test]
    fn test_payload_window_credits_late_delivery() {
        let mut window = PayloadWindow::new(receiver(), 5);
        window.sent(0, "first", at(0));
        window.sent(1, "second", at(100));

        assert!(window.observe(&event("receiver", 130, "Received from 1: msg=second")));
        // late, but still inside the window
        assert!(window.observe(&event("receiver", 190, "Received from 1: msg=first ")));
        assert!(!window.observe(&event("receiver", 191, "Received from 1: msg=first")));
        assert!(!window.observe(&event("sender", 192, "msg=second")));
        assert_eq!(window.outstanding(), 0);

        let results = window.finish();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].total_latency_ms, Some(190.0));
        assert_eq!(results[1].total_latency_ms, Some(30.0));
    }

    #[test]
    fn test_payload_window_writes_off_oldest_beyond_capacity() {
        let mut window = PayloadWindow::new(receiver(), 2);
        for (i, payload) in ["a", "b", "c", "d"].iter().enumerate() {
            window.sent(i, *payload, at(i as i64 * 100));
            window.evict_overflow();
        }
        assert_eq!(window.outstanding(), 2);

        // "a" was already written off
        assert!(!window.observe(&event("receiver", 500, "msg=a")));
        assert!(window.observe(&event("receiver", 510, "msg=c")));
        assert_eq!(window.delivered(), 1);

        let results = window.finish();
        let outcome: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(outcome, vec![false, false, true, false]);
        assert_eq!(results[3].failure, Some(TrialFailure::Timeout));
    }

    #[test]
    fn test_burst_counts_sequence_numbers_once() {
        let mut tracker = BurstTracker::new(receiver(), 10);
        let lines = [
            r#"Received from 480652657: msg={"message_number": 6, "payload": "x"}"#,
            r#"Received from 480652657: msg={"message_number": 7, "payload": "x"}"#,
            r#"Received from 480652657: msg={"message_number": 7, "payload": "x"}"#,
            r#"Received from 480652657: msg=null"#,
            r#"Received from 480652657: msg={broken"#,
        ];
        for (i, line) in lines.iter().enumerate() {
            tracker.observe(&event("receiver", i as i64, line));
        }
        // same line on the sender's console is not a delivery
        tracker.observe(&event("sender", 9, lines[0]));

        assert_eq!(tracker.received(), 2);
        let result = tracker.finish(Duration::from_secs(2));
        assert!(result.success);
        assert_eq!(result.sent_count, Some(10));
        assert_eq!(result.received_count, Some(2));
        assert_eq!(result.throughput_per_sec, Some(1.0));
    }

    #[test]
    fn test_empty_burst_keeps_counts() {
        let tracker = BurstTracker::new(receiver(), 5);
        let result = tracker.finish(Duration::from_secs(1));
        assert_eq!(result.failure, Some(TrialFailure::NothingReceived));
        assert_eq!(result.sent_count, Some(5));
        assert_eq!(result.received_count, Some(0));
    }

    #[test]
    fn test_burst_deadline() {
        let timeout = Duration::from_secs(10);
        assert_eq!(burst_deadline(10, 1, timeout), Duration::from_secs(20));
        assert_eq!(burst_deadline(10, 100, timeout), timeout);
        assert_eq!(burst_deadline(10, 0, timeout), timeout);
    }

    /// Writer whose bytes land in a reader the test can inspect
    fn wired_writer(source: &str) -> (LineWriter, LineReader) {
        let (host, device) = tokio::io::duplex(1024);
        let (_, host_tx) = tokio::io::split(host);
        let (device_rx, _) = tokio::io::split(device);
        (
            LineWriter::new(SourceId::from(source), Box::new(host_tx)),
            LineReader::new(SourceId::from("device"), Box::new(device_rx)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_no_earlier_than_deadline() {
        let bus = EventBus::new();
        let correlator =
            Correlator::new(bus.clone(), Duration::from_millis(100), CancellationToken::new());
        let (mut writer, _device) = wired_writer("sender");

        let timeout = Duration::from_millis(2_500);
        let expectation = Expectation::one_way(&sender(), &receiver(), "zz", false, timeout);
        let command = Command::plaintext(sender(), 42, "zz");

        let started = Instant::now();
        let result = correlator
            .correlate(&mut writer, &command, &expectation)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.failure, Some(TrialFailure::Timeout));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_correlates_response_from_simulated_node() {
        let bus = EventBus::new();
        let correlator =
            Correlator::new(bus.clone(), Duration::from_millis(10), CancellationToken::new());
        let (mut writer, mut device) = wired_writer("sender");

        // stale output from an earlier trial must not be picked up
        bus.publish(event("receiver", -50, "Decrypted message: ABCXYZ"));

        let node_bus = bus.clone();
        let node = tokio::spawn(async move {
            let line = device.read_line(Duration::from_secs(2)).await.unwrap();
            node_bus.publish(event("sender", 2, "OUTBOUND"));
            node_bus.publish(event("receiver", 18, "INBOUND"));
            node_bus.publish(event("receiver", 19, "Decrypted message: ABCXYZ"));
            line
        });

        let command = Command::plaintext(sender(), 42, "ABCXYZ");
        let expectation =
            Expectation::one_way(&sender(), &receiver(), "ABCXYZ", false, Duration::from_secs(5));
        let result = correlator
            .correlate(&mut writer, &command, &expectation)
            .await
            .unwrap();

        assert_eq!(node.await.unwrap(), "hirg -r 42 -p ABCXYZ");
        assert!(result.success);
        assert_eq!(result.transit_ms, Some(16.0));
        assert_eq!(result.total_latency_ms, Some(16.0));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let correlator =
            Correlator::new(EventBus::new(), Duration::from_millis(50), cancel.clone());
        let (mut writer, _device) = wired_writer("sender");

        let expectation = Expectation::round_trip(&sender(), Duration::from_secs(60));
        let command = Command::round_trip(sender(), 1, 16);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            correlator.correlate(&mut writer, &command, &expectation),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProbeError::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_for_other_source_is_rejected() {
        let correlator =
            Correlator::new(EventBus::new(), Duration::from_millis(10), CancellationToken::new());
        let (mut writer, _device) = wired_writer("receiver");
        let expectation = Expectation::round_trip(&sender(), Duration::from_secs(1));
        let command = Command::round_trip(sender(), 1, 16);

        let result = correlator.correlate(&mut writer, &command, &expectation).await;
        assert!(matches!(result, Err(ProbeError::UnknownSource(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_stops_once_all_messages_arrive() {
        let bus = EventBus::new();
        let correlator =
            Correlator::new(bus.clone(), Duration::from_millis(100), CancellationToken::new());
        let (mut writer, mut device) = wired_writer("sender");

        let node_bus = bus.clone();
        tokio::spawn(async move {
            let _ = device.read_line(Duration::from_secs(1)).await;
            for n in [1, 2, 2, 3] {
                tokio::time::sleep(Duration::from_millis(200)).await;
                node_bus.publish(LineEvent::now(
                    SourceId::from("receiver"),
                    format!(r#"Received from 7: msg={{"message_number": {}}}"#, n),
                ));
            }
        });

        let command = Command::burst(sender(), 7, "data", false, 5, 3);
        let deadline = burst_deadline(3, 5, Duration::from_secs(10));
        let started = Instant::now();
        let result = correlator
            .collect_burst(&mut writer, &command, &receiver(), 3, deadline)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.received_count, Some(3));
        assert_eq!(result.sent_count, Some(3));
    }
}
