// Reader task - one per line source
//
// Pulls lines from a LineReader and publishes them, stamped at receipt, to the
// event bus. Reads are bounded by the poll interval; the cancellation token is
// checked between reads. Once it fires, a line that is already partly buffered
// gets one more poll to finish and be published; no new line is started.

use crate::bus::EventBus;
use crate::error::{ProbeError, Result};
use crate::source::LineReader;
use crate::types::{LineEvent, SourceId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    Running,
    Stopping,
    Stopped,
}

/// Why a reader task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", content = "detail", rename_all = "snake_case")]
pub enum ReaderExit {
    Cancelled,
    SourceClosed,
    Failed(String),
}

/// Per-source counters kept in the experiment report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderSummary {
    pub source: SourceId,
    pub lines_published: u64,
    pub exit: ReaderExit,
}

pub struct ReaderTask {
    reader: LineReader,
    bus: EventBus,
    cancel: CancellationToken,
    poll_interval: Duration,
    state: Arc<RwLock<ReaderState>>,
    lines_published: Arc<AtomicU64>,
}

impl ReaderTask {
    /// Spawn the task on the current runtime. `cancel` should be a child of the
    /// experiment's token so one signal stops every reader.
    pub fn spawn(
        reader: LineReader,
        bus: EventBus,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> ReaderHandle {
        let source = reader.source_id().clone();
        let state = Arc::new(RwLock::new(ReaderState::Running));
        let lines_published = Arc::new(AtomicU64::new(0));

        let task = ReaderTask {
            reader,
            bus,
            cancel: cancel.clone(),
            poll_interval,
            state: Arc::clone(&state),
            lines_published: Arc::clone(&lines_published),
        };

        log::debug!("Starting reader task for '{}'", source);
        let join = tokio::spawn(task.run());

        ReaderHandle {
            source,
            state,
            lines_published,
            cancel,
            join,
        }
    }

    async fn run(mut self) -> (LineReader, ReaderExit) {
        let exit = loop {
            if self.cancel.is_cancelled() {
                self.finish_partial_line().await;
                break ReaderExit::Cancelled;
            }

            match self.reader.read_line(self.poll_interval).await {
                Ok(line) => self.publish(line),
                Err(ProbeError::ReadTimeout(_)) => continue,
                Err(ProbeError::SourceClosed(source)) => {
                    log::warn!("Line source '{}' closed, reader exiting", source);
                    break ReaderExit::SourceClosed;
                }
                Err(e) => {
                    log::error!(
                        "Reader for '{}' failed: {}",
                        self.reader.source_id(),
                        e
                    );
                    break ReaderExit::Failed(e.to_string());
                }
            }
        };

        *self.state.write() = ReaderState::Stopped;
        log::debug!(
            "Reader task for '{}' stopped ({:?}) after {} lines",
            self.reader.source_id(),
            exit,
            self.lines_published.load(Ordering::Relaxed)
        );
        (self.reader, exit)
    }

    async fn finish_partial_line(&mut self) {
        if !self.reader.has_data_available() {
            return;
        }
        match self.reader.read_line(self.poll_interval).await {
            Ok(line) => self.publish(line),
            Err(e) => log::debug!(
                "Dropping unfinished line from '{}': {}",
                self.reader.source_id(),
                e
            ),
        }
    }

    fn publish(&self, line: String) {
        if line.is_empty() {
            return;
        }
        let event = LineEvent::now(self.reader.source_id().clone(), line);
        log::debug!(
            "[{}][{} IN] {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.source,
            event.text
        );
        self.bus.publish(event);
        self.lines_published.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owner side of a running reader task
pub struct ReaderHandle {
    source: SourceId,
    state: Arc<RwLock<ReaderState>>,
    lines_published: Arc<AtomicU64>,
    cancel: CancellationToken,
    join: JoinHandle<(LineReader, ReaderExit)>,
}

impl ReaderHandle {
    pub fn source_id(&self) -> &SourceId {
        &self.source
    }

    pub fn state(&self) -> ReaderState {
        *self.state.read()
    }

    pub fn lines_published(&self) -> u64 {
        self.lines_published.load(Ordering::Relaxed)
    }

    /// Signal the task to stop after its current read
    pub fn stop(&self) {
        let mut state = self.state.write();
        if *state == ReaderState::Running {
            *state = ReaderState::Stopping;
        }
        self.cancel.cancel();
    }

    /// Wait for the task to exit and take back the read half
    pub async fn join(self) -> Result<(LineReader, ReaderSummary)> {
        let (reader, exit) = self
            .join
            .await
            .map_err(|e| ProbeError::TaskFailed(format!("reader '{}': {}", self.source, e)))?;

        let summary = ReaderSummary {
            source: self.source,
            lines_published: self.lines_published.load(Ordering::Relaxed),
            exit,
        };
        Ok((reader, summary))
    }
}
