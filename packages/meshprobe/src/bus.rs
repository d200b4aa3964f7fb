// Fan-out event bus between reader tasks and correlators
//
// Reader tasks publish every received line; each consumer holds its own
// subscription with an unbounded lock-free queue. A consumer that discards
// events it does not care about only empties its own queue, never another
// consumer's.

use crate::types::{LineEvent, SourceId};
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    All,
    Sources(HashSet<SourceId>),
}

impl EventFilter {
    pub fn sources<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = SourceId>,
    {
        EventFilter::Sources(sources.into_iter().collect())
    }

    pub fn accepts(&self, event: &LineEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Sources(sources) => sources.contains(&event.source),
        }
    }
}

/// Result of waiting on a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    Event(LineEvent),
    Empty,
}

/// Counters for the whole bus
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BusStats {
    pub total_published: u64,
    /// Events no live subscription accepted
    pub total_undelivered: u64,
    pub subscribers: usize,
}

struct Mailbox {
    queue: SegQueue<LineEvent>,
    notify: Notify,
    filter: EventFilter,
}

impl Mailbox {
    fn push(&self, event: LineEvent) {
        self.queue.push(event);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct BusInner {
    mailboxes: RwLock<Vec<Weak<Mailbox>>>,
    total_published: AtomicU64,
    total_undelivered: AtomicU64,
}

/// Thread-safe, unbounded, multi-producer event bus
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscription whose filter accepts it. Never blocks.
    pub fn publish(&self, event: LineEvent) {
        self.inner.total_published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = false;
        let mut saw_dropped = false;
        {
            let mailboxes = self.inner.mailboxes.read();
            for weak in mailboxes.iter() {
                match weak.upgrade() {
                    Some(mailbox) => {
                        if mailbox.filter.accepts(&event) {
                            mailbox.push(event.clone());
                            delivered = true;
                        }
                    }
                    None => saw_dropped = true,
                }
            }
        }

        if saw_dropped {
            self.inner
                .mailboxes
                .write()
                .retain(|weak| weak.strong_count() > 0);
        }

        if !delivered {
            self.inner.total_undelivered.fetch_add(1, Ordering::Relaxed);
            log::trace!("No subscriber for line from {}: {}", event.source, event.text);
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let mailbox = Arc::new(Mailbox {
            queue: SegQueue::new(),
            notify: Notify::new(),
            filter,
        });
        self.inner.mailboxes.write().push(Arc::downgrade(&mailbox));
        Subscription { mailbox }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .mailboxes
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.inner.total_published.load(Ordering::Relaxed),
            total_undelivered: self.inner.total_undelivered.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// One consumer's view of the bus. Dropping it unsubscribes.
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Wait up to `timeout` for the next event
    pub async fn consume(&self, timeout: Duration) -> Consumed {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(event) = self.mailbox.queue.pop() {
                return Consumed::Event(event);
            }

            if tokio::time::timeout_at(deadline, self.mailbox.notify.notified())
                .await
                .is_err()
            {
                // a publish may have landed right at the deadline
                return match self.mailbox.queue.pop() {
                    Some(event) => Consumed::Event(event),
                    None => Consumed::Empty,
                };
            }
        }
    }

    pub fn try_consume(&self) -> Option<LineEvent> {
        self.mailbox.queue.pop()
    }

    /// Drain everything currently queued, oldest first
    pub fn drain(&self) -> Vec<LineEvent> {
        let mut events = Vec::with_capacity(self.mailbox.queue.len());
        while let Some(event) = self.mailbox.queue.pop() {
            events.push(event);
        }
        events
    }

    /// Put events back at the tail of this subscription's queue
    ///
    /// Requeued events keep their relative order; events published meanwhile
    /// may end up ahead of them.
    pub fn requeue<I>(&self, events: I)
    where
        I: IntoIterator<Item = LineEvent>,
    {
        for event in events {
            self.mailbox.push(event);
        }
    }

    /// Wait up to `timeout` for an event satisfying `predicate`
    ///
    /// Events pulled along the way that do not match are requeued once the
    /// wait ends, in the order they were pulled.
    pub async fn take_matching<F>(&self, predicate: F, timeout: Duration) -> Consumed
    where
        F: Fn(&LineEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut skipped = Vec::new();

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.consume(remaining).await {
                Consumed::Event(event) if predicate(&event) => break Consumed::Event(event),
                Consumed::Event(event) => skipped.push(event),
                Consumed::Empty => break Consumed::Empty,
            }
        };

        self.requeue(skipped);
        outcome
    }

    pub fn len(&self) -> usize {
        self.mailbox.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.queue.is_empty()
    }
}
