//! Typed metric stream.
//!
//! Everything the relay reports to the outside world flows through one event
//! enumeration. Subscribers pull at their own pace from bounded queues; when
//! a queue is full the oldest record is dropped, never the pump blocked.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::apdu::FrameFault;
use crate::latency::LatencyStats;

/// Per-subscriber queue bound; slow subscribers lose the oldest records.
pub const SUBSCRIBER_QUEUE_LIMIT: usize = 64;

/// Which serial flow a record belongs to. Commands travel client to host,
/// responses host to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToHost => Direction::HostToClient,
            Direction::HostToClient => Direction::ClientToHost,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::ClientToHost => 0,
            Direction::HostToClient => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToHost => write!(f, "client->host"),
            Direction::HostToClient => write!(f, "host->client"),
        }
    }
}

/// Error taxonomy surfaced in counters and the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BufferFull,
    Malformed,
    Timeout,
    Io,
    PortUnavailable,
    Orphaned,
    HighLatency,
    ShutdownDropped,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::BufferFull => write!(f, "buffer full"),
            ErrorKind::Malformed => write!(f, "malformed frame"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Io => write!(f, "I/O error"),
            ErrorKind::PortUnavailable => write!(f, "port unavailable"),
            ErrorKind::Orphaned => write!(f, "orphaned exchange"),
            ErrorKind::HighLatency => write!(f, "high latency"),
            ErrorKind::ShutdownDropped => write!(f, "dropped at shutdown"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Point-in-time relay statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub uptime_ns: u64,
    /// Command frames relayed client to host; one per exchange.
    pub frames: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub latency: LatencyStats,
}

/// Everything a subscriber can observe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Snapshot(Snapshot),
    HighLatency {
        sample_ns: u64,
        direction: Direction,
        fingerprint: u64,
    },
    FramingError {
        kind: FrameFault,
        direction: Direction,
    },
    PortUnavailable {
        direction: Direction,
    },
    Restarted {
        reason: String,
    },
}

/// Counters shared by the pumps and the coordinator. Byte/frame totals are
/// atomics on the hot path; the error map sits behind a mutex and is only
/// touched on error events and snapshot assembly.
#[derive(Default)]
pub struct RelayStats {
    pub frames: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    errors: Mutex<BTreeMap<ErrorKind, u64>>,
    seq: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.add_error_count(kind, 1);
    }

    pub fn add_error_count(&self, kind: ErrorKind, n: u64) {
        let mut errors = self.errors.lock().unwrap();
        *errors.entry(kind).or_insert(0) += n;
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn errors(&self) -> BTreeMap<ErrorKind, u64> {
        self.errors.lock().unwrap().clone()
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

struct SubscriberQueue {
    id: usize,
    events: Mutex<VecDeque<RelayEvent>>,
    ready: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Fan-out point for relay events.
pub struct MetricsPublisher {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    next_id: AtomicUsize,
}

impl Default for MetricsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsPublisher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> MetricStream {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            events: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.lock().unwrap().push(Arc::clone(&queue));
        MetricStream { queue }
    }

    /// Deliver `event` to every live subscriber, dropping the oldest queued
    /// record when a queue is at its bound.
    pub fn publish(&self, event: RelayEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
        for sub in subs.iter() {
            let mut queue = sub.events.lock().unwrap();
            if queue.len() >= SUBSCRIBER_QUEUE_LIMIT {
                queue.pop_front();
                let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 64 == 1 {
                    log::debug!("subscriber {} lagging, {} records dropped", sub.id, dropped);
                }
            }
            queue.push_back(event.clone());
            sub.ready.notify_one();
        }
    }

    /// End all streams; queued records remain readable until drained.
    pub fn close(&self) {
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            sub.closed.store(true, Ordering::Release);
            sub.ready.notify_all();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
        subs.len()
    }
}

/// Lazy sequence of relay events. Blocks on [`MetricStream::recv`] (and the
/// `Iterator` impl) until a record arrives or the publisher shuts down.
pub struct MetricStream {
    queue: Arc<SubscriberQueue>,
}

impl MetricStream {
    /// Next event, blocking. `None` once the stream is closed and drained.
    pub fn recv(&self) -> Option<RelayEvent> {
        let mut queue = self.queue.events.lock().unwrap();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            queue = self.queue.ready.wait(queue).unwrap();
        }
    }

    /// Next event, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RelayEvent> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.queue.events.lock().unwrap();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.queue.ready.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    pub fn try_recv(&self) -> Option<RelayEvent> {
        self.queue.events.lock().unwrap().pop_front()
    }

    /// Records lost to the queue bound so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Iterator for MetricStream {
    type Item = RelayEvent;

    fn next(&mut self) -> Option<RelayEvent> {
        self.recv()
    }
}

impl Drop for MetricStream {
    fn drop(&mut self) {
        // Let the publisher prune this queue on its next pass.
        self.queue.closed.store(true, Ordering::Release);
    }
}
