//! Round-trip latency measurement.
//!
//! One pending-exchange slot per direction pairs a forwarded command with
//! the response coming back the other way. Completed exchanges land in a
//! bounded sliding window (oldest evicted); statistics are computed on
//! demand over a copy, so repeated snapshots without new samples are
//! identical.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::metrics::Direction;

/// One completed command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub started_ns: u64,
    pub ended_ns: u64,
    pub direction: Direction,
    pub fingerprint: u64,
}

impl LatencySample {
    pub fn duration_ns(&self) -> u64 {
        // ended >= started by construction; monotonic clock.
        self.ended_ns.saturating_sub(self.started_ns)
    }
}

/// Windowed statistics; percentiles use the nearest-rank method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub std_dev_ns: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

struct Pending {
    started_ns: u64,
    fingerprint: u64,
    expected_le: Option<usize>,
}

struct MeterInner {
    window: VecDeque<LatencySample>,
    pending: [Option<Pending>; 2],
    orphaned: u64,
}

/// Internally synchronized: the pumps write, the publisher reads.
pub struct LatencyMeter {
    epoch: Instant,
    window_size: usize,
    inner: Mutex<MeterInner>,
}

impl LatencyMeter {
    pub fn new(window_size: usize) -> Self {
        Self {
            epoch: Instant::now(),
            window_size: window_size.max(1),
            inner: Mutex::new(MeterInner {
                window: VecDeque::with_capacity(window_size.max(1)),
                pending: [None, None],
                orphaned: 0,
            }),
        }
    }

    /// Nanoseconds since meter creation, monotonic.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// A command was forwarded: arm the direction's pending slot.
    ///
    /// Overwriting an unacknowledged slot counts the old exchange as
    /// orphaned.
    pub fn begin(&self, direction: Direction, fingerprint: u64, expected_le: Option<usize>) {
        let started_ns = self.now_ns();
        let mut inner = self.inner.lock().unwrap();
        let old = inner.pending[direction.index()].replace(Pending {
            started_ns,
            fingerprint,
            expected_le,
        });
        if old.is_some() {
            inner.orphaned += 1;
        }
    }

    /// Expected response length of the pending exchange, if one is armed.
    /// Outer `None` means nothing is pending.
    pub fn expected_le(&self, direction: Direction) -> Option<Option<usize>> {
        let inner = self.inner.lock().unwrap();
        inner.pending[direction.index()]
            .as_ref()
            .map(|p| p.expected_le)
    }

    pub fn has_pending(&self, direction: Direction) -> bool {
        self.inner.lock().unwrap().pending[direction.index()].is_some()
    }

    /// A response was forwarded: close the pending exchange and record the
    /// sample. A response with no armed command counts as orphaned.
    pub fn complete(&self, direction: Direction) -> Option<LatencySample> {
        let ended_ns = self.now_ns();
        let mut inner = self.inner.lock().unwrap();
        match inner.pending[direction.index()].take() {
            Some(p) => {
                let sample = LatencySample {
                    started_ns: p.started_ns,
                    ended_ns,
                    direction,
                    fingerprint: p.fingerprint,
                };
                Self::push(&mut inner, self.window_size, sample);
                Some(sample)
            }
            None => {
                inner.orphaned += 1;
                None
            }
        }
    }

    fn push(inner: &mut MeterInner, window_size: usize, sample: LatencySample) {
        if inner.window.len() == window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(sample);
    }

    pub fn orphaned(&self) -> u64 {
        self.inner.lock().unwrap().orphaned
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().unwrap().window.len()
    }

    /// Statistics over the current window.
    pub fn stats(&self) -> LatencyStats {
        let durations: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner.window.iter().map(|s| s.duration_ns()).collect()
        };
        compute_stats(&durations)
    }

    #[cfg(test)]
    fn record(&self, sample: LatencySample) {
        let mut inner = self.inner.lock().unwrap();
        Self::push(&mut inner, self.window_size, sample);
    }
}

fn compute_stats(durations: &[u64]) -> LatencyStats {
    if durations.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted = durations.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let sum: u128 = sorted.iter().map(|&d| u128::from(d)).sum();
    let mean = (sum / n as u128) as u64;
    let variance = sorted
        .iter()
        .map(|&d| {
            let diff = d as f64 - mean as f64;
            diff * diff
        })
        .sum::<f64>()
        / n as f64;
    LatencyStats {
        count: n,
        mean_ns: mean,
        min_ns: sorted[0],
        max_ns: sorted[n - 1],
        std_dev_ns: variance.sqrt() as u64,
        p50_ns: nearest_rank(&sorted, 50),
        p95_ns: nearest_rank(&sorted, 95),
        p99_ns: nearest_rank(&sorted, 99),
    }
}

/// Nearest-rank percentile over a sorted slice.
fn nearest_rank(sorted: &[u64], pct: usize) -> u64 {
    let n = sorted.len();
    let rank = (pct * n).div_ceil(100).max(1);
    sorted[rank - 1]
}
