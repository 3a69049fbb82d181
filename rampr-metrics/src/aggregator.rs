use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use strum::{EnumCount, IntoEnumIterator};

use crate::histogram::{
    HistogramSummary, new_latency_histogram, record_latency, summarize_histogram,
};
use crate::iteration::{FailureKind, IterationResult, Outcome};

/// Distinct failure messages tracked before folding into [`ERRORS_OVERFLOW_KEY`]. The error map
/// never holds more than this many messages plus the overflow key.
pub const MAX_ERROR_KEYS: usize = 64;
pub const ERRORS_OVERFLOW_KEY: &str = "other";

#[derive(Debug)]
struct Shard {
    success: u64,
    failure: u64,
    failures_by_kind: [u64; FailureKind::COUNT],
    bytes: u64,
    latency_us: Histogram<u64>,
}

impl Shard {
    fn new() -> Self {
        Self {
            success: 0,
            failure: 0,
            failures_by_kind: [0; FailureKind::COUNT],
            bytes: 0,
            latency_us: new_latency_histogram(),
        }
    }
}

/// Point-in-time view of the run's aggregated metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub total_iterations: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Every [`FailureKind`], in declaration order.
    pub failures_by_kind: Vec<(FailureKind, u64)>,
    /// Failure counts keyed by message, sorted by message.
    pub errors: Vec<(String, u64)>,
    pub bytes_transferred_total: u64,
    /// Iteration latency (milliseconds).
    pub latency: HistogramSummary,
    /// Percentiles 1..=99, values in milliseconds.
    pub latency_distribution_ms: Vec<(u8, f64)>,
    pub current_vus: u64,
    pub peak_vus: u64,
    pub in_flight: u64,
    pub vu_shortfall_total: u64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures_by_kind
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Concurrent iteration aggregator.
///
/// Results are folded into one of several shards, picked by VU id, each behind a short-held
/// mutex. A snapshot merges the shards one at a time: counters are monotonic and a shard always
/// contributes its success and failure counts together, so `success + failure == total` holds in
/// every snapshot even while VUs keep recording.
#[derive(Debug)]
pub struct Aggregator {
    shards: Box<[Mutex<Shard>]>,
    errors: DashMap<Arc<str>, AtomicU64, ahash::RandomState>,
    /// Message keys reserved in `errors`, excluding the overflow key.
    error_keys: AtomicUsize,
    live_vus: AtomicU64,
    peak_vus: AtomicU64,
    in_flight: AtomicU64,
    vu_shortfall_total: AtomicU64,
}

impl Default for Aggregator {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(parallelism.saturating_mul(4))
    }
}

impl Aggregator {
    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            errors: DashMap::with_hasher(ahash::RandomState::new()),
            error_keys: AtomicUsize::new(0),
            live_vus: AtomicU64::new(0),
            peak_vus: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            vu_shortfall_total: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, vu_id: u64) -> &Mutex<Shard> {
        let idx = (vu_id % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub fn record(&self, result: &IterationResult) {
        let latency = result.latency();

        {
            let mut shard = self.shard_for(result.vu_id).lock();
            match &result.outcome {
                Outcome::Success => shard.success = shard.success.saturating_add(1),
                Outcome::Failure { kind, .. } => {
                    shard.failure = shard.failure.saturating_add(1);
                    let slot = &mut shard.failures_by_kind[kind.index()];
                    *slot = slot.saturating_add(1);
                }
            }
            if let Some(bytes) = result.bytes_transferred {
                shard.bytes = shard.bytes.saturating_add(bytes);
            }
            record_latency(&mut shard.latency_us, latency);
        }

        if let Outcome::Failure { reason, .. } = &result.outcome {
            self.count_error(reason);
        }
    }

    fn count_error(&self, reason: &Arc<str>) {
        if let Some(counter) = self.errors.get(reason) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Reserve a key before inserting so racing first failures cannot overshoot the cap.
        let reserved = self
            .error_keys
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_ERROR_KEYS).then_some(n + 1)
            })
            .is_ok();
        let key: Arc<str> = if reserved {
            reason.clone()
        } else {
            Arc::from(ERRORS_OVERFLOW_KEY)
        };

        match self.errors.entry(key) {
            Entry::Occupied(entry) => {
                entry.get().fetch_add(1, Ordering::Relaxed);
                if reserved {
                    // Another thread inserted the same message first.
                    self.error_keys.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(AtomicU64::new(1));
            }
        }
    }

    /// Marks an iteration as started; pair with [`Aggregator::finish_iteration`].
    pub fn begin_iteration(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a result for an iteration previously announced with
    /// [`Aggregator::begin_iteration`].
    pub fn finish_iteration(&self, result: &IterationResult) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        self.record(result);
    }

    pub fn set_live_vus(&self, live: u64) {
        self.live_vus.store(live, Ordering::Relaxed);

        let mut cur = self.peak_vus.load(Ordering::Relaxed);
        while live > cur {
            match self.peak_vus.compare_exchange_weak(
                cur,
                live,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn live_vus(&self) -> u64 {
        self.live_vus.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn record_vu_shortfall(&self, missing: u64) {
        if missing != 0 {
            self.vu_shortfall_total
                .fetch_add(missing, Ordering::Relaxed);
        }
    }

    pub fn total_iterations(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| {
                let s = s.lock();
                s.success.saturating_add(s.failure)
            })
            .sum()
    }

    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let mut success = 0u64;
        let mut failure = 0u64;
        let mut by_kind = [0u64; FailureKind::COUNT];
        let mut bytes = 0u64;
        let mut latency = new_latency_histogram();

        for shard in self.shards.iter() {
            let shard = shard.lock();
            success = success.saturating_add(shard.success);
            failure = failure.saturating_add(shard.failure);
            for (acc, n) in by_kind.iter_mut().zip(shard.failures_by_kind.iter()) {
                *acc = acc.saturating_add(*n);
            }
            bytes = bytes.saturating_add(shard.bytes);
            let _ = latency.add(&shard.latency_us);
        }

        let mut errors: Vec<(String, u64)> = self
            .errors
            .iter()
            .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort_by(|a, b| a.0.cmp(&b.0));

        let latency_distribution_ms = if latency.is_empty() {
            Vec::new()
        } else {
            (1u8..=99u8)
                .map(|p| {
                    let q = f64::from(p) / 100.0;
                    (p, latency.value_at_quantile(q) as f64 / 1000.0)
                })
                .collect()
        };

        MetricsSnapshot {
            total_iterations: success.saturating_add(failure),
            success_count: success,
            failure_count: failure,
            failures_by_kind: FailureKind::iter()
                .map(|k| (k, by_kind[k.index()]))
                .collect(),
            errors,
            bytes_transferred_total: bytes,
            latency: summarize_histogram(&latency),
            latency_distribution_ms,
            current_vus: self.live_vus.load(Ordering::Relaxed),
            peak_vus: self.peak_vus.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            vu_shortfall_total: self.vu_shortfall_total.load(Ordering::Relaxed),
            elapsed,
        }
    }
}
