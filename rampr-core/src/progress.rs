use std::sync::{Arc, Mutex};
use std::time::Duration;

use rampr_metrics::{Aggregator, MetricsSnapshot, RunningStats, per_sec};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::schedule::{RampSchedule, StageSnapshot};
use crate::state::RunState;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    pub interval: Duration,
    pub elapsed: Duration,
    pub state: RunState,
    /// Absent once the ramp has ended.
    pub stage: Option<StageSnapshot>,
    pub iterations_per_sec: f64,
    pub metrics: MetricsSnapshot,
}

pub type ProgressFn = std::sync::Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;

/// Samples iteration throughput every interval and feeds the optional progress callback.
pub(crate) struct ProgressSampler {
    pub aggregator: Arc<Aggregator>,
    pub schedule: Arc<RampSchedule>,
    pub state: watch::Receiver<RunState>,
    pub progress: Option<ProgressFn>,
    pub rates: Arc<Mutex<RunningStats>>,
    pub interval: Duration,
    pub started: Instant,
}

impl ProgressSampler {
    pub(crate) async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the immediate first tick so the first rate sample covers a full interval.
        interval.tick().await;

        let mut tick_id: u64 = 0;
        let mut last_at = Instant::now();
        let mut last_total = self.aggregator.total_iterations();

        loop {
            interval.tick().await;

            tick_id = tick_id.saturating_add(1);
            let now = Instant::now();
            let dt = now.duration_since(last_at);
            last_at = now;

            let total = self.aggregator.total_iterations();
            let rate = per_sec(total.saturating_sub(last_total), dt.as_secs_f64());
            last_total = total;

            self.rates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(rate);

            let Some(progress) = &self.progress else {
                continue;
            };

            let elapsed = now.duration_since(self.started);
            let stage = if self.schedule.is_done(elapsed) {
                None
            } else {
                self.schedule.stage_snapshot_at(elapsed)
            };

            (progress)(ProgressUpdate {
                tick: tick_id,
                interval: dt,
                elapsed,
                state: *self.state.borrow(),
                stage,
                iterations_per_sec: rate,
                metrics: self.aggregator.snapshot(elapsed),
            });
        }
    }
}
