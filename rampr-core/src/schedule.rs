use std::time::Duration;

use crate::config::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    pub index: usize,
    pub count: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

/// Piecewise-linear desired-concurrency curve over elapsed run time.
///
/// Stage `i` covers `[start_i, start_i + duration_i)` and ramps from the previous stage's target
/// (0 for the first stage) to its own. Zero-length stages cover no instant, so the curve snaps to
/// their target. At and past the end of the last stage the curve is 0.
#[derive(Debug, Clone)]
pub struct RampSchedule {
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampSchedule {
    pub fn new(stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            stages,
            cumulative_ends,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_target(&self) -> u64 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Index of the stage whose half-open interval contains `elapsed`.
    fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let idx = self.cumulative_ends.partition_point(|end| *end <= elapsed);
        (idx < self.stages.len()).then_some(idx)
    }

    fn stage_start(&self, idx: usize) -> Duration {
        if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        }
    }

    fn start_target(&self, idx: usize) -> u64 {
        if idx == 0 {
            0
        } else {
            self.stages[idx - 1].target
        }
    }

    pub fn desired_at(&self, elapsed: Duration) -> u64 {
        let Some(idx) = self.stage_index(elapsed) else {
            return 0;
        };

        let stage_start = self.stage_start(idx);
        let stage_duration = self.cumulative_ends[idx].saturating_sub(stage_start);
        let stage_elapsed = elapsed.saturating_sub(stage_start).min(stage_duration);

        let start_target = self.start_target(idx);
        let end_target = self.stages[idx].target;

        if stage_duration.is_zero() {
            return end_target;
        }

        // Linear interpolation across the stage, rounded half up: the interpolated value is never
        // negative, so `floor(v + 0.5)` is plain integer division of a non-negative numerator.
        let start_i = start_target as i128;
        let delta = end_target as i128 - start_i;

        let num = stage_elapsed.as_nanos() as i128;
        let den = stage_duration.as_nanos() as i128;

        let twice = start_i
            .saturating_mul(den)
            .saturating_add(delta.saturating_mul(num))
            .saturating_mul(2)
            .saturating_add(den);

        (twice / den.saturating_mul(2)).clamp(0, u64::MAX as i128) as u64
    }

    pub fn stage_snapshot_at(&self, elapsed: Duration) -> Option<StageSnapshot> {
        if self.stages.is_empty() {
            return None;
        }

        let idx = self
            .stage_index(elapsed)
            .unwrap_or(self.stages.len().saturating_sub(1));

        let stage_start = self.stage_start(idx);
        let stage_duration = self.cumulative_ends[idx].saturating_sub(stage_start);
        let stage_elapsed = elapsed.saturating_sub(stage_start).min(stage_duration);
        let stage_remaining = stage_duration.saturating_sub(stage_elapsed);

        Some(StageSnapshot {
            index: idx,
            count: self.stages.len(),
            stage_elapsed,
            stage_remaining,
            start_target: self.start_target(idx),
            end_target: self.stages[idx].target,
            current_target: self.desired_at(elapsed),
        })
    }
}
