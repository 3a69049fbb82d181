/// Incremental mean, sample standard deviation and maximum of a stream of rates.
///
/// Uses Welford's update so a long run never accumulates a large sum of squares.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RunningStats {
    samples: u64,
    mean: f64,
    sq_dev_sum: f64,
    max: f64,
}

impl RunningStats {
    /// Adds one sample. NaN and infinite values are dropped.
    pub fn push(&mut self, sample: f64) {
        if !sample.is_finite() {
            return;
        }

        self.samples = self.samples.saturating_add(1);
        let before = self.mean;
        self.mean += (sample - before) / self.samples as f64;
        self.sq_dev_sum += (sample - before) * (sample - self.mean);
        self.max = if self.samples == 1 {
            sample
        } else {
            self.max.max(sample)
        };
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn summary(&self) -> RateSummary {
        let stdev = match self.samples {
            0 | 1 => 0.0,
            n => (self.sq_dev_sum / (n - 1) as f64).sqrt(),
        };
        RateSummary {
            samples: self.samples,
            avg: self.mean,
            stdev,
            max: self.max,
        }
    }
}

/// Per-second rate statistics sampled over the run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RateSummary {
    pub samples: u64,
    pub avg: f64,
    pub stdev: f64,
    pub max: f64,
}

/// Rate of `delta` events over `secs` seconds; a zero window counts as one nanosecond.
pub fn per_sec(delta: u64, secs: f64) -> f64 {
    delta as f64 / secs.max(1e-9)
}
