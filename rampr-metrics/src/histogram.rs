use hdrhistogram::Histogram;
use std::time::Duration;

/// Highest trackable latency: 1 hour in microseconds.
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Latency distribution summary, values in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSummary {
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub stdev: Option<f64>,
    pub count: u64,
}

pub(crate) fn new_latency_histogram() -> Histogram<u64> {
    match Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3) {
        Ok(h) => h,
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

/// Records a latency in microseconds, clamped into the histogram's trackable range.
pub(crate) fn record_latency(h: &mut Histogram<u64>, latency: Duration) {
    let us: u64 = latency.as_micros().try_into().unwrap_or(u64::MAX);
    let _ = h.record(us.clamp(1, MAX_LATENCY_US));
}

pub(crate) fn summarize_histogram(h: &Histogram<u64>) -> HistogramSummary {
    if h.is_empty() {
        return HistogramSummary::default();
    }

    let at = |q: f64| Some(us_to_ms(h.value_at_quantile(q)));
    HistogramSummary {
        p50: at(0.50),
        p75: at(0.75),
        p90: at(0.90),
        p95: at(0.95),
        p99: at(0.99),
        min: Some(us_to_ms(h.min())),
        max: Some(us_to_ms(h.max())),
        mean: Some(h.mean() / 1000.0),
        stdev: Some(h.stdev() / 1000.0),
        count: h.len(),
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}
