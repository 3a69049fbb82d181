use std::sync::{Arc, Mutex, OnceLock};

use rampr_metrics::{Aggregator, MetricsSnapshot, RateSummary, RunningStats};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RunOptions, Stage, validate_stages};
use crate::error::{Error, Result};
use crate::executor::IterationExecutor;
use crate::pool::{PoolController, PoolExit};
use crate::progress::{ProgressFn, ProgressSampler, ProgressUpdate};
use crate::schedule::RampSchedule;
use crate::state::{RunState, StateCell};
use crate::workload::Workload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The ramp ran to its end and every VU drained.
    Completed,
    /// Stopped early through [`RunHandle::cancel`]; the report covers the partial run.
    Cancelled,
    /// An internal fault stopped the run; carries the reason. Every iteration started before the
    /// fault is still in the report.
    Aborted(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub metrics: MetricsSnapshot,
    /// Iterations/sec sampled every progress interval.
    pub iterations_per_sec: RateSummary,
    /// VUs dropped from accounting because they did not stop in time.
    pub abandoned_vus: usize,
}

/// Entry point: binds a workload to run options and starts runs.
pub struct Engine<W> {
    workload: Arc<W>,
    options: RunOptions,
    progress: Option<ProgressFn>,
}

impl<W: Workload> Engine<W> {
    pub fn new(workload: W) -> Self {
        Self {
            workload: Arc::new(workload),
            options: RunOptions::default(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn on_progress(
        mut self,
        progress: impl Fn(ProgressUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Validates the configuration and starts a run on the current Tokio runtime.
    ///
    /// Nothing is spawned when validation fails.
    pub fn start(&self, stages: Vec<Stage>) -> Result<RunHandle> {
        validate_stages(&stages)?;
        self.options.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let schedule = Arc::new(RampSchedule::new(stages));
        let aggregator = Arc::new(Aggregator::default());
        let executor = Arc::new(IterationExecutor::new(
            self.workload.clone(),
            aggregator.clone(),
            self.options.pacing,
            self.options.iteration_timeout,
        ));

        let started = Instant::now();
        let shared = Arc::new(RunShared {
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            aggregator: aggregator.clone(),
            started,
            report: OnceLock::new(),
        });

        let pool = PoolController::new(
            schedule.clone(),
            executor,
            self.options.clone(),
            shared.cancel.clone(),
            started,
        );
        let rates = Arc::new(Mutex::new(RunningStats::default()));
        let sampler = ProgressSampler {
            aggregator,
            schedule: schedule.clone(),
            state: shared.state.subscribe(),
            progress: self.progress.clone(),
            rates: rates.clone(),
            interval: self.options.progress_interval,
            started,
        };

        shared.state.advance(RunState::Ramping);
        tracing::info!(
            stages = schedule.stages().len(),
            duration = %humantime::format_duration(schedule.total_duration()),
            max_target = schedule.max_target(),
            max_vus = ?self.options.max_vus,
            "starting run"
        );

        runtime.spawn(drive(
            shared.clone(),
            runtime.spawn(pool.run()),
            runtime.spawn(sampler.run()),
            rates,
        ));

        Ok(RunHandle { inner: shared })
    }
}

#[derive(Debug)]
struct RunShared {
    state: StateCell,
    cancel: CancellationToken,
    aggregator: Arc<Aggregator>,
    started: Instant,
    report: OnceLock<RunReport>,
}

async fn drive(
    shared: Arc<RunShared>,
    pool: tokio::task::JoinHandle<PoolExit>,
    sampler: tokio::task::JoinHandle<()>,
    rates: Arc<Mutex<RunningStats>>,
) {
    let joined = pool.await;
    if matches!(joined, Ok(PoolExit::Faulted { .. }) | Err(_)) {
        shared.state.advance(RunState::Cancelling);
    }
    // A cancel that lands after this point is a no-op, so the state and the outcome agree.
    let state = shared.state.seal();

    let (outcome, abandoned_vus) = match joined {
        Ok(PoolExit::Completed { abandoned }) if state == RunState::Cancelling => {
            (RunOutcome::Cancelled, abandoned)
        }
        Ok(PoolExit::Completed { abandoned }) => (RunOutcome::Completed, abandoned),
        Ok(PoolExit::Cancelled { abandoned }) => (RunOutcome::Cancelled, abandoned),
        Ok(PoolExit::Faulted { reason, abandoned }) => (RunOutcome::Aborted(reason), abandoned),
        Err(err) => {
            // The registry was dropped while unwinding, which settled open iterations and
            // aborted the VU tasks.
            tracing::error!(error = %err, "pool controller failed, aborting run");
            shared.cancel.cancel();
            shared.aggregator.set_live_vus(0);
            (RunOutcome::Aborted(err.to_string()), 0)
        }
    };

    sampler.abort();
    let _ = sampler.await;

    let elapsed = shared.started.elapsed();
    let metrics = shared.aggregator.snapshot(elapsed);
    let iterations_per_sec = rates
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .summary();

    tracing::info!(
        outcome = ?outcome,
        elapsed = %humantime::format_duration(elapsed),
        iterations = metrics.total_iterations,
        failures = metrics.failure_count,
        abandoned_vus,
        "run finished"
    );

    let _ = shared.report.set(RunReport {
        outcome,
        metrics,
        iterations_per_sec,
        abandoned_vus,
    });
    shared.state.advance(RunState::Finished);
}

/// Control surface of a started run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunHandle {
    inner: Arc<RunShared>,
}

impl RunHandle {
    /// Hard-stops the run: in-flight iterations are interrupted and reported as cancelled.
    /// Calling it again, or once the run's outcome is decided, does nothing.
    pub fn cancel(&self) {
        if self.inner.state.advance(RunState::Cancelling) {
            tracing::info!("cancelling run");
            self.inner.cancel.cancel();
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RunState::Finished
    }

    /// Live metrics while running; the frozen final snapshot once finished.
    pub fn snapshot(&self) -> MetricsSnapshot {
        match self.inner.report.get() {
            Some(report) => report.metrics.clone(),
            None => self.inner.aggregator.snapshot(self.inner.started.elapsed()),
        }
    }

    /// Waits for the run to finish and returns its final report.
    pub async fn wait(&self) -> Result<RunReport> {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == RunState::Finished).await;
        self.inner
            .report
            .get()
            .cloned()
            .ok_or(Error::ReportUnavailable)
    }
}
