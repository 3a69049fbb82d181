use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use rampr_metrics::Aggregator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RunOptions;
use crate::executor::{IterationExecutor, panic_message, settle_abandoned};
use crate::schedule::RampSchedule;
use crate::vu::{VirtualUser, VuShared, VuState};
use crate::workload::Workload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolExit {
    /// The ramp ended and every VU drained, or was abandoned after the graceful stop window.
    Completed { abandoned: usize },
    Cancelled { abandoned: usize },
    /// The controller hit an internal fault and hard-stopped every VU.
    Faulted { reason: String, abandoned: usize },
}

struct VuSlot {
    id: u64,
    shared: VuShared,
    handle: JoinHandle<()>,
    aggregator: Arc<Aggregator>,
}

impl VuSlot {
    /// Drops the VU from accounting: a still-open iteration is reported as cancelled and the task
    /// is aborted at its next yield. Returns whether an iteration was settled.
    fn abandon(&self) -> bool {
        let settled = settle_abandoned(&self.aggregator, self.id, &self.shared.in_flight);
        self.handle.abort();
        self.shared.state.set(VuState::Stopped);
        settled
    }
}

// Runs for VUs that already exited too, where it finds nothing to settle. Matters when the
// controller task itself unwinds: the registry is dropped and no started iteration goes missing.
impl Drop for VuSlot {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Owns the VU registry and keeps the number of active VUs on the ramp.
///
/// Runs as a single task: VUs report their exit over a channel and never touch the registry.
pub(crate) struct PoolController<W> {
    schedule: Arc<RampSchedule>,
    executor: Arc<IterationExecutor<W>>,
    options: RunOptions,

    run_cancel: CancellationToken,
    vu_abort: CancellationToken,

    /// Ordered by id, which is creation order.
    registry: BTreeMap<u64, VuSlot>,
    next_id: u64,
    exited_tx: mpsc::UnboundedSender<u64>,
    exited_rx: mpsc::UnboundedReceiver<u64>,

    started: Instant,
    ramp_ended: bool,
    fault: Option<String>,
}

impl<W: Workload> PoolController<W> {
    pub(crate) fn new(
        schedule: Arc<RampSchedule>,
        executor: Arc<IterationExecutor<W>>,
        options: RunOptions,
        run_cancel: CancellationToken,
        started: Instant,
    ) -> Self {
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        let vu_abort = run_cancel.child_token();

        Self {
            schedule,
            executor,
            options,
            run_cancel,
            vu_abort,
            registry: BTreeMap::new(),
            next_id: 1,
            exited_tx,
            exited_rx,
            started,
            ramp_ended: false,
            fault: None,
        }
    }

    pub(crate) async fn run(mut self) -> PoolExit {
        let mut tick = tokio::time::interval(self.options.reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.run_cancel.cancelled() => {
                    let abandoned = self.shutdown().await;
                    return PoolExit::Cancelled { abandoned };
                }
                Some(id) = self.exited_rx.recv() => {
                    self.deregister(id);
                    if self.ramp_ended && self.registry.is_empty() {
                        return PoolExit::Completed { abandoned: 0 };
                    }
                }
                _ = tick.tick() => {
                    if let Some(exit) = self.on_tick() {
                        return exit;
                    }
                    if let Some(reason) = self.fault.take() {
                        let abandoned = self.shutdown().await;
                        return PoolExit::Faulted { reason, abandoned };
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) -> Option<PoolExit> {
        while let Ok(id) = self.exited_rx.try_recv() {
            self.deregister(id);
        }

        let elapsed = self.started.elapsed();
        if !self.schedule.is_done(elapsed) {
            self.reconcile(self.schedule.desired_at(elapsed));
            return None;
        }

        if !self.ramp_ended {
            self.ramp_ended = true;
            tracing::info!(
                live_vus = self.registry.len(),
                "ramp finished, stopping virtual users"
            );
        }
        self.reconcile(0);
        if self.registry.is_empty() {
            return Some(PoolExit::Completed { abandoned: 0 });
        }

        let overrun = elapsed.saturating_sub(self.schedule.total_duration());
        if overrun >= self.options.graceful_stop && !self.vu_abort.is_cancelled() {
            tracing::warn!(
                live_vus = self.registry.len(),
                graceful_stop = %humantime::format_duration(self.options.graceful_stop),
                "virtual users did not finish in time, interrupting their iterations"
            );
            self.vu_abort.cancel();
        }
        if overrun >= self.options.graceful_stop.saturating_add(self.options.cancel_grace) {
            let abandoned = self.abandon_all();
            return Some(PoolExit::Completed { abandoned });
        }

        None
    }

    /// Brings the number of active (starting or running) VUs to `desired`.
    pub(crate) fn reconcile(&mut self, desired: u64) {
        let active = self.active_count();
        if desired > active {
            self.spawn(desired - active);
        } else if desired < active {
            self.retire(active - desired);
        }
        self.publish_live();
    }

    fn active_count(&self) -> u64 {
        self.registry
            .values()
            .filter(|slot| slot.shared.state.get().is_active())
            .count() as u64
    }

    fn spawn(&mut self, wanted: u64) {
        let mut spawned = 0u64;

        for _ in 0..wanted {
            let registered = self.registry.len() as u64;
            if self.options.max_vus.is_some_and(|max| registered >= max) {
                break;
            }

            let id = self.next_id;
            self.next_id = self.next_id.saturating_add(1);

            let setup = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.executor.workload().setup_vu(id)
            }));
            match setup {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(vu = id, error = %err, "virtual user setup failed");
                    break;
                }
                Err(panic) => {
                    let reason = panic_message("virtual user setup", panic.as_ref());
                    tracing::error!(
                        vu = id,
                        %reason,
                        "virtual user setup panicked, stopping the run"
                    );
                    self.fault = Some(reason);
                    return;
                }
            }

            let shared = VuShared::new();
            let vu = VirtualUser::new(
                id,
                shared.clone(),
                self.vu_abort.child_token(),
                self.executor.clone(),
                self.exited_tx.clone(),
            );
            let handle = tokio::spawn(vu.run());
            self.registry.insert(
                id,
                VuSlot {
                    id,
                    shared,
                    handle,
                    aggregator: self.executor.aggregator().clone(),
                },
            );
            spawned += 1;

            tracing::debug!(vu = id, "spawned virtual user");
        }

        let missing = wanted - spawned;
        if missing > 0 {
            self.executor.aggregator().record_vu_shortfall(missing);
            tracing::warn!(
                wanted,
                spawned,
                missing,
                max_vus = ?self.options.max_vus,
                "could not reach the ramp target, retrying on the next tick"
            );
        }
    }

    /// Marks the `count` oldest active VUs Stopping. They finish their current iteration first.
    fn retire(&mut self, count: u64) {
        let mut retired = 0u64;

        for (id, slot) in &self.registry {
            if retired == count {
                break;
            }

            let state = &slot.shared.state;
            if state.transition(VuState::Running, VuState::Stopping)
                || state.transition(VuState::Starting, VuState::Stopping)
            {
                slot.shared.retire.cancel();
                retired += 1;
                tracing::debug!(vu = *id, "retiring virtual user");
            }
        }
    }

    fn deregister(&mut self, id: u64) {
        if self.registry.remove(&id).is_some() {
            tracing::debug!(vu = id, "virtual user exited");
            self.publish_live();
        }
    }

    fn publish_live(&self) {
        self.executor
            .aggregator()
            .set_live_vus(self.registry.len() as u64);
    }

    /// Hard stop: interrupts every VU, waits up to `cancel_grace` for them to exit, then abandons
    /// the rest.
    async fn shutdown(&mut self) -> usize {
        self.vu_abort.cancel();
        tracing::info!(
            live_vus = self.registry.len(),
            cancel_grace = %humantime::format_duration(self.options.cancel_grace),
            "cancelling virtual users"
        );

        let deadline = Instant::now() + self.options.cancel_grace;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.exited_rx.recv()).await {
                Ok(Some(id)) => self.deregister(id),
                Ok(None) | Err(_) => break,
            }
        }

        self.abandon_all()
    }

    /// Drops every remaining VU from accounting. An iteration still in flight is reported as
    /// cancelled unless its VU reports it first.
    fn abandon_all(&mut self) -> usize {
        let registry = std::mem::take(&mut self.registry);
        let abandoned = registry.len();

        for (id, slot) in registry {
            let settled = slot.abandon();
            tracing::warn!(
                vu = id,
                in_flight = settled,
                "abandoned virtual user that did not stop within the grace period"
            );
        }

        self.publish_live();
        abandoned
    }

    #[cfg(test)]
    fn states(&self) -> Vec<(u64, VuState)> {
        self.registry
            .iter()
            .map(|(id, slot)| (*id, slot.shared.state.get()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pacing, Stage};
    use crate::workload::{Iteration, IterationContext};
    use rampr_metrics::{Aggregator, FailureKind};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn paced() -> impl Fn(IterationContext) -> std::future::Ready<Result<Iteration, String>>
    + Send
    + Sync
    + 'static {
        |_ctx| std::future::ready(Ok(Iteration::done().sleep(Duration::from_millis(100))))
    }

    fn controller<W: Workload>(
        workload: W,
        stages: Vec<Stage>,
        options: RunOptions,
    ) -> (PoolController<W>, Arc<Aggregator>, CancellationToken) {
        let aggregator = Arc::new(Aggregator::with_shards(2));
        let executor = Arc::new(IterationExecutor::new(
            Arc::new(workload),
            aggregator.clone(),
            options.pacing,
            options.iteration_timeout,
        ));
        let cancel = CancellationToken::new();
        let pool = PoolController::new(
            Arc::new(RampSchedule::new(stages)),
            executor,
            options,
            cancel.clone(),
            Instant::now(),
        );
        (pool, aggregator, cancel)
    }

    fn one_stage() -> Vec<Stage> {
        vec![Stage::new(Duration::from_secs(60), 10)]
    }

    #[tokio::test(start_paused = true)]
    async fn retires_oldest_first_and_never_twice() {
        let (mut pool, agg, _cancel) = controller(paced(), one_stage(), RunOptions::default());

        pool.reconcile(5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agg.live_vus(), 5);
        assert!(
            pool.states()
                .iter()
                .all(|(_, s)| *s == VuState::Running)
        );

        pool.reconcile(3);
        let states = pool.states();
        assert_eq!(states[0], (1, VuState::Stopping));
        assert_eq!(states[1], (2, VuState::Stopping));
        assert_eq!(states[2], (3, VuState::Running));
        assert_eq!(pool.active_count(), 3);

        // Same target again: nothing else is stopped.
        pool.reconcile(3);
        assert_eq!(
            pool.states()
                .iter()
                .filter(|(_, s)| *s == VuState::Stopping)
                .count(),
            2
        );

        // Retired VUs exit and deregister; new VUs get fresh ids.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(id) = pool.exited_rx.try_recv() {
            pool.deregister(id);
        }
        assert_eq!(
            pool.states().iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        pool.reconcile(4);
        assert_eq!(
            pool.states().last().map(|(id, _)| *id),
            Some(6),
            "ids are never reused"
        );
        assert_eq!(agg.snapshot(Duration::ZERO).peak_vus, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn max_vus_caps_the_pool_and_records_shortfall() {
        let options = RunOptions {
            max_vus: Some(3),
            ..RunOptions::default()
        };
        let (mut pool, agg, _cancel) = controller(paced(), one_stage(), options);

        pool.reconcile(5);
        assert_eq!(pool.registry.len(), 3);
        assert_eq!(agg.snapshot(Duration::ZERO).vu_shortfall_total, 2);

        // Retried and recorded again on the next tick.
        pool.reconcile(5);
        assert_eq!(pool.registry.len(), 3);
        assert_eq!(agg.snapshot(Duration::ZERO).vu_shortfall_total, 4);
    }

    struct FlakySetup {
        attempts: AtomicU64,
    }

    impl Workload for FlakySetup {
        type Error = String;

        fn setup_vu(&self, _vu_id: u64) -> Result<(), String> {
            // Every third setup fails.
            if self.attempts.fetch_add(1, Ordering::Relaxed) % 3 == 2 {
                return Err("connection refused".to_string());
            }
            Ok(())
        }

        async fn iteration(&self, _ctx: IterationContext) -> Result<Iteration, String> {
            Ok(Iteration::done().sleep(Duration::from_millis(100)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failure_is_recorded_and_retried() {
        let workload = FlakySetup {
            attempts: AtomicU64::new(0),
        };
        let (mut pool, agg, _cancel) = controller(workload, one_stage(), RunOptions::default());

        pool.reconcile(4);
        assert_eq!(pool.registry.len(), 2);
        assert_eq!(agg.snapshot(Duration::ZERO).vu_shortfall_total, 2);

        pool.reconcile(4);
        assert_eq!(pool.registry.len(), 4);
        // The failed id was consumed, not re-registered.
        assert_eq!(
            pool.states().iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![1, 2, 4, 5]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_ramp_ends_and_vus_drain() {
        let stages = vec![
            Stage::new(Duration::from_secs(2), 4),
            Stage::new(Duration::from_secs(2), 4),
        ];
        let options = RunOptions {
            pacing: Some(Pacing::After(Duration::from_millis(250))),
            ..RunOptions::default()
        };
        let reconcile = options.reconcile_interval;
        let (pool, agg, _cancel) = controller(
            |_ctx: IterationContext| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, String>(Iteration::done())
            },
            stages,
            options,
        );

        let started = Instant::now();
        let exit = pool.run().await;
        assert_eq!(exit, PoolExit::Completed { abandoned: 0 });
        // Zero live VUs within one tick of the ramp's end plus one iteration draining.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "finished early: {elapsed:?}");
        assert!(
            elapsed <= Duration::from_secs(4) + reconcile + Duration::from_millis(150),
            "took {elapsed:?} to drain"
        );

        let s = agg.snapshot(Duration::ZERO);
        assert_eq!(s.current_vus, 0);
        assert_eq!(s.peak_vus, 4);
        assert_eq!(s.in_flight, 0);
        assert!(s.total_iterations > 0);
        assert_eq!(s.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_interrupts_stuck_iterations() {
        let options = RunOptions {
            graceful_stop: Duration::from_secs(3),
            ..RunOptions::default()
        };
        let (pool, agg, _cancel) = controller(
            |_ctx: IterationContext| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(Iteration::done())
            },
            vec![Stage::new(Duration::from_secs(2), 4)],
            options,
        );

        let started = Instant::now();
        let exit = pool.run().await;
        assert_eq!(exit, PoolExit::Completed { abandoned: 0 });
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(7));

        let s = agg.snapshot(Duration::ZERO);
        assert_eq!(s.failures_of(FailureKind::Cancelled), 2);
        assert_eq!(s.success_count, 0);
        assert_eq!(s.current_vus, 0);
    }

    struct PanickingSetup;

    impl Workload for PanickingSetup {
        type Error = String;

        fn setup_vu(&self, vu_id: u64) -> Result<(), String> {
            if vu_id == 3 {
                panic!("fixture missing");
            }
            Ok(())
        }

        async fn iteration(&self, _ctx: IterationContext) -> Result<Iteration, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Iteration::done())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn setup_panic_hard_stops_the_pool() {
        let options = RunOptions {
            cancel_grace: Duration::from_secs(1),
            ..RunOptions::default()
        };
        // One new VU per tick: VU 3 is set up at t=3s.
        let stages = vec![Stage::new(Duration::from_secs(4), 4)];
        let (pool, agg, _cancel) = controller(PanickingSetup, stages, options);

        let exit = pool.run().await;
        assert_eq!(
            exit,
            PoolExit::Faulted {
                reason: "virtual user setup panicked: fixture missing".to_string(),
                abandoned: 0,
            }
        );

        // VUs 1 and 2 were mid-iteration; both are reported, none left in flight.
        let s = agg.snapshot(Duration::ZERO);
        assert_eq!(s.total_iterations, 2);
        assert_eq!(s.failures_of(FailureKind::Cancelled), 2);
        assert_eq!(s.in_flight, 0);
        assert_eq!(s.current_vus, 0);
        assert_eq!(s.vu_shortfall_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_registry_settles_open_iterations() {
        let (mut pool, agg, _cancel) = controller(
            |_ctx: IterationContext| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(Iteration::done())
            },
            one_stage(),
            RunOptions::default(),
        );

        pool.reconcile(3);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agg.in_flight(), 3);

        drop(pool);
        let s = agg.snapshot(Duration::ZERO);
        assert_eq!(s.in_flight, 0);
        assert_eq!(s.failures_of(FailureKind::Cancelled), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_every_vu() {
        let (pool, agg, cancel) = controller(paced(), one_stage(), RunOptions::default());
        let task = tokio::spawn(pool.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let exit = task.await.unwrap_or_else(|e| panic!("controller task failed: {e}"));
        assert_eq!(exit, PoolExit::Cancelled { abandoned: 0 });
        let s = agg.snapshot(Duration::ZERO);
        assert_eq!(s.current_vus, 0);
        assert_eq!(s.in_flight, 0);
    }
}
