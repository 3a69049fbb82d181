use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Ramping,
    /// Hard stop in progress. Skipped when the ramp completes normally.
    Cancelling,
    Finished,
}

impl RunState {
    fn can_move_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (NotStarted, Ramping)
                | (Ramping, Cancelling)
                | (Ramping, Finished)
                | (Cancelling, Finished)
        )
    }
}

/// Forward-only run state, observable by any number of watchers.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<RunState>,
    /// Set once the run's outcome is decided; `Cancelling` is refused from then on.
    sealed: AtomicBool,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::NotStarted);
        Self {
            tx,
            sealed: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    /// Moves to `next` if that is a legal transition from the current state.
    pub(crate) fn advance(&self, next: RunState) -> bool {
        self.tx.send_if_modified(|current| {
            let refused = next == RunState::Cancelling && self.sealed.load(Ordering::Acquire);
            if !refused && current.can_move_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Freezes the state ahead of `Finished` and returns it. Runs under the channel's write lock,
    /// so an `advance` either lands before the seal and is seen here, or is refused.
    pub(crate) fn seal(&self) -> RunState {
        let mut seen = RunState::NotStarted;
        self.tx.send_if_modified(|current| {
            self.sealed.store(true, Ordering::Release);
            seen = *current;
            false
        });
        seen
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }
}
