// Task state machine and thread hand-off protocol

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::SchedulerError;
use super::executor::{ErrorReporter, WorkerPool};
use super::sequence::{BoxedSequence, Drained, StepSequence, flatten, guarded_next};
use super::signal::{ControlSignal, Yield};
use crate::types::{TaskId, TaskLabel};

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Next step must be submitted to the worker pool. Initial state.
    ToWorkThread,
    /// A worker job owns the next step.
    InWorkThread,
    /// Next step runs inline on the driver thread.
    ToMainThread,
    /// A step yielded something the driver has not decoded yet.
    PendingYieldReturn,
    Finished,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    /// Edges of the hand-off protocol. Cancellation is legal from anywhere.
    fn can_become(self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (ToWorkThread, InWorkThread)
                | (InWorkThread, PendingYieldReturn | Finished)
                | (ToMainThread, PendingYieldReturn | Finished | ToWorkThread)
                | (PendingYieldReturn, ToWorkThread | ToMainThread)
                | (_, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ToWorkThread => "to_work_thread",
            Self::InWorkThread => "in_work_thread",
            Self::ToMainThread => "to_main_thread",
            Self::PendingYieldReturn => "pending_yield_return",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What one `advance()` call hands back to the driver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance<T> {
    /// Still running. Carries a value when a step yielded one this tick.
    Suspended(Option<T>),
    /// Finished or cancelled. Every later call returns `Done` too.
    Done,
}

impl<T> Advance<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Point-in-time view of a task, for logs and host dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub label: TaskLabel,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
}

/// Decoded output of a step, held until the driver consumes it.
enum Pending<T> {
    Signal(ControlSignal),
    Value(T),
    /// A nested sequence was flattened; resume where the step ran.
    Resume,
}

/// Every write to task state is one of these.
enum Transition<T> {
    Yielded { pending: Pending<T>, ran_on: TaskState },
    Hop(TaskState),
    Finished,
    Exit,
    Cancel,
    Failed(SchedulerError),
}

struct Slot<T> {
    state: TaskState,
    /// Context the last step ran in: `InWorkThread` or `ToMainThread`.
    previous_state: TaskState,
    pending_signal: Option<Pending<T>>,
}

struct TaskCore<T> {
    id: TaskId,
    label: TaskLabel,
    created_at: DateTime<Utc>,
    /// Holding this lock is holding the turn.
    sequence: Mutex<Option<BoxedSequence<T>>>,
    slot: Mutex<Slot<T>>,
    /// Held for the duration of one `advance()` call.
    driver: Mutex<()>,
    pool: Arc<dyn WorkerPool>,
    reporter: Arc<dyn ErrorReporter>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn try_lock<G>(mutex: &Mutex<G>) -> Option<MutexGuard<'_, G>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Context to resume in after a step's yield has been decoded.
fn resume_state(previous: TaskState) -> TaskState {
    if previous == TaskState::InWorkThread {
        TaskState::ToWorkThread
    } else {
        TaskState::ToMainThread
    }
}

/// Pull one step and classify it.
///
/// Nested sequences are drained here, on whichever thread holds the turn.
fn run_step<T>(sequence: &mut BoxedSequence<T>, ran_on: TaskState) -> Transition<T> {
    match guarded_next(sequence) {
        Ok(None) => Transition::Finished,
        Ok(Some(Yield::Signal(signal))) => Transition::Yielded {
            pending: Pending::Signal(signal),
            ran_on,
        },
        Ok(Some(Yield::Value(value))) => Transition::Yielded {
            pending: Pending::Value(value),
            ran_on,
        },
        Ok(Some(Yield::Nested(mut nested))) => match flatten(&mut nested, 1) {
            Ok(Drained::Exhausted) => Transition::Yielded {
                pending: Pending::Resume,
                ran_on,
            },
            Ok(Drained::Exit) => Transition::Exit,
            Err(err) => Transition::Failed(err.into()),
        },
        Err(err) => Transition::Failed(err.into()),
    }
}

impl<T: Send + 'static> TaskCore<T> {
    fn state(&self) -> TaskState {
        lock(&self.slot).state
    }

    /// Apply a transition under the slot lock and return the resulting state.
    ///
    /// Terminal states absorb everything. Failures are reported after the
    /// lock is released so a reporter may call back into the task.
    fn transition(&self, transition: Transition<T>) -> TaskState {
        let mut slot = lock(&self.slot);
        let from = slot.state;
        let live = !from.is_terminal();
        let mut failure = None;

        let target = match transition {
            Transition::Yielded { pending, ran_on } => {
                if live {
                    slot.previous_state = ran_on;
                    slot.pending_signal = Some(pending);
                }
                TaskState::PendingYieldReturn
            }
            Transition::Hop(state) => state,
            Transition::Finished => TaskState::Finished,
            Transition::Exit | Transition::Cancel => TaskState::Cancelled,
            Transition::Failed(err) => {
                failure = Some(err);
                TaskState::Cancelled
            }
        };

        if live {
            debug_assert!(
                from.can_become(target),
                "illegal task transition {} -> {}",
                from,
                target
            );
            slot.state = target;
            if target.is_terminal() {
                slot.pending_signal = None;
            }
        }
        let now = slot.state;
        drop(slot);

        if live && from != now {
            tracing::trace!(task = %self.label, id = %self.id.short(), %from, to = %now, "task transition");
            if now.is_terminal() {
                tracing::debug!(task = %self.label, id = %self.id.short(), state = %now, "task ended");
            }
        }

        if let Some(err) = failure {
            // A step that failed after cancellation is still worth reporting.
            if live || matches!(err, SchedulerError::Step(_)) {
                let trace = err.stack_trace().unwrap_or_default();
                self.reporter
                    .report_error(&format!("task {}: {}", self.label, err), &trace);
            }
        }

        now
    }

    /// Read the state and, if a yield is waiting, take it.
    fn observe(&self) -> (TaskState, Option<Pending<T>>, TaskState) {
        let mut slot = lock(&self.slot);
        let pending = if slot.state == TaskState::PendingYieldReturn {
            slot.pending_signal.take()
        } else {
            None
        };
        (slot.state, pending, slot.previous_state)
    }

    /// Drop the sequence unless someone is mid-step; they drop it on exit.
    fn release_sequence(&self) {
        if let Some(mut sequence) = try_lock(&self.sequence) {
            sequence.take();
        }
    }

    /// Execute one step while holding the turn.
    fn run_turn(&self, ran_on: TaskState) -> TaskState {
        let mut guard = lock(&self.sequence);

        let state = self.state();
        if state.is_terminal() {
            guard.take();
            return state;
        }

        let Some(sequence) = guard.as_mut() else {
            return self.transition(Transition::Cancel);
        };
        let outcome = run_step(sequence, ran_on);
        let now = self.transition(outcome);
        if now.is_terminal() {
            guard.take();
        }
        now
    }

    /// Submit the next step to the worker pool.
    ///
    /// Precondition: state is `ToWorkThread`.
    fn dispatch_to_worker(self: &Arc<Self>) -> TaskState {
        let now = self.transition(Transition::Hop(TaskState::InWorkThread));
        if now != TaskState::InWorkThread {
            return now;
        }

        let armed = Arc::new(AtomicBool::new(true));
        let job = WorkerJob {
            core: Some(self.clone()),
            armed: armed.clone(),
        };

        match self.pool.submit(Box::new(move || job.run())) {
            Ok(()) => {
                tracing::trace!(task = %self.label, id = %self.id.short(), "step dispatched to worker");
                // The pool may already have run or dropped the job.
                self.state()
            }
            Err(rejected) => {
                armed.store(false, Ordering::Release);
                drop(rejected.job);
                tracing::warn!(task = %self.label, reason = %rejected.reason, "worker pool rejected step");
                let now = self.transition(Transition::Failed(SchedulerError::Rejected(rejected.reason)));
                self.release_sequence();
                now
            }
        }
    }

    /// Synchronous drain entered on `ToMainThreadFollows`.
    ///
    /// Runs on the driver thread until the sequence hops back to a worker,
    /// exits, fails, or is exhausted. Values are not surfaced.
    fn drain(&self) -> TaskState {
        let mut guard = lock(&self.sequence);

        loop {
            let state = self.state();
            if state.is_terminal() {
                guard.take();
                return state;
            }

            let Some(sequence) = guard.as_mut() else {
                return self.transition(Transition::Cancel);
            };

            let outcome = match guarded_next(sequence) {
                Ok(None) => Transition::Finished,
                Ok(Some(Yield::Signal(ControlSignal::ToExit))) => Transition::Exit,
                Ok(Some(Yield::Signal(ControlSignal::ToWorkThread))) => {
                    Transition::Hop(TaskState::ToWorkThread)
                }
                Ok(Some(Yield::Signal(_))) | Ok(Some(Yield::Value(_))) => continue,
                Ok(Some(Yield::Nested(mut nested))) => match flatten(&mut nested, 1) {
                    Ok(Drained::Exhausted) => continue,
                    Ok(Drained::Exit) => Transition::Exit,
                    Err(err) => Transition::Failed(err.into()),
                },
                Err(err) => Transition::Failed(err.into()),
            };

            let now = self.transition(outcome);
            if now.is_terminal() {
                guard.take();
            }
            return now;
        }
    }
}

/// One background step. Dropping it unrun cancels the task.
struct WorkerJob<T: Send + 'static> {
    core: Option<Arc<TaskCore<T>>>,
    armed: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerJob<T> {
    fn run(mut self) {
        if let Some(core) = self.core.take() {
            core.run_turn(TaskState::InWorkThread);
        }
    }
}

impl<T: Send + 'static> Drop for WorkerJob<T> {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if self.armed.load(Ordering::Acquire) {
            core.transition(Transition::Failed(SchedulerError::JobDropped));
            core.release_sequence();
        }
    }
}

/// Handle to one running procedure.
///
/// Cloning is cheap; every clone refers to the same task, so a clone can be
/// sent to another thread to cancel it.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new<S>(
        label: TaskLabel,
        sequence: S,
        pool: Arc<dyn WorkerPool>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self
    where
        S: StepSequence<T> + Send + 'static,
    {
        let core = TaskCore {
            id: TaskId::new(),
            label,
            created_at: Utc::now(),
            sequence: Mutex::new(Some(Box::new(sequence))),
            slot: Mutex::new(Slot {
                state: TaskState::ToWorkThread,
                previous_state: TaskState::ToWorkThread,
                pending_signal: None,
            }),
            driver: Mutex::new(()),
            pool,
            reporter,
        };

        tracing::debug!(task = %core.label, id = %core.id.short(), "task created");
        Self {
            core: Arc::new(core),
        }
    }

    /// Drive the task once. Call this from the host loop every tick.
    ///
    /// Never blocks on background work. A second call racing an in-progress
    /// one on another thread returns `Suspended(None)` without progressing.
    pub fn advance(&self) -> Advance<T> {
        let Some(_driver) = try_lock(&self.core.driver) else {
            return Advance::Suspended(None);
        };

        loop {
            let (state, pending, previous) = self.core.observe();

            match state {
                TaskState::Finished | TaskState::Cancelled => {
                    self.core.release_sequence();
                    return Advance::Done;
                }
                TaskState::InWorkThread => return Advance::Suspended(None),
                TaskState::ToWorkThread => {
                    if self.core.dispatch_to_worker().is_terminal() {
                        continue;
                    }
                    return Advance::Suspended(None);
                }
                TaskState::ToMainThread => {
                    self.core.run_turn(TaskState::ToMainThread);
                }
                TaskState::PendingYieldReturn => match pending {
                    Some(Pending::Signal(ControlSignal::ToWorkThread)) => {
                        self.core.transition(Transition::Hop(TaskState::ToWorkThread));
                    }
                    Some(Pending::Signal(ControlSignal::ToMainThread)) => {
                        self.core.transition(Transition::Hop(TaskState::ToMainThread));
                    }
                    Some(Pending::Signal(ControlSignal::ToMainThreadFollows)) => {
                        if self.core.transition(Transition::Hop(TaskState::ToMainThread))
                            == TaskState::ToMainThread
                            && self.core.drain() == TaskState::ToWorkThread
                        {
                            return Advance::Suspended(None);
                        }
                    }
                    Some(Pending::Signal(ControlSignal::ToExit)) => {
                        self.core.transition(Transition::Exit);
                    }
                    Some(Pending::Value(value)) => {
                        let now = self.core.transition(Transition::Hop(resume_state(previous)));
                        if now.is_terminal() {
                            continue;
                        }
                        return Advance::Suspended(Some(value));
                    }
                    Some(Pending::Resume) | None => {
                        self.core.transition(Transition::Hop(resume_state(previous)));
                    }
                },
            }
        }
    }

    /// Stop the task. Idempotent and callable from any thread.
    ///
    /// A step already executing runs to completion; its result is dropped.
    pub fn cancel(&self) {
        let before = self.core.state();
        let now = self.core.transition(Transition::Cancel);
        if !before.is_terminal() && now == TaskState::Cancelled {
            tracing::debug!(task = %self.core.label, id = %self.core.id.short(), "task cancelled");
        }
        self.core.release_sequence();
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.core.id,
            label: self.core.label.clone(),
            state: self.state(),
            created_at: self.core.created_at,
        }
    }
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn label(&self) -> &TaskLabel {
        &self.core.label
    }
}

impl<T: Send + 'static> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .field("state", &self.state())
            .finish()
    }
}
