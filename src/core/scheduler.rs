// Task creation and main-loop integration

use std::sync::Arc;

use super::executor::{ErrorReporter, TracingReporter, WorkerPool};
use super::sequence::StepSequence;
use super::task::{Advance, TaskHandle, TaskSnapshot};
use crate::types::{TaskId, TaskLabel};

/// Creates tasks bound to one worker pool and one error reporter.
///
/// The scheduler itself holds no task registry; each task owns its state.
#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<dyn WorkerPool>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Scheduler {
    pub fn new(pool: impl WorkerPool + 'static, reporter: impl ErrorReporter + 'static) -> Self {
        Self {
            pool: Arc::new(pool),
            reporter: Arc::new(reporter),
        }
    }

    /// Scheduler that reports failures through `tracing`.
    pub fn with_pool(pool: impl WorkerPool + 'static) -> Self {
        Self::new(pool, TracingReporter)
    }

    pub fn from_shared(pool: Arc<dyn WorkerPool>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { pool, reporter }
    }

    /// Wrap a sequence in a new task. Its first step runs on a worker.
    pub fn create_task<T, S>(&self, sequence: S) -> TaskHandle<T>
    where
        T: Send + 'static,
        S: StepSequence<T> + Send + 'static,
    {
        self.create_named_task(TaskLabel::default(), sequence)
    }

    pub fn create_named_task<T, S>(&self, label: impl Into<TaskLabel>, sequence: S) -> TaskHandle<T>
    where
        T: Send + 'static,
        S: StepSequence<T> + Send + 'static,
    {
        TaskHandle::new(
            label.into(),
            sequence,
            self.pool.clone(),
            self.reporter.clone(),
        )
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// Outcome of ticking a `TaskSet` once.
#[derive(Debug)]
pub struct TickReport<T> {
    /// Values yielded this tick, in task insertion order.
    pub values: Vec<(TaskId, T)>,
    /// Tasks that reached a terminal state this tick and were removed.
    pub completed: Vec<TaskSnapshot>,
}

impl<T> TickReport<T> {
    pub fn is_quiet(&self) -> bool {
        self.values.is_empty() && self.completed.is_empty()
    }
}

/// A group of tasks driven together, one `advance()` each per tick.
pub struct TaskSet<T> {
    tasks: Vec<TaskHandle<T>>,
}

impl<T> Default for TaskSet<T> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<T: Send + 'static> TaskSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task on `scheduler` and start driving it.
    pub fn spawn<S>(
        &mut self,
        scheduler: &Scheduler,
        label: impl Into<TaskLabel>,
        sequence: S,
    ) -> TaskHandle<T>
    where
        S: StepSequence<T> + Send + 'static,
    {
        let handle = scheduler.create_named_task(label, sequence);
        self.tasks.push(handle.clone());
        handle
    }

    /// Adopt a task created elsewhere.
    pub fn push(&mut self, handle: TaskHandle<T>) {
        self.tasks.push(handle);
    }

    /// Advance every task once and drop the ones that are done.
    pub fn tick(&mut self) -> TickReport<T> {
        let mut report = TickReport {
            values: Vec::new(),
            completed: Vec::new(),
        };

        self.tasks.retain(|task| match task.advance() {
            Advance::Suspended(Some(value)) => {
                report.values.push((task.id(), value));
                true
            }
            Advance::Suspended(None) => true,
            Advance::Done => {
                report.completed.push(task.snapshot());
                false
            }
        });

        if !report.completed.is_empty() {
            tracing::debug!(
                completed = report.completed.len(),
                remaining = self.tasks.len(),
                "tasks completed this tick"
            );
        }

        report
    }

    /// Cancel every task. They are removed on the next tick.
    pub fn cancel_all(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskHandle<T>> {
        self.tasks.iter().find(|task| task.id() == id)
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.iter().map(TaskHandle::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::Yield;
    use crate::core::sequence::from_iter;
    use crate::core::task::TaskState;
    use crate::core::testing::{QueuePool, RecordingReporter};

    #[test]
    fn test_create_task_starts_off_main_loop() {
        let pool = QueuePool::new();
        let scheduler = Scheduler::new(pool.clone(), RecordingReporter::new());
        let task = scheduler.create_task(from_iter(vec![Yield::value(1u32)]));

        assert_eq!(task.state(), TaskState::ToWorkThread);
        assert_eq!(task.label().as_str(), "task");
        task.advance();
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn test_named_task_label() {
        let scheduler = Scheduler::with_pool(QueuePool::new());
        let task = scheduler.create_named_task("fetch-leaderboard", from_iter(vec![Yield::value(1u32)]));
        assert_eq!(task.label().as_str(), "fetch-leaderboard");
    }

    #[test]
    fn test_task_set_collects_values_and_completions() {
        let pool = QueuePool::new();
        let scheduler = Scheduler::new(pool.clone(), RecordingReporter::new());
        let mut set = TaskSet::new();

        let a = set.spawn(
            &scheduler,
            "a",
            from_iter(vec![Yield::to_main_thread(), Yield::value(1u32), Yield::value(2)]),
        );
        let b = set.spawn(&scheduler, "b", from_iter(vec![Yield::to_main_thread()]));
        assert_eq!(set.len(), 2);

        // Tick 1: both dispatch their first step.
        assert!(set.tick().is_quiet());
        assert_eq!(pool.run_all(), 2);

        // Tick 2: a yields 1 inline, b is exhausted inline.
        let report = set.tick();
        assert_eq!(report.values, vec![(a.id(), 1)]);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].id, b.id());
        assert_eq!(report.completed[0].state, TaskState::Finished);
        assert_eq!(set.len(), 1);

        let report = set.tick();
        assert_eq!(report.values, vec![(a.id(), 2)]);

        let report = set.tick();
        assert!(report.values.is_empty());
        assert_eq!(report.completed[0].id, a.id());
        assert!(set.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let pool = QueuePool::new();
        let scheduler = Scheduler::new(pool.clone(), RecordingReporter::new());
        let mut set = TaskSet::new();
        set.spawn(&scheduler, "a", from_iter(vec![Yield::value(1u32)]));
        set.spawn(&scheduler, "b", from_iter(vec![Yield::value(2u32)]));

        set.tick();
        set.cancel_all();
        assert!(set.snapshots().iter().all(|s| s.state == TaskState::Cancelled));

        // In-flight jobs see the cancellation and discard their results.
        pool.run_all();
        let report = set.tick();
        assert!(report.values.is_empty());
        assert_eq!(report.completed.len(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_from_shared_reuses_pool_and_reporter() {
        let pool = QueuePool::new();
        let reporter = RecordingReporter::new();
        pool.reject_all();
        let shared_pool: Arc<dyn WorkerPool> = Arc::new(pool.clone());
        let shared_reporter: Arc<dyn ErrorReporter> = Arc::new(reporter.clone());

        let first = Scheduler::from_shared(shared_pool.clone(), shared_reporter.clone());
        let second = Scheduler::from_shared(shared_pool, shared_reporter);
        let a = first.create_task(from_iter(vec![Yield::value(1u32)]));
        let b = second.create_task(from_iter(vec![Yield::value(2u32)]));

        assert!(a.advance().is_done());
        assert!(b.advance().is_done());
        assert_eq!(reporter.messages().len(), 2);
    }

    #[test]
    fn test_push_adopts_existing_task() {
        let pool = QueuePool::new();
        let scheduler = Scheduler::new(pool.clone(), RecordingReporter::new());
        let handle = scheduler.create_named_task("adopted", from_iter(vec![Yield::to_main_thread(), Yield::value(4u32)]));

        let mut set = TaskSet::new();
        set.push(handle.clone());
        assert_eq!(set.len(), 1);

        set.tick();
        pool.run_all();
        let report = set.tick();
        assert_eq!(report.values, vec![(handle.id(), 4)]);
        assert_eq!(set.get(handle.id()).map(|t| t.label().as_str()), Some("adopted"));
    }

    #[test]
    fn test_get_by_id() {
        let scheduler = Scheduler::with_pool(QueuePool::new());
        let mut set: TaskSet<u32> = TaskSet::new();
        let handle = set.spawn(&scheduler, "x", from_iter(Vec::new()));
        assert!(set.get(handle.id()).is_some());
        assert!(set.get(TaskId::new()).is_none());
    }
}
