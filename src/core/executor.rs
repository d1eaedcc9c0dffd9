// Background dispatch and error reporting capabilities supplied by the host

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;

use super::error::{RejectReason, Rejected};

/// A unit of background work: exactly one step of one task.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work-submission capability of an external thread pool.
///
/// A pool that refuses a job hands it back inside `Rejected` without
/// running it. A pool that accepts a job and later discards it unrun is
/// tolerated; the task notices when the job is dropped.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job) -> Result<(), Rejected>;
}

impl<F> WorkerPool for F
where
    F: Fn(Job) -> Result<(), Rejected> + Send + Sync,
{
    fn submit(&self, job: Job) -> Result<(), Rejected> {
        self(job)
    }
}

/// Runs jobs on the blocking pool of a host-owned tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioPool {
    handle: Handle,
    closed: Arc<AtomicBool>,
}

impl TokioPool {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse every job submitted from now on. Clones share the flag.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl WorkerPool for TokioPool {
    fn submit(&self, job: Job) -> Result<(), Rejected> {
        if self.is_closed() {
            return Err(Rejected::new(job, RejectReason::ShutDown));
        }

        // Detached: completion is signalled through the task's own state.
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

/// Out-of-band sink for failures the scheduler contains.
///
/// `stack_trace` is empty when no backtrace was captured.
pub trait ErrorReporter: Send + Sync {
    fn report_error(&self, message: &str, stack_trace: &str);
}

impl<F> ErrorReporter for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn report_error(&self, message: &str, stack_trace: &str) {
        self(message, stack_trace)
    }
}

/// Default reporter: logs through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report_error(&self, message: &str, stack_trace: &str) {
        if stack_trace.is_empty() {
            tracing::error!("{}", message);
        } else {
            tracing::error!(stack_trace, "{}", message);
        }
    }
}
