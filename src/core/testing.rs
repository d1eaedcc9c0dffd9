//! Test doubles for the host-supplied capabilities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::error::{RejectReason, Rejected};
use super::executor::{ErrorReporter, Job, WorkerPool};

/// Worker pool that only queues jobs; the test decides when they run.
#[derive(Clone, Default)]
pub(crate) struct QueuePool {
    jobs: Arc<Mutex<VecDeque<Job>>>,
    rejecting: Arc<AtomicBool>,
}

impl QueuePool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Run the oldest queued job on the calling thread.
    pub(crate) fn run_next(&self) -> bool {
        let job = self.jobs.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run queued jobs until the queue is empty, including any queued meanwhile.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Take the oldest job without running it, e.g. to run it on another thread.
    pub(crate) fn take_next(&self) -> Option<Job> {
        self.jobs.lock().unwrap().pop_front()
    }

    /// Discard every queued job unrun.
    pub(crate) fn drop_all(&self) {
        let jobs: Vec<Job> = self.jobs.lock().unwrap().drain(..).collect();
        drop(jobs);
    }

    pub(crate) fn reject_all(&self) {
        self.rejecting.store(true, Ordering::SeqCst);
    }
}

impl WorkerPool for QueuePool {
    fn submit(&self, job: Job) -> Result<(), Rejected> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(Rejected::new(job, RejectReason::ShutDown));
        }
        self.jobs.lock().unwrap().push_back(job);
        Ok(())
    }
}

/// Reporter that remembers every message.
#[derive(Clone, Default)]
pub(crate) struct RecordingReporter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report_error(&self, message: &str, _stack_trace: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
