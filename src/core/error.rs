//! Error types for task execution and background dispatch.
//!
//! None of these cross the `advance()` boundary. Step failures and pool
//! rejections are handed to the task's `ErrorReporter` and the task ends
//! cancelled.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic;
use std::sync::Once;

use thiserror::Error;

use super::executor::Job;

thread_local! {
    /// Nesting depth of `catch_step` on this thread.
    static CATCHING: Cell<usize> = const { Cell::new(0) };
    /// Backtrace taken by the panic hook before unwinding started.
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records where a contained step panicked.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CATCHING.with(Cell::get) > 0 {
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            }
            previous(info);
        }));
    });
}

/// Render a backtrace, or `None` when capture was disabled or unsupported.
fn render(trace: Backtrace) -> Option<String> {
    (trace.status() == BacktraceStatus::Captured).then(|| trace.to_string())
}

/// Failure raised by a single step of a sequence.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
    trace: Option<String>,
}

impl StepError {
    /// Create an error, capturing a backtrace when `RUST_BACKTRACE` allows it.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: render(Backtrace::capture()),
        }
    }

    /// Build an error from a caught panic payload.
    ///
    /// Uses the trace recorded at the panic site when one is available.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "step panicked with a non-string payload".to_string()
        };

        let trace = PANIC_TRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(Backtrace::force_capture);

        Self {
            message: format!("step panicked: {}", message),
            trace: render(trace),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            trace: render(Backtrace::capture()),
        }
    }
}

/// Why a worker pool refused a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("worker pool is shut down")]
    ShutDown,
}

/// A job the pool refused, handed back so the caller can dispose of it.
pub struct Rejected {
    pub job: Job,
    pub reason: RejectReason,
}

impl Rejected {
    pub fn new(job: Job, reason: RejectReason) -> Self {
        Self { job, reason }
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job rejected: {}", self.reason)
    }
}

impl std::error::Error for Rejected {}

/// Everything the scheduler reports out-of-band.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("step failed: {0}")]
    Step(#[from] StepError),

    #[error("background dispatch failed: {0}")]
    Rejected(RejectReason),

    #[error("background job was dropped before it ran")]
    JobDropped,
}

impl SchedulerError {
    /// Stack trace to hand to the reporter alongside the message.
    pub fn stack_trace(&self) -> Option<String> {
        match self {
            Self::Step(err) => err.stack_trace().map(str::to_string),
            Self::Rejected(_) | Self::JobDropped => render(Backtrace::capture()),
        }
    }
}

/// Run `f`, turning a panic into a `StepError`.
pub(crate) fn catch_step<R>(f: impl FnOnce() -> Result<R, StepError>) -> Result<R, StepError> {
    install_panic_hook();

    CATCHING.with(|depth| depth.set(depth.get() + 1));
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(f));
    CATCHING.with(|depth| depth.set(depth.get() - 1));

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(StepError::from_panic(payload)),
    }
}
