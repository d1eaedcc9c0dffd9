// Core modules
pub mod config;
pub mod core;
pub mod types;

// Re-export key types and functions
pub use config::{SchedulerConfig, resolve_config_path};
pub use self::core::{
    Advance, BoxedSequence, ControlSignal, ErrorReporter, Job, RejectReason, Rejected, Scheduler,
    SchedulerError, StepError, StepResult, StepSequence, TaskHandle, TaskSet, TaskSnapshot,
    TaskState, TickReport, TokioPool, TracingReporter, WorkerPool, Yield, from_fn, from_iter,
};
pub use types::{TaskId, TaskLabel};
