// Cooperative task scheduling: thread hand-off between a worker pool and the main loop

pub mod error;
pub mod executor;
pub mod scheduler;
pub mod sequence;
pub mod signal;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;


pub use error::*;
pub use executor::*;
pub use scheduler::*;
pub use sequence::{BoxedSequence, FnSequence, IterSequence, StepResult, StepSequence, from_fn, from_iter};
pub use signal::*;
pub use task::*;
