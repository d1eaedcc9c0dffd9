//! Control-signal vocabulary.
//!
//! A step sequence yields either an ordinary value for the host, a nested
//! sequence to run inline, or one of a closed set of signals telling the
//! scheduler where the next step runs.

use std::fmt;

use super::sequence::BoxedSequence;

/// Where the next step of a task should run, or whether to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Run the following steps on a background worker.
    ToWorkThread,
    /// Run the following steps inline on the driver thread.
    ToMainThread,
    /// Drain the rest of the sequence synchronously on the driver thread,
    /// flattening nested sequences, until it hops back to a worker or ends.
    ToMainThreadFollows,
    /// Stop the task. It ends in the cancelled state.
    ToExit,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ToWorkThread => "to-work-thread",
            Self::ToMainThread => "to-main-thread",
            Self::ToMainThreadFollows => "to-main-thread-follows",
            Self::ToExit => "to-exit",
        };
        f.write_str(name)
    }
}

/// One item produced by a step sequence.
pub enum Yield<T> {
    Signal(ControlSignal),
    /// Handed back to the host from `advance()`.
    Value(T),
    /// Run to completion inline before the outer sequence continues.
    Nested(BoxedSequence<T>),
}

impl<T> Yield<T> {
    pub fn value(value: T) -> Self {
        Self::Value(value)
    }

    pub fn signal(signal: ControlSignal) -> Self {
        Self::Signal(signal)
    }

    pub fn nested<S>(sequence: S) -> Self
    where
        S: super::sequence::StepSequence<T> + Send + 'static,
    {
        Self::Nested(Box::new(sequence))
    }

    pub fn to_work_thread() -> Self {
        Self::Signal(ControlSignal::ToWorkThread)
    }

    pub fn to_main_thread() -> Self {
        Self::Signal(ControlSignal::ToMainThread)
    }

    pub fn to_main_thread_follows() -> Self {
        Self::Signal(ControlSignal::ToMainThreadFollows)
    }

    pub fn exit() -> Self {
        Self::Signal(ControlSignal::ToExit)
    }

    /// The control signal carried by this item, if any.
    pub fn as_signal(&self) -> Option<ControlSignal> {
        match self {
            Self::Signal(signal) => Some(*signal),
            _ => None,
        }
    }
}

impl<T> From<ControlSignal> for Yield<T> {
    fn from(signal: ControlSignal) -> Self {
        Self::Signal(signal)
    }
}

impl<T: fmt::Debug> fmt::Debug for Yield<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Nested(_) => f.write_str("Nested(..)"),
        }
    }
}
