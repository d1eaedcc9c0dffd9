//! Step sequences: the resumable procedures a task drives.
//!
//! A sequence is pulled one item at a time. Each call to `next_step` runs
//! one step of user work and reports what it produced, or `None` once the
//! procedure is finished.

use super::error::{StepError, catch_step};
use super::signal::{ControlSignal, Yield};

/// Result of pulling one step.
pub type StepResult<T> = Result<Option<Yield<T>>, StepError>;

/// A lazy, resumable sequence of steps.
pub trait StepSequence<T> {
    fn next_step(&mut self) -> StepResult<T>;
}

/// Owned, type-erased sequence as stored inside a task.
pub type BoxedSequence<T> = Box<dyn StepSequence<T> + Send>;

impl<T, S> StepSequence<T> for Box<S>
where
    S: StepSequence<T> + ?Sized,
{
    fn next_step(&mut self) -> StepResult<T> {
        (**self).next_step()
    }
}

/// Sequence backed by an iterator of yields. Never fails.
pub struct IterSequence<I> {
    iter: I,
}

impl<T, I> StepSequence<T> for IterSequence<I>
where
    I: Iterator<Item = Yield<T>>,
{
    fn next_step(&mut self) -> StepResult<T> {
        Ok(self.iter.next())
    }
}

pub fn from_iter<T, I>(items: I) -> IterSequence<I::IntoIter>
where
    I: IntoIterator<Item = Yield<T>>,
{
    IterSequence {
        iter: items.into_iter(),
    }
}

/// Sequence backed by a closure called once per step.
pub struct FnSequence<F> {
    f: F,
}

impl<T, F> StepSequence<T> for FnSequence<F>
where
    F: FnMut() -> StepResult<T>,
{
    fn next_step(&mut self) -> StepResult<T> {
        (self.f)()
    }
}

pub fn from_fn<T, F>(f: F) -> FnSequence<F>
where
    F: FnMut() -> StepResult<T>,
{
    FnSequence { f }
}

/// Pull one step with panics contained.
pub(crate) fn guarded_next<T, S>(sequence: &mut S) -> StepResult<T>
where
    S: StepSequence<T> + ?Sized,
{
    catch_step(|| sequence.next_step())
}

/// How a synchronous drain of a nested sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drained {
    Exhausted,
    Exit,
}

/// Drain a nested sequence to completion on the calling thread.
///
/// Only `ToExit` and further nested sequences are honored here; values and
/// thread-hop signals produced at this depth are dropped.
pub(crate) fn flatten<T, S>(sequence: &mut S, depth: usize) -> Result<Drained, StepError>
where
    S: StepSequence<T> + ?Sized,
{
    loop {
        match guarded_next(sequence)? {
            None => return Ok(Drained::Exhausted),
            Some(Yield::Signal(ControlSignal::ToExit)) => {
                tracing::debug!(depth, "nested sequence requested exit");
                return Ok(Drained::Exit);
            }
            Some(Yield::Nested(mut inner)) => {
                if flatten(&mut inner, depth + 1)? == Drained::Exit {
                    return Ok(Drained::Exit);
                }
            }
            Some(Yield::Signal(signal)) => {
                tracing::trace!(depth, %signal, "ignoring thread hop inside nested sequence");
            }
            Some(Yield::Value(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_values(mut seq: impl StepSequence<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(item) = seq.next_step().unwrap() {
            if let Yield::Value(v) = item {
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn test_from_iter() {
        let seq = from_iter(vec![Yield::value(1u32), Yield::to_main_thread(), Yield::value(2)]);
        assert_eq!(collect_values(seq), vec![1, 2]);
    }

    #[test]
    fn test_from_fn_counts_down() {
        let mut left = 3u32;
        let seq = from_fn(move || {
            if left == 0 {
                return Ok(None);
            }
            left -= 1;
            Ok(Some(Yield::value(left)))
        });
        assert_eq!(collect_values(seq), vec![2, 1, 0]);
    }

    #[test]
    fn test_guarded_next_contains_panic() {
        let mut seq = from_fn(|| -> StepResult<u32> { panic!("sensor unplugged") });
        let err = guarded_next(&mut seq).unwrap_err();
        assert!(err.message().contains("sensor unplugged"));
    }

    #[test]
    fn test_flatten_runs_nested_to_completion() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let pulls = Arc::new(AtomicU32::new(0));
        let inner_pulls = pulls.clone();
        let inner = from_fn(move || {
            let n = inner_pulls.fetch_add(1, Ordering::SeqCst);
            if n >= 2 { Ok(None) } else { Ok(Some(Yield::value(n))) }
        });
        let mut outer = from_iter(vec![
            Yield::value(10u32),
            Yield::nested(inner),
            Yield::to_work_thread(),
            Yield::value(11),
        ]);

        assert_eq!(flatten(&mut outer, 0).unwrap(), Drained::Exhausted);
        // Two values plus the final exhausted pull.
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_flatten_exit_from_deep_nesting() {
        let deepest = from_iter(vec![Yield::value(1u32), Yield::exit(), Yield::value(2)]);
        let middle = from_iter(vec![Yield::nested(deepest)]);
        let mut outer = from_iter(vec![Yield::nested(middle), Yield::value(3)]);

        assert_eq!(flatten(&mut outer, 0).unwrap(), Drained::Exit);
        // The item after the nested exit was never pulled.
        assert!(matches!(outer.next_step().unwrap(), Some(Yield::Value(3))));
    }

    #[test]
    fn test_flatten_propagates_step_error() {
        let failing = from_fn(|| -> StepResult<u32> { Err(StepError::new("read failed")) });
        let mut outer = from_iter(vec![Yield::nested(failing)]);

        let err = flatten(&mut outer, 0).unwrap_err();
        assert_eq!(err.message(), "read failed");
    }
}
