//! Progress reporting and cancellation
//!
//! Long passes poll a caller-supplied [`Progress`] at coarse granularity.
//! When the callback asks to stop, the pass returns early with
//! [`Outcome::Cancelled`] carrying whatever raw state was reached. That
//! state is never finalized and must not be presented as a result.

/// Number of ranked cells processed between two progress polls.
pub const PROGRESS_INTERVAL: usize = 4096;

/// Host-side progress sink.
pub trait Progress {
    /// Report the fraction of work done (0..=1).
    ///
    /// Returns `false` to request cancellation.
    fn report(&mut self, fraction_done: f64) -> bool;
}

impl<F> Progress for F
where
    F: FnMut(f64) -> bool,
{
    fn report(&mut self, fraction_done: f64) -> bool {
        self(fraction_done)
    }
}

/// Progress sink that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&mut self, _fraction_done: f64) -> bool {
        true
    }
}

/// Completion status of an engine run.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The run finished and the payload is finalized.
    Complete(T),
    /// The host cancelled the run; the payload is partial and unfinalized.
    Cancelled(T),
}

impl<T> Outcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }

    /// The finalized payload, or `None` if the run was cancelled.
    pub fn complete(self) -> Option<T> {
        match self {
            Outcome::Complete(value) => Some(value),
            Outcome::Cancelled(_) => None,
        }
    }

    /// The payload regardless of status.
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Complete(value) | Outcome::Cancelled(value) => value,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Complete(value) => Outcome::Complete(f(value)),
            Outcome::Cancelled(value) => Outcome::Cancelled(f(value)),
        }
    }
}

/// Poll helper for sorted passes: reports every [`PROGRESS_INTERVAL`] steps.
///
/// Returns `false` if the host requested cancellation.
pub fn poll_every<P: Progress + ?Sized>(progress: &mut P, done: usize, total: usize) -> bool {
    if done % PROGRESS_INTERVAL != 0 || total == 0 {
        return true;
    }
    progress.report(done as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_progress_cancels() {
        let mut calls = 0;
        let mut progress = |_f: f64| {
            calls += 1;
            calls < 2
        };
        assert!(progress.report(0.1));
        assert!(!progress.report(0.2));
    }

    #[test]
    fn test_poll_every_interval() {
        let mut seen = Vec::new();
        let mut progress = |f: f64| {
            seen.push(f);
            true
        };
        for i in 0..(PROGRESS_INTERVAL * 2 + 1) {
            assert!(poll_every(&mut progress, i, PROGRESS_INTERVAL * 2));
        }
        assert_eq!(seen.len(), 3, "Expected polls at 0, N and 2N");
    }

    #[test]
    fn test_outcome_accessors() {
        let done: Outcome<i32> = Outcome::Complete(3);
        assert!(done.is_complete());
        assert_eq!(done.clone().complete(), Some(3));

        let partial: Outcome<i32> = Outcome::Cancelled(1);
        assert!(partial.is_cancelled());
        assert_eq!(partial.clone().complete(), None);
        assert_eq!(partial.map(|v| v * 10).into_inner(), 10);
    }
}
