//! Timers
//!
//! Sleeping, delayed effects, and timeouts, all built on the executor's
//! timer heap. A sleeping effect holds exactly one timer; cancellation of
//! the surrounding region releases it through the async cleanup path.

use std::time::Duration;

use crate::concurrency::race_all_first;
use crate::effect::Effect;

/// Suspend for `duration`.
///
/// Registers one executor timer; the cleanup run on abort cancels it, so an
/// interrupted sleep never leaves a timer behind.
pub fn sleep<E: Send + 'static>(duration: Duration) -> Effect<(), E> {
    Effect::callback(move |resume, _signal| {
        let timer = resume.executor().set_timer(duration, {
            let resume = resume.clone();
            move || resume.succeed(())
        });
        Some(Effect::sync(move || timer.cancel()))
    })
}

enum TimeoutMarker<E> {
    Inner(E),
    Elapsed,
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Sleep for `duration`, then run this effect.
    pub fn delay(self, duration: Duration) -> Effect<A, E> {
        sleep(duration).then(self)
    }

    /// Race this effect against a deadline.
    ///
    /// Delivers `Some(value)` if the effect wins, `None` if the deadline
    /// does; the loser is aborted either way. Expected failures of the
    /// effect propagate unchanged. An uninterruptible effect outlasts the
    /// deadline and still wins.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        let contender = self.map(Some).map_error(TimeoutMarker::Inner);
        let cutoff =
            sleep::<TimeoutMarker<E>>(duration).then(Effect::fail(TimeoutMarker::Elapsed));
        race_all_first(vec![contender, cutoff]).catch_all(|marker| match marker {
            TimeoutMarker::Inner(error) => Effect::fail(error),
            TimeoutMarker::Elapsed => Effect::succeed(None),
        })
    }

    /// Like [`timeout`](Effect::timeout), but runs `fallback` when the
    /// deadline wins.
    pub fn timeout_or_else<F>(self, duration: Duration, fallback: F) -> Effect<A, E>
    where
        F: FnOnce() -> Effect<A, E> + Send + 'static,
    {
        let contender = self.map_error(TimeoutMarker::Inner);
        let cutoff = sleep::<TimeoutMarker<E>>(duration).then(Effect::fail(TimeoutMarker::Elapsed));
        race_all_first(vec![contender, cutoff]).catch_all(|marker| match marker {
            TimeoutMarker::Inner(error) => Effect::fail(error),
            TimeoutMarker::Elapsed => fallback(),
        })
    }
}
