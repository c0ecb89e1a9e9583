//! Concurrent Composition
//!
//! Running collections of effects: ordered traversal with a concurrency
//! budget, and races where the first success (or first outcome) wins.
//!
//! # Design
//!
//! Every concurrent combinator forks a child cancellation source linked to
//! the signal in force: a parent abort fans out to all children, a first
//! failure (or a decided race) cancels the siblings, and the combinator
//! always waits for every in-flight child to report before delivering. That
//! last point is what lets losers run their `on_interrupt` finalizers before
//! the race resolves.
//!
//! The traversal pump is iterative: a running flag turns synchronous child
//! completions into loop iterations instead of recursion, so long
//! all-synchronous chains consume constant stack.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::{CancellationSource, CancellationToken, ListenerKey};
use crate::effect::{Effect, OnResult};
use crate::env::Env;
use crate::outcome::{catching, Defect, Failure, Outcome};

/// Concurrency policy for [`for_each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Use the policy inherited from the environment.
    Inherit,
    /// No limit on in-flight children.
    Unbounded,
    /// At most this many in-flight children; `1` is sequential.
    Limit(usize),
}

impl Concurrency {
    /// The effective in-flight budget under `env`.
    fn resolved(self, env: &Env) -> usize {
        let policy = match self {
            Concurrency::Inherit => env.concurrency(),
            explicit => explicit,
        };
        match policy {
            Concurrency::Limit(n) => n.max(1),
            _ => usize::MAX,
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Inherit => write!(f, "inherit"),
            Concurrency::Unbounded => write!(f, "unbounded"),
            Concurrency::Limit(n) => write!(f, "{}", n),
        }
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Install a concurrency policy for inherited lookups below this effect.
    pub fn with_concurrency(self, concurrency: Concurrency) -> Effect<A, E> {
        Effect::make(move |env, on_result| {
            let env = match concurrency {
                Concurrency::Inherit => env,
                explicit => env.with_concurrency(explicit),
            };
            self.run(env, on_result);
        })
    }
}

// ----------------------------------------------------------------------
// for_each
// ----------------------------------------------------------------------

/// Apply `f` to every item, running at most `concurrency` children at once.
///
/// Delivers the `Ok` values in input order, regardless of completion order.
/// On the first failure the remaining children are aborted, every in-flight
/// child is awaited, and the failure is delivered; with a budget of one this
/// degenerates to the classic sequential loop.
pub fn for_each<T, B, E, I, F>(items: I, f: F, concurrency: Concurrency) -> Effect<Vec<B>, E>
where
    T: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
    F: FnMut(T) -> Effect<B, E> + Send + 'static,
{
    traverse(items, f, concurrency, true)
}

/// [`for_each`] without collecting the outputs.
pub fn for_each_discard<T, B, E, I, F>(items: I, f: F, concurrency: Concurrency) -> Effect<(), E>
where
    T: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
    F: FnMut(T) -> Effect<B, E> + Send + 'static,
{
    traverse(items, f, concurrency, false).void()
}

struct TraverseState<T, B, E, F> {
    items: std::vec::IntoIter<T>,
    f: F,
    slots: Vec<Option<B>>,
    collect: bool,
    next_index: usize,
    in_progress: usize,
    limit: usize,
    exhausted: bool,
    failure: Option<Failure<E>>,
    on_result: Option<OnResult<Vec<B>, E>>,
    child_source: CancellationSource,
    unlink: Option<(CancellationToken, ListenerKey)>,
    env: Env,
    pumping: bool,
    repump: bool,
}

enum TraverseStep<B, E> {
    Run(Effect<B, E>, Env, usize),
    Cancel(CancellationSource),
    Deliver(
        OnResult<Vec<B>, E>,
        Outcome<Vec<B>, E>,
        Option<(CancellationToken, ListenerKey)>,
    ),
    Again,
    Idle,
}

fn traverse<T, B, E, I, F>(
    items: I,
    f: F,
    concurrency: Concurrency,
    collect: bool,
) -> Effect<Vec<B>, E>
where
    T: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
    F: FnMut(T) -> Effect<B, E> + Send + 'static,
{
    Effect::make(move |env, on_result| {
        let items: Vec<T> = items.into_iter().collect();
        let total = items.len();
        if total == 0 {
            on_result(Ok(Vec::new()));
            return;
        }
        let limit = concurrency.resolved(&env);
        let parent_signal = env.signal().clone();
        let (child_source, link) = CancellationSource::linked_to(&parent_signal);
        let child_env = env.with_source(child_source.clone());
        let slots = if collect {
            (0..total).map(|_| None).collect()
        } else {
            Vec::new()
        };
        let state = Arc::new(Mutex::new(TraverseState {
            items: items.into_iter(),
            f,
            slots,
            collect,
            next_index: 0,
            in_progress: 0,
            limit,
            exhausted: false,
            failure: None,
            on_result: Some(on_result),
            child_source,
            unlink: link.map(|key| (parent_signal, key)),
            env: child_env,
            pumping: false,
            repump: false,
        }));
        traverse_pump(&state);
    })
}

fn traverse_pump<T, B, E, F>(state: &Arc<Mutex<TraverseState<T, B, E, F>>>)
where
    T: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    F: FnMut(T) -> Effect<B, E> + Send + 'static,
{
    {
        let mut s = state.lock();
        if s.pumping {
            s.repump = true;
            return;
        }
        s.pumping = true;
    }
    loop {
        let step = {
            let mut s = state.lock();
            if s.in_progress == 0 && (s.failure.is_some() || s.exhausted) {
                match s.on_result.take() {
                    Some(on_result) => {
                        let unlink = s.unlink.take();
                        let outcome = match s.failure.take() {
                            Some(failure) => Err(failure),
                            None => {
                                let mut out = Vec::with_capacity(s.slots.len());
                                for slot in s.slots.drain(..) {
                                    debug_assert!(slot.is_some());
                                    if let Some(value) = slot {
                                        out.push(value);
                                    }
                                }
                                Ok(out)
                            }
                        };
                        TraverseStep::Deliver(on_result, outcome, unlink)
                    }
                    None => TraverseStep::Idle,
                }
            } else if s.failure.is_none() && !s.exhausted && s.in_progress < s.limit {
                match s.items.next() {
                    None => {
                        s.exhausted = true;
                        TraverseStep::Again
                    }
                    Some(item) => {
                        let index = s.next_index;
                        s.next_index += 1;
                        s.in_progress += 1;
                        match catching(|| (s.f)(item)) {
                            Ok(effect) => TraverseStep::Run(effect, s.env.clone(), index),
                            Err(defect) => {
                                s.in_progress -= 1;
                                s.failure = Some(Failure::Unexpected(defect));
                                TraverseStep::Cancel(s.child_source.clone())
                            }
                        }
                    }
                }
            } else {
                TraverseStep::Idle
            }
        };
        match step {
            TraverseStep::Again => {}
            TraverseStep::Cancel(source) => {
                // Outside the state lock: cancelling re-enters the child
                // callbacks of anything already in flight.
                source.cancel();
            }
            TraverseStep::Run(effect, env, index) => {
                let state = state.clone();
                effect.run(
                    env,
                    Box::new(move |outcome| {
                        let to_cancel = {
                            let mut s = state.lock();
                            s.in_progress -= 1;
                            match outcome {
                                Ok(value) => {
                                    if s.collect {
                                        s.slots[index] = Some(value);
                                    }
                                    None
                                }
                                Err(failure) => {
                                    if s.failure.is_none() {
                                        s.failure = Some(failure);
                                        Some(s.child_source.clone())
                                    } else {
                                        if !failure.is_aborted() {
                                            crate::debug!(
                                                "for_each: subsequent failure dropped"
                                            );
                                        }
                                        None
                                    }
                                }
                            }
                        };
                        if let Some(source) = to_cancel {
                            source.cancel();
                        }
                        traverse_pump(&state);
                    }),
                );
            }
            TraverseStep::Deliver(on_result, outcome, unlink) => {
                {
                    let mut s = state.lock();
                    s.pumping = false;
                    s.repump = false;
                }
                if let Some((token, key)) = unlink {
                    token.remove_listener(key);
                }
                on_result(outcome);
                return;
            }
            TraverseStep::Idle => {
                let mut s = state.lock();
                if s.repump {
                    s.repump = false;
                } else {
                    s.pumping = false;
                    return;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Races
// ----------------------------------------------------------------------

/// Race `effects`; the first success wins.
///
/// On the first `Ok` the siblings are aborted, every child is awaited, and
/// the winner is delivered. If every effect fails, the first collected
/// failure is delivered.
pub fn race_all<A, E, I>(effects: I) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = Effect<A, E>> + Send + 'static,
{
    race(effects, false)
}

/// Race `effects`; the first outcome of either polarity wins.
pub fn race_all_first<A, E, I>(effects: I) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = Effect<A, E>> + Send + 'static,
{
    race(effects, true)
}

struct RaceState<A, E> {
    winner: Option<Outcome<A, E>>,
    fallback: Option<Failure<E>>,
    remaining: usize,
    on_result: Option<OnResult<A, E>>,
    unlink: Option<(CancellationToken, ListenerKey)>,
}

fn race<A, E, I>(effects: I, first_outcome_wins: bool) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = Effect<A, E>> + Send + 'static,
{
    Effect::make(move |env, on_result| {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        if effects.is_empty() {
            on_result(Err(Failure::Unexpected(Defect::message(
                "race over an empty collection",
            ))));
            return;
        }
        let parent_signal = env.signal().clone();
        let (child_source, link) = CancellationSource::linked_to(&parent_signal);
        let child_env = env.with_source(child_source.clone());
        let state = Arc::new(Mutex::new(RaceState {
            winner: None,
            fallback: None,
            remaining: effects.len(),
            on_result: Some(on_result),
            unlink: link.map(|key| (parent_signal, key)),
        }));
        for effect in effects {
            let state = state.clone();
            let source = child_source.clone();
            effect.run(
                child_env.clone(),
                Box::new(move |outcome| {
                    let (to_cancel, finished) = {
                        let mut s = state.lock();
                        s.remaining -= 1;
                        let mut to_cancel = false;
                        match outcome {
                            Ok(value) => {
                                if s.winner.is_none() {
                                    s.winner = Some(Ok(value));
                                    to_cancel = true;
                                } else {
                                    crate::debug!("race: trailing success dropped");
                                }
                            }
                            Err(failure) => {
                                if first_outcome_wins && s.winner.is_none() {
                                    s.winner = Some(Err(failure));
                                    to_cancel = true;
                                } else if s.winner.is_none() && s.fallback.is_none() {
                                    s.fallback = Some(failure);
                                } else if !failure.is_aborted() {
                                    crate::debug!("race: trailing failure dropped");
                                }
                            }
                        }
                        let finished = if s.remaining == 0 {
                            let delivered = match (s.winner.take(), s.fallback.take()) {
                                (Some(winner), _) => Some(winner),
                                (None, Some(failure)) => Some(Err(failure)),
                                (None, None) => None,
                            };
                            s.on_result
                                .take()
                                .zip(delivered)
                                .map(|(cb, result)| (cb, result, s.unlink.take()))
                        } else {
                            None
                        };
                        (to_cancel, finished)
                    };
                    if to_cancel {
                        source.cancel();
                    }
                    if let Some((on_result, result, unlink)) = finished {
                        if let Some((token, key)) = unlink {
                            token.remove_listener(key);
                        }
                        on_result(result);
                    }
                }),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_for_each_sequential_order() {
        let rt = Runtime::default();
        let effect = for_each(
            vec![1, 2, 3, 4],
            |n| Effect::<_, Infallible>::succeed(n * 10),
            Concurrency::Limit(1),
        );
        assert_eq!(rt.block_on(effect).unwrap(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_for_each_preserves_input_order_unbounded() {
        let rt = Runtime::default();
        // Later items finish first; the output must still follow input order.
        let effect = for_each(
            vec![40u64, 30, 20, 10],
            |ms| {
                Effect::<_, Infallible>::succeed(ms).delay(Duration::from_millis(ms))
            },
            Concurrency::Unbounded,
        );
        assert_eq!(rt.block_on(effect).unwrap(), vec![40, 30, 20, 10]);
    }

    #[test]
    fn test_for_each_bounded_respects_limit() {
        let rt = Runtime::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let effect = for_each(
            0..10,
            {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move |_| {
                    let gauge = in_flight.clone();
                    let release = in_flight.clone();
                    let peak = peak.clone();
                    Effect::<_, Infallible>::sync(move || {
                        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                    })
                    .then(crate::time::sleep(Duration::from_millis(10)))
                    .then(Effect::sync(move || {
                        release.fetch_sub(1, Ordering::SeqCst);
                    }))
                }
            },
            Concurrency::Limit(3),
        );

        assert!(rt.block_on(effect).is_ok());
        let peak = peak.load(Ordering::SeqCst);
        assert!((2..=3).contains(&peak), "peak in-flight was {}", peak);
    }

    #[test]
    fn test_for_each_sequential_stops_on_failure() {
        let rt = Runtime::default();
        let touched = Arc::new(AtomicUsize::new(0));
        let t = touched.clone();

        let effect = for_each(
            vec![1, 2, 3, 4, 5],
            move |n| {
                let t = t.clone();
                Effect::suspend(move || {
                    if n == 3 {
                        Effect::fail("item three")
                    } else {
                        t.fetch_add(1, Ordering::SeqCst);
                        Effect::succeed(n)
                    }
                })
            },
            Concurrency::Limit(1),
        );

        assert!(matches!(
            rt.block_on(effect),
            Err(Failure::Expected("item three"))
        ));
        assert_eq!(touched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_for_each_failure_aborts_in_flight() {
        let rt = Runtime::default();
        let completed = Arc::new(AtomicUsize::new(0));
        let c = completed.clone();

        // One quick failure plus slow successes: the slow ones must be
        // aborted, and the combinator still waits for them to report.
        let effect = for_each(
            vec![0u64, 200, 200],
            move |ms| {
                let c = c.clone();
                if ms == 0 {
                    Effect::<u64, _>::fail("early").delay(Duration::from_millis(5))
                } else {
                    Effect::<_, &str>::sync(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                        ms
                    })
                    .delay(Duration::from_millis(ms))
                }
            },
            Concurrency::Unbounded,
        );

        let started = std::time::Instant::now();
        assert!(matches!(
            rt.block_on(effect),
            Err(Failure::Expected("early"))
        ));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_for_each_discard() {
        let rt = Runtime::default();
        let sum = Arc::new(AtomicUsize::new(0));
        let s = sum.clone();
        let effect = for_each_discard(
            1..=4usize,
            move |n| {
                let s = s.clone();
                Effect::<_, Infallible>::sync(move || s.fetch_add(n, Ordering::SeqCst))
            },
            Concurrency::Limit(2),
        );
        assert!(rt.block_on(effect).is_ok());
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_for_each_inherit_reads_env() {
        let rt = Runtime::default();
        let effect = for_each(
            vec![1, 2, 3],
            |n| Effect::<_, Infallible>::succeed(n),
            Concurrency::Inherit,
        )
        .with_concurrency(Concurrency::Limit(2));
        assert_eq!(rt.block_on(effect).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_race_all_first_success_wins() {
        let rt = Runtime::default();
        let effect = race_all(vec![
            Effect::<_, Infallible>::succeed(100).delay(Duration::from_millis(100)),
            Effect::succeed(25).delay(Duration::from_millis(25)),
            Effect::succeed(50).delay(Duration::from_millis(50)),
        ]);
        assert_eq!(rt.block_on(effect).unwrap(), 25);
    }

    #[test]
    fn test_race_all_skips_failures() {
        let rt = Runtime::default();
        let effect = race_all(vec![
            Effect::<i32, _>::fail("fast failure"),
            Effect::succeed(7).delay(Duration::from_millis(20)),
        ]);
        assert_eq!(rt.block_on(effect).unwrap(), 7);
    }

    #[test]
    fn test_race_all_all_failed_delivers_first() {
        let rt = Runtime::default();
        let effect = race_all(vec![
            Effect::<i32, _>::fail("first").delay(Duration::from_millis(5)),
            Effect::fail("second").delay(Duration::from_millis(20)),
        ]);
        assert!(matches!(
            rt.block_on(effect),
            Err(Failure::Expected("first"))
        ));
    }

    #[test]
    fn test_race_all_first_failure_wins() {
        let rt = Runtime::default();
        let effect = race_all_first(vec![
            Effect::<i32, _>::fail("quick").delay(Duration::from_millis(5)),
            Effect::succeed(1).delay(Duration::from_millis(50)),
        ]);
        assert!(matches!(
            rt.block_on(effect),
            Err(Failure::Expected("quick"))
        ));
    }

    #[test]
    fn test_race_empty_is_defect() {
        let rt = Runtime::default();
        let effect = race_all(Vec::<Effect<i32, Infallible>>::new());
        assert!(matches!(
            rt.block_on(effect),
            Err(Failure::Unexpected(_))
        ));
    }
}
