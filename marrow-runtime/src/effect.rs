//! Effect Values
//!
//! The core suspended-computation type and its combinators.
//!
//! # Design
//!
//! An [`Effect`] is an inert descriptor of work. It carries a single boxed
//! operation, `run(env, on_result)`, which must deliver exactly one
//! [`Outcome`] to `on_result` (or never complete, for [`Effect::never`]).
//! Every combinator returns a new descriptor whose `run` drives its children
//! with an appropriately rebound [`Env`]; control flow is entirely
//! continuation-passing.
//!
//! Running consumes the descriptor, the same ownership discipline as
//! `Future`. Loop constructors ([`repeat_n`], `for_each`) therefore take
//! factories that build a fresh descriptor per iteration.
//!
//! # Cancellation checkpoints
//!
//! Every effect built through the checked constructor first looks at the
//! environment: if the region is interruptible and the current signal has
//! fired, the effect delivers `Aborted` without running its body. This makes
//! every combinator boundary a deterministic cancellation checkpoint.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::cancellation::{CancellationSource, CancellationToken, ListenerKey};
use crate::env::Env;
use crate::executor::Executor;
use crate::outcome::{catching, Defect, Failure, Outcome};

/// The continuation an effect delivers its outcome to.
pub(crate) type OnResult<A, E> = Box<dyn FnOnce(Outcome<A, E>) + Send>;

type RunFn<A, E> = Box<dyn FnOnce(Env, OnResult<A, E>) + Send>;

/// A suspended computation that succeeds with `A`, fails with `E`, dies with
/// a defect, or is aborted.
///
/// Effects are inert until run by a [`Runtime`](crate::runtime::Runtime).
pub struct Effect<A, E = Infallible> {
    run_fn: RunFn<A, E>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

/// Error for [`Effect::from_option`] on `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no value present")]
pub struct NoSuchElement;

/// Defect payload raised when a requested service is not bound.
#[derive(Debug, Error)]
#[error("service not found: {type_name}")]
pub struct ServiceMissing {
    /// Type name of the missing service.
    pub type_name: &'static str,
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Build an effect with the universal cancellation preflight.
    pub(crate) fn make(
        f: impl FnOnce(Env, OnResult<A, E>) + Send + 'static,
    ) -> Self {
        Effect::make_unchecked(move |env, on_result| {
            if env.is_interruptible() && env.signal().is_cancelled() {
                on_result(Err(Failure::Aborted));
            } else {
                f(env, on_result);
            }
        })
    }

    /// Build an effect without the preflight.
    ///
    /// Only the interruptibility combinators use this; they must run even
    /// under an already-fired signal in order to swap it out.
    pub(crate) fn make_unchecked(
        f: impl FnOnce(Env, OnResult<A, E>) + Send + 'static,
    ) -> Self {
        Effect {
            run_fn: Box::new(f),
        }
    }

    /// Run this effect. Consumes the descriptor.
    pub(crate) fn run(self, env: Env, on_result: OnResult<A, E>) {
        (self.run_fn)(env, on_result);
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An effect that delivers `Ok(value)`.
    pub fn succeed(value: A) -> Self {
        Effect::make(move |_env, on_result| on_result(Ok(value)))
    }

    /// An effect that delivers `Err(Expected(error))`.
    pub fn fail(error: E) -> Self {
        Effect::make(move |_env, on_result| on_result(Err(Failure::Expected(error))))
    }

    /// An effect that dies with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Effect::make(move |_env, on_result| on_result(Err(Failure::Unexpected(defect))))
    }

    /// An effect that delivers a precomputed outcome.
    pub fn from_outcome(outcome: Outcome<A, E>) -> Self {
        Effect::make(move |_env, on_result| on_result(outcome))
    }

    /// Lift a `Result`, mapping `Err` into the expected-error channel.
    pub fn from_result(result: Result<A, E>) -> Self {
        Effect::from_outcome(result.map_err(Failure::Expected))
    }

    /// Run a thunk when the effect executes. A panic becomes a defect.
    pub fn sync(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Effect::make(move |_env, on_result| match catching(thunk) {
            Ok(value) => on_result(Ok(value)),
            Err(defect) => on_result(Err(Failure::Unexpected(defect))),
        })
    }

    /// Defer construction of an effect until run time.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Effect::make(move |env, on_result| match catching(f) {
            Ok(effect) => effect.run(env, on_result),
            Err(defect) => on_result(Err(Failure::Unexpected(defect))),
        })
    }

    /// An effect that never delivers.
    ///
    /// It completes only through cancellation of the surrounding region.
    pub fn never() -> Self {
        Effect::callback(|_resume, _signal| None)
    }

    /// Register an asynchronous computation.
    ///
    /// `register` receives a [`Resume`] and the cancellation token in force.
    /// It may resume at most once, from any thread; later calls are ignored.
    /// If the token fires before the resume, the effect completes with
    /// `Aborted`, after first running the optional cleanup effect returned by
    /// `register` (uninterruptibly, under a detached signal).
    pub fn callback<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A, E>, CancellationToken) -> Option<Effect<(), Infallible>>
            + Send
            + 'static,
    {
        Effect::make(move |env, on_result| {
            let signal = env.signal().clone();
            let resume = Resume::new(env, on_result);
            let register_resume = resume.clone();
            let register_signal = signal.clone();
            match catching(move || register(register_resume, register_signal)) {
                Ok(cleanup) => resume.watch(&signal, cleanup),
                Err(defect) => {
                    resume.resume(Effect::from_outcome(Err(Failure::Unexpected(defect))))
                }
            }
        })
    }

    /// Run a closure on a background thread, resuming through the executor.
    ///
    /// The closure is not interrupted by cancellation; an abort of the
    /// surrounding region delivers `Aborted` immediately and the eventual
    /// return value of the closure is discarded.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
    {
        Effect::callback(move |resume, _signal| {
            let worker = resume.clone();
            let spawned = std::thread::Builder::new()
                .name("marrow-blocking".to_string())
                .spawn(move || {
                    let outcome = match catching(f) {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(error)) => Err(Failure::Expected(error)),
                        Err(defect) => Err(Failure::Unexpected(defect)),
                    };
                    worker.schedule(Effect::from_outcome(outcome));
                });
            if let Err(err) = spawned {
                resume.die(Defect::message(format!(
                    "failed to spawn blocking thread: {}",
                    err
                )));
            }
            None
        })
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transform the success value. A panic in `f` becomes a defect.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::make(move |env, on_result| {
            self.run(
                env,
                Box::new(move |outcome| match outcome {
                    Ok(a) => match catching(move || f(a)) {
                        Ok(b) => on_result(Ok(b)),
                        Err(defect) => on_result(Err(Failure::Unexpected(defect))),
                    },
                    Err(failure) => on_result(Err(failure)),
                }),
            );
        })
    }

    /// Chain a dependent effect onto the success value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::make(move |env, on_result| {
            let child_env = env.clone();
            self.run(
                env,
                Box::new(move |outcome| match outcome {
                    Ok(a) => match catching(move || f(a)) {
                        Ok(next) => next.run(child_env, on_result),
                        Err(defect) => on_result(Err(Failure::Unexpected(defect))),
                    },
                    Err(failure) => on_result(Err(failure)),
                }),
            );
        })
    }

    /// Run `next` after this effect, discarding this effect's value.
    pub fn then<B>(self, next: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Replace the success value.
    pub fn as_value<B>(self, value: B) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        self.map(move |_| value)
    }

    /// Discard the success value.
    pub fn void(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Run a dependent effect for its side effects, keeping this effect's
    /// value. If the tap fails, its failure replaces the success.
    pub fn tap<B, F>(self, f: F) -> Effect<A, E>
    where
        A: Clone,
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        self.flat_map(move |a| {
            let keep = a.clone();
            f(a).map(move |_| keep)
        })
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Dispatch on the full failure, including defects and aborts.
    pub fn match_failure<B, E2, FF, FS>(self, on_failure: FF, on_success: FS) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
        FF: FnOnce(Failure<E>) -> Effect<B, E2> + Send + 'static,
        FS: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::make(move |env, on_result| {
            let handler_env = env.clone();
            self.run(
                env,
                Box::new(move |outcome| {
                    let next = match outcome {
                        Ok(a) => catching(move || on_success(a)),
                        Err(failure) => catching(move || on_failure(failure)),
                    };
                    match next {
                        Ok(effect) => effect.run(handler_env, on_result),
                        Err(defect) => on_result(Err(Failure::Unexpected(defect))),
                    }
                }),
            );
        })
    }

    /// Fold the expected outcome into a value.
    ///
    /// Only `Ok` and `Expected` reach the handlers; defects and aborts
    /// propagate untouched.
    pub fn fold<B, FE, FS>(self, on_failure: FE, on_success: FS) -> Effect<B, Infallible>
    where
        B: Send + 'static,
        FE: FnOnce(E) -> B + Send + 'static,
        FS: FnOnce(A) -> B + Send + 'static,
    {
        self.match_failure(
            move |failure| match failure {
                Failure::Expected(error) => Effect::sync(move || on_failure(error)),
                Failure::Unexpected(defect) => {
                    Effect::from_outcome(Err(Failure::Unexpected(defect)))
                }
                Failure::Aborted => Effect::from_outcome(Err(Failure::Aborted)),
            },
            move |a| Effect::sync(move || on_success(a)),
        )
    }

    /// Reify the outcome: always succeeds with the `Outcome` itself.
    pub fn as_result(self) -> Effect<Outcome<A, E>, Infallible> {
        self.match_failure(
            |failure| Effect::succeed(Err(failure)),
            |a| Effect::succeed(Ok(a)),
        )
    }

    /// Handle every failure, of any polarity.
    pub fn catch_all_failure<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: FnOnce(Failure<E>) -> Effect<A, E2> + Send + 'static,
    {
        self.match_failure(f, Effect::succeed)
    }

    /// Handle expected failures only. Defects and aborts pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        self.match_failure(
            move |failure| match failure {
                Failure::Expected(error) => f(error),
                Failure::Unexpected(defect) => {
                    Effect::from_outcome(Err(Failure::Unexpected(defect)))
                }
                Failure::Aborted => Effect::from_outcome(Err(Failure::Aborted)),
            },
            Effect::succeed,
        )
    }

    /// Transform the expected error channel.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        Effect::make(move |env, on_result| {
            self.run(
                env,
                Box::new(move |outcome| match outcome {
                    Ok(a) => on_result(Ok(a)),
                    Err(Failure::Expected(error)) => match catching(move || f(error)) {
                        Ok(mapped) => on_result(Err(Failure::Expected(mapped))),
                        Err(defect) => on_result(Err(Failure::Unexpected(defect))),
                    },
                    Err(Failure::Unexpected(defect)) => {
                        on_result(Err(Failure::Unexpected(defect)))
                    }
                    Err(Failure::Aborted) => on_result(Err(Failure::Aborted)),
                }),
            );
        })
    }

    /// Promote expected failures to defects.
    pub fn or_die(self) -> Effect<A, Infallible>
    where
        E: fmt::Debug,
    {
        self.catch_all(|error| Effect::die(Defect::message(format!("{:?}", error))))
    }

    /// Replace any expected failure with a fallback value.
    pub fn or_else_succeed<F>(self, f: F) -> Effect<A, Infallible>
    where
        F: FnOnce() -> A + Send + 'static,
    {
        self.catch_all(move |_| Effect::sync(f))
    }

    /// Discard the outcome. Expected failures and aborts become `Ok(())`;
    /// defects stay fatal.
    pub fn ignore(self) -> Effect<(), Infallible> {
        self.match_failure(
            |failure| match failure {
                Failure::Unexpected(defect) => {
                    Effect::from_outcome(Err(Failure::Unexpected(defect)))
                }
                _ => Effect::succeed(()),
            },
            |_| Effect::succeed(()),
        )
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Run with one service added to the ambient map.
    pub fn provide_service<S: Any + Send + Sync>(self, service: S) -> Effect<A, E> {
        Effect::make(move |env, on_result| {
            let env = env.with_service(service);
            self.run(env, on_result);
        })
    }
}

impl<A> Effect<A, Infallible>
where
    A: Send + 'static,
{
    /// Re-type an effect that provably carries no expected error.
    pub fn widen<E: Send + 'static>(self) -> Effect<A, E> {
        self.map_error(|never| match never {})
    }
}

impl<A> Effect<A, NoSuchElement>
where
    A: Send + 'static,
{
    /// Lift an `Option`, failing with [`NoSuchElement`] on `None`.
    pub fn from_option(option: Option<A>) -> Self {
        match option {
            Some(value) => Effect::succeed(value),
            None => Effect::fail(NoSuchElement),
        }
    }
}

impl<E> Effect<(), E>
where
    E: Send + 'static,
{
    /// The unit effect.
    pub fn unit() -> Self {
        Effect::succeed(())
    }

    /// Suspend until the next pass of the executor's job queue.
    pub fn yield_now() -> Self {
        Effect::make(move |env, on_result| {
            let executor = env.executor().clone();
            executor.schedule(move || on_result(Ok(())));
        })
    }
}

/// Read a service of type `T` from the ambient map.
///
/// Absence of the service is a programmer error and dies with a
/// [`ServiceMissing`] defect.
pub fn service<T, E>() -> Effect<Arc<T>, E>
where
    T: Any + Send + Sync,
    E: Send + 'static,
{
    Effect::make(move |env, on_result| match env.services().get::<T>() {
        Some(value) => on_result(Ok(value)),
        None => on_result(Err(Failure::Unexpected(Defect::from_error(ServiceMissing {
            type_name: std::any::type_name::<T>(),
        })))),
    })
}

// ----------------------------------------------------------------------
// Resume
// ----------------------------------------------------------------------

/// One-shot resumption handle handed to [`Effect::callback`] registrations.
pub struct Resume<A, E> {
    executor: Executor,
    state: Arc<Mutex<ResumeState<A, E>>>,
}

struct ResumeState<A, E> {
    slot: Option<(Env, OnResult<A, E>)>,
    listener: Option<(CancellationToken, ListenerKey)>,
}

impl<A, E> Clone for Resume<A, E> {
    fn clone(&self) -> Self {
        Resume {
            executor: self.executor.clone(),
            state: self.state.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Resume<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("pending", &self.state.lock().slot.is_some())
            .finish()
    }
}

impl<A, E> Resume<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn new(env: Env, on_result: OnResult<A, E>) -> Self {
        Resume {
            executor: env.executor().clone(),
            state: Arc::new(Mutex::new(ResumeState {
                slot: Some((env, on_result)),
                listener: None,
            })),
        }
    }

    /// Whether the computation is still waiting to be resumed.
    pub fn is_pending(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    /// Continue with `effect`. At most one resume wins; later calls are
    /// ignored.
    pub fn resume(&self, effect: Effect<A, E>) {
        let taken = {
            let mut state = self.state.lock();
            state.slot.take().map(|slot| (slot, state.listener.take()))
        };
        if let Some(((env, on_result), listener)) = taken {
            if let Some((token, key)) = listener {
                token.remove_listener(key);
            }
            effect.run(env, on_result);
        }
    }

    /// Resume with a success value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::from_outcome(Ok(value)));
    }

    /// Resume with an expected failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::from_outcome(Err(Failure::Expected(error))));
    }

    /// Resume with a defect.
    pub fn die(&self, defect: impl Into<Defect>) {
        self.resume(Effect::from_outcome(Err(Failure::Unexpected(defect.into()))));
    }

    /// Enqueue the resume on the executor instead of running it on the
    /// calling thread. Use this from background threads.
    pub fn schedule(&self, effect: Effect<A, E>) {
        let this = self.clone();
        self.executor.schedule(move || this.resume(effect));
    }

    /// The executor behind the suspended computation.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Install the abort watcher after registration.
    fn watch(&self, signal: &CancellationToken, cleanup: Option<Effect<(), Infallible>>) {
        let this = self.clone();
        let key = signal.on_cancel(move || this.abort_with_cleanup(cleanup));
        if let Some(key) = key {
            let mut state = self.state.lock();
            if state.slot.is_some() {
                state.listener = Some((signal.clone(), key));
            } else {
                drop(state);
                signal.remove_listener(key);
            }
        }
    }

    fn abort_with_cleanup(&self, cleanup: Option<Effect<(), Infallible>>) {
        let taken = {
            let mut state = self.state.lock();
            state.slot.take()
        };
        if let Some((env, on_result)) = taken {
            match cleanup {
                None => on_result(Err(Failure::Aborted)),
                Some(effect) => {
                    // The cleanup must not observe the very cancellation that
                    // triggered it.
                    let shielded = env
                        .with_interruptible(false)
                        .with_signal(CancellationSource::new().token());
                    effect.run(
                        shielded,
                        Box::new(move |result| {
                            if let Err(failure) = result {
                                crate::debug!("async cleanup failed: {}", failure);
                            }
                            on_result(Err(Failure::Aborted));
                        }),
                    );
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Repetition
// ----------------------------------------------------------------------

struct RepeatState<A, E, F> {
    factory: F,
    remaining: usize,
    env: Env,
    on_result: Option<OnResult<(), E>>,
    incoming: Option<Outcome<A, E>>,
    in_flight: bool,
    pumping: bool,
    repump: bool,
}

enum RepeatStep<A, E> {
    Run(Effect<A, E>, Env),
    Deliver(OnResult<(), E>, Outcome<(), E>),
    Idle,
}

/// Run `factory()` `times` times in sequence, stopping at the first failure.
///
/// The loop is iterative: a chain of synchronously-completing iterations
/// consumes constant stack. Zero repetitions succeed immediately.
pub fn repeat_n<A, E, F>(times: usize, factory: F) -> Effect<(), E>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnMut() -> Effect<A, E> + Send + 'static,
{
    Effect::make(move |env, on_result| {
        let state = Arc::new(Mutex::new(RepeatState {
            factory,
            remaining: times,
            env,
            on_result: Some(on_result),
            incoming: None,
            in_flight: false,
            pumping: false,
            repump: false,
        }));
        repeat_pump(&state);
    })
}

fn repeat_pump<A, E, F>(state: &Arc<Mutex<RepeatState<A, E, F>>>)
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnMut() -> Effect<A, E> + Send + 'static,
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
            let mut failed = None;
            if let Some(outcome) = s.incoming.take() {
                if let Err(failure) = outcome {
                    failed = Some(failure);
                }
            }
            if let Some(failure) = failed {
                match s.on_result.take() {
                    Some(cb) => RepeatStep::Deliver(cb, Err(failure)),
                    None => RepeatStep::Idle,
                }
            } else if s.in_flight {
                RepeatStep::Idle
            } else if s.remaining == 0 {
                match s.on_result.take() {
                    Some(cb) => RepeatStep::Deliver(cb, Ok(())),
                    None => RepeatStep::Idle,
                }
            } else {
                s.remaining -= 1;
                s.in_flight = true;
                match catching(|| (s.factory)()) {
                    Ok(effect) => RepeatStep::Run(effect, s.env.clone()),
                    Err(defect) => {
                        s.in_flight = false;
                        match s.on_result.take() {
                            Some(cb) => {
                                RepeatStep::Deliver(cb, Err(Failure::Unexpected(defect)))
                            }
                            None => RepeatStep::Idle,
                        }
                    }
                }
            }
        };
        match step {
            RepeatStep::Deliver(on_result, outcome) => {
                {
                    let mut s = state.lock();
                    s.pumping = false;
                    s.repump = false;
                }
                on_result(outcome);
                return;
            }
            RepeatStep::Run(effect, env) => {
                let state = state.clone();
                effect.run(
                    env,
                    Box::new(move |outcome| {
                        {
                            let mut s = state.lock();
                            s.incoming = Some(outcome);
                            s.in_flight = false;
                        }
                        repeat_pump(&state);
                    }),
                );
            }
            RepeatStep::Idle => {
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
