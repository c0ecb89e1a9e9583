//! Scopes and Finalization
//!
//! A [`Scope`] is a lifetime bracket carrying an ordered finalizer list. It
//! is a two-state machine: open scopes accept finalizers, and `close`
//! atomically flips to closed, then runs every finalizer in reverse
//! insertion order, sequentially. A finalizer added after the close runs
//! immediately with the recorded exit.
//!
//! [`Effect::scoped`] brackets an effect with a fresh scope provided as a
//! service; [`acquire_release`] and [`acquire_use_release`] build the
//! familiar resource-safety patterns on top, with acquisition pinned inside
//! an uninterruptible mask so cancellation can never separate a successful
//! acquire from its release.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::concurrency::{for_each, Concurrency};
use crate::effect::{service, Effect};
use crate::interrupt::uninterruptible_mask;
use crate::outcome::{Defect, Failure, Outcome};

/// The type-erased verdict a scope closes with.
#[derive(Clone)]
pub enum Exit {
    /// The bracketed computation succeeded.
    Success,
    /// It failed with a typed error, stored erased.
    Expected(Arc<dyn Any + Send + Sync>),
    /// It died with a defect.
    Unexpected(Defect),
    /// It was cancelled.
    Aborted,
}

impl Exit {
    /// Whether the computation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success)
    }

    /// Whether the computation was cancelled.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Aborted)
    }

    /// Whether the computation failed in any way.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Downcast the erased expected error.
    pub fn expected_as<E: Any>(&self) -> Option<&E> {
        match self {
            Exit::Expected(erased) => erased.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Erase an outcome into an exit.
    pub fn from_outcome<A, E>(outcome: &Outcome<A, E>) -> Exit
    where
        E: Any + Clone + Send + Sync,
    {
        match outcome {
            Ok(_) => Exit::Success,
            Err(Failure::Expected(error)) => Exit::Expected(Arc::new(error.clone())),
            Err(Failure::Unexpected(defect)) => Exit::Unexpected(defect.clone()),
            Err(Failure::Aborted) => Exit::Aborted,
        }
    }
}

impl fmt::Debug for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Success => write!(f, "Success"),
            Exit::Expected(_) => write!(f, "Expected(..)"),
            Exit::Unexpected(defect) => f.debug_tuple("Unexpected").field(defect).finish(),
            Exit::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Identifies a registered finalizer so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizerKey(u64);

type Finalizer = Box<dyn FnOnce(Exit) -> Effect<(), Infallible> + Send>;

enum ScopeState {
    Open {
        next_key: u64,
        finalizers: Vec<(u64, Finalizer)>,
    },
    Closed {
        exit: Exit,
    },
}

/// A lifetime bracket with an ordered finalizer list.
#[derive(Clone)]
pub struct Scope {
    state: Arc<Mutex<ScopeState>>,
}

/// The ambient scope service installed by [`Effect::scoped`].
pub struct CurrentScope(pub Scope);

impl Scope {
    /// A fresh, open scope.
    pub fn new() -> Self {
        Scope {
            state: Arc::new(Mutex::new(ScopeState::Open {
                next_key: 1,
                finalizers: Vec::new(),
            })),
        }
    }

    fn closed(exit: Exit) -> Self {
        Scope {
            state: Arc::new(Mutex::new(ScopeState::Closed { exit })),
        }
    }

    /// Whether this scope has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ScopeState::Closed { .. })
    }

    fn insert(&self, finalizer: Finalizer) -> Result<FinalizerKey, (Finalizer, Exit)> {
        let mut state = self.state.lock();
        match &mut *state {
            ScopeState::Open {
                next_key,
                finalizers,
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.push((key, finalizer));
                Ok(FinalizerKey(key))
            }
            ScopeState::Closed { exit } => Err((finalizer, exit.clone())),
        }
    }

    /// Register a finalizer.
    ///
    /// If the scope is already closed the finalizer runs immediately with
    /// the recorded exit.
    pub fn add_finalizer<F>(&self, finalizer: F) -> Effect<(), Infallible>
    where
        F: FnOnce(Exit) -> Effect<(), Infallible> + Send + 'static,
    {
        let scope = self.clone();
        Effect::suspend(move || match scope.insert(Box::new(finalizer)) {
            Ok(_key) => Effect::unit(),
            Err((finalizer, exit)) => finalizer(exit).uninterruptible(),
        })
    }

    /// Remove a registered finalizer. Returns whether it was present.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            ScopeState::Open { finalizers, .. } => {
                let before = finalizers.len();
                finalizers.retain(|(k, _)| *k != key.0);
                finalizers.len() != before
            }
            ScopeState::Closed { .. } => false,
        }
    }

    /// Close the scope with `exit`.
    ///
    /// Runs the finalizers in reverse insertion order, sequentially, each
    /// reified so that all of them run; the close succeeds iff every
    /// finalizer did, otherwise the first failure surfaces. Closing a closed
    /// scope is a no-op.
    pub fn close(&self, exit: Exit) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::suspend(move || {
            let pending = {
                let mut state = scope.state.lock();
                if matches!(*state, ScopeState::Closed { .. }) {
                    None
                } else {
                    let previous = std::mem::replace(
                        &mut *state,
                        ScopeState::Closed { exit: exit.clone() },
                    );
                    match previous {
                        ScopeState::Open { finalizers, .. } => Some(finalizers),
                        ScopeState::Closed { .. } => None,
                    }
                }
            };
            match pending {
                None => Effect::unit(),
                Some(mut finalizers) => {
                    finalizers.reverse();
                    for_each(
                        finalizers,
                        move |(_key, finalizer)| finalizer(exit.clone()).as_result(),
                        Concurrency::Limit(1),
                    )
                    .flat_map(|results| {
                        match results.into_iter().find_map(|result| result.err()) {
                            Some(failure) => {
                                crate::debug!("finalizer failed during close: {}", failure);
                                Effect::from_outcome(Err(failure))
                            }
                            None => Effect::unit(),
                        }
                    })
                }
            }
        })
        .uninterruptible()
    }

    /// Create a child scope.
    ///
    /// The parent closes the child when it closes; a child that closes first
    /// de-registers itself from the parent. A child forked from a closed
    /// parent starts closed with the same exit.
    pub fn fork(&self) -> Scope {
        let mut state = self.state.lock();
        match &mut *state {
            ScopeState::Closed { exit } => Scope::closed(exit.clone()),
            ScopeState::Open {
                next_key,
                finalizers,
            } => {
                let child = Scope::new();
                let key = *next_key;
                *next_key += 1;
                let closer = child.clone();
                finalizers.push((key, Box::new(move |exit| closer.close(exit))));

                let parent = self.clone();
                let _ = child.insert(Box::new(move |_exit| {
                    Effect::sync(move || {
                        parent.remove_finalizer(FinalizerKey(key));
                    })
                }));
                child
            }
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read the ambient scope installed by [`Effect::scoped`].
pub fn current_scope<E: Send + 'static>() -> Effect<Scope, E> {
    service::<CurrentScope, E>().map(|current| current.0.clone())
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Bracket this effect with a fresh scope.
    ///
    /// The scope is provided as the [`CurrentScope`] service and closed with
    /// the final exit, success or failure, before the outcome is delivered.
    /// A failure of the close itself surfaces only when the effect
    /// succeeded.
    pub fn scoped(self) -> Effect<A, E>
    where
        E: Any + Clone + Sync,
    {
        Effect::suspend(move || {
            let scope = Scope::new();
            let closer = scope.clone();
            uninterruptible_mask(move |restore| {
                restore
                    .apply(self.provide_service(CurrentScope(scope)))
                    .as_result()
                    .widen::<E>()
                    .flat_map(move |outcome| {
                        let exit = Exit::from_outcome(&outcome);
                        closer
                            .close(exit)
                            .as_result()
                            .widen::<E>()
                            .flat_map(move |close_result| match close_result {
                                Err(close_failure) if outcome.is_ok() => {
                                    Effect::from_outcome(Err(close_failure.widen()))
                                }
                                _ => Effect::from_outcome(outcome),
                            })
                    })
            })
        })
    }

    /// Run a hook on every exit, success or failure.
    ///
    /// The hook runs uninterruptibly. A failure of the hook is appended to
    /// the outcome: it surfaces only when the effect itself succeeded.
    pub fn on_exit<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&Outcome<A, E>) -> Effect<(), Infallible> + Send + 'static,
    {
        uninterruptible_mask(move |restore| {
            restore
                .apply(self)
                .as_result()
                .widen::<E>()
                .flat_map(move |outcome| {
                    f(&outcome)
                        .as_result()
                        .widen::<E>()
                        .flat_map(move |hook_result| match hook_result {
                            Err(hook_failure) if outcome.is_ok() => {
                                Effect::from_outcome(Err(hook_failure.widen()))
                            }
                            _ => Effect::from_outcome(outcome),
                        })
                })
        })
    }

    /// Run a hook only when this effect is aborted.
    pub fn on_interrupt<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce() -> Effect<(), Infallible> + Send + 'static,
    {
        self.on_exit(move |outcome| match outcome {
            Err(Failure::Aborted) => f(),
            _ => Effect::unit(),
        })
    }
}

/// Acquire a resource and register its release with the ambient scope.
///
/// Acquisition runs uninterruptibly; on success the release is added as a
/// finalizer, invoked with the scope's exit. Requires an enclosing
/// [`Effect::scoped`].
pub fn acquire_release<A, E, Rel>(acquire: Effect<A, E>, release: Rel) -> Effect<A, E>
where
    A: Clone + Send + 'static,
    E: Send + 'static,
    Rel: FnOnce(A, Exit) -> Effect<(), Infallible> + Send + 'static,
{
    current_scope::<E>()
        .flat_map(move |scope| {
            acquire.flat_map(move |a| {
                let resource = a.clone();
                scope
                    .add_finalizer(move |exit| release(resource, exit))
                    .widen()
                    .as_value(a)
            })
        })
        .uninterruptible()
}

/// The self-contained bracket: acquire, use, release.
///
/// Acquisition and release are atomic with respect to cancellation; only the
/// use site is cancellable by the caller. The release runs exactly once for
/// every outcome of the use site and never runs when the acquire fails.
pub fn acquire_use_release<A, B, E, Use, Rel>(
    acquire: Effect<A, E>,
    use_: Use,
    release: Rel,
) -> Effect<B, E>
where
    A: Clone + Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    Use: FnOnce(A) -> Effect<B, E> + Send + 'static,
    Rel: FnOnce(A, &Outcome<B, E>) -> Effect<(), Infallible> + Send + 'static,
{
    uninterruptible_mask(move |restore| {
        acquire.flat_map(move |a| {
            let resource = a.clone();
            restore
                .apply(Effect::suspend(move || use_(a)))
                .as_result()
                .widen::<E>()
                .flat_map(move |outcome| {
                    release(resource, &outcome)
                        .widen::<E>()
                        .then(Effect::from_outcome(outcome))
                })
        })
    })
}
