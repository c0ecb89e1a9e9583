//! Fork Handles
//!
//! Forking starts an effect on the next pass of the executor's job queue and
//! hands back a [`Handle`]: an observer for the eventual outcome with its
//! own cancellation source.
//!
//! A forked child is linked to the signal in force at the fork point, so a
//! parent abort fans out to the child; the link is removed the moment the
//! child completes. A daemon fork has no link at all and is only stopped
//! through its own handle.
//!
//! Emission is single-shot and idempotent: the first outcome wins, every
//! observer is notified exactly once and then cleared, and the handle's own
//! source is cancelled on completion so any leftover work below it unwinds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::{CancellationSource, CancellationToken, ListenerKey};
use crate::effect::Effect;
use crate::outcome::Outcome;

/// Unique identifier for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Global handle ID counter.
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> HandleId {
    HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
}

type Observer<A, E> = Box<dyn FnOnce(Outcome<A, E>) + Send>;

struct HandleCell<A, E> {
    result: Option<Outcome<A, E>>,
    observers: Vec<(u64, Observer<A, E>)>,
    next_observer: u64,
    parent_unhook: Option<(CancellationToken, ListenerKey)>,
}

struct HandleShared<A, E> {
    source: CancellationSource,
    is_root: bool,
    cell: Mutex<HandleCell<A, E>>,
}

/// Observer of a running, possibly-forked computation.
pub struct Handle<A, E> {
    id: HandleId,
    shared: Arc<HandleShared<A, E>>,
}

impl<A, E> Clone for Handle<A, E> {
    fn clone(&self) -> Self {
        Handle {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Handle<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("is_root", &self.shared.is_root)
            .field("completed", &self.shared.cell.lock().result.is_some())
            .finish()
    }
}

impl<A, E> Handle<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(
        source: CancellationSource,
        is_root: bool,
        parent_unhook: Option<(CancellationToken, ListenerKey)>,
    ) -> Self {
        Handle {
            id: next_handle_id(),
            shared: Arc::new(HandleShared {
                source,
                is_root,
                cell: Mutex::new(HandleCell {
                    result: None,
                    observers: Vec::new(),
                    next_observer: 1,
                    parent_unhook,
                }),
            }),
        }
    }

    /// This handle's identity.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Whether this handle owns a root source (daemon or top-level).
    pub fn is_root(&self) -> bool {
        self.shared.is_root
    }

    /// Deliver the outcome. The first emission wins; later ones are ignored.
    pub(crate) fn emit(&self, outcome: Outcome<A, E>) {
        let (observers, unhook) = {
            let mut cell = self.shared.cell.lock();
            if cell.result.is_some() {
                crate::trace!("{}: duplicate emission ignored", self.id);
                return;
            }
            cell.result = Some(outcome.clone());
            (
                std::mem::take(&mut cell.observers),
                cell.parent_unhook.take(),
            )
        };
        if let Some((token, key)) = unhook {
            token.remove_listener(key);
        }
        // Completion tears down anything still running below the handle.
        self.shared.source.cancel();
        for (_, observer) in observers {
            observer(outcome.clone());
        }
    }

    /// The outcome, if the computation has completed.
    pub fn poll(&self) -> Option<Outcome<A, E>> {
        self.shared.cell.lock().result.clone()
    }

    /// Abort the computation from the host side.
    ///
    /// Idempotent; aborting an already-completed handle is a no-op.
    pub fn unsafe_abort(&self) {
        self.shared.source.cancel();
    }

    /// Wait for the outcome, reified.
    ///
    /// Completes immediately when the computation is already done; otherwise
    /// registers an observer, which is unregistered again if the waiting
    /// region is aborted.
    pub fn observe(&self) -> Effect<Outcome<A, E>, std::convert::Infallible> {
        let shared = self.shared.clone();
        Effect::callback(move |resume, _signal| {
            let registered = {
                let mut cell = shared.cell.lock();
                match cell.result.clone() {
                    Some(outcome) => {
                        drop(cell);
                        resume.succeed(outcome);
                        None
                    }
                    None => {
                        let key = cell.next_observer;
                        cell.next_observer += 1;
                        let resume = resume.clone();
                        cell.observers
                            .push((key, Box::new(move |outcome| resume.succeed(outcome))));
                        Some(key)
                    }
                }
            };
            registered.map(|key| {
                let shared = shared.clone();
                Effect::sync(move || {
                    shared.cell.lock().observers.retain(|(k, _)| *k != key);
                })
            })
        })
    }

    /// Wait for the outcome and unwrap it back into effect form.
    pub fn join(&self) -> Effect<A, E> {
        self.observe().widen().flat_map(Effect::from_outcome)
    }

    /// Abort the computation and wait for it to wind down.
    pub fn abort(&self) -> Effect<(), std::convert::Infallible> {
        let handle = self.clone();
        Effect::suspend(move || {
            handle.unsafe_abort();
            handle.observe().void()
        })
    }
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Start this effect on the next pass of the job queue, linked to the
    /// current signal. Returns the handle synchronously.
    ///
    /// The surrounding scope does not wait for the child; join or observe
    /// the handle to reclaim its outcome.
    pub fn fork(self) -> Effect<Handle<A, E>, E> {
        Effect::make(move |env, on_result| {
            let parent_signal = env.signal().clone();
            let (source, link) = CancellationSource::linked_to(&parent_signal);
            let handle = Handle::new(
                source.clone(),
                false,
                link.map(|key| (parent_signal, key)),
            );
            let child_env = env.with_source(source);
            let emitter = handle.clone();
            env.executor().schedule(move || {
                self.run(child_env, Box::new(move |outcome| emitter.emit(outcome)));
            });
            on_result(Ok(handle));
        })
    }

    /// Like [`fork`](Effect::fork), but with a root source: no parent
    /// linkage, stopped only through its own handle.
    pub fn fork_daemon(self) -> Effect<Handle<A, E>, E> {
        Effect::make(move |env, on_result| {
            let source = CancellationSource::new();
            let handle = Handle::new(source.clone(), true, None);
            let child_env = env.with_source(source);
            let emitter = handle.clone();
            env.executor().schedule(move || {
                self.run(child_env, Box::new(move |outcome| emitter.emit(outcome)));
            });
            on_result(Ok(handle));
        })
    }
}
