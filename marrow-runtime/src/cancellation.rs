//! Cooperative Cancellation
//!
//! Cancellation tokens and sources for cooperative cancellation of running
//! effects.
//!
//! # Design
//!
//! Cancellation is cooperative: the interpreter checks the current token at
//! effect boundaries (the universal preflight) and suspended operations
//! register listeners that fire when cancellation is requested. This mirrors
//! web-style abort controllers: a [`CancellationSource`] plays the controller
//! role, its [`CancellationToken`] the signal role.
//!
//! # Components
//!
//! - `CancellationToken`: a read-only token with a cancelled flag and
//!   add/remove listener registration
//! - `CancellationSource`: creates tokens and triggers cancellation
//! - Linked sources: a child source cancelled automatically when a parent
//!   token fires, with an unlink key so completed children detach

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A listener callback, invoked at most once when cancellation fires.
type Listener = Box<dyn FnOnce() + Send>;

/// Shared state behind a source and its tokens.
struct CancelState {
    cancelled: AtomicBool,
    listeners: Mutex<ListenerTable>,
}

struct ListenerTable {
    next_key: u64,
    entries: Vec<(u64, Listener)>,
}

impl CancelState {
    fn new() -> Self {
        CancelState {
            cancelled: AtomicBool::new(false),
            listeners: Mutex::new(ListenerTable {
                next_key: 1,
                entries: Vec::new(),
            }),
        }
    }
}

/// Identifies a registered listener so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

/// A read-only cancellation token.
///
/// Tokens are created by a [`CancellationSource`] and can be cloned cheaply.
/// All clones share the same underlying state.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Register a listener to run when cancellation fires.
    ///
    /// If cancellation has already been requested the listener runs
    /// immediately on the calling thread and `None` is returned. Otherwise
    /// the returned key can be passed to [`remove_listener`] to deregister.
    ///
    /// [`remove_listener`]: CancellationToken::remove_listener
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> Option<ListenerKey> {
        let registered = {
            let mut table = self.state.listeners.lock();
            // The flag is only set while the table lock is held, so checking
            // it here is race-free with respect to cancel().
            if self.state.cancelled.load(Ordering::SeqCst) {
                Err(f)
            } else {
                let key = table.next_key;
                table.next_key += 1;
                table.entries.push((key, Box::new(f)));
                Ok(ListenerKey(key))
            }
        };
        match registered {
            Ok(key) => Some(key),
            Err(f) => {
                f();
                None
            }
        }
    }

    /// Remove a previously registered listener.
    ///
    /// Removing a listener that already fired or was already removed is a
    /// no-op.
    pub fn remove_listener(&self, key: ListenerKey) {
        let mut table = self.state.listeners.lock();
        table.entries.retain(|(k, _)| *k != key.0);
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A cancellation source that creates and triggers tokens.
///
/// The source owns the ability to request cancellation; tokens derived from
/// it can only observe.
#[derive(Clone)]
pub struct CancellationSource {
    state: Arc<CancelState>,
}

impl CancellationSource {
    /// Create a new, untriggered source.
    pub fn new() -> Self {
        CancellationSource {
            state: Arc::new(CancelState::new()),
        }
    }

    /// Create a source whose token is cancelled when `parent` fires.
    ///
    /// Returns the source together with the key of the listener installed on
    /// the parent, so a completed child can detach itself. The key is `None`
    /// when the parent was already cancelled (the new source starts
    /// cancelled).
    pub fn linked_to(parent: &CancellationToken) -> (Self, Option<ListenerKey>) {
        let source = CancellationSource::new();
        let child = source.clone();
        let key = parent.on_cancel(move || child.cancel());
        (source, key)
    }

    /// Get a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: self.state.clone(),
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation.
    ///
    /// Sets the cancelled flag and runs every registered listener exactly
    /// once, in registration order. Cancelling an already-cancelled source is
    /// a no-op.
    pub fn cancel(&self) {
        let entries = {
            let mut table = self.state.listeners.lock();
            if self.state.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut table.entries)
        };
        for (_, listener) in entries {
            listener();
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_basic() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_listener_fires_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_runs_immediately_when_already_cancelled() {
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let key = token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(key.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_does_not_fire() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let key = token
            .on_cancel(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .expect("source is live");
        token.remove_listener(key);

        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            token.on_cancel(move || order.lock().push(i));
        }

        source.cancel();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_linked_source_follows_parent() {
        let parent = CancellationSource::new();
        let (child, key) = CancellationSource::linked_to(&parent.token());

        assert!(key.is_some());
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_linked_source_independent_of_parent() {
        let parent = CancellationSource::new();
        let (child, _) = CancellationSource::linked_to(&parent.token());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_linked_to_cancelled_parent_starts_cancelled() {
        let parent = CancellationSource::new();
        parent.cancel();

        let (child, key) = CancellationSource::linked_to(&parent.token());
        assert!(key.is_none());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_unlinked_child_survives_parent_cancel() {
        let parent = CancellationSource::new();
        let parent_token = parent.token();
        let (child, key) = CancellationSource::linked_to(&parent_token);

        parent_token.remove_listener(key.expect("parent is live"));
        parent.cancel();
        assert!(!child.is_cancelled());
    }
}
