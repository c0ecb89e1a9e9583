//! Interruptibility Regions
//!
//! Cancellation is observed only at effect boundaries, and only while the
//! interruptibility flag is set. These combinators delimit regions where the
//! flag is cleared (and the observed signal detached) or restored.
//!
//! # Design
//!
//! `uninterruptible` swaps the observed signal for a fresh, detached one and
//! clears the flag; the cancellation source ref is deliberately left in
//! place, so a nested `interruptible` can re-install the parent's own
//! signal. `uninterruptible_mask` hands the body a [`Restore`] that
//! re-applies the interruptibility that was in force at the boundary, which
//! keeps nested masks from un-masking an already uninterruptible caller.

use crate::cancellation::CancellationSource;
use crate::effect::Effect;

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Shield this effect from cancellation.
    ///
    /// The effect runs to completion even if the surrounding region is
    /// aborted; the abort is then observed at the next checkpoint outside
    /// the shield.
    pub fn uninterruptible(self) -> Effect<A, E> {
        Effect::make_unchecked(move |env, on_result| {
            let detached = CancellationSource::new();
            let shielded = env
                .with_interruptible(false)
                .with_signal(detached.token());
            self.run(shielded, on_result);
        })
    }

    /// Re-enable cancellation inside an uninterruptible region.
    ///
    /// Restores the signal of the cancellation source currently in force, so
    /// a pending abort of the parent becomes observable again at the next
    /// checkpoint.
    pub fn interruptible(self) -> Effect<A, E> {
        Effect::make_unchecked(move |env, on_result| {
            let env = if env.is_interruptible() {
                env
            } else {
                let signal = env.source().token();
                env.with_interruptible(true).with_signal(signal)
            };
            self.run(env, on_result);
        })
    }
}

/// Re-applies the interruptibility in force when a mask was entered.
///
/// Inside `uninterruptible_mask`, wrapping an effect with
/// [`Restore::apply`] makes it cancellable again only if the masked caller
/// was cancellable in the first place.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    was_interruptible: bool,
}

impl Restore {
    /// Wrap `effect` with the captured interruptibility.
    pub fn apply<B, E2>(&self, effect: Effect<B, E2>) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        if self.was_interruptible {
            effect.interruptible()
        } else {
            effect
        }
    }
}

/// Run `f` uninterruptibly, passing it a [`Restore`] for the regions that
/// should stay cancellable.
///
/// The canonical use is resource bookkeeping that must be atomic relative to
/// cancellation: acquisition runs masked, the use site runs restored.
pub fn uninterruptible_mask<A, E, F>(f: F) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Restore) -> Effect<A, E> + Send + 'static,
{
    Effect::make_unchecked(move |env, on_result| {
        let was_interruptible = env.is_interruptible();
        let restore = Restore { was_interruptible };
        let effect = match crate::outcome::catching(move || f(restore)) {
            Ok(effect) => effect,
            Err(defect) => {
                on_result(Err(crate::outcome::Failure::Unexpected(defect)));
                return;
            }
        };
        let env = if was_interruptible {
            let detached = CancellationSource::new();
            env.with_interruptible(false).with_signal(detached.token())
        } else {
            env
        };
        effect.run(env, on_result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Failure;
    use crate::runtime::Runtime;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_uninterruptible_survives_abort() {
        let rt = Runtime::default();
        let effect = Effect::<_, Infallible>::succeed(5)
            .delay(Duration::from_millis(20))
            .uninterruptible();

        let outcome = rt.block_on(effect.fork().flat_map(|handle| {
            handle.unsafe_abort();
            handle.join()
        }));
        assert_eq!(outcome.unwrap(), 5);
    }

    #[test]
    fn test_interruptible_body_aborts() {
        let rt = Runtime::default();
        let effect = Effect::<_, Infallible>::succeed(5)
            .delay(Duration::from_millis(20))
            .interruptible()
            .uninterruptible();

        let outcome = rt.block_on(effect.fork().flat_map(|handle| {
            handle.unsafe_abort();
            handle.join()
        }));
        assert!(matches!(outcome, Err(Failure::Aborted)));
    }

    #[test]
    fn test_mask_restore_is_identity_when_already_masked() {
        let rt = Runtime::default();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();

        // The inner mask's restore must NOT re-enable interruption, because
        // the outer region is uninterruptible.
        let inner = uninterruptible_mask(move |restore| {
            restore.apply(
                Effect::<_, Infallible>::sync(move || r.store(true, Ordering::SeqCst))
                    .delay(Duration::from_millis(10)),
            )
        });
        let effect = inner.uninterruptible();

        let outcome = rt.block_on(effect.fork().flat_map(|handle| {
            handle.unsafe_abort();
            handle.join()
        }));
        assert!(outcome.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mask_restore_reenables_interruption() {
        let rt = Runtime::default();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();

        let effect = uninterruptible_mask(move |restore| {
            restore.apply(
                Effect::<_, Infallible>::sync(move || r.store(true, Ordering::SeqCst))
                    .delay(Duration::from_millis(10)),
            )
        });

        let outcome = rt.block_on(effect.fork().flat_map(|handle| {
            handle.unsafe_abort();
            handle.join()
        }));
        assert!(matches!(outcome, Err(Failure::Aborted)));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
