//! Runtime
//!
//! The run boundary: owns the receiving end of the executor's job queue and
//! drives effects to completion on the calling thread.
//!
//! - [`Runtime::block_on`] runs an effect and waits, sleeping between timer
//!   deadlines, until its outcome arrives.
//! - [`Runtime::run_sync`] drains only work that is already runnable; an
//!   effect that suspends comes back as a defect.
//! - [`Runtime::run_fork`] starts an effect under a root handle and returns
//!   the handle immediately; a later `block_on(handle.join())` reclaims it.
//!
//! Drive from one thread at a time. Jobs enqueued by background threads
//! (timers resumed via [`Resume::schedule`](crate::effect::Resume::schedule),
//! blocking escapes) are picked up by whichever call is currently driving.

use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use thiserror::Error;

use crate::cancellation::CancellationSource;
use crate::config::RuntimeConfig;
use crate::effect::Effect;
use crate::env::Env;
use crate::executor::{Executor, Job};
use crate::handle::Handle;
use crate::log;
use crate::outcome::{Defect, Failure, Outcome};
use crate::services::ServiceMap;

use parking_lot::Mutex;
use std::sync::Arc;

/// Defect payload returned by [`Runtime::run_sync`] when the effect
/// suspended.
#[derive(Debug, Error)]
#[error("effect did not complete synchronously")]
pub struct NotSynchronous;

/// Drives effects on the calling thread.
pub struct Runtime {
    executor: Executor,
    queue: Receiver<Job>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        log::set_level(config.log_level);
        log::set_format(config.log_format);
        let (executor, queue) = Executor::new();
        Runtime {
            executor,
            queue,
            config,
        }
    }

    /// Create a runtime configured from `MARROW_*` environment variables.
    pub fn from_env() -> Self {
        Runtime::new(RuntimeConfig::from_env())
    }

    /// The executor handle.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn root_env(&self, source: &CancellationSource) -> Env {
        Env::root(
            self.executor.clone(),
            source.clone(),
            ServiceMap::empty(),
            self.config.default_concurrency,
        )
    }

    /// Run an effect to completion, blocking the calling thread.
    ///
    /// Returns the full outcome: the success value, or the failure exactly
    /// as the effect produced it. An effect that never completes (and is
    /// never cancelled) blocks forever, which is the contract of
    /// [`Effect::never`].
    pub fn block_on<A, E>(&self, effect: Effect<A, E>) -> Outcome<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let source = CancellationSource::new();
        let env = self.root_env(&source);
        let cell: Arc<Mutex<Option<Outcome<A, E>>>> = Arc::new(Mutex::new(None));
        let slot = cell.clone();
        self.executor.schedule(move || {
            effect.run(
                env,
                Box::new(move |outcome| {
                    *slot.lock() = Some(outcome);
                }),
            );
        });
        self.drive(true, || cell.lock().is_some());
        let result = cell.lock().take();
        match result {
            Some(outcome) => outcome,
            None => Err(Failure::Unexpected(Defect::message(
                "executor stopped before the effect completed",
            ))),
        }
    }

    /// Run an effect, refusing to wait.
    ///
    /// Drains the job queue to quiescence without sleeping for timers. If
    /// the effect suspended, it is aborted and a [`NotSynchronous`] defect
    /// is returned.
    pub fn run_sync<A, E>(&self, effect: Effect<A, E>) -> Outcome<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let source = CancellationSource::new();
        let env = self.root_env(&source);
        let cell: Arc<Mutex<Option<Outcome<A, E>>>> = Arc::new(Mutex::new(None));
        let slot = cell.clone();
        self.executor.schedule(move || {
            effect.run(
                env,
                Box::new(move |outcome| {
                    *slot.lock() = Some(outcome);
                }),
            );
        });
        self.drive(false, || cell.lock().is_some());
        if let Some(outcome) = cell.lock().take() {
            return outcome;
        }
        // Suspended: tear the pending work down before reporting.
        source.cancel();
        self.drive(false, || false);
        Err(Failure::Unexpected(Defect::from_error(NotSynchronous)))
    }

    /// Start an effect under a root handle without waiting for it.
    ///
    /// Nothing runs until something drives the runtime again; join or
    /// observe the handle under `block_on` to make progress and reclaim the
    /// outcome.
    pub fn run_fork<A, E>(&self, effect: Effect<A, E>) -> Handle<A, E>
    where
        A: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let source = CancellationSource::new();
        let handle = Handle::new(source.clone(), true, None);
        let env = self.root_env(&source);
        let emitter = handle.clone();
        self.executor.schedule(move || {
            effect.run(env, Box::new(move |outcome| emitter.emit(outcome)));
        });
        handle
    }

    /// The drive loop: ready jobs first, then due timers, then either sleep
    /// until the next deadline or (for the non-waiting mode) return.
    fn drive<F: Fn() -> bool>(&self, wait: bool, done: F) {
        loop {
            let mut progressed = false;
            while let Ok(job) = self.queue.try_recv() {
                job();
                progressed = true;
                if done() {
                    return;
                }
            }
            if self.executor.fire_due_timers() > 0 {
                progressed = true;
            }
            if done() {
                return;
            }
            if progressed {
                continue;
            }
            if !wait {
                return;
            }
            match self.executor.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        continue;
                    }
                    match self.queue.recv_timeout(deadline - now) {
                        Ok(job) => {
                            job();
                            if done() {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match self.queue.recv() {
                    Ok(job) => {
                        job();
                        if done() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending_jobs", &self.queue.len())
            .field("pending_timers", &self.executor.pending_timers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::Concurrency;
    use crate::effect::repeat_n;
    use std::convert::Infallible;
    use std::time::Duration;

    #[test]
    fn test_block_on_success() {
        let rt = Runtime::default();
        assert_eq!(
            rt.block_on(Effect::<_, Infallible>::succeed(1)).unwrap(),
            1
        );
    }

    #[test]
    fn test_block_on_failure_round_trips() {
        let rt = Runtime::default();
        assert!(matches!(
            rt.block_on(Effect::<i32, _>::fail("bad")),
            Err(Failure::Expected("bad"))
        ));
    }

    #[test]
    fn test_block_on_drives_timers() {
        let rt = Runtime::default();
        let value = rt
            .block_on(Effect::<_, Infallible>::succeed(8).delay(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(value, 8);
    }

    #[test]
    fn test_run_sync_synchronous_chain() {
        let rt = Runtime::default();
        let effect = Effect::<_, Infallible>::succeed(1)
            .map(|n| n + 1)
            .flat_map(|n| Effect::succeed(n * 3));
        assert_eq!(rt.run_sync(effect).unwrap(), 6);
    }

    #[test]
    fn test_run_sync_rejects_timers() {
        let rt = Runtime::default();
        let outcome = rt.run_sync(
            Effect::<_, Infallible>::succeed(1).delay(Duration::from_millis(50)),
        );
        match outcome {
            Err(Failure::Unexpected(defect)) => {
                assert!(defect.to_string().contains("synchronously"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_run_sync_allows_yield() {
        let rt = Runtime::default();
        let effect = Effect::<(), Infallible>::yield_now().as_value(2);
        assert_eq!(rt.run_sync(effect).unwrap(), 2);
    }

    #[test]
    fn test_run_fork_then_join() {
        let rt = Runtime::default();
        let handle =
            rt.run_fork(Effect::<_, Infallible>::succeed(3).delay(Duration::from_millis(5)));
        assert!(handle.is_root());
        assert_eq!(rt.block_on(handle.join()).unwrap(), 3);
    }

    #[test]
    fn test_run_fork_abort_before_drive() {
        let rt = Runtime::default();
        let handle = rt.run_fork(Effect::<i32, Infallible>::never());
        handle.unsafe_abort();
        assert!(matches!(
            rt.block_on(handle.join()),
            Err(Failure::Aborted)
        ));
    }

    #[test]
    fn test_deep_synchronous_repeat_is_stack_safe() {
        let rt = Runtime::default();
        let effect = repeat_n(10_000, || Effect::<(), Infallible>::unit());
        assert!(rt.run_sync(effect).is_ok());
    }

    #[test]
    fn test_config_reaches_env() {
        let config = RuntimeConfig::builder()
            .default_concurrency(Concurrency::Limit(2))
            .build();
        let rt = Runtime::new(config);
        assert!(matches!(
            rt.config().default_concurrency,
            Concurrency::Limit(2)
        ));
    }
}
