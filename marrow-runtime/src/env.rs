//! Execution Environment
//!
//! The per-execution dynamic context threaded through every `run` chain. An
//! [`Env`] carries the cancellation pair currently in force, the
//! interruptibility flag, the inherited concurrency policy, the service map,
//! and a handle to the executor.
//!
//! Environments are immutable by convention: every `with_*` method returns a
//! fresh value (a cheap clone with one field rebound) and the original is
//! never touched. Reads always see the most recently bound value on their
//! own chain.

use std::any::Any;
use std::fmt;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::concurrency::Concurrency;
use crate::executor::Executor;
use crate::services::ServiceMap;

/// The dynamic context of a single `run` chain.
#[derive(Clone)]
pub struct Env {
    executor: Executor,
    source: CancellationSource,
    signal: CancellationToken,
    interruptible: bool,
    concurrency: Concurrency,
    services: ServiceMap,
}

impl Env {
    /// Build the root environment for a top-level run.
    pub(crate) fn root(
        executor: Executor,
        source: CancellationSource,
        services: ServiceMap,
        concurrency: Concurrency,
    ) -> Self {
        let signal = source.token();
        Env {
            executor,
            source,
            signal,
            interruptible: true,
            concurrency,
            services,
        }
    }

    /// The executor this chain runs on.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The cancellation source currently in force.
    ///
    /// This is the source interruptible regions restore their signal from;
    /// it is not replaced by `uninterruptible`.
    pub fn source(&self) -> &CancellationSource {
        &self.source
    }

    /// The cancellation token observed at checkpoints.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Whether cancellation is observed at effect boundaries.
    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    /// The inherited concurrency policy.
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// The ambient service map.
    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    /// A fresh environment with the cancellation source (and its token)
    /// rebound.
    pub fn with_source(&self, source: CancellationSource) -> Self {
        let signal = source.token();
        Env {
            source,
            signal,
            ..self.clone()
        }
    }

    /// A fresh environment with only the observed signal rebound.
    pub fn with_signal(&self, signal: CancellationToken) -> Self {
        Env {
            signal,
            ..self.clone()
        }
    }

    /// A fresh environment with the interruptibility flag rebound.
    pub fn with_interruptible(&self, interruptible: bool) -> Self {
        Env {
            interruptible,
            ..self.clone()
        }
    }

    /// A fresh environment with the concurrency policy rebound.
    pub fn with_concurrency(&self, concurrency: Concurrency) -> Self {
        Env {
            concurrency,
            ..self.clone()
        }
    }

    /// A fresh environment with the whole service map rebound.
    pub fn with_services(&self, services: ServiceMap) -> Self {
        Env {
            services,
            ..self.clone()
        }
    }

    /// A fresh environment with one service added.
    pub fn with_service<S: Any + Send + Sync>(&self, service: S) -> Self {
        self.with_services(self.services.add(service))
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("interruptible", &self.interruptible)
            .field("cancelled", &self.signal.is_cancelled())
            .field("concurrency", &self.concurrency)
            .field("services", &self.services.len())
            .finish()
    }
}
