//! # Marrow Runtime Library
//!
//! A lightweight effect runtime: pure, composable descriptions of
//! asynchronous work that can fail in controlled ways, be raced and forked,
//! acquire and release resources safely, and be interrupted at well-defined
//! points.
//!
//! The runtime provides:
//!
//! - **Effect values**: inert descriptors executed by a
//!   continuation-passing interpreter
//! - **Failure algebra**: expected error, unexpected defect, aborted
//! - **Structured concurrency**: fork handles, races, bounded traversal,
//!   cancellation fan-out
//! - **Scoped finalization**: ordered finalizers, acquire/release brackets
//! - **Interruptibility regions**: uninterruptible, interruptible, masks
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        MARROW RUNTIME                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────┐         │
//! │  │   Effect    │  │ Concurrency  │  │  Scope/Exit   │         │
//! │  │ (effect.rs) │  │(concurrency.rs)│ │  (scope.rs)   │         │
//! │  └─────────────┘  └──────────────┘  └───────────────┘         │
//! │         │                 │                 │                  │
//! │         └─────────────────┼─────────────────┘                  │
//! │                           │                                    │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────┐         │
//! │  │  Executor   │  │ Cancellation │  │    Runtime    │         │
//! │  │(executor.rs)│  │(cancellation.rs)│ │ (runtime.rs)  │         │
//! │  └─────────────┘  └──────────────┘  └───────────────┘         │
//! │                                                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow_runtime::{Effect, Runtime};
//! use std::time::Duration;
//!
//! let rt = Runtime::default();
//! let effect = Effect::<_, String>::succeed(40)
//!     .delay(Duration::from_millis(10))
//!     .map(|n| n + 2);
//! assert_eq!(rt.block_on(effect).unwrap(), 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancellation;
pub mod concurrency;
pub mod config;
pub mod effect;
pub mod env;
pub mod executor;
pub mod handle;
pub mod interrupt;
pub mod log;
pub mod outcome;
pub mod runtime;
pub mod scope;
pub mod services;
pub mod time;

// Re-exports
pub use cancellation::{CancellationSource, CancellationToken, ListenerKey};
pub use concurrency::{for_each, for_each_discard, race_all, race_all_first, Concurrency};
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{repeat_n, service, Effect, NoSuchElement, Resume, ServiceMissing};
pub use env::Env;
pub use executor::{Executor, TimerHandle};
pub use handle::{Handle, HandleId};
pub use interrupt::{uninterruptible_mask, Restore};
pub use outcome::{Defect, Failure, Outcome};
pub use runtime::{NotSynchronous, Runtime};
pub use scope::{
    acquire_release, acquire_use_release, current_scope, CurrentScope, Exit, FinalizerKey, Scope,
};
pub use services::ServiceMap;
pub use time::sleep;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
