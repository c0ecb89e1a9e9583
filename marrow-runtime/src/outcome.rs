//! Failure Algebra
//!
//! Every run of an effect delivers exactly one [`Outcome`]: either a success
//! value or a [`Failure`]. Failures come in three flavors:
//!
//! - `Expected`: a typed, recoverable error. Flows through the error channel
//!   and can be handled with `catch_all` and friends.
//! - `Unexpected`: a defect. Panics in user code and other unplanned errors
//!   are boxed into a [`Defect`] and bypass expected-only handlers.
//! - `Aborted`: cancellation. Injected at cancellation checkpoints; handled
//!   only by the full-failure combinators.

use std::any::Any;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// The result of running an effect: a value or a [`Failure`].
pub type Outcome<A, E> = Result<A, Failure<E>>;

/// The three ways an effect can fail.
#[derive(Clone)]
pub enum Failure<E> {
    /// A typed, recoverable error.
    Expected(E),
    /// An unplanned error: a caught panic or a raised defect.
    Unexpected(Defect),
    /// The computation was cancelled.
    Aborted,
}

impl<E> Failure<E> {
    /// Whether this is an `Expected` failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, Failure::Expected(_))
    }

    /// Whether this is an `Unexpected` defect.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Failure::Unexpected(_))
    }

    /// Whether this is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Failure::Aborted)
    }

    /// The expected error, if that is what this failure carries.
    pub fn expected(&self) -> Option<&E> {
        match self {
            Failure::Expected(e) => Some(e),
            _ => None,
        }
    }

    /// The defect, if that is what this failure carries.
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Failure::Unexpected(d) => Some(d),
            _ => None,
        }
    }

    /// Consume the failure, returning the expected error if present.
    pub fn into_expected(self) -> Option<E> {
        match self {
            Failure::Expected(e) => Some(e),
            _ => None,
        }
    }

    /// Transform the expected error channel, leaving the other variants as-is.
    pub fn map_expected<F>(self, f: impl FnOnce(E) -> F) -> Failure<F> {
        match self {
            Failure::Expected(e) => Failure::Expected(f(e)),
            Failure::Unexpected(d) => Failure::Unexpected(d),
            Failure::Aborted => Failure::Aborted,
        }
    }
}

impl Failure<Infallible> {
    /// Re-type a failure that provably carries no expected error.
    pub fn widen<E>(self) -> Failure<E> {
        match self {
            Failure::Expected(never) => match never {},
            Failure::Unexpected(d) => Failure::Unexpected(d),
            Failure::Aborted => Failure::Aborted,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Expected(e) => f.debug_tuple("Expected").field(e).finish(),
            Failure::Unexpected(d) => f.debug_tuple("Unexpected").field(d).finish(),
            Failure::Aborted => write!(f, "Aborted"),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Expected(e) => write!(f, "expected failure: {}", e),
            Failure::Unexpected(d) => write!(f, "defect: {}", d),
            Failure::Aborted => write!(f, "aborted"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> StdError for Failure<E> {}

/// An opaque, cheaply clonable description of an unplanned error.
///
/// Built from a message, an error object, or a caught panic payload.
#[derive(Clone)]
pub struct Defect {
    repr: Arc<DefectRepr>,
}

enum DefectRepr {
    Message(String),
    Error(Box<dyn StdError + Send + Sync>),
}

impl Defect {
    /// A defect carrying a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Defect {
            repr: Arc::new(DefectRepr::Message(msg.into())),
        }
    }

    /// A defect wrapping an error object.
    pub fn from_error(err: impl StdError + Send + Sync + 'static) -> Self {
        Defect {
            repr: Arc::new(DefectRepr::Error(Box::new(err))),
        }
    }

    /// A defect built from a caught panic payload.
    ///
    /// String payloads (the common case for `panic!`) are preserved; anything
    /// else is reported as an opaque payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Defect::message(format!("panicked: {}", msg))
    }

    /// The wrapped error object, if this defect carries one.
    pub fn as_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match &*self.repr {
            DefectRepr::Error(e) => Some(e.as_ref()),
            DefectRepr::Message(_) => None,
        }
    }
}

impl From<String> for Defect {
    fn from(msg: String) -> Self {
        Defect::message(msg)
    }
}

impl From<&str> for Defect {
    fn from(msg: &str) -> Self {
        Defect::message(msg)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.repr {
            DefectRepr::Message(m) => write!(f, "{}", m),
            DefectRepr::Error(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self)
    }
}

impl StdError for Defect {}

/// Run a closure, converting a panic into a [`Defect`].
pub(crate) fn catching<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_predicates() {
        let expected: Failure<&str> = Failure::Expected("boom");
        assert!(expected.is_expected());
        assert!(!expected.is_unexpected());
        assert!(!expected.is_aborted());
        assert_eq!(expected.expected(), Some(&"boom"));

        let aborted: Failure<&str> = Failure::Aborted;
        assert!(aborted.is_aborted());
        assert!(aborted.expected().is_none());
    }

    #[test]
    fn test_map_expected() {
        let failure: Failure<u32> = Failure::Expected(41);
        match failure.map_expected(|n| n + 1) {
            Failure::Expected(42) => {}
            other => panic!("unexpected: {:?}", other),
        }

        let aborted: Failure<u32> = Failure::Aborted;
        assert!(aborted.map_expected(|n| n + 1).is_aborted());
    }

    #[test]
    fn test_defect_from_panic_preserves_message() {
        let defect = catching(|| panic!("it broke")).unwrap_err();
        assert!(defect.to_string().contains("it broke"));
    }

    #[test]
    fn test_defect_from_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("disk full")]
        struct DiskFull;

        let defect = Defect::from_error(DiskFull);
        assert_eq!(defect.to_string(), "disk full");
        assert!(defect.as_error().is_some());
    }

    #[test]
    fn test_catching_passes_values_through() {
        assert_eq!(catching(|| 7).unwrap(), 7);
    }

    #[test]
    fn test_failure_display() {
        let failure: Failure<String> = Failure::Expected("nope".to_string());
        assert_eq!(failure.to_string(), "expected failure: nope");
        let aborted: Failure<String> = Failure::Aborted;
        assert_eq!(aborted.to_string(), "aborted");
    }
}
