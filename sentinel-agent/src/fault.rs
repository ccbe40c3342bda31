//! Fault capability surface.
//!
//! The agent never reflects over arbitrary values. Types that want deep
//! capture implement [`Fault`] and hand over bounded [`FieldValue`] trees;
//! everything else degrades to the generic type + message pair.

use std::error::Error;

/// Bounded runtime value handed to the snapshotter.
///
/// Hosts build these explicitly; there is no reflection fallback. `Seq` is
/// deliberately summarized rather than expanded (see the snapshotter), while
/// `Map` entries are walked because that is how fault data bags and exported
/// fields travel.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    /// Epoch milliseconds
    Timestamp(i64),
    /// Indexed collection, reported as an item count only
    Seq(Vec<FieldValue>),
    /// Keyed entries, walked up to the collection cap
    Map(Vec<(String, FieldValue)>),
    /// Composite value the host chose not to expand
    Opaque { type_name: String },
}

impl FieldValue {
    /// Convenience constructor for string fields.
    pub fn str(value: impl Into<String>) -> Self {
        FieldValue::Str(value.into())
    }
}

/// Capability interface for capturable failures.
///
/// Only `type_name` and `message` are required; the default methods are the
/// generic fallback the capture engine uses when a type exports nothing else.
pub trait Fault {
    /// Concrete type name, e.g. `std::io::Error`
    fn type_name(&self) -> String;

    /// Human-readable failure message
    fn message(&self) -> String;

    /// Native error code, when the failure has one
    fn error_code(&self) -> Option<i64> {
        None
    }

    /// Link to remediation docs
    fn help_link(&self) -> Option<String> {
        None
    }

    /// Fields this type explicitly exports for capture
    fn exported_fields(&self) -> Vec<(String, FieldValue)> {
        Vec::new()
    }

    /// Side-channel key/value data bag
    fn data(&self) -> Vec<(String, FieldValue)> {
        Vec::new()
    }

    /// Inner fault, for wrapped failures
    fn cause(&self) -> Option<&dyn Fault> {
        None
    }

    /// Contained faults, for aggregate/multi-cause failures
    fn contained_faults(&self) -> Vec<&dyn Fault> {
        Vec::new()
    }
}

/// Longest `source()` chain [`ChainFault::from_error`] will walk.
const MAX_SOURCE_CHAIN: usize = 16;

/// Owned [`Fault`] built from any `std::error::Error`.
///
/// The `source()` chain is walked eagerly into nested causes; sources carry
/// only their display text because trait objects expose no concrete type name.
#[derive(Debug)]
pub struct ChainFault {
    type_name: String,
    message: String,
    cause: Option<Box<ChainFault>>,
}

impl ChainFault {
    /// Capture a typed error and its source chain.
    pub fn from_error<E: Error>(error: &E) -> Self {
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            cause: error.source().map(|s| Box::new(Self::from_source(s, 1))),
        }
    }

    fn from_source(source: &dyn Error, depth: usize) -> Self {
        let cause = if depth < MAX_SOURCE_CHAIN {
            source
                .source()
                .map(|s| Box::new(Self::from_source(s, depth + 1)))
        } else {
            None
        };
        Self {
            type_name: "error".to_string(),
            message: source.to_string(),
            cause,
        }
    }
}

impl Fault for ChainFault {
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    fn message(&self) -> String {
        self.message.clone()
    }

    fn cause(&self) -> Option<&dyn Fault> {
        self.cause.as_deref().map(|c| c as &dyn Fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Leaf;

    impl fmt::Display for Leaf {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "leaf failure")
        }
    }

    impl Error for Leaf {}

    #[derive(Debug)]
    struct Wrapper(Leaf);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapper failure")
        }
    }

    impl Error for Wrapper {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_chain_fault_walks_sources() {
        let fault = ChainFault::from_error(&Wrapper(Leaf));
        assert!(fault.type_name().ends_with("Wrapper"));
        assert_eq!(fault.message(), "wrapper failure");

        let cause = fault.cause().expect("expected a cause");
        assert_eq!(cause.message(), "leaf failure");
        assert!(cause.cause().is_none());
    }

    #[test]
    fn test_default_capability_surface_is_empty() {
        let fault = ChainFault::from_error(&Leaf);
        assert!(fault.exported_fields().is_empty());
        assert!(fault.data().is_empty());
        assert!(fault.error_code().is_none());
        assert!(fault.contained_faults().is_empty());
    }
}
