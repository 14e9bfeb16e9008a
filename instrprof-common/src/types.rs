//! Common data types shared by all instrprof crates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// The identity of a profiled function: its name and structural hash.
///
/// Two records with equal identity, for example from different runs of the same binary, describe
/// the same function and can be merged.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// The (possibly mangled) function name.
    pub name: String,
    /// A digest of the function's control flow shape.
    pub hash: u64,
}

impl FunctionId {
    /// Creates a new function identity.
    pub fn new(name: impl Into<String>, hash: u64) -> Self {
        Self {
            name: name.into(),
            hash,
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name, self.hash)
    }
}

/// Decides what happens when a single function record fails to decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorPolicy {
    /// Any error aborts decoding of the whole input.
    #[default]
    Strict,
    /// Records that fail to decode are skipped and reported as [`Skipped`].
    ///
    /// Errors that invalidate the entire input, such as a bad magic or an unsupported version,
    /// still abort.
    BestEffort,
}

/// Options controlling how inputs are decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// What to do with records that fail to decode.
    pub policy: ErrorPolicy,
}

impl ReadOptions {
    /// Options that skip corrupt records instead of failing.
    pub fn best_effort() -> Self {
        Self {
            policy: ErrorPolicy::BestEffort,
        }
    }

    /// Applies the error policy to a per-record error.
    ///
    /// In strict mode the error is returned. In best-effort mode it is logged, appended to
    /// `skipped` and `Ok(())` is returned so the caller can continue with the next record.
    pub fn recover(&self, error: Error, skipped: &mut Vec<Skipped>) -> Result<(), Error> {
        match self.policy {
            ErrorPolicy::Strict => Err(error),
            ErrorPolicy::BestEffort => {
                tracing::warn!(error = %error, "skipping function record");
                skipped.push(Skipped::from_error(&error));
                Ok(())
            }
        }
    }
}

/// A function record that was skipped in best-effort mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Skipped {
    /// The function identity, if it was decoded before the failure.
    pub function: Option<FunctionId>,
    /// Why the record was skipped.
    #[serde(skip)]
    pub kind: ErrorKind,
    /// A rendered description of the error.
    pub reason: String,
}

impl Skipped {
    /// Records the given error as the reason a function was skipped.
    pub fn from_error(error: &Error) -> Self {
        Self {
            function: error.function().cloned(),
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}
