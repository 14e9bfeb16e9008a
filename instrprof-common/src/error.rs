use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::types::FunctionId;
use crate::version::SUPPORTED_VERSION_TAGS;

/// The kind of an [`Error`].
///
/// Every kind is terminal for the input that is being decoded. Whether the whole input is rejected
/// or only a single function record is skipped depends on the [`ErrorPolicy`](crate::ErrorPolicy)
/// and on the blast radius of the failing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The file magic does not match the expected format constant.
    #[error("bad magic")]
    BadMagic,
    /// The embedded version tag names none of the supported versions.
    #[error("unsupported version")]
    UnsupportedVersion,
    /// Fewer bytes remain than the next field requires.
    #[error("truncated input")]
    TruncatedInput,
    /// A value is encoded in a way that signals corruption.
    #[error("invalid encoding")]
    InvalidEncoding,
    /// A line of a text profile does not match the grammar at its position.
    #[error("malformed line")]
    MalformedLine,
    /// The number of counters differs from what was declared or expected.
    #[error("counter count mismatch")]
    CounterCountMismatch,
    /// An offset in an index points outside of its section.
    #[error("corrupt index")]
    CorruptIndex,
    /// A coverage mapping references an out of range index or has inconsistent regions.
    #[error("corrupt coverage mapping")]
    CorruptMapping,
    /// The binary and the profile disagree on the structural hash of a function.
    #[error("profile and binary are out of sync")]
    ProfileBinaryMismatch,
    /// Serializing a profile or mapping failed.
    #[error("failed to write")]
    WriteFailed,
}

/// An error encountered while decoding profiles, coverage mappings or while building a report.
///
/// Besides its [`ErrorKind`], an error carries as much context as was known at the point of
/// failure: the byte offset, the line in a text profile, the function identity and the version tag
/// that was found.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    offset: Option<usize>,
    line: Option<usize>,
    function: Option<FunctionId>,
    found_version: Option<u64>,
    detail: Option<Cow<'static, str>>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new error of the given kind without any context.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            offset: None,
            line: None,
            function: None,
            found_version: None,
            detail: None,
            source: None,
        }
    }

    /// Creates an `UnsupportedVersion` error for the given version tag.
    pub fn unsupported_version(found: u64) -> Self {
        let mut error = Self::new(ErrorKind::UnsupportedVersion);
        error.found_version = Some(found);
        error
    }

    /// Attaches the byte offset at which decoding failed.
    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Attaches the 1-based line number at which decoding failed.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    /// Attaches the identity of the function that was being decoded.
    pub fn in_function(mut self, name: impl Into<String>, hash: u64) -> Self {
        self.function = Some(FunctionId::new(name, hash));
        self
    }

    /// Attaches a human readable description of what went wrong.
    pub fn with_detail(mut self, detail: impl Into<Cow<'static, str>>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches an underlying error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.source = Some(source.into());
        self
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The byte offset at which decoding failed, if known.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// The 1-based line number in a text profile, if known.
    pub fn line(&self) -> Option<usize> {
        self.line
    }

    /// The function that was being decoded, if known.
    pub fn function(&self) -> Option<&FunctionId> {
        self.function.as_ref()
    }

    /// The version tag found in the input, for `UnsupportedVersion` errors.
    pub fn found_version(&self) -> Option<u64> {
        self.found_version
    }

    /// Additional description of the failure.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        if let Some(found) = self.found_version {
            write!(
                f,
                " {found} (expected one of {:?})",
                SUPPORTED_VERSION_TAGS
            )?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(ref function) = self.function {
            write!(f, " in function `{}` (hash {:#x})", function.name, function.hash)?;
        }
        if let Some(line) = self.line {
            write!(f, " on line {line}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset:#x}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        let offset = match e {
            scroll::Error::TooBig { .. } => None,
            scroll::Error::BadOffset(offset) => Some(offset),
            _ => None,
        };
        let error = Error::new(ErrorKind::TruncatedInput).with_source(e);
        match offset {
            Some(offset) => error.at_offset(offset),
            None => error,
        }
    }
}
