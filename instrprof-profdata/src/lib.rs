//! Execution count profiles in the raw, text and indexed encodings.
//!
//! Instrumented programs count how often each of their blocks executes and dump these counts into
//! a *raw* profile on exit. Raw profiles of several runs are merged into an *indexed* profile, which
//! supports lookups by structural hash. The *text* format is a human readable rendition of the same
//! data.
//!
//! All three encodings, in all supported toolchain versions, decode into an [`InstrProfile`]:
//!
//! ```
//! use instrprof_profdata::{read_profile, FunctionRecord};
//!
//! let profile = read_profile(b"main\n0x1234\n2\n10\n3\n").unwrap();
//! assert_eq!(profile.records, vec![FunctionRecord::new("main", 0x1234, vec![10, 3])]);
//! ```
//!
//! Use [`read_profile_with`] and [`ReadOptions::best_effort`] to skip corrupt records instead of
//! rejecting the whole input. Profiles are written back with [`write_text`], [`IndexedWriter`] and
//! [`RawWriter`], and combined with [`InstrProfile::merge`] or [`read_profiles_parallel`].

#![warn(missing_docs)]

mod compat;
pub mod indexed;
mod merge;
pub mod raw;
mod record;
mod summary;
pub mod text;
mod value_prof;

pub use compat::*;
pub use indexed::{IndexedProfile, IndexedWriter};
pub use merge::*;
pub use raw::RawWriter;
pub use record::*;
pub use summary::*;
pub use text::write_text;

pub use instrprof_common::{Error, ErrorKind, ErrorPolicy, ProfileVersion, ReadOptions, Skipped};
