//! Common functionality for `instrprof`.
//!
//! This crate exposes a set of key types:
//!
//!  - [`Error`] and [`ErrorKind`]: The error taxonomy shared by all decoders.
//!  - [`ProfileVersion`] and [`VersionSchema`]: The table of supported toolchain releases and the
//!    layout each of them uses.
//!  - [`Reader`]: A bounds-checked cursor used by all binary decoders.
//!  - [`FunctionId`], [`ReadOptions`] and [`Skipped`]: Function identity and best-effort decoding.
//!  - [`read_chunk`] and [`write_chunk`]: Optionally zlib compressed string tables.
//!  - [`join_path`]: Resolves file names against a compilation directory.
//!
//! This module is part of the `instrprof` crate.

#![warn(missing_docs)]

mod compression;
mod error;
mod path;
mod reader;
mod types;
mod version;

pub use crate::compression::*;
pub use crate::error::*;
pub use crate::path::*;
pub use crate::reader::*;
pub use crate::types::*;
pub use crate::version::*;
