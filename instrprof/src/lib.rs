//! `instrprof` reads and writes the profiles produced by LLVM instrumentation and turns them into
//! line coverage. It consists of a few largely independent crates, bundled here behind features.
//!
//! # What's in the package
//!
//! - Execution count profiles (`profdata`)
//!   - Raw profiles as written by instrumented programs
//!   - Indexed profiles with a hash table for lookups by function hash
//!   - The line oriented text format
//!   - Merging of any number of profiles, in parallel
//! - Coverage mappings (`covmap`)
//!   - Decoding and encoding of coverage mapping sections
//!   - Counter expressions over the counters of a function
//! - Line coverage (`coverage`)
//!   - Joining profiles with coverage mappings into per-line counts
//!
//! # Usage
//!
//! All features are enabled by default:
//!
//! - **`profdata`**: Reading, writing and merging of profiles.
//! - **`covmap`**: Coverage mapping sections.
//! - **`coverage`**: Line coverage reports. Implies the other two features.
//!
//! ## Minimal Rust Version
//!
//! This crate is known to require at least Rust 1.70.

#![warn(missing_docs)]

#[doc(inline)]
pub use instrprof_common as common;
#[doc(inline)]
#[cfg(feature = "coverage")]
pub use instrprof_coverage as coverage;
#[doc(inline)]
#[cfg(feature = "covmap")]
pub use instrprof_covmap as covmap;
#[doc(inline)]
#[cfg(feature = "profdata")]
pub use instrprof_profdata as profdata;
