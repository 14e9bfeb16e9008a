//! Coverage mapping sections of instrumented binaries.
//!
//! Compilers emitting coverage instrumentation describe, for every function, which source ranges
//! (*regions*) are counted by which counters. This crate decodes these descriptions from the raw
//! bytes of one or more coverage mapping sections, which the caller extracts from the executable.
//!
//! The main entry point is [`CoverageMappings::parse`]. Each decoded [`CoverageMapping`] is
//! identified by function name and structural hash, the same identity that profile records carry.
//! Region counts are [`CounterExpression`]s over the counters of that record.
//!
//! [`MappingWriter`] produces sections in the same format.
//!
//! ```
//! use instrprof_common::{ProfileVersion, ReadOptions};
//! use instrprof_covmap::{CounterExpression, CoverageMapping, CoverageMappings, MappingWriter, Region};
//!
//! let mapping = CoverageMapping {
//!     function_name: "main".into(),
//!     structural_hash: 0x1234,
//!     version: ProfileVersion::Llvm12,
//!     filenames: vec!["/src/main.c".into()],
//!     regions: vec![Region::code(0, (1, 1), (3, 2), CounterExpression::Counter(0))],
//! };
//!
//! let mut writer = MappingWriter::new(ProfileVersion::Llvm12);
//! writer.add_function(mapping.clone());
//! let mut section = Vec::new();
//! writer.serialize(&mut section).unwrap();
//!
//! let mappings = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap();
//! assert_eq!(mappings.functions, vec![mapping]);
//! ```

#![warn(missing_docs)]

mod expression;
mod mapping;
mod writer;

pub use expression::{CounterExpression, MAX_EXPRESSION_DEPTH, MAX_EXPRESSION_NODES};
pub use mapping::*;
pub use writer::MappingWriter;
