//! Line coverage from execution count profiles and coverage mappings.
//!
//! [`aggregate`] joins an [`InstrProfile`](instrprof_profdata::InstrProfile) with the
//! [`CoverageMappings`](instrprof_covmap::CoverageMappings) of the binary that produced it. The
//! counts of all code regions are folded into a count per source line, yielding a
//! [`CoverageReport`] sorted by file name and line number.
//!
//! ```
//! use instrprof_common::ProfileVersion;
//! use instrprof_coverage::{aggregate, CoverageOptions};
//! use instrprof_covmap::{CounterExpression, CoverageMapping, CoverageMappings, Region};
//! use instrprof_profdata::read_profile;
//!
//! let profile = read_profile(b"main\n0x1234\n2\n10\n3\n").unwrap();
//! let mappings = CoverageMappings {
//!     functions: vec![CoverageMapping {
//!         function_name: "main".into(),
//!         structural_hash: 0x1234,
//!         version: ProfileVersion::Llvm14,
//!         filenames: vec!["main.c".into()],
//!         regions: vec![
//!             Region::code(0, (1, 1), (3, 2), CounterExpression::Counter(0)),
//!             Region::code(0, (2, 5), (2, 9), CounterExpression::Counter(1)),
//!         ],
//!     }],
//!     skipped: vec![],
//! };
//!
//! let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
//! let counts: Vec<_> = report.lines.iter().map(|line| line.execution_count).collect();
//! assert_eq!(counts, [10, 10, 10]);
//! ```

#![warn(missing_docs)]

mod aggregate;
mod report;

pub use aggregate::*;
pub use report::*;
