use serde::Serialize;

use instrprof_common::{ErrorPolicy, Skipped};

/// How the counts of overlapping code regions combine into the count of a line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum LineFold {
    /// The line count is the largest count of any region on the line.
    #[default]
    Max,
    /// The line count is the saturating sum of the counts of all regions on the line.
    Sum,
    /// The line count is `1` if any region on the line executed, `0` otherwise.
    Presence,
}

impl LineFold {
    /// The count of a line given the largest and the total count of the regions on it.
    pub(crate) fn resolve(self, max: u64, sum: u128) -> u64 {
        match self {
            LineFold::Max => max,
            LineFold::Sum => u64::try_from(sum).unwrap_or(u64::MAX),
            LineFold::Presence => max.min(1),
        }
    }
}

/// Options for [`aggregate`](crate::aggregate).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoverageOptions {
    /// What to do with functions whose counts cannot be computed.
    pub policy: ErrorPolicy,
    /// How overlapping regions combine.
    pub fold: LineFold,
}

/// The coverage of a single source line.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LineCoverage {
    /// The source file.
    pub filename: String,
    /// The 1-based line number.
    pub line_number: u32,
    /// The folded count of all code regions on this line.
    pub execution_count: u64,
    /// Whether any code region covers this line.
    pub is_executable: bool,
}

/// The coverage of a single function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionCoverage {
    /// The function name.
    pub name: String,
    /// The structural hash shared by mapping and profile record.
    pub hash: u64,
    /// The file containing the function.
    pub filename: Option<String>,
    /// How often the function was entered, the count of its first code region.
    pub execution_count: u64,
    /// Whether the profile had a record for this function.
    pub has_profile: bool,
}

/// Line coverage for all files of a binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    /// All lines up to the last covered line of each file, ordered by file name and line.
    pub lines: Vec<LineCoverage>,
    /// One entry per distinct function mapping.
    pub functions: Vec<FunctionCoverage>,
    /// Functions dropped by the profile reader, the mapping reader or the aggregation.
    pub skipped: Vec<Skipped>,
}

/// Aggregate line counts of a [`CoverageReport`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoverageSummary {
    /// Lines covered by at least one code region.
    pub executable_lines: usize,
    /// Executable lines with a nonzero count.
    pub covered_lines: usize,
}

impl CoverageReport {
    /// The number of skipped functions.
    pub fn num_skipped(&self) -> usize {
        self.skipped.len()
    }

    /// Returns the lines of a single file.
    pub fn file_lines(&self, filename: &str) -> &[LineCoverage] {
        let start = self
            .lines
            .partition_point(|line| line.filename.as_str() < filename);
        let end = self
            .lines
            .partition_point(|line| line.filename.as_str() <= filename);
        &self.lines[start..end]
    }

    /// Iterates over the distinct files in the report, in order.
    pub fn files(&self) -> impl Iterator<Item = &str> + '_ {
        let mut previous = None;
        self.lines.iter().filter_map(move |line| {
            let filename = line.filename.as_str();
            if previous == Some(filename) {
                return None;
            }
            previous = Some(filename);
            Some(filename)
        })
    }

    /// Counts executable and covered lines.
    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for line in self.lines.iter().filter(|line| line.is_executable) {
            summary.executable_lines += 1;
            if line.execution_count > 0 {
                summary.covered_lines += 1;
            }
        }
        summary
    }
}
