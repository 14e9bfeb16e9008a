use std::collections::{BTreeMap, HashMap, HashSet};

use instrprof_common::{Error, ErrorKind, FunctionId, ReadOptions};
use instrprof_covmap::{CoverageMapping, CoverageMappings, RegionKind};
use instrprof_profdata::{FunctionRecord, InstrProfile};

use crate::report::{CoverageOptions, CoverageReport, FunctionCoverage, LineCoverage, LineFold};

/// Lines beyond this number are treated as corrupt, which bounds the size of a report.
pub const MAX_LINE_NUMBER: u32 = 1 << 24;

/// The evaluated code regions of one file: first line, last line and count.
#[derive(Default)]
struct FileLines {
    regions: Vec<(u32, u32, u64)>,
    last_line: u32,
}

/// A run of lines sharing the same set of covering regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LineSpan {
    start: u32,
    end: u32,
    count: u64,
}

/// The counts of all regions covering the current line of a sweep.
#[derive(Default)]
struct ActiveRegions {
    counts: BTreeMap<u64, usize>,
    sum: u128,
}

impl ActiveRegions {
    fn insert(&mut self, count: u64) {
        *self.counts.entry(count).or_default() += 1;
        self.sum += u128::from(count);
    }

    fn remove(&mut self, count: u64) {
        if let Some(n) = self.counts.get_mut(&count) {
            *n -= 1;
            if *n == 0 {
                self.counts.remove(&count);
            }
            self.sum -= u128::from(count);
        }
    }

    fn folded(&self, fold: LineFold) -> Option<u64> {
        let max = *self.counts.keys().next_back()?;
        Some(fold.resolve(max, self.sum))
    }
}

/// Folds overlapping regions into disjoint spans of lines, ordered by line.
///
/// Work is proportional to the number of regions, not to the number of lines they cover.
fn fold_regions(regions: &[(u32, u32, u64)], fold: LineFold) -> Vec<LineSpan> {
    // (line, starts, count): a region starts at its first line and ends after its last
    let mut events = Vec::with_capacity(regions.len() * 2);
    for &(start, end, count) in regions {
        events.push((start, true, count));
        events.push((end.saturating_add(1), false, count));
    }
    events.sort_unstable();

    let mut spans = Vec::new();
    let mut active = ActiveRegions::default();
    let mut previous = 0;
    let mut events = events.into_iter().peekable();
    while let Some(&(line, _, _)) = events.peek() {
        if let Some(count) = active.folded(fold) {
            if line > previous {
                spans.push(LineSpan {
                    start: previous,
                    end: line - 1,
                    count,
                });
            }
        }
        while let Some((_, starts, count)) = events.next_if(|&(l, _, _)| l == line) {
            if starts {
                active.insert(count);
            } else {
                active.remove(count);
            }
        }
        previous = line;
    }
    spans
}

/// The evaluated code regions of one function: file, lines and count.
type FunctionLines<'a> = Vec<(&'a str, u32, u32, u64)>;

/// Joins a profile with the coverage mappings of the profiled binary.
///
/// Each mapping is matched with the profile record of equal name and structural hash. Functions
/// without any record are reported as never executed. A record with the right name but only other
/// hashes means the profile was recorded from a different build and fails with
/// [`ErrorKind::ProfileBinaryMismatch`], regardless of the error policy.
///
/// Functions whose counts cannot be computed fail with [`ErrorKind::CorruptMapping`], or are
/// reported as skipped in best-effort mode. Records skipped while reading the profile or the
/// mappings are carried over into the report.
#[tracing::instrument(level = "trace", name = "aggregate", skip_all)]
pub fn aggregate(
    profile: &InstrProfile,
    mappings: &CoverageMappings,
    options: &CoverageOptions,
) -> Result<CoverageReport, Error> {
    let read_options = ReadOptions {
        policy: options.policy,
    };
    let mut report = CoverageReport::default();
    report.skipped.extend(profile.skipped.iter().cloned());
    report.skipped.extend(mappings.skipped.iter().cloned());

    // context sensitive records describe a later compilation stage
    let mut records: HashMap<&str, Vec<&FunctionRecord>> = HashMap::new();
    for record in profile.records.iter().filter(|r| !r.has_cs_flag()) {
        records.entry(record.name.as_str()).or_default().push(record);
    }

    let mut seen = HashSet::new();
    let mut files: BTreeMap<&str, FileLines> = BTreeMap::new();
    let mut duplicates = 0;

    for mapping in &mappings.functions {
        if !seen.insert(mapping.id()) {
            duplicates += 1;
            continue;
        }

        let candidates = records
            .get(mapping.function_name.as_str())
            .map_or(&[][..], Vec::as_slice);
        let record = candidates
            .iter()
            .find(|record| record.hash == mapping.structural_hash);
        if record.is_none() && !candidates.is_empty() {
            let hashes: Vec<_> = candidates
                .iter()
                .map(|record| format!("{:#x}", record.hash))
                .collect();
            return Err(Error::new(ErrorKind::ProfileBinaryMismatch)
                .in_function(mapping.function_name.as_str(), mapping.structural_hash)
                .with_detail(format!(
                    "the profile only has records with hashes {}",
                    hashes.join(", ")
                )));
        }

        let counters = record.map(|record| record.counters.as_slice());
        let (execution_count, lines) = match evaluate_function(mapping, counters) {
            Ok(result) => result,
            Err(error) => {
                let error =
                    error.in_function(mapping.function_name.as_str(), mapping.structural_hash);
                read_options.recover(error, &mut report.skipped)?;
                continue;
            }
        };

        for (filename, start_line, end_line, count) in lines {
            let file = files.entry(filename).or_default();
            file.last_line = file.last_line.max(end_line);
            if start_line <= end_line {
                file.regions.push((start_line, end_line, count));
            }
        }

        report.functions.push(FunctionCoverage {
            name: mapping.function_name.clone(),
            hash: mapping.structural_hash,
            filename: mapping.filename().map(str::to_owned),
            execution_count,
            has_profile: record.is_some(),
        });
    }

    for (filename, file) in files {
        let line = |line_number, execution_count, is_executable| LineCoverage {
            filename: filename.to_owned(),
            line_number,
            execution_count,
            is_executable,
        };

        let mut next = 1;
        for span in fold_regions(&file.regions, options.fold) {
            report
                .lines
                .extend((next..span.start).map(|number| line(number, 0, false)));
            report
                .lines
                .extend((span.start..=span.end).map(|number| line(number, span.count, true)));
            next = span.end + 1;
        }
        report
            .lines
            .extend((next..=file.last_line).map(|number| line(number, 0, false)));
    }

    tracing::debug!(
        functions = report.functions.len(),
        duplicates,
        lines = report.lines.len(),
        skipped = report.skipped.len(),
        fold = ?options.fold,
        "aggregated coverage"
    );

    Ok(report)
}

/// Evaluates the code regions of a function.
///
/// Returns the execution count of the function and the count of every code region. Without
/// counters, the function never ran and every region counts zero.
fn evaluate_function<'a>(
    mapping: &'a CoverageMapping,
    counters: Option<&[u64]>,
) -> Result<(u64, FunctionLines<'a>), Error> {
    let mut execution_count = None;
    let mut lines = Vec::new();

    for region in &mapping.regions {
        if region.kind != RegionKind::Code {
            continue;
        }

        let count = match counters {
            Some(counters) => region.counter.evaluate(counters)?,
            None => 0,
        };
        execution_count.get_or_insert(count);

        let filename = mapping
            .filenames
            .get(region.file_id as usize)
            .ok_or_else(|| {
                Error::new(ErrorKind::CorruptMapping)
                    .with_detail(format!("region in missing file id {}", region.file_id))
            })?;
        if region.end_line > MAX_LINE_NUMBER {
            return Err(Error::new(ErrorKind::CorruptMapping)
                .with_detail(format!("region ends at line {}", region.end_line)));
        }

        lines.push((filename.as_str(), region.start_line.max(1), region.end_line, count));
    }

    Ok((execution_count.unwrap_or(0), lines))
}

/// Identities of all mappings that have no profile record.
///
/// These functions were compiled into the binary but never executed.
pub fn unexecuted_functions(profile: &InstrProfile, mappings: &CoverageMappings) -> Vec<FunctionId> {
    let profiled: HashSet<_> = profile.records.iter().map(FunctionRecord::id).collect();
    let mut unexecuted: Vec<_> = mappings
        .functions
        .iter()
        .map(CoverageMapping::id)
        .filter(|id| !profiled.contains(id))
        .collect();
    unexecuted.sort();
    unexecuted.dedup();
    unexecuted
}

#[cfg(test)]
mod tests {
    use super::*;

    use instrprof_common::{ErrorPolicy, ProfileVersion};
    use instrprof_covmap::{CounterExpression, Region};
    use instrprof_profdata::ProfileFormat;

    use crate::report::LineFold;

    use CounterExpression::Counter;

    fn profile(records: Vec<FunctionRecord>) -> InstrProfile {
        let mut profile = InstrProfile::new(ProfileFormat::Indexed);
        profile.records = records;
        profile
    }

    fn mappings(functions: Vec<CoverageMapping>) -> CoverageMappings {
        CoverageMappings {
            functions,
            skipped: Vec::new(),
        }
    }

    fn mapping(name: &str, hash: u64, regions: Vec<Region>) -> CoverageMapping {
        CoverageMapping {
            function_name: name.into(),
            structural_hash: hash,
            version: ProfileVersion::Llvm14,
            filenames: vec!["main.c".into()],
            regions,
        }
    }

    fn counts(report: &CoverageReport) -> Vec<(u32, u64, bool)> {
        report
            .lines
            .iter()
            .map(|line| (line.line_number, line.execution_count, line.is_executable))
            .collect()
    }

    #[test]
    fn test_expressions() {
        let profile = profile(vec![FunctionRecord::new("main", 1, vec![10, 3])]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![
                Region::code(0, (1, 1), (1, 20), Counter(0)),
                Region::code(
                    0,
                    (2, 1),
                    (2, 20),
                    CounterExpression::subtract(Counter(0), Counter(1)),
                ),
                Region::code(
                    0,
                    (3, 1),
                    (3, 20),
                    CounterExpression::add(Counter(0), Counter(1)),
                ),
            ],
        )]);

        let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
        assert_eq!(
            counts(&report),
            [(1, 10, true), (2, 7, true), (3, 13, true)]
        );
        assert_eq!(report.functions[0].execution_count, 10);
        assert!(report.functions[0].has_profile);
    }

    #[test]
    fn test_overlapping_regions() {
        let profile = profile(vec![FunctionRecord::new("main", 1, vec![5, 9])]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![
                Region::code(0, (1, 1), (4, 2), Counter(0)),
                Region::code(0, (2, 5), (2, 9), Counter(1)),
            ],
        )]);

        let fold = |fold| {
            let options = CoverageOptions {
                fold,
                ..Default::default()
            };
            counts(&aggregate(&profile, &mappings, &options).unwrap())
        };

        assert_eq!(
            fold(LineFold::Max),
            [(1, 5, true), (2, 9, true), (3, 5, true), (4, 5, true)]
        );
        assert_eq!(fold(LineFold::Sum)[1], (2, 14, true));
        assert_eq!(fold(LineFold::Presence)[1], (2, 1, true));
    }

    #[test]
    fn test_non_code_regions() {
        let profile = profile(vec![FunctionRecord::new("main", 1, vec![4])]);
        let mut branch = Region::code(0, (6, 1), (6, 5), Counter(0)).with_kind(RegionKind::Branch);
        branch.false_counter = Some(CounterExpression::Zero);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![
                Region::code(0, (2, 1), (3, 1), Counter(0)),
                Region::code(0, (4, 1), (4, u32::MAX), CounterExpression::Zero)
                    .with_kind(RegionKind::Skipped),
                Region::code(0, (5, 1), (5, 2), Counter(0)).with_kind(RegionKind::Gap),
                branch,
            ],
        )]);

        let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
        assert_eq!(
            counts(&report),
            [(1, 0, false), (2, 4, true), (3, 4, true)]
        );
    }

    #[test]
    fn test_hash_mismatch() {
        let profile = profile(vec![FunctionRecord::new("main", 2, vec![1])]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![Region::code(0, (1, 1), (1, 2), Counter(0))],
        )]);

        for policy in [ErrorPolicy::Strict, ErrorPolicy::BestEffort] {
            let options = CoverageOptions {
                policy,
                ..Default::default()
            };
            let err = aggregate(&profile, &mappings, &options).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProfileBinaryMismatch);
            assert_eq!(err.function(), Some(&FunctionId::new("main", 1)));
        }
    }

    #[test]
    fn test_unexecuted_function() {
        let profile = profile(vec![]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![Region::code(0, (2, 1), (2, 2), Counter(3))],
        )]);

        let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
        assert_eq!(counts(&report), [(1, 0, false), (2, 0, true)]);
        assert!(!report.functions[0].has_profile);
        assert_eq!(
            unexecuted_functions(&profile, &mappings),
            [FunctionId::new("main", 1)]
        );
    }

    #[test]
    fn test_counter_out_of_range() {
        let profile = profile(vec![
            FunctionRecord::new("main", 1, vec![1]),
            FunctionRecord::new("other", 2, vec![1]),
        ]);
        let mappings = mappings(vec![
            mapping("main", 1, vec![Region::code(0, (1, 1), (1, 2), Counter(1))]),
            mapping("other", 2, vec![Region::code(0, (3, 1), (3, 2), Counter(0))]),
        ]);

        let err = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);

        let options = CoverageOptions {
            policy: ErrorPolicy::BestEffort,
            ..Default::default()
        };
        let report = aggregate(&profile, &mappings, &options).unwrap();
        assert_eq!(report.num_skipped(), 1);
        assert_eq!(
            report.skipped[0].function,
            Some(FunctionId::new("main", 1))
        );
        assert_eq!(report.functions.len(), 1);
        assert_eq!(counts(&report), [(1, 0, false), (2, 0, false), (3, 1, true)]);
    }

    #[test]
    fn test_duplicate_mappings() {
        let profile = profile(vec![FunctionRecord::new("inline", 1, vec![2])]);
        let first = mapping("inline", 1, vec![Region::code(0, (1, 1), (1, 2), Counter(0))]);
        let mut second = first.clone();
        second.regions[0].start_line = 5;
        second.regions[0].end_line = 5;

        let report = aggregate(
            &profile,
            &mappings(vec![first, second]),
            &CoverageOptions {
                fold: LineFold::Sum,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.functions.len(), 1);
        assert_eq!(counts(&report), [(1, 2, true)]);
    }

    #[test]
    fn test_context_sensitive_records_ignored() {
        let mut cs_record = FunctionRecord::new("main", 1, vec![100]);
        cs_record.set_cs_flag();
        let profile = profile(vec![cs_record]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![Region::code(0, (1, 1), (1, 2), Counter(0))],
        )]);

        // the record's hash differs only by the flag, which is not a mismatch
        let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
        assert_eq!(counts(&report), [(1, 0, true)]);
        assert!(!report.functions[0].has_profile);
    }

    #[test]
    fn test_huge_line_numbers() {
        let profile = profile(vec![FunctionRecord::new("main", 1, vec![1])]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![Region::code(0, (1, 1), (u32::MAX, 1), Counter(0))],
        )]);
        let err = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_unexecuted_function_with_huge_counter_index() {
        let profile = profile(vec![]);
        let mappings = mappings(vec![mapping(
            "main",
            1,
            vec![Region::code(0, (1, 1), (2, 2), Counter(u32::MAX - 1))],
        )]);

        let report = aggregate(&profile, &mappings, &CoverageOptions::default()).unwrap();
        assert_eq!(counts(&report), [(1, 0, true), (2, 0, true)]);
        assert_eq!(report.functions[0].execution_count, 0);
    }

    #[test]
    fn test_fold_regions() {
        let regions = [(1, 10, 3), (4, 6, 8), (6, 6, 1), (20, 21, 0)];

        let span = |start, end, count| LineSpan { start, end, count };
        assert_eq!(
            fold_regions(&regions, LineFold::Max),
            [
                span(1, 3, 3),
                span(4, 5, 8),
                span(6, 6, 8),
                span(7, 10, 3),
                span(20, 21, 0),
            ]
        );
        assert_eq!(fold_regions(&regions, LineFold::Sum)[2], span(6, 6, 12));
        assert_eq!(fold_regions(&regions, LineFold::Presence)[4], span(20, 21, 0));
    }

    #[test]
    fn test_fold_regions_spanning_all_lines() {
        let regions: Vec<_> = (0..10_000)
            .map(|count| (1, MAX_LINE_NUMBER, count))
            .collect();
        assert_eq!(
            fold_regions(&regions, LineFold::Sum),
            [LineSpan {
                start: 1,
                end: MAX_LINE_NUMBER,
                count: (0..10_000).sum(),
            }]
        );
    }
}
