use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::record::{FunctionRecord, ValueKind};

/// Cutoffs are expressed in parts per million of the total count.
pub const CUTOFF_SCALE: u64 = 1_000_000;

/// The cutoffs used for detailed summaries unless others are requested.
pub const DEFAULT_CUTOFFS: [u32; 16] = [
    10_000, 100_000, 200_000, 300_000, 400_000, 500_000, 600_000, 700_000, 800_000, 900_000,
    950_000, 990_000, 999_000, 999_900, 999_990, 999_999,
];

/// One row of a detailed summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SummaryEntry {
    /// The share of the total count, in parts per million.
    pub cutoff: u32,
    /// The smallest count among the hottest counters that make up the cutoff.
    pub min_count: u64,
    /// The number of counters needed to reach the cutoff.
    pub num_counts: u64,
}

/// Summary statistics over the counters of a profile.
///
/// The first counter of every record is its entry count and contributes to the function
/// statistics, all others to the block statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    total_count: u64,
    max_count: u64,
    max_function_count: u64,
    max_internal_block_count: u64,
    num_counts: u64,
    num_functions: u64,
    #[serde(skip)]
    count_frequencies: BTreeMap<u64, u64>,
}

impl ProfileSummary {
    /// Creates an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_count(&mut self, count: u64) {
        self.total_count = self.total_count.saturating_add(count);
        self.max_count = self.max_count.max(count);
        self.num_counts += 1;
        *self.count_frequencies.entry(count).or_default() += 1;
    }

    /// Adds the counters of a record.
    pub fn add_record(&mut self, record: &FunctionRecord) {
        let Some((&entry, blocks)) = record.counters.split_first() else {
            return;
        };

        self.num_functions += 1;
        self.add_count(entry);
        self.max_function_count = self.max_function_count.max(entry);

        for &count in blocks {
            self.add_count(count);
            self.max_internal_block_count = self.max_internal_block_count.max(count);
        }
    }

    /// The sum of all counts, saturating at `u64::MAX`.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// The largest count.
    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    /// The largest entry count of any function.
    pub fn max_function_count(&self) -> u64 {
        self.max_function_count
    }

    /// The largest count of any non-entry block.
    pub fn max_internal_block_count(&self) -> u64 {
        self.max_internal_block_count
    }

    /// The number of counters.
    pub fn num_counts(&self) -> u64 {
        self.num_counts
    }

    /// The number of records with at least one counter.
    pub fn num_functions(&self) -> u64 {
        self.num_functions
    }

    /// Computes how many of the hottest counters are needed to reach each cutoff.
    ///
    /// Counters are visited in descending order of their count. For each cutoff, as many counters
    /// are taken as needed for their sum to reach `total_count * cutoff / 1_000_000`.
    pub fn detailed_summary(&self, cutoffs: &[u32]) -> Vec<SummaryEntry> {
        let mut cutoffs = cutoffs.to_vec();
        cutoffs.sort_unstable();

        let mut frequencies = self.count_frequencies.iter().rev();
        let mut current_sum = 0u128;
        let mut counts_seen = 0u64;
        let mut count = 0u64;

        cutoffs
            .into_iter()
            .map(|cutoff| {
                let desired =
                    u128::from(self.total_count) * u128::from(cutoff) / u128::from(CUTOFF_SCALE);
                while current_sum < desired {
                    let Some((&next, &frequency)) = frequencies.next() else {
                        break;
                    };
                    count = next;
                    current_sum += u128::from(next) * u128::from(frequency);
                    counts_seen += frequency;
                }

                SummaryEntry {
                    cutoff,
                    min_count: count,
                    num_counts: counts_seen,
                }
            })
            .collect()
    }
}

/// Statistics over the value profiling sites of one kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValueSiteStats {
    /// The number of sites.
    pub total_sites: u64,
    /// The number of sites that observed at least one value.
    pub sites_with_values: u64,
    /// The number of distinct values over all sites.
    pub total_values: u64,
    /// How many sites observed a given number of distinct values.
    pub histogram: BTreeMap<usize, u64>,
}

impl ValueSiteStats {
    /// Adds the sites of the given kind of a record.
    pub fn add_record(&mut self, record: &FunctionRecord, kind: ValueKind) {
        let Some(ref values) = record.values else {
            return;
        };

        for site in values.sites(kind) {
            self.total_sites += 1;
            if !site.is_empty() {
                self.sites_with_values += 1;
            }
            self.total_values += site.len() as u64;
            *self.histogram.entry(site.len()).or_default() += 1;
        }
    }
}

impl fmt::Display for ValueSiteStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Total number of sites: {}", self.total_sites)?;
        writeln!(
            f,
            "  Total number of sites with values: {}",
            self.sites_with_values
        )?;
        writeln!(f, "  Total number of profiled values: {}", self.total_values)?;
        writeln!(f, "  Value sites histogram:")?;
        writeln!(f, "\tNumTargets, SiteCount")?;
        for (targets, sites) in &self.histogram {
            writeln!(f, "\t{targets}, {sites}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::record::{ValueData, ValueProfile};

    #[test]
    fn test_summary() {
        let mut summary = ProfileSummary::new();
        summary.add_record(&FunctionRecord::new("main", 1, vec![10, 3, 0]));
        summary.add_record(&FunctionRecord::new("foo", 2, vec![4, 20]));
        summary.add_record(&FunctionRecord::new("empty", 3, vec![]));

        assert_eq!(summary.total_count(), 37);
        assert_eq!(summary.max_count(), 20);
        assert_eq!(summary.max_function_count(), 10);
        assert_eq!(summary.max_internal_block_count(), 20);
        assert_eq!(summary.num_counts(), 5);
        assert_eq!(summary.num_functions(), 2);
    }

    #[test]
    fn test_detailed_summary() {
        let mut summary = ProfileSummary::new();
        summary.add_record(&FunctionRecord::new("main", 1, vec![50, 30, 10, 10]));

        // 50% is reached by the hottest counter, 90% needs the two tens as well
        let entries = summary.detailed_summary(&[900_000, 500_000, 0]);
        assert_eq!(
            entries,
            vec![
                SummaryEntry {
                    cutoff: 0,
                    min_count: 0,
                    num_counts: 0,
                },
                SummaryEntry {
                    cutoff: 500_000,
                    min_count: 50,
                    num_counts: 1,
                },
                SummaryEntry {
                    cutoff: 900_000,
                    min_count: 10,
                    num_counts: 4,
                },
            ]
        );

        let entries = summary.detailed_summary(&DEFAULT_CUTOFFS);
        assert_eq!(entries.len(), DEFAULT_CUTOFFS.len());
        assert_eq!(entries.last().unwrap().num_counts, 4);
    }

    #[test]
    fn test_value_site_stats() {
        let mut record = FunctionRecord::new("main", 1, vec![1]);
        record.values = Some(ValueProfile {
            indirect_call_targets: vec![
                vec![ValueData::default(), ValueData { value: 1, count: 1 }],
                vec![],
            ],
            mem_op_sizes: vec![],
        });

        let mut stats = ValueSiteStats::default();
        stats.add_record(&record, ValueKind::IndirectCallTarget);
        assert_eq!(stats.total_sites, 2);
        assert_eq!(stats.sites_with_values, 1);
        assert_eq!(stats.total_values, 2);

        assert_eq!(
            stats.to_string(),
            "  Total number of sites: 2\n\
             \x20 Total number of sites with values: 1\n\
             \x20 Total number of profiled values: 2\n\
             \x20 Value sites histogram:\n\
             \tNumTargets, SiteCount\n\
             \t0, 1\n\
             \t2, 1\n"
        );
    }
}
