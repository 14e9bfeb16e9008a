use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use instrprof_common::{Error, ErrorKind, FunctionId, ProfileVersion, Skipped};

use crate::compat::ProfileFormat;
use crate::summary::ProfileSummary;

/// Bit of the structural hash that flags a context sensitive record.
const CS_FLAG_IN_FUNC_HASH: u64 = 60;

/// The number of bits of the version word that hold the version tag.
const VERSION_TAG_BITS: u32 = 56;

const VARIANT_MASK_IR_PROF: u64 = 1 << 56;
const VARIANT_MASK_CSIR_PROF: u64 = 1 << 57;
const VARIANT_MASK_INSTR_ENTRY: u64 = 1 << 58;

/// The kind of a value profiling site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Targets of indirect calls.
    IndirectCallTarget = 0,
    /// Sizes passed to memory intrinsics such as `memcpy`.
    MemOpSize = 1,
}

impl ValueKind {
    /// All value kinds, in encoding order.
    pub const ALL: [ValueKind; 2] = [ValueKind::IndirectCallTarget, ValueKind::MemOpSize];

    /// Resolves the numeric identifier used in all encodings.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ValueKind::IndirectCallTarget),
            1 => Some(ValueKind::MemOpSize),
            _ => None,
        }
    }

    /// The numeric identifier used in all encodings.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A single profiled value and how often it was observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueData {
    /// The observed value, for example a call target address.
    pub value: u64,
    /// How often the value was observed.
    pub count: u64,
}

/// All values observed at one value profiling site.
pub type ValueSite = Vec<ValueData>;

/// Value profiling data of a single function.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueProfile {
    /// Indirect call sites.
    pub indirect_call_targets: Vec<ValueSite>,
    /// Memory intrinsic call sites.
    pub mem_op_sizes: Vec<ValueSite>,
}

impl ValueProfile {
    /// The sites of the given kind.
    pub fn sites(&self, kind: ValueKind) -> &[ValueSite] {
        match kind {
            ValueKind::IndirectCallTarget => &self.indirect_call_targets,
            ValueKind::MemOpSize => &self.mem_op_sizes,
        }
    }

    /// Mutable access to the sites of the given kind.
    pub fn sites_mut(&mut self, kind: ValueKind) -> &mut Vec<ValueSite> {
        match kind {
            ValueKind::IndirectCallTarget => &mut self.indirect_call_targets,
            ValueKind::MemOpSize => &mut self.mem_op_sizes,
        }
    }

    /// Returns `true` if there are no sites of any kind.
    pub fn is_empty(&self) -> bool {
        ValueKind::ALL.iter().all(|&kind| self.sites(kind).is_empty())
    }

    /// Adds the values of `other` site by site.
    ///
    /// Counts of equal values are summed, saturating at `u64::MAX`. Afterwards, every site lists
    /// each value once, in ascending order.
    pub fn merge(&mut self, other: &ValueProfile) -> Result<(), Error> {
        for kind in ValueKind::ALL {
            let theirs = other.sites(kind);
            let ours = self.sites_mut(kind);
            if ours.len() != theirs.len() {
                return Err(Error::new(ErrorKind::CounterCountMismatch).with_detail(format!(
                    "{} {kind:?} sites cannot be merged with {}",
                    ours.len(),
                    theirs.len()
                )));
            }

            for (site, other_site) in ours.iter_mut().zip(theirs) {
                *site = merge_sites(site, other_site);
            }
        }
        Ok(())
    }

    /// Collapses duplicate values in every site and orders them by value.
    pub fn normalize(&mut self) {
        for kind in ValueKind::ALL {
            for site in self.sites_mut(kind) {
                *site = merge_sites(site, &[]);
            }
        }
    }
}

fn merge_sites(a: &[ValueData], b: &[ValueData]) -> ValueSite {
    let mut merged = BTreeMap::new();
    for data in a.iter().chain(b) {
        let count: &mut u64 = merged.entry(data.value).or_default();
        *count = count.saturating_add(data.count);
    }
    merged
        .into_iter()
        .map(|(value, count)| ValueData { value, count })
        .collect()
}

/// The execution counts of a single function.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// The (possibly mangled) function name.
    pub name: String,
    /// The structural hash of the function's control flow.
    pub hash: u64,
    /// One execution count per instrumented counter.
    pub counters: Vec<u64>,
    /// Value profiling data, if the encoding carries any for this function.
    pub values: Option<ValueProfile>,
}

impl FunctionRecord {
    /// Creates a record without value profiling data.
    pub fn new(name: impl Into<String>, hash: u64, counters: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            hash,
            counters,
            values: None,
        }
    }

    /// The identity of this record.
    pub fn id(&self) -> FunctionId {
        FunctionId::new(self.name.clone(), self.hash)
    }

    /// Whether the record stems from a context sensitive profiling pass.
    pub fn has_cs_flag(&self) -> bool {
        (self.hash >> CS_FLAG_IN_FUNC_HASH) & 1 != 0
    }

    /// Marks the record as context sensitive by setting the flag bit in its hash.
    pub fn set_cs_flag(&mut self) {
        self.hash |= 1 << CS_FLAG_IN_FUNC_HASH;
    }

    /// The number of value profiling sites of the given kind.
    pub fn num_value_sites(&self, kind: ValueKind) -> usize {
        self.values
            .as_ref()
            .map_or(0, |values| values.sites(kind).len())
    }

    /// How often the function was entered, which is stored in the first counter.
    pub fn entry_count(&self) -> Option<u64> {
        self.counters.first().copied()
    }

    /// Adds the counts of another record with the same identity.
    ///
    /// Counters are summed pairwise, saturating at `u64::MAX`. Records of differing length cannot
    /// be merged and fail with [`ErrorKind::CounterCountMismatch`].
    pub fn merge(&mut self, other: &FunctionRecord) -> Result<(), Error> {
        if self.counters.len() != other.counters.len() {
            return Err(Error::new(ErrorKind::CounterCountMismatch)
                .in_function(self.name.clone(), self.hash)
                .with_detail(format!(
                    "{} counters cannot be merged with {}",
                    self.counters.len(),
                    other.counters.len()
                )));
        }

        for (count, other) in self.counters.iter_mut().zip(&other.counters) {
            *count = count.saturating_add(*other);
        }

        if let Some(ref theirs) = other.values {
            match self.values {
                Some(ref mut ours) => ours
                    .merge(theirs)
                    .map_err(|e| e.in_function(self.name.clone(), self.hash))?,
                None => self.values = Some(theirs.clone()),
            }
        }

        if let Some(ref mut values) = self.values {
            values.normalize();
        }

        Ok(())
    }
}

/// Variant flags of a profile, carried in the high byte of the version word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ProfileKind {
    /// Counters were inserted at IR level instead of by the front-end.
    pub ir: bool,
    /// The profile contains context sensitive IR records.
    pub cs: bool,
    /// The first counter of every record is the function entry count.
    pub entry_first: bool,
}

impl ProfileKind {
    /// Splits a version word into the version tag and the variant flags.
    pub fn split_version(word: u64) -> (u64, ProfileKind) {
        let tag = word & ((1 << VERSION_TAG_BITS) - 1);
        let kind = ProfileKind {
            ir: word & VARIANT_MASK_IR_PROF != 0,
            cs: word & VARIANT_MASK_CSIR_PROF != 0,
            entry_first: word & VARIANT_MASK_INSTR_ENTRY != 0,
        };
        (tag, kind)
    }

    /// Combines a version tag with these flags into a version word.
    pub fn version_word(self, tag: u64) -> u64 {
        let mut word = tag;
        if self.ir {
            word |= VARIANT_MASK_IR_PROF;
        }
        if self.cs {
            word |= VARIANT_MASK_CSIR_PROF;
        }
        if self.entry_first {
            word |= VARIANT_MASK_INSTR_ENTRY;
        }
        word
    }

    /// The flags of a profile merged from profiles with these two kinds.
    pub fn union(self, other: ProfileKind) -> ProfileKind {
        ProfileKind {
            ir: self.ir || other.ir,
            cs: self.cs || other.cs,
            entry_first: self.entry_first || other.entry_first,
        }
    }
}

/// The compiler stage that inserted the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum InstrumentationLevel {
    /// Counters were inserted by the language front-end.
    FrontEnd,
    /// Counters were inserted into the intermediate representation.
    Ir,
}

impl fmt::Display for InstrumentationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrontEnd => write!(f, "Front-end"),
            Self::Ir => write!(f, "IR"),
        }
    }
}

/// A decoded execution count profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstrProfile {
    /// The encoding the profile was decoded from.
    pub format: ProfileFormat,
    /// The version of the producing toolchain. Text profiles do not record one.
    pub version: Option<ProfileVersion>,
    /// Variant flags.
    pub kind: ProfileKind,
    /// All function records, in input order.
    pub records: Vec<FunctionRecord>,
    /// Build ids of the profiled binaries, for raw profiles that record them.
    pub binary_ids: Vec<Vec<u8>>,
    /// Records that were dropped in best-effort mode.
    pub skipped: Vec<Skipped>,
}

impl InstrProfile {
    /// Creates an empty profile.
    pub fn new(format: ProfileFormat) -> Self {
        Self {
            format,
            version: None,
            kind: ProfileKind::default(),
            records: Vec::new(),
            binary_ids: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Whether counters were inserted at IR level.
    pub fn is_ir_level_profile(&self) -> bool {
        self.kind.ir
    }

    /// Whether the profile contains context sensitive records.
    pub fn has_csir_level_profile(&self) -> bool {
        self.kind.cs
    }

    /// The compiler stage that inserted the counters.
    pub fn level(&self) -> InstrumentationLevel {
        if self.is_ir_level_profile() {
            InstrumentationLevel::Ir
        } else {
            InstrumentationLevel::FrontEnd
        }
    }

    /// Returns all records with the given name.
    pub fn records_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a FunctionRecord> + 'a {
        self.records.iter().filter(move |record| record.name == name)
    }

    /// Returns the first record with the given identity.
    pub fn get(&self, name: &str, hash: u64) -> Option<&FunctionRecord> {
        self.records
            .iter()
            .find(|record| record.name == name && record.hash == hash)
    }

    /// Computes summary statistics over all records.
    pub fn summary(&self) -> ProfileSummary {
        let mut summary = ProfileSummary::new();
        for record in &self.records {
            summary.add_record(record);
        }
        summary
    }
}
