//! Merging of profiles from multiple runs.
//!
//! Merging sums the counters of records with equal identity and unions everything else. It is
//! associative and commutative, so profiles can be merged in any order or in parallel.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::thread;

use instrprof_common::{Error, FunctionId, ReadOptions};

use crate::compat::{read_profile_with, ProfileFormat};
use crate::record::{FunctionRecord, InstrProfile};

impl InstrProfile {
    /// Merges `other` into this profile.
    ///
    /// Afterwards, records are ordered by identity and every identity occurs once. The version is
    /// the newer of both versions, variant flags and binary ids are unioned.
    pub fn merge(&mut self, other: &InstrProfile) -> Result<(), Error> {
        let mut merged: BTreeMap<FunctionId, FunctionRecord> = BTreeMap::new();

        for record in self.records.iter().chain(&other.records).cloned() {
            match merged.get_mut(&record.id()) {
                Some(existing) => existing.merge(&record)?,
                None => {
                    let mut record = record;
                    if let Some(ref mut values) = record.values {
                        values.normalize();
                    }
                    merged.insert(record.id(), record);
                }
            }
        }

        self.records = merged.into_values().collect();
        self.format = self.format.max(other.format);
        self.version = self.version.max(other.version);
        self.kind = self.kind.union(other.kind);

        self.binary_ids.extend(other.binary_ids.iter().cloned());
        self.binary_ids.sort();
        self.binary_ids.dedup();

        self.skipped.extend(other.skipped.iter().cloned());
        self.skipped
            .sort_by(|a, b| (&a.function, &a.reason).cmp(&(&b.function, &b.reason)));

        Ok(())
    }
}

/// Merges any number of profiles into one.
///
/// Merging no profiles yields an empty indexed profile.
pub fn merge_profiles<I>(profiles: I) -> Result<InstrProfile, Error>
where
    I: IntoIterator<Item = InstrProfile>,
{
    // an empty raw profile is the neutral element of `merge`
    let mut merged = None;
    for profile in profiles {
        merged
            .get_or_insert_with(|| InstrProfile::new(ProfileFormat::Raw))
            .merge(&profile)?;
    }

    Ok(merged.unwrap_or_else(|| InstrProfile::new(ProfileFormat::Indexed)))
}

/// Decodes several profiles on multiple threads and merges them.
///
/// Inputs are split evenly over the available cores. The result does not depend on the split,
/// since merging is associative and commutative.
#[tracing::instrument(level = "trace", name = "read_profiles_parallel", skip_all)]
pub fn read_profiles_parallel(
    inputs: &[&[u8]],
    options: &ReadOptions,
) -> Result<InstrProfile, Error> {
    let threads = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(inputs.len())
        .max(1);
    let chunk_size = (inputs.len() + threads - 1) / threads;

    tracing::debug!(inputs = inputs.len(), threads, "decoding profiles");

    let partials = thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .chunks(chunk_size.max(1))
            .map(|chunk| {
                scope.spawn(move || {
                    let profiles = chunk
                        .iter()
                        .map(|data| read_profile_with(data, options))
                        .collect::<Result<Vec<_>, _>>()?;
                    merge_profiles(profiles)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    merge_profiles(partials)
}
