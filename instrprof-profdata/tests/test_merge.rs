use proptest::prelude::*;

use instrprof_profdata::{
    merge_profiles, read_profiles_parallel, write_text, FunctionRecord, InstrProfile,
    ProfileFormat, ProfileKind, ReadOptions,
};

const NAMES: [&str; 3] = ["main", "foo", "bar"];

/// Records with equal identity always have the same number of counters.
fn record() -> impl Strategy<Value = FunctionRecord> {
    (0..NAMES.len(), 0u64..3, prop::array::uniform3(any::<u64>())).prop_map(
        |(name, hash, counts)| {
            let len = (name + hash as usize) % 3 + 1;
            FunctionRecord::new(NAMES[name], hash, counts[..len].to_vec())
        },
    )
}

fn profile() -> impl Strategy<Value = InstrProfile> {
    (prop::collection::vec(record(), 0..6), any::<bool>()).prop_map(|(records, ir)| {
        let mut profile = InstrProfile::new(ProfileFormat::Raw);
        profile.kind = ProfileKind {
            ir,
            ..Default::default()
        };
        profile.records = records;
        profile
    })
}

fn merged(a: &InstrProfile, b: &InstrProfile) -> InstrProfile {
    let mut result = a.clone();
    result.merge(b).unwrap();
    result
}

proptest! {
    #[test]
    fn prop_merge_commutative(a in profile(), b in profile()) {
        prop_assert_eq!(merged(&a, &b), merged(&b, &a));
    }

    #[test]
    fn prop_merge_associative(a in profile(), b in profile(), c in profile()) {
        let left = merged(&merged(&a, &b), &c);
        let right = merged(&a, &merged(&b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_merge_saturates(a in profile(), b in profile()) {
        let result = merged(&a, &b);
        for record in &result.records {
            for input in a.records.iter().chain(&b.records) {
                if input.id() == record.id() {
                    for (sum, original) in record.counters.iter().zip(&input.counters) {
                        prop_assert!(sum >= original);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_parallel_matches_sequential(profiles in prop::collection::vec(profile(), 1..6)) {
        let texts: Vec<String> = profiles
            .iter()
            .map(|profile| write_text(profile).unwrap())
            .collect();
        let inputs: Vec<&[u8]> = texts.iter().map(|text| text.as_bytes()).collect();

        let parallel = read_profiles_parallel(&inputs, &ReadOptions::default()).unwrap();
        let sequential = merge_profiles(profiles).unwrap();
        prop_assert_eq!(parallel.records, sequential.records);
        prop_assert_eq!(parallel.kind, sequential.kind);
    }
}
