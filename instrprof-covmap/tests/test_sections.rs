use similar_asserts::assert_eq;

use instrprof_common::{ErrorKind, ProfileVersion, ReadOptions};
use instrprof_covmap::{
    CounterExpression, CoverageMapping, CoverageMappings, MappingWriter, Region, RegionKind,
};

fn mapping(name: &str, hash: u64, regions: Vec<Region>) -> CoverageMapping {
    CoverageMapping {
        function_name: name.into(),
        structural_hash: hash,
        version: ProfileVersion::Llvm14,
        filenames: vec!["lib/parse.c".into()],
        regions,
    }
}

fn write(mappings: Vec<CoverageMapping>) -> Vec<u8> {
    let mut writer = MappingWriter::new(ProfileVersion::Llvm14)
        .compilation_dir("/home/build")
        .compress_filenames(true);
    for mapping in mappings {
        writer.add_function(mapping);
    }
    let mut out = Vec::new();
    writer.serialize(&mut out).unwrap();
    out
}

#[test]
fn test_big_endian_section() {
    let mut data = Vec::new();
    data.extend_from_slice(b"MVOC");
    data.extend_from_slice(&11u32.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    // one filename: "a.c"
    data.extend_from_slice(&5u32.to_be_bytes());
    data.extend_from_slice(&[1, 3, b'a', b'.', b'c', 0, 0, 0]);
    // record "f" with hash 0x0102030405060708
    data.extend_from_slice(&[1, b'f']);
    data.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
    let regions = [1, 0, 0, 1, 1, 2, 1, 0, 7];
    data.extend_from_slice(&(regions.len() as u32).to_be_bytes());
    data.extend_from_slice(&regions);

    let mappings = CoverageMappings::parse(&data, &ReadOptions::default()).unwrap();
    let mapping = mappings.get("f", 0x0102_0304_0506_0708).unwrap();
    assert_eq!(mapping.filename(), Some("a.c"));
    assert_eq!(
        mapping.regions,
        vec![Region::code(0, (2, 1), (2, 7), CounterExpression::Counter(0))]
    );
}

#[test]
fn test_best_effort_keeps_other_functions() {
    let good = mapping(
        "parse",
        1,
        vec![Region::code(0, (10, 1), (20, 2), CounterExpression::Counter(0))],
    );
    let bad = mapping(
        "broken",
        2,
        vec![Region::code(0, (30, 5), (31, 1), CounterExpression::Counter(0))],
    );
    let mut data = write(vec![good.clone(), bad, good.clone()]);

    // make the broken record's region end on its first line, before its start column
    let name_at = data
        .windows(6)
        .position(|window| window == b"broken")
        .unwrap();
    // name, hash and data size precede the record data, which ends in the region
    let data_size_at = name_at + 6 + 8;
    let data_size = u32::from_le_bytes(data[data_size_at..data_size_at + 4].try_into().unwrap());
    let region_end = data_size_at + 4 + data_size as usize;
    // the end column is the last byte, the line count the one before
    data[region_end - 2] = 0;

    let err = CoverageMappings::parse(&data, &ReadOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptMapping);

    let mappings = CoverageMappings::parse(&data, &ReadOptions::best_effort()).unwrap();
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings.skipped.len(), 1);
    assert_eq!(mappings.skipped[0].function.as_ref().unwrap().name, "broken");
    assert_eq!(
        mappings.functions[0].filenames,
        ["/home/build/lib/parse.c"]
    );
}

#[test]
fn test_region_kinds_survive() {
    let regions = vec![
        Region::code(0, (1, 1), (40, 1), CounterExpression::Counter(0)),
        Region::code(0, (2, 1), (2, u32::MAX), CounterExpression::Zero)
            .with_kind(RegionKind::Skipped),
        Region::code(0, (3, 4), (5, 1), CounterExpression::Counter(1)).with_kind(RegionKind::Gap),
    ];
    let mut expected = mapping("kinds", 3, regions.clone());
    let data = write(vec![expected.clone()]);

    let mappings = CoverageMappings::parse(&data, &ReadOptions::default()).unwrap();
    expected.filenames = vec!["/home/build/lib/parse.c".into()];
    assert_eq!(mappings.functions, vec![expected]);
}
