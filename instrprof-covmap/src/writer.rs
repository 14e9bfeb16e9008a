use std::io::Write;

use indexmap::IndexSet;
use watto::Writer;

use instrprof_common::{write_chunk, Error, ErrorKind, ProfileVersion};

use crate::expression::ExpressionEncoder;
use crate::mapping::{
    CoverageMapping, Region, RegionKind, EXPANSION_BIT, GAP_BIT, MAPPING_MAGIC, PSEUDO_KIND_BRANCH,
    PSEUDO_KIND_SHIFT, PSEUDO_KIND_SKIPPED,
};

fn write_uleb(out: &mut Vec<u8>, value: u64) -> Result<(), Error> {
    leb128::write::unsigned(out, value)
        .map(|_| ())
        .map_err(|e| Error::new(ErrorKind::WriteFailed).with_source(e))
}

fn invalid(mapping: &CoverageMapping, detail: String) -> Error {
    Error::new(ErrorKind::WriteFailed)
        .in_function(mapping.function_name.clone(), mapping.structural_hash)
        .with_detail(detail)
}

/// Serializes function mappings into a little-endian coverage mapping section.
///
/// Regions are stored grouped by file id and ordered by start line within each file, which is the
/// order [`CoverageMappings::parse`](crate::CoverageMappings::parse) returns them in.
#[derive(Clone, Debug)]
pub struct MappingWriter {
    version: ProfileVersion,
    compress_filenames: bool,
    compilation_dir: String,
    functions: Vec<CoverageMapping>,
}

impl MappingWriter {
    /// Creates an empty section of the given version.
    pub fn new(version: ProfileVersion) -> Self {
        Self {
            version,
            compress_filenames: false,
            compilation_dir: String::new(),
            functions: Vec::new(),
        }
    }

    /// Whether the filename table should be zlib compressed, where the version supports it.
    pub fn compress_filenames(mut self, compress: bool) -> Self {
        self.compress_filenames = compress;
        self
    }

    /// Sets the compilation directory stored as the first filename by newer versions.
    pub fn compilation_dir(mut self, dir: impl Into<String>) -> Self {
        self.compilation_dir = dir.into();
        self
    }

    /// Adds the mapping of a function.
    pub fn add_function(&mut self, mapping: CoverageMapping) {
        self.functions.push(mapping);
    }

    /// Writes the section into `writer`.
    ///
    /// Fails with [`ErrorKind::WriteFailed`] if a mapping cannot be represented, for instance
    /// because a region refers to a file id the mapping does not have.
    #[tracing::instrument(level = "trace", name = "MappingWriter::serialize", skip_all)]
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        let schema = &self.version.schema().mapping;
        let write_failed = |e: std::io::Error| Error::new(ErrorKind::WriteFailed).with_source(e);

        let mut filenames = IndexSet::new();
        if schema.compilation_dir {
            filenames.insert(self.compilation_dir.as_str());
        } else if !self.compilation_dir.is_empty() {
            tracing::warn!(version = %self.version, "dropping compilation directory");
        }

        let mut records = Vec::new();
        for mapping in &self.functions {
            let file_indices: Vec<_> = mapping
                .filenames
                .iter()
                .map(|name| filenames.insert_full(name.as_str()).0)
                .collect();
            let data = encode_function(mapping, &file_indices, schema.branch_regions)?;

            write_uleb(&mut records, mapping.function_name.len() as u64)?;
            records.extend_from_slice(mapping.function_name.as_bytes());
            records.extend_from_slice(&mapping.structural_hash.to_le_bytes());
            let data_size = u32::try_from(data.len())
                .map_err(|_| invalid(mapping, "mapping data is too large".into()))?;
            records.extend_from_slice(&data_size.to_le_bytes());
            records.extend_from_slice(&data);
            if schema.aligned_records {
                records.resize(instrprof_common::align_up(records.len(), 8), 0);
            }
        }

        let mut names = Vec::new();
        for name in &filenames {
            write_uleb(&mut names, name.len() as u64)?;
            names.extend_from_slice(name.as_bytes());
        }
        let mut filename_table = Vec::new();
        write_uleb(&mut filename_table, filenames.len() as u64)?;
        if schema.compressed_filenames {
            write_chunk(&names, self.compress_filenames, &mut filename_table)?;
        } else {
            filename_table.extend_from_slice(&names);
        }

        let too_large = |what: &str| {
            Error::new(ErrorKind::WriteFailed).with_detail(format!("{what} exceeds 32 bits"))
        };
        let num_records =
            u32::try_from(self.functions.len()).map_err(|_| too_large("number of records"))?;
        let filenames_size =
            u32::try_from(filename_table.len()).map_err(|_| too_large("filename table"))?;

        let mut writer = Writer::new(writer);
        writer.write_all(&MAPPING_MAGIC).map_err(write_failed)?;
        writer
            .write_all(&(self.version.tag() as u32).to_le_bytes())
            .map_err(write_failed)?;
        writer
            .write_all(&num_records.to_le_bytes())
            .map_err(write_failed)?;
        writer
            .write_all(&filenames_size.to_le_bytes())
            .map_err(write_failed)?;
        writer.write_all(&filename_table).map_err(write_failed)?;
        writer.align_to(8).map_err(write_failed)?;
        writer.write_all(&records).map_err(write_failed)?;

        tracing::debug!(
            functions = self.functions.len(),
            filenames = filenames.len(),
            "wrote coverage mapping section"
        );

        Ok(())
    }
}

fn encode_function(
    mapping: &CoverageMapping,
    file_indices: &[usize],
    branch_regions: bool,
) -> Result<Vec<u8>, Error> {
    let mut regions: Vec<&Region> = mapping.regions.iter().collect();
    regions.sort_by_key(|region| (region.file_id, region.start_line));

    for region in &regions {
        if region.file_id as usize >= file_indices.len() {
            return Err(invalid(
                mapping,
                format!("region refers to missing file id {}", region.file_id),
            ));
        }
        if !region.is_well_formed() {
            return Err(invalid(mapping, "region ends before it starts".into()));
        }
    }

    let mut expressions = ExpressionEncoder::default();
    let mut encoded_regions = Vec::new();
    for file_id in 0..file_indices.len() as u32 {
        let file_regions: Vec<_> = regions.iter().filter(|r| r.file_id == file_id).collect();
        write_uleb(&mut encoded_regions, file_regions.len() as u64)?;

        let mut previous_line = 0;
        for region in file_regions {
            encode_region(
                mapping,
                region,
                &mut expressions,
                branch_regions,
                file_indices.len(),
                &mut encoded_regions,
            )?;
            write_uleb(&mut encoded_regions, u64::from(region.start_line - previous_line))?;

            let (start_col, end_col) = if (region.start_col, region.end_col) == (1, u32::MAX) {
                (0, 0)
            } else if region.end_col & GAP_BIT != 0 {
                return Err(invalid(mapping, format!("column {} is too large", region.end_col)));
            } else {
                (region.start_col, region.end_col)
            };
            let end_col = if region.kind == RegionKind::Gap {
                end_col | GAP_BIT
            } else {
                end_col
            };

            write_uleb(&mut encoded_regions, start_col.into())?;
            write_uleb(
                &mut encoded_regions,
                u64::from(region.end_line - region.start_line),
            )?;
            write_uleb(&mut encoded_regions, end_col.into())?;
            previous_line = region.start_line;
        }
    }

    let mut data = Vec::new();
    write_uleb(&mut data, file_indices.len() as u64)?;
    for &index in file_indices {
        write_uleb(&mut data, index as u64)?;
    }
    write_uleb(&mut data, expressions.entries().len() as u64)?;
    for &(lhs, rhs) in expressions.entries() {
        write_uleb(&mut data, lhs)?;
        write_uleb(&mut data, rhs)?;
    }
    data.extend_from_slice(&encoded_regions);

    Ok(data)
}

/// Writes the counter, or the pseudo counter describing the kind, of a region.
fn encode_region(
    mapping: &CoverageMapping,
    region: &Region,
    expressions: &mut ExpressionEncoder,
    branch_regions: bool,
    num_files: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    match region.kind {
        RegionKind::Code | RegionKind::Gap => write_uleb(out, expressions.encode(&region.counter)),
        RegionKind::Expansion => {
            let expanded = region
                .expanded_file_id
                .filter(|&id| (id as usize) < num_files)
                .ok_or_else(|| invalid(mapping, "expansion without a valid file id".into()))?;
            write_uleb(out, (u64::from(expanded) << PSEUDO_KIND_SHIFT) | EXPANSION_BIT)
        }
        RegionKind::Skipped => write_uleb(out, PSEUDO_KIND_SKIPPED << PSEUDO_KIND_SHIFT),
        RegionKind::Branch => {
            if !branch_regions {
                return Err(invalid(
                    mapping,
                    "branch regions are not supported by this version".into(),
                ));
            }
            write_uleb(out, PSEUDO_KIND_BRANCH << PSEUDO_KIND_SHIFT)?;
            let false_counter = region
                .false_counter
                .clone()
                .unwrap_or(crate::CounterExpression::Zero);
            let true_counter = expressions.encode(&region.counter);
            let false_counter = expressions.encode(&false_counter);
            write_uleb(out, true_counter)?;
            write_uleb(out, false_counter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use instrprof_common::ReadOptions;

    use crate::{CounterExpression, CoverageMappings};

    use CounterExpression::Counter;

    fn mapping(version: ProfileVersion) -> CoverageMapping {
        let mut branch = Region::code(0, (4, 8), (4, 20), Counter(1)).with_kind(RegionKind::Branch);
        branch.false_counter = Some(CounterExpression::subtract(Counter(0), Counter(1)));

        let mut expansion = Region::code(0, (6, 3), (6, 10), CounterExpression::Zero)
            .with_kind(RegionKind::Expansion);
        expansion.expanded_file_id = Some(1);

        CoverageMapping {
            function_name: "main".into(),
            structural_hash: 0xfeed,
            version,
            filenames: vec!["/src/main.c".into(), "/src/macros.h".into()],
            regions: vec![
                Region::code(0, (3, 12), (9, 2), Counter(0)),
                branch,
                Region::code(0, (5, 1), (5, u32::MAX), CounterExpression::Zero)
                    .with_kind(RegionKind::Skipped),
                expansion,
                Region::code(0, (7, 1), (8, 4), Counter(0)).with_kind(RegionKind::Gap),
                Region::code(
                    1,
                    (1, 1),
                    (1, 30),
                    CounterExpression::add(Counter(0), Counter(2)),
                ),
            ],
        }
    }

    fn write(writer: &MappingWriter) -> Vec<u8> {
        let mut out = Vec::new();
        writer.serialize(&mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip() {
        for version in [
            ProfileVersion::Llvm12,
            ProfileVersion::Llvm13,
            ProfileVersion::Llvm14,
        ] {
            for compress in [false, true] {
                let mut writer = MappingWriter::new(version).compress_filenames(compress);
                writer.add_function(mapping(version));
                let section = write(&writer);

                let mappings = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap();
                assert_eq!(mappings.functions, vec![mapping(version)]);
            }
        }
    }

    #[test]
    fn test_branch_regions_need_version_12() {
        let mut writer = MappingWriter::new(ProfileVersion::Llvm11);
        writer.add_function(mapping(ProfileVersion::Llvm11));
        let err = writer.serialize(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
    }

    #[test]
    fn test_shared_filenames() {
        let mut writer = MappingWriter::new(ProfileVersion::Llvm11);
        let mut other = mapping(ProfileVersion::Llvm11);
        other.regions.retain(|region| region.kind != RegionKind::Branch);
        other.function_name = "other".into();
        writer.add_function(other.clone());
        other.function_name = "third".into();
        writer.add_function(other);

        let mappings = CoverageMappings::parse(&write(&writer), &ReadOptions::default()).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings.functions[1].filename(), Some("/src/main.c"));
        assert_eq!(mappings.functions[1].filenames[1], "/src/macros.h");
    }

    #[test]
    fn test_compilation_dir() {
        let mut mapping = mapping(ProfileVersion::Llvm13);
        mapping.filenames = vec!["src/main.c".into(), "/usr/include/macros.h".into()];

        let mut writer = MappingWriter::new(ProfileVersion::Llvm13).compilation_dir("/build");
        writer.add_function(mapping);

        let mappings = CoverageMappings::parse(&write(&writer), &ReadOptions::default()).unwrap();
        assert_eq!(
            mappings.functions[0].filenames,
            ["/build/src/main.c", "/usr/include/macros.h"]
        );
    }

    #[test]
    fn test_concatenated_sections() {
        let mut first = MappingWriter::new(ProfileVersion::Llvm12);
        first.add_function(mapping(ProfileVersion::Llvm12));
        let mut second = MappingWriter::new(ProfileVersion::Llvm14);
        second.add_function(mapping(ProfileVersion::Llvm14));

        let mut data = write(&first);
        data.resize(instrprof_common::align_up(data.len(), 8), 0);
        data.extend_from_slice(&write(&second));
        data.extend_from_slice(&[0; 8]);

        let mappings = CoverageMappings::parse(&data, &ReadOptions::default()).unwrap();
        let versions: Vec<_> = mappings.functions.iter().map(|m| m.version).collect();
        assert_eq!(versions, [ProfileVersion::Llvm12, ProfileVersion::Llvm14]);
    }

    #[test]
    fn test_missing_file_id() {
        let mut mapping = mapping(ProfileVersion::Llvm12);
        mapping.filenames.truncate(1);

        let mut writer = MappingWriter::new(ProfileVersion::Llvm12);
        writer.add_function(mapping);
        let err = writer.serialize(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert_eq!(err.function().unwrap().name, "main");
    }
}
