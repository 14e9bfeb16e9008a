//! Decoding of coverage mapping sections.

use std::ops::RangeInclusive;

use scroll::Endian;
use serde::Serialize;

use instrprof_common::{
    join_path, read_chunk, Error, ErrorKind, FunctionId, MappingSchema, ProfileVersion,
    ReadOptions, Reader, Skipped, VersionSchema,
};

use crate::expression::{
    CounterExpression, ExpressionTable, EXPRESSION_NODES_PER_BYTE, MAX_EXPRESSION_NODES,
};

/// Magic of a little-endian coverage mapping section.
pub const MAPPING_MAGIC: [u8; 4] = *b"COVM";

/// Magic of a big-endian coverage mapping section.
pub const MAPPING_MAGIC_BE: [u8; 4] = *b"MVOC";

pub(crate) const EXPANSION_BIT: u64 = 1 << 2;
pub(crate) const PSEUDO_KIND_SHIFT: u32 = 3;
pub(crate) const PSEUDO_KIND_SKIPPED: u64 = 2;
pub(crate) const PSEUDO_KIND_BRANCH: u64 = 4;
pub(crate) const GAP_BIT: u32 = 1 << 31;

fn corrupt(detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::CorruptMapping).with_detail(detail.into())
}

/// The kind of a mapping region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RegionKind {
    /// Executable code counted by the region's counter.
    Code,
    /// The expansion of a macro, whose code lives in another file id.
    Expansion,
    /// Code that was skipped by the preprocessor.
    Skipped,
    /// Whitespace or punctuation between regions.
    Gap,
    /// A branch condition with counters for both outcomes.
    Branch,
}

/// A source range and the expression computing its execution count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    /// Index into the filenames of the function.
    pub file_id: u32,
    /// The first line, 1-based.
    pub start_line: u32,
    /// The first column, 1-based.
    pub start_col: u32,
    /// The last line.
    pub end_line: u32,
    /// The last column. Regions covering entire lines end at `u32::MAX`.
    pub end_col: u32,
    /// The kind of region.
    pub kind: RegionKind,
    /// The execution count, or the `true` count of a branch.
    pub counter: CounterExpression,
    /// The `false` count of a branch.
    pub false_counter: Option<CounterExpression>,
    /// The file id an expansion region expands to.
    pub expanded_file_id: Option<u32>,
}

impl Region {
    /// Creates a code region.
    pub fn code(
        file_id: u32,
        (start_line, start_col): (u32, u32),
        (end_line, end_col): (u32, u32),
        counter: CounterExpression,
    ) -> Self {
        Self {
            file_id,
            start_line,
            start_col,
            end_line,
            end_col,
            kind: RegionKind::Code,
            counter,
            false_counter: None,
            expanded_file_id: None,
        }
    }

    /// Changes the kind of the region.
    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }

    /// The lines touched by this region.
    pub fn lines(&self) -> RangeInclusive<u32> {
        self.start_line..=self.end_line
    }

    /// Returns `true` if the region's start does not lie after its end.
    pub fn is_well_formed(&self) -> bool {
        (self.start_line, self.start_col) <= (self.end_line, self.end_col)
    }
}

/// The coverage mapping of a single function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoverageMapping {
    /// The name of the function, matching the name of its profile record.
    pub function_name: String,
    /// The structural hash, matching the hash of its profile record.
    pub structural_hash: u64,
    /// The version of the section the mapping was read from.
    pub version: ProfileVersion,
    /// The file of every file id.
    pub filenames: Vec<String>,
    /// All regions, grouped by file id.
    pub regions: Vec<Region>,
}

impl CoverageMapping {
    /// The identity of the function, as used by profile records.
    pub fn id(&self) -> FunctionId {
        FunctionId::new(self.function_name.clone(), self.structural_hash)
    }

    /// The file containing the function, which is the file of file id 0.
    pub fn filename(&self) -> Option<&str> {
        self.filenames.first().map(String::as_str)
    }

    /// The number of counters the function's regions refer to.
    pub fn num_counters(&self) -> usize {
        self.regions
            .iter()
            .flat_map(|region| [Some(&region.counter), region.false_counter.as_ref()])
            .flatten()
            .filter_map(CounterExpression::max_counter)
            .max()
            .map_or(0, |max| max as usize + 1)
    }
}

/// All function mappings found in one or more coverage mapping sections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoverageMappings {
    /// The decoded mappings in section order.
    pub functions: Vec<CoverageMapping>,
    /// Records skipped in best-effort mode.
    pub skipped: Vec<Skipped>,
}

impl CoverageMappings {
    /// Parses a buffer holding one or more coverage mapping sections.
    ///
    /// Sections are concatenated at 8-byte boundaries, trailing zero bytes are ignored. Errors
    /// inside the data of one function record are per-record and skipped in best-effort mode.
    #[tracing::instrument(level = "trace", name = "CoverageMappings::parse", skip_all)]
    pub fn parse(data: &[u8], options: &ReadOptions) -> Result<Self, Error> {
        let mut mappings = Self::default();
        let mut reader = Reader::new(data);
        let mut sections = 0;

        while reader.rest().iter().any(|&byte| byte != 0) {
            reader.align_to(8)?;
            parse_section(&mut reader, options, &mut mappings)?;
            sections += 1;
        }

        tracing::debug!(
            sections,
            functions = mappings.functions.len(),
            skipped = mappings.skipped.len(),
            "parsed coverage mappings"
        );

        Ok(mappings)
    }

    /// Returns the mapping with the given identity.
    pub fn get(&self, name: &str, hash: u64) -> Option<&CoverageMapping> {
        self.functions
            .iter()
            .find(|mapping| mapping.function_name == name && mapping.structural_hash == hash)
    }

    /// The number of decoded mappings.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` if no mapping was decoded.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn parse_section(
    reader: &mut Reader<'_>,
    options: &ReadOptions,
    mappings: &mut CoverageMappings,
) -> Result<(), Error> {
    let start = reader.offset();
    let endian = match reader.read_bytes(4)? {
        magic if magic == MAPPING_MAGIC => Endian::Little,
        magic if magic == MAPPING_MAGIC_BE => Endian::Big,
        _ => {
            return Err(Error::new(ErrorKind::BadMagic)
                .at_offset(start)
                .with_detail("not a coverage mapping section"))
        }
    };

    let mut section = Reader::with_endian(reader.data(), endian);
    section.seek(reader.offset())?;

    let tag = section.read_u32()?;
    let schema = VersionSchema::lookup(tag.into()).map_err(|e| e.at_offset(start + 4))?;
    let num_records = section.read_u32()?;
    let filenames_size = section.read_u32()? as usize;

    let filenames_start = section.offset();
    let mut filenames_reader = Reader::new(section.read_bytes(filenames_size)?);
    let filenames = read_filenames(&mut filenames_reader, &schema.mapping)
        .map_err(|e| e.at_offset(filenames_start))?;
    section.align_to(8)?;

    tracing::trace!(
        version = tag,
        records = num_records,
        filenames = filenames.len(),
        "parsing coverage mapping section"
    );

    for _ in 0..num_records {
        let record_start = section.offset();
        let name = section.read_uleb_str()?;
        let hash = section.read_u64()?;
        let data_size = section.read_u32()? as usize;
        let data = section.read_bytes(data_size)?;
        if schema.mapping.aligned_records {
            section.align_to(8)?;
        }

        match decode_function(data, endian, &schema.mapping, &filenames) {
            Ok((filenames, regions)) => mappings.functions.push(CoverageMapping {
                function_name: name.to_owned(),
                structural_hash: hash,
                version: schema.version,
                filenames,
                regions,
            }),
            Err(error) => {
                let error = error.in_function(name, hash).at_offset(record_start);
                options.recover(error, &mut mappings.skipped)?;
            }
        }
    }

    reader.seek(section.offset())
}

fn read_names(reader: &mut Reader<'_>, count: u64) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(reader.read_uleb_str()?.to_owned());
    }
    Ok(names)
}

/// Reads the filename table of a section.
fn read_filenames(reader: &mut Reader<'_>, schema: &MappingSchema) -> Result<Vec<String>, Error> {
    let count = reader.read_uleb128()?;
    let names = if schema.compressed_filenames {
        let payload = read_chunk(reader)?;
        let mut payload_reader = Reader::new(&payload);
        let names = read_names(&mut payload_reader, count)?;
        if !payload_reader.is_empty() {
            return Err(Error::new(ErrorKind::InvalidEncoding)
                .with_detail("trailing bytes after the filenames"));
        }
        names
    } else {
        read_names(reader, count)?
    };

    if !reader.is_empty() {
        return Err(Error::new(ErrorKind::InvalidEncoding)
            .with_detail("filenames are shorter than the declared size"));
    }

    if !schema.compilation_dir {
        return Ok(names);
    }

    let mut names = names.into_iter();
    let Some(compilation_dir) = names.next() else {
        return Ok(Vec::new());
    };
    let joined = names.map(|name| join_path(&compilation_dir, &name));
    Ok(std::iter::once(compilation_dir.clone()).chain(joined).collect())
}

/// Decodes the data of a function record into its filenames and regions.
fn decode_function(
    data: &[u8],
    endian: Endian,
    schema: &MappingSchema,
    section_filenames: &[String],
) -> Result<(Vec<String>, Vec<Region>), Error> {
    let mut reader = Reader::with_endian(data, endian);

    let num_file_ids = reader.read_uleb128()?;
    let mut filenames = Vec::new();
    for _ in 0..num_file_ids {
        let index = reader.read_uleb128()?;
        let filename = usize::try_from(index)
            .ok()
            .and_then(|index| section_filenames.get(index))
            .ok_or_else(|| {
                corrupt(format!(
                    "filename {index} is out of range, the section has {} files",
                    section_filenames.len()
                ))
            })?;
        filenames.push(filename.clone());
    }

    let num_expressions = reader.read_uleb128()?;
    let mut expressions = Vec::new();
    for _ in 0..num_expressions {
        expressions.push((reader.read_uleb128()?, reader.read_uleb128()?));
    }
    let budget = data
        .len()
        .saturating_mul(EXPRESSION_NODES_PER_BYTE)
        .min(MAX_EXPRESSION_NODES);
    let mut expressions = ExpressionTable::new(expressions, budget);

    let mut regions = Vec::new();
    for file_id in 0..filenames.len() as u32 {
        let num_regions = reader.read_uleb128()?;
        let mut line = 0;
        for _ in 0..num_regions {
            let region = decode_region(
                &mut reader,
                &mut expressions,
                schema,
                file_id,
                filenames.len(),
                line,
            )?;
            line = region.start_line;
            regions.push(region);
        }
    }

    if !reader.is_empty() {
        return Err(Error::new(ErrorKind::InvalidEncoding)
            .at_offset(reader.offset())
            .with_detail("trailing bytes after the regions"));
    }

    Ok((filenames, regions))
}

fn decode_region(
    reader: &mut Reader<'_>,
    expressions: &mut ExpressionTable,
    schema: &MappingSchema,
    file_id: u32,
    num_files: usize,
    previous_line: u32,
) -> Result<Region, Error> {
    let mut region = Region::code(file_id, (0, 0), (0, 0), CounterExpression::Zero);

    let encoded_offset = reader.offset();
    let encoded = reader.read_uleb128()?;
    if encoded == 0 || encoded & 0b11 != 0 {
        region.counter = expressions.resolve(encoded)?;
    } else if encoded & EXPANSION_BIT != 0 {
        // pseudo counters encode the region kind instead of a count
        let expanded = encoded >> PSEUDO_KIND_SHIFT;
        if expanded >= num_files as u64 {
            return Err(corrupt(format!(
                "expansion into file id {expanded}, the function has {num_files} files"
            )));
        }
        region.kind = RegionKind::Expansion;
        region.expanded_file_id = Some(expanded as u32);
    } else {
        match encoded >> PSEUDO_KIND_SHIFT {
            0 => {}
            PSEUDO_KIND_SKIPPED => region.kind = RegionKind::Skipped,
            PSEUDO_KIND_BRANCH if schema.branch_regions => {
                region.kind = RegionKind::Branch;
                region.counter = expressions.resolve(reader.read_uleb128()?)?;
                region.false_counter = Some(expressions.resolve(reader.read_uleb128()?)?);
            }
            other => {
                return Err(Error::new(ErrorKind::InvalidEncoding)
                    .at_offset(encoded_offset)
                    .with_detail(format!("unknown region kind {other}")))
            }
        }
    }

    let line_delta = reader.read_uleb128_u32()?;
    let mut start_col = reader.read_uleb128_u32()?;
    let num_lines = reader.read_uleb128_u32()?;
    let mut end_col = reader.read_uleb128_u32()?;

    if end_col & GAP_BIT != 0 {
        region.kind = RegionKind::Gap;
        end_col &= !GAP_BIT;
    }
    if start_col == 0 && end_col == 0 {
        start_col = 1;
        end_col = u32::MAX;
    }

    region.start_line = previous_line
        .checked_add(line_delta)
        .ok_or_else(|| corrupt("region start line overflows"))?;
    region.end_line = region
        .start_line
        .checked_add(num_lines)
        .ok_or_else(|| corrupt("region end line overflows"))?;
    region.start_col = start_col;
    region.end_col = end_col;

    if !region.is_well_formed() {
        return Err(corrupt(format!(
            "region {}:{start_col} ends before it starts at {}:{end_col}",
            region.start_line, region.end_line
        )));
    }

    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    use instrprof_common::{align_up, write_chunk};

    fn uleb(out: &mut Vec<u8>, value: u64) {
        leb128::write::unsigned(out, value).unwrap();
    }

    /// A little-endian section of version 11 or 12 with a single record.
    fn section(version: u32, filenames: &[&str], data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        for name in filenames {
            uleb(&mut payload, name.len() as u64);
            payload.extend_from_slice(name.as_bytes());
        }
        let mut names = Vec::new();
        uleb(&mut names, filenames.len() as u64);
        if version >= 12 {
            write_chunk(&payload, false, &mut names).unwrap();
        } else {
            names.extend_from_slice(&payload);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"COVM");
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(names.len() as u32).to_le_bytes());
        out.extend_from_slice(&names);
        out.resize(align_up(out.len(), 8), 0);

        uleb(&mut out, 4);
        out.extend_from_slice(b"main");
        out.extend_from_slice(&0x1234u64.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn regions() -> Vec<u8> {
        let mut data = vec![
            1, 0, // one file id, filename 0
            1, 5, 1, // one expression: #1 - #0
            5, // five regions
            1, 3, 5, 2, 2, // #0 at 3:5 - 5:2
            2, 1, 1, 0, 9, // (#1 - #0) at 4:1 - 4:9
            16, 2, 0, 0, 0, // skipped line 6
            32, 1, 5, 1, 3, 0, 4, // branch #0 / #1 at 7:3 - 7:4
            1, 0, 4, 1, // gap #0 at 7:4 - 8:1
        ];
        uleb(&mut data, u64::from(GAP_BIT | 1));
        data
    }

    #[test]
    fn test_decode_regions() {
        let section = section(12, &["/src/main.c"], &regions());
        let mappings = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap();
        assert_eq!(mappings.len(), 1);

        let mapping = &mappings.functions[0];
        assert_eq!(mapping.id(), FunctionId::new("main", 0x1234));
        assert_eq!(mapping.filename(), Some("/src/main.c"));
        assert_eq!(mapping.version, ProfileVersion::Llvm12);
        assert_eq!(mapping.num_counters(), 2);

        let kinds: Vec<_> = mapping.regions.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                RegionKind::Code,
                RegionKind::Code,
                RegionKind::Skipped,
                RegionKind::Branch,
                RegionKind::Gap
            ]
        );

        let code = &mapping.regions[1];
        assert_eq!((code.start_line, code.start_col), (4, 1));
        assert_eq!((code.end_line, code.end_col), (4, 9));
        assert_eq!(
            code.counter,
            CounterExpression::subtract(CounterExpression::Counter(1), CounterExpression::Counter(0))
        );

        let skipped = &mapping.regions[2];
        assert_eq!(skipped.lines(), 6..=6);
        assert_eq!((skipped.start_col, skipped.end_col), (1, u32::MAX));

        let branch = &mapping.regions[3];
        assert_eq!(branch.counter, CounterExpression::Counter(0));
        assert_eq!(branch.false_counter, Some(CounterExpression::Counter(1)));

        let gap = &mapping.regions[4];
        assert_eq!((gap.start_line, gap.end_line, gap.end_col), (7, 8, 1));
    }

    #[test]
    fn test_branch_needs_version_12() {
        let section = section(11, &["/src/main.c"], &regions());
        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);
    }

    #[test]
    fn test_inverted_region() {
        // #1 at 3:9 - 3:2
        let data = [1, 0, 0, 1, 5, 3, 9, 0, 2];
        let section = section(11, &["main.c"], &data);

        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
        assert_eq!(err.function(), Some(&FunctionId::new("main", 0x1234)));

        let mappings = CoverageMappings::parse(&section, &ReadOptions::best_effort()).unwrap();
        assert!(mappings.is_empty());
        assert_eq!(mappings.skipped.len(), 1);
        assert_eq!(mappings.skipped[0].kind, ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_expression_budget_per_record() {
        // each entry adds the previous one to itself, the last one expands into 1023 nodes
        let mut data = vec![1, 0, 9, 1, 1];
        for index in 0..8u8 {
            let previous = (index << 2) | 3;
            data.extend_from_slice(&[previous, previous]);
        }
        uleb(&mut data, 400);
        for _ in 0..400 {
            data.extend_from_slice(&[(8 << 2) | 3, 1, 1, 0, 2]);
        }
        let section = section(11, &["main.c"], &data);

        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);

        // a few references to a smaller entry of 31 nodes fit
        let mut data = data[..21].to_vec();
        data.extend_from_slice(&[3, 15, 1, 1, 0, 2, 15, 1, 1, 0, 2, 15, 1, 1, 0, 2]);
        let section = self::section(11, &["main.c"], &data);
        let mappings = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap();
        assert_eq!(mappings.functions[0].regions.len(), 3);
    }

    #[test]
    fn test_filename_out_of_range() {
        let data = [1, 3, 0, 0];
        let section = section(11, &["main.c"], &data);
        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_expansion_out_of_range() {
        // expansion into file id 1 of a function with one file
        let data = [1, 0, 0, 1, 12, 1, 1, 0, 5];
        let section = section(11, &["main.c"], &data);
        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMapping);
    }

    #[test]
    fn test_bad_magic() {
        let err = CoverageMappings::parse(b"COVX\x0b\0\0\0", &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadMagic);
    }

    #[test]
    fn test_unsupported_version() {
        let mut section = section(11, &["main.c"], &[1, 0, 0, 0]);
        section[4] = 10;
        let err = CoverageMappings::parse(&section, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
        assert_eq!(err.found_version(), Some(10));
    }

    #[test]
    fn test_truncated_section() {
        let section = section(11, &["main.c"], &[1, 0, 0, 0]);
        let err = CoverageMappings::parse(&section[..section.len() - 1], &ReadOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedInput);
    }

    #[test]
    fn test_empty_and_padding() {
        let mappings = CoverageMappings::parse(&[0; 16], &ReadOptions::default()).unwrap();
        assert!(mappings.is_empty());
        assert!(CoverageMappings::parse(&[], &ReadOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_compilation_dir() {
        let schema = ProfileVersion::Llvm13.schema().mapping;
        let mut payload = Vec::new();
        for name in ["/build", "src/main.c", "/usr/include/stdio.h"] {
            uleb(&mut payload, name.len() as u64);
            payload.extend_from_slice(name.as_bytes());
        }
        let mut data = vec![3];
        write_chunk(&payload, true, &mut data).unwrap();

        let names = read_filenames(&mut Reader::new(&data), &schema).unwrap();
        assert_eq!(
            names,
            ["/build", "/build/src/main.c", "/usr/include/stdio.h"]
        );
    }
}
