//! Raw profiles, as dumped by an instrumented process on exit.
//!
//! ```text
//! magic u64, version u64, header fields u64 (see `RawSchema`),
//! binary ids       { len u64, bytes, padding to 8 }*
//! data records     { name_ref u64, hash u64, counter_ptr, function_ptr, values_ptr,
//!                    num_counters u32, num_value_sites [u16; 2] } padded to 8
//! counters         u64 * CountersSize
//! names            compressed or plain chunks, names separated by 0x01
//! value profiles   one blob for every record with value sites
//! ```
//!
//! All integers are in the byte order of the profiled process, which is detected from the magic.
//! The width of the three pointer fields is that of the profiled process as well.

use std::collections::HashMap;
use std::io::Write;

use indexmap::IndexMap;
use scroll::Endian;
use watto::Writer;

use instrprof_common::{
    align_up, read_chunk, write_chunk, Error, ErrorKind, ProfileVersion, RawHeaderField,
    ReadOptions, Reader, VersionSchema, Width,
};

use crate::compat::ProfileFormat;
use crate::record::{FunctionRecord, InstrProfile, ProfileKind, ValueKind};
use crate::value_prof;

/// Magic of raw profiles written by 64-bit processes.
pub const RAW_MAGIC_64: u64 = 0xff6c_7072_6f66_7281;
/// Magic of raw profiles written by 32-bit processes.
pub const RAW_MAGIC_32: u64 = 0xff6c_7072_6f66_5281;

/// Separates function names within a names chunk.
const NAME_SEPARATOR: u8 = 0x01;

/// The highest value kind a raw profile may declare.
const VALUE_KIND_LAST: u64 = 1;

/// Returns `true` if the buffer starts with a raw profile magic in either byte order.
pub fn is_raw(data: &[u8]) -> bool {
    detect_magic(data).is_some()
}

/// Detects byte order and pointer width from the magic.
pub(crate) fn detect_magic(data: &[u8]) -> Option<(Endian, Width)> {
    let magic = Reader::new(data).read_u64().ok()?;
    match magic {
        RAW_MAGIC_64 => Some((Endian::Little, Width::U64)),
        RAW_MAGIC_32 => Some((Endian::Little, Width::U32)),
        _ if magic.swap_bytes() == RAW_MAGIC_64 => Some((Endian::Big, Width::U64)),
        _ if magic.swap_bytes() == RAW_MAGIC_32 => Some((Endian::Big, Width::U32)),
        _ => None,
    }
}

/// Size of a single data record for the given pointer width.
fn data_record_size(pointer_width: Width) -> usize {
    align_up(8 + 8 + 3 * pointer_width.size() + 4 + 2 * 2, 8)
}

#[derive(Debug, Default)]
struct RawHeader {
    binary_ids_size: u64,
    data_size: u64,
    padding_bytes_before_counters: u64,
    counters_size: u64,
    padding_bytes_after_counters: u64,
    names_size: u64,
    counters_delta: u64,
    names_delta: u64,
    value_kind_last: u64,
}

/// Converts a size read from the input, failing if it cannot possibly fit.
fn to_size(value: u64, offset: usize) -> Result<usize, Error> {
    usize::try_from(value).map_err(|_| {
        Error::new(ErrorKind::TruncatedInput)
            .at_offset(offset)
            .with_detail(format!("section size {value} exceeds address space"))
    })
}

fn section_size(count: u64, item_size: usize, offset: usize) -> Result<usize, Error> {
    to_size(count, offset)?
        .checked_mul(item_size)
        .ok_or_else(|| {
            Error::new(ErrorKind::TruncatedInput)
                .at_offset(offset)
                .with_detail(format!("{count} items exceed address space"))
        })
}

/// Maps offsets within the decoded names section to function names.
struct NameTable {
    names: HashMap<u64, String>,
}

impl NameTable {
    fn parse(data: &[u8], endian: Endian) -> Result<Self, Error> {
        let mut reader = Reader::with_endian(data, endian);
        let mut names = HashMap::new();
        let mut base = 0u64;

        // the section may end in zero padding
        while reader.rest().iter().any(|&b| b != 0) {
            let chunk = read_chunk(&mut reader)?;
            let mut start = 0;
            for name in chunk.split(|&b| b == NAME_SEPARATOR) {
                if !name.is_empty() {
                    let name = std::str::from_utf8(name).map_err(|e| {
                        Error::new(ErrorKind::InvalidEncoding)
                            .with_detail("function name is not valid UTF-8")
                            .with_source(e)
                    })?;
                    names.insert(base + start as u64, name.to_owned());
                }
                start += name.len() + 1;
            }
            base += chunk.len() as u64;
        }

        Ok(Self { names })
    }

    fn get(&self, name_ref: u64) -> Option<&str> {
        self.names.get(&name_ref).map(String::as_str)
    }
}

/// The fields of a data record.
struct DataRecord {
    name_ref: u64,
    hash: u64,
    counter_ptr: u64,
    num_counters: u32,
    num_value_sites: [u16; 2],
}

impl DataRecord {
    fn parse(reader: &mut Reader<'_>, pointer_width: Width) -> Result<Self, Error> {
        let name_ref = reader.read_u64()?;
        let hash = reader.read_u64()?;
        let counter_ptr = reader.read_uint(pointer_width)?;
        let _function_ptr = reader.read_uint(pointer_width)?;
        let _values_ptr = reader.read_uint(pointer_width)?;
        let num_counters = reader.read_u32()?;
        let num_value_sites = [reader.read_u16()?, reader.read_u16()?];
        reader.align_to(8)?;

        Ok(Self {
            name_ref,
            hash,
            counter_ptr,
            num_counters,
            num_value_sites,
        })
    }

    fn has_value_sites(&self) -> bool {
        self.num_value_sites.iter().any(|&n| n > 0)
    }
}

/// Parses a raw profile.
///
/// Records whose name or counters cannot be resolved fail with [`ErrorKind::CorruptIndex`] and are
/// skipped in best-effort mode. All other errors reject the whole profile.
#[tracing::instrument(level = "trace", name = "raw::parse", skip_all)]
pub fn parse(data: &[u8], options: &ReadOptions) -> Result<InstrProfile, Error> {
    let (endian, pointer_width) = match detect_magic(data) {
        Some(detected) => detected,
        None if data.len() < 8 => return Err(Error::new(ErrorKind::TruncatedInput).at_offset(0)),
        None => return Err(Error::new(ErrorKind::BadMagic).at_offset(0)),
    };

    let mut reader = Reader::with_endian(data, endian);
    reader.skip(8)?;
    let (tag, kind) = ProfileKind::split_version(reader.read_u64()?);
    let schema = VersionSchema::lookup(tag).map_err(|e| e.at_offset(8))?;

    let mut header = RawHeader::default();
    for field in schema.raw.header {
        let value = reader.read_u64()?;
        match field {
            RawHeaderField::BinaryIdsSize => header.binary_ids_size = value,
            RawHeaderField::DataSize => header.data_size = value,
            RawHeaderField::PaddingBytesBeforeCounters => {
                header.padding_bytes_before_counters = value
            }
            RawHeaderField::CountersSize => header.counters_size = value,
            RawHeaderField::PaddingBytesAfterCounters => {
                header.padding_bytes_after_counters = value
            }
            RawHeaderField::NamesSize => header.names_size = value,
            RawHeaderField::CountersDelta => header.counters_delta = value,
            RawHeaderField::NamesDelta => header.names_delta = value,
            RawHeaderField::ValueKindLast => header.value_kind_last = value,
        }
    }

    if header.value_kind_last > VALUE_KIND_LAST {
        return Err(Error::new(ErrorKind::InvalidEncoding)
            .at_offset(reader.offset() - 8)
            .with_detail(format!("unknown value kind {}", header.value_kind_last)));
    }

    tracing::debug!(
        version = tag,
        records = header.data_size,
        counters = header.counters_size,
        names_delta = header.names_delta,
        "parsing raw profile"
    );

    let offset = reader.offset();
    let binary_ids_bytes = reader.read_bytes(to_size(header.binary_ids_size, offset)?)?;
    let binary_ids = parse_binary_ids(binary_ids_bytes, endian)?;

    let record_size = data_record_size(pointer_width);
    let data_start = reader.offset();
    let offset = data_start;
    let data_bytes = reader.read_bytes(section_size(header.data_size, record_size, offset)?)?;
    reader.skip(to_size(header.padding_bytes_before_counters, offset)?)?;

    let offset = reader.offset();
    let counters_bytes = reader.read_bytes(section_size(header.counters_size, 8, offset)?)?;
    reader.skip(to_size(header.padding_bytes_after_counters, offset)?)?;

    let offset = reader.offset();
    let names_bytes = reader.read_bytes(to_size(header.names_size, offset)?)?;
    let names = NameTable::parse(names_bytes, endian).map_err(|e| match e.offset() {
        Some(_) => e,
        None => e.at_offset(offset),
    })?;
    if !reader.is_empty() {
        reader.align_to(8)?;
    }

    let mut profile = InstrProfile::new(ProfileFormat::Raw);
    profile.version = Some(schema.version);
    profile.kind = kind;
    profile.binary_ids = binary_ids;

    let mut data_reader = Reader::with_endian(data_bytes, endian);
    let counters = Counters {
        data: counters_bytes,
        endian,
        delta: header.counters_delta,
        relative: schema.raw.relative_counters,
        record_size: record_size as u64,
    };

    for index in 0..data_bytes.len() / record_size {
        let record_offset = data_start + data_reader.offset();
        let record = DataRecord::parse(&mut data_reader, pointer_width)?;

        let blob = if record.has_value_sites() {
            Some(value_prof::read_blob(&mut reader)?)
        } else {
            None
        };

        let decoded = decode_record(&record, index as u64, &names, &counters, blob)
            .map_err(|e| e.at_offset(record_offset));

        match decoded {
            Ok(record) => profile.records.push(record),
            Err(error) => options.recover(error, &mut profile.skipped)?,
        }
    }

    Ok(profile)
}

fn parse_binary_ids(data: &[u8], endian: Endian) -> Result<Vec<Vec<u8>>, Error> {
    let mut reader = Reader::with_endian(data, endian);
    let mut ids = Vec::new();
    while !reader.is_empty() {
        let offset = reader.offset();
        let len = reader.read_u64()?;
        ids.push(reader.read_bytes(to_size(len, offset)?)?.to_vec());
        reader.align_to(8)?;
    }
    Ok(ids)
}

struct Counters<'data> {
    data: &'data [u8],
    endian: Endian,
    delta: u64,
    relative: bool,
    record_size: u64,
}

impl Counters<'_> {
    fn read(&self, record: &DataRecord, index: u64) -> Result<Vec<u64>, Error> {
        let mut offset = record.counter_ptr;
        if self.relative {
            offset = offset.wrapping_add(index.wrapping_mul(self.record_size));
        }
        offset = offset.wrapping_sub(self.delta);

        let len = record.num_counters as u64 * 8;
        let in_bounds = offset % 8 == 0
            && offset
                .checked_add(len)
                .map_or(false, |end| end <= self.data.len() as u64);
        if !in_bounds {
            return Err(Error::new(ErrorKind::CorruptIndex).with_detail(format!(
                "{} counters at offset {offset:#x} are outside of the counter section",
                record.num_counters
            )));
        }

        let mut reader = Reader::with_endian(self.data, self.endian);
        reader.seek(offset as usize)?;
        (0..record.num_counters)
            .map(|_| reader.read_u64())
            .collect()
    }
}

fn decode_record(
    record: &DataRecord,
    index: u64,
    names: &NameTable,
    counters: &Counters<'_>,
    blob: Option<Reader<'_>>,
) -> Result<FunctionRecord, Error> {
    let name = names.get(record.name_ref).ok_or_else(|| {
        Error::new(ErrorKind::CorruptIndex).with_detail(format!(
            "name reference {:#x} of function with hash {:#x} is not a name",
            record.name_ref, record.hash
        ))
    })?;

    let with_function = |e: Error| e.in_function(name, record.hash);
    let counters = counters.read(record, index).map_err(with_function)?;
    let values = blob
        .map(|blob| value_prof::decode_blob(blob, Some(record.num_value_sites)))
        .transpose()
        .map_err(with_function)?;

    Ok(FunctionRecord {
        name: name.to_owned(),
        hash: record.hash,
        counters,
        values,
    })
}

/// Serializes profiles into the raw format of a 64-bit little-endian process.
///
/// Counter pointers are laid out the way the runtime of the target version lays them out, so the
/// output can be read back by [`parse`] and by other consumers of the same version.
#[derive(Clone, Debug)]
pub struct RawWriter {
    version: ProfileVersion,
    compress_names: bool,
}

impl RawWriter {
    /// Creates a writer for the given version.
    pub fn new(version: ProfileVersion) -> Self {
        Self {
            version,
            compress_names: false,
        }
    }

    /// Whether the names section should be zlib compressed.
    pub fn compress_names(mut self, compress: bool) -> Self {
        self.compress_names = compress;
        self
    }

    /// Writes the profile into `writer`.
    #[tracing::instrument(level = "trace", name = "RawWriter::serialize", skip_all)]
    pub fn serialize<W: Write>(&self, profile: &InstrProfile, writer: &mut W) -> Result<(), Error> {
        let schema = self.version.schema();
        let write_failed = |e: std::io::Error| Error::new(ErrorKind::WriteFailed).with_source(e);

        let mut name_offsets = IndexMap::new();
        let mut names_payload = Vec::new();
        for record in &profile.records {
            if record.name.is_empty() || record.name.as_bytes().contains(&NAME_SEPARATOR) {
                return Err(Error::new(ErrorKind::WriteFailed)
                    .in_function(record.name.clone(), record.hash)
                    .with_detail("function name cannot be stored in a raw profile"));
            }
            if !name_offsets.contains_key(record.name.as_str()) {
                if !names_payload.is_empty() {
                    names_payload.push(NAME_SEPARATOR);
                }
                name_offsets.insert(record.name.as_str(), names_payload.len() as u64);
                names_payload.extend_from_slice(record.name.as_bytes());
            }
        }
        let mut names = Vec::new();
        if !names_payload.is_empty() {
            write_chunk(&names_payload, self.compress_names, &mut names)?;
        }

        let mut binary_ids = Vec::new();
        if schema.raw.has_binary_ids() {
            for id in &profile.binary_ids {
                binary_ids.extend_from_slice(&(id.len() as u64).to_le_bytes());
                binary_ids.extend_from_slice(id);
                binary_ids.resize(align_up(binary_ids.len(), 8), 0);
            }
        } else if !profile.binary_ids.is_empty() {
            tracing::warn!(version = %self.version, "dropping binary ids");
        }

        let record_size = data_record_size(Width::U64);
        let num_counters: usize = profile.records.iter().map(|r| r.counters.len()).sum();
        let data_offset = schema.raw.header_size() + binary_ids.len();
        let counters_offset = data_offset + profile.records.len() * record_size;

        // Absolute counter pointers are based at a fictional load address. Relative pointers
        // store the distance between a data record and its counters.
        let counters_delta = if schema.raw.relative_counters {
            (counters_offset - data_offset) as u64
        } else {
            COUNTERS_ADDRESS
        };

        let mut header = Vec::new();
        for field in schema.raw.header {
            let value = match field {
                RawHeaderField::BinaryIdsSize => binary_ids.len() as u64,
                RawHeaderField::DataSize => profile.records.len() as u64,
                RawHeaderField::PaddingBytesBeforeCounters => 0,
                RawHeaderField::CountersSize => num_counters as u64,
                RawHeaderField::PaddingBytesAfterCounters => 0,
                RawHeaderField::NamesSize => names.len() as u64,
                RawHeaderField::CountersDelta => counters_delta,
                RawHeaderField::NamesDelta => NAMES_ADDRESS,
                RawHeaderField::ValueKindLast => VALUE_KIND_LAST,
            };
            header.extend_from_slice(&value.to_le_bytes());
        }

        let mut data = Vec::with_capacity(profile.records.len() * record_size);
        let mut values = Vec::new();
        let mut counter_offset = 0u64;
        for (index, record) in profile.records.iter().enumerate() {
            let with_function = |e: Error| e.in_function(record.name.clone(), record.hash);
            let mut num_value_sites = [0u16; 2];
            if let Some(ref profile_values) = record.values {
                for kind in ValueKind::ALL {
                    let sites = profile_values.sites(kind).len();
                    num_value_sites[kind.as_u32() as usize] = u16::try_from(sites)
                        .map_err(|_| {
                            Error::new(ErrorKind::WriteFailed)
                                .with_detail(format!("{sites} {kind:?} sites"))
                        })
                        .map_err(with_function)?;
                }
                if !profile_values.is_empty() {
                    value_prof::encode(profile_values, &mut values).map_err(with_function)?;
                }
            }
            let num_counters = u32::try_from(record.counters.len()).map_err(|_| {
                with_function(Error::new(ErrorKind::WriteFailed).with_detail("too many counters"))
            })?;

            let counter_ptr = if schema.raw.relative_counters {
                counters_delta
                    .wrapping_add(counter_offset)
                    .wrapping_sub((index * record_size) as u64)
            } else {
                COUNTERS_ADDRESS + counter_offset
            };

            data.extend_from_slice(&name_offsets[record.name.as_str()].to_le_bytes());
            data.extend_from_slice(&record.hash.to_le_bytes());
            data.extend_from_slice(&counter_ptr.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&num_counters.to_le_bytes());
            data.extend_from_slice(&num_value_sites[0].to_le_bytes());
            data.extend_from_slice(&num_value_sites[1].to_le_bytes());

            counter_offset += record.counters.len() as u64 * 8;
        }

        let tag = schema.tag;
        let mut writer = Writer::new(writer);
        let magic = RAW_MAGIC_64.to_le_bytes();
        let version = profile.kind.version_word(tag).to_le_bytes();

        writer.write_all(&magic).map_err(write_failed)?;
        writer.write_all(&version).map_err(write_failed)?;
        writer.write_all(&header).map_err(write_failed)?;
        writer.write_all(&binary_ids).map_err(write_failed)?;
        writer.write_all(&data).map_err(write_failed)?;
        for counter in profile.records.iter().flat_map(|r| &r.counters) {
            writer
                .write_all(&counter.to_le_bytes())
                .map_err(write_failed)?;
        }
        writer.write_all(&names).map_err(write_failed)?;
        writer.align_to(8).map_err(write_failed)?;
        writer.write_all(&values).map_err(write_failed)?;

        Ok(())
    }
}

const COUNTERS_ADDRESS: u64 = 0x0001_0000;
const NAMES_ADDRESS: u64 = 0x0080_0000;

#[cfg(test)]
mod tests {
    use super::*;

    fn write(profile: &InstrProfile, version: ProfileVersion) -> Vec<u8> {
        let mut out = Vec::new();
        RawWriter::new(version)
            .serialize(profile, &mut out)
            .unwrap();
        out
    }

    fn sample() -> InstrProfile {
        let mut profile = InstrProfile::new(ProfileFormat::Raw);
        profile.records = vec![
            FunctionRecord::new("main", 0x1234, vec![1, 0, 7]),
            FunctionRecord::new("foo", 0xabcd, vec![3]),
            FunctionRecord::new("main", 0x5678, vec![2, 2]),
        ];
        profile
    }

    #[test]
    fn test_magic() {
        assert!(is_raw(&RAW_MAGIC_64.to_le_bytes()));
        assert!(is_raw(&RAW_MAGIC_32.to_be_bytes()));
        assert!(!is_raw(b"\x00\x00\x00\x00\x00\x00\x00\x00"));
        assert!(!is_raw(b"short"));
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(data_record_size(Width::U64), 48);
        assert_eq!(data_record_size(Width::U32), 40);
    }

    #[test]
    fn test_relative_and_absolute_counters() {
        for version in ProfileVersion::ALL {
            let data = write(&sample(), version);
            let parsed = parse(&data, &ReadOptions::default()).unwrap();
            assert_eq!(parsed.version, Some(version));
            assert_eq!(parsed.records, sample().records);
        }
    }

    #[test]
    fn test_corrupt_counter_pointer() {
        let mut data = write(&sample(), ProfileVersion::Llvm12);
        let header_size = ProfileVersion::Llvm12.schema().raw.header_size();
        // counter pointer of the second record
        let ptr = header_size + 48 + 16;
        data[ptr..ptr + 8].copy_from_slice(&u64::MAX.to_le_bytes());

        let err = parse(&data, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
        assert_eq!(err.function().unwrap().name, "foo");

        let profile = parse(&data, &ReadOptions::best_effort()).unwrap();
        assert_eq!(profile.records.len(), 2);
        assert_eq!(profile.skipped.len(), 1);
        assert_eq!(profile.skipped[0].kind, ErrorKind::CorruptIndex);
    }

    #[test]
    fn test_bad_value_kind_last() {
        let mut data = write(&sample(), ProfileVersion::Llvm11);
        let field = ProfileVersion::Llvm11.schema().raw.header_size() - 8;
        data[field] = 7;
        let err = parse(&data, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);
    }
}
