//! Indexed profiles, the on-disk summary produced by merging raw profiles.
//!
//! ```text
//! magic u64, version u64, header fields (see `IndexedSchema`)
//! hash table      num_buckets u64, chain offset u64 * num_buckets (0 = empty bucket)
//! chains          { count u32, { hash u64, record_offset }* }*
//! records         { name_offset, name_len u32, hash u64, counter_index, num_counters u32,
//!                   [value_offset, value_len u32] }*
//! counters        one counter per instrumented block
//! value profiles  value profile blobs
//! names           UTF-8 function names
//! ```
//!
//! The file is little-endian. Offsets stored in the header and in chains are absolute, offsets
//! stored in records are relative to the section they point into. Sections appear in the order
//! above and the names section extends to the end of the file.

use std::io::Write;

use flate2::Crc;
use indexmap::IndexMap;

use instrprof_common::{
    Error, ErrorKind, IndexedHeaderField, IndexedSchema, ProfileVersion, ReadOptions, Reader,
    VersionSchema, Width,
};

use crate::compat::ProfileFormat;
use crate::record::{FunctionRecord, InstrProfile, ProfileKind};
use crate::value_prof;

/// Magic of indexed profiles.
pub const INDEXED_MAGIC: u64 = 0x8169_666f_7270_6cff;

/// Returns `true` if the buffer starts with the indexed profile magic.
pub fn is_indexed(data: &[u8]) -> bool {
    Reader::new(data).read_u64().ok() == Some(INDEXED_MAGIC)
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

fn corrupt(detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::CorruptIndex).with_detail(detail.into())
}

fn to_offset(value: u64) -> Result<usize, Error> {
    usize::try_from(value).map_err(|_| corrupt(format!("offset {value:#x} is out of bounds")))
}

/// Absolute start offsets of all sections.
#[derive(Clone, Copy, Debug)]
struct Sections {
    hash_table: usize,
    records: usize,
    counters: usize,
    value_profiles: Option<usize>,
    names: usize,
}

impl Sections {
    /// The end of the counters section.
    fn counters_end(&self) -> usize {
        self.value_profiles.unwrap_or(self.names)
    }
}

/// The fields of a record in the record table.
#[derive(Debug)]
struct RawRecord {
    name_offset: u64,
    name_len: u32,
    hash: u64,
    counter_index: u64,
    num_counters: u32,
    value_offset: u64,
    value_len: u32,
}

/// An indexed profile with lazily decoded records.
///
/// [`parse`](Self::parse) validates the header, the checksum and the entire hash table up front.
/// Records are only decoded when they are looked up or iterated, so corruption in a single record
/// surfaces as an error of that record.
#[derive(Clone, Debug)]
pub struct IndexedProfile<'data> {
    data: &'data [u8],
    version: ProfileVersion,
    kind: ProfileKind,
    schema: &'static IndexedSchema,
    sections: Sections,
    num_buckets: usize,
    num_records: usize,
}

impl<'data> IndexedProfile<'data> {
    /// Parses the header and hash table of an indexed profile.
    #[tracing::instrument(level = "trace", name = "IndexedProfile::parse", skip_all)]
    pub fn parse(data: &'data [u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(data);
        if reader.read_u64()? != INDEXED_MAGIC {
            return Err(Error::new(ErrorKind::BadMagic).at_offset(0));
        }

        let (tag, kind) = ProfileKind::split_version(reader.read_u64()?);
        let version_schema = VersionSchema::lookup(tag).map_err(|e| e.at_offset(8))?;
        let schema = &version_schema.indexed;

        let mut hash_type = 0;
        let mut checksum = None;
        let mut hash_table = 0;
        let mut records = 0;
        let mut counters = 0;
        let mut value_profiles = None;
        let mut names = 0;

        for field in schema.header {
            let value = reader.read_uint(schema.offset_width)?;
            match field {
                IndexedHeaderField::HashType => hash_type = value,
                IndexedHeaderField::Checksum => checksum = Some(value),
                IndexedHeaderField::HashTableOffset => hash_table = value,
                IndexedHeaderField::RecordsOffset => records = value,
                IndexedHeaderField::CountersOffset => counters = value,
                IndexedHeaderField::ValueProfileOffset => value_profiles = Some(value),
                IndexedHeaderField::NamesOffset => names = value,
            }
        }
        let header_size = reader.offset();

        if hash_type != 0 {
            return Err(Error::new(ErrorKind::InvalidEncoding)
                .at_offset(16)
                .with_detail(format!("unknown hash type {hash_type}")));
        }

        if let Some(expected) = checksum {
            let actual = crc32(reader.rest());
            if u64::from(actual) != expected {
                return Err(corrupt(format!(
                    "checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
                )));
            }
        }

        let sections = Sections {
            hash_table: to_offset(hash_table)?,
            records: to_offset(records)?,
            counters: to_offset(counters)?,
            value_profiles: value_profiles.map(to_offset).transpose()?,
            names: to_offset(names)?,
        };

        let order = [
            ("header", Some(header_size)),
            ("hash table", Some(sections.hash_table)),
            ("records", Some(sections.records)),
            ("counters", Some(sections.counters)),
            ("value profiles", sections.value_profiles),
            ("names", Some(sections.names)),
            ("end of file", Some(data.len())),
        ];
        let mut previous = ("start", 0);
        for (name, offset) in order {
            let Some(offset) = offset else { continue };
            if offset < previous.1 {
                return Err(corrupt(format!(
                    "{name} section at {offset:#x} precedes {} at {:#x}",
                    previous.0, previous.1
                )));
            }
            previous = (name, offset);
        }

        let records_len = sections.counters - sections.records;
        if records_len % schema.record_size() != 0 {
            return Err(corrupt(format!(
                "record table of {records_len} bytes is not a multiple of {}",
                schema.record_size()
            ))
            .at_offset(sections.records));
        }

        reader.seek(sections.hash_table)?;
        let num_buckets = reader.read_u64()?;
        let buckets_end = to_offset(num_buckets)
            .ok()
            .and_then(|n| n.checked_mul(8))
            .and_then(|size| size.checked_add(reader.offset()));
        if !num_buckets.is_power_of_two() || buckets_end.map_or(true, |end| end > sections.records)
        {
            return Err(corrupt(format!("invalid bucket count {num_buckets}"))
                .at_offset(sections.hash_table));
        }

        let profile = Self {
            data,
            version: version_schema.version,
            kind,
            schema,
            sections,
            num_buckets: num_buckets as usize,
            num_records: records_len / schema.record_size(),
        };

        for bucket in 0..profile.num_buckets {
            profile.chain(bucket)?;
        }

        tracing::debug!(
            version = tag,
            records = profile.num_records,
            buckets = profile.num_buckets,
            "parsed indexed profile"
        );

        Ok(profile)
    }

    /// The version of the toolchain that wrote the profile.
    pub fn version(&self) -> ProfileVersion {
        self.version
    }

    /// The variant flags of the profile.
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    /// The number of records in the record table.
    pub fn len(&self) -> usize {
        self.num_records
    }

    /// Returns `true` if the profile has no records.
    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    /// Reads and validates the chain of a bucket, returning hash and record index of every entry.
    fn chain(&self, bucket: usize) -> Result<Vec<(u64, usize)>, Error> {
        let mut reader = Reader::new(self.data);
        let bucket_offset = self.sections.hash_table + 8 + bucket * 8;
        reader.seek(bucket_offset)?;
        let chain_offset = reader.read_u64()?;
        if chain_offset == 0 {
            return Ok(Vec::new());
        }

        let chains_start = self.sections.hash_table + 8 + self.num_buckets * 8;
        let chain_error = |detail: String| corrupt(detail).at_offset(bucket_offset);

        let chain_offset = to_offset(chain_offset)?;
        let chain_end = chain_offset.checked_add(4);
        if chain_offset < chains_start || chain_end.map_or(true, |end| end > self.sections.records)
        {
            return Err(chain_error(format!(
                "chain of bucket {bucket} at {chain_offset:#x} is outside of the hash table"
            )));
        }

        reader.seek(chain_offset)?;
        let count = reader.read_u32()? as usize;
        let entry_size = self.schema.chain_entry_size();
        if count * entry_size > self.sections.records - reader.offset() {
            return Err(chain_error(format!(
                "chain of bucket {bucket} with {count} entries exceeds the hash table"
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let hash = reader.read_u64()?;
            let record_offset = reader.read_uint(self.schema.offset_width)?;

            if hash & (self.num_buckets as u64 - 1) != bucket as u64 {
                return Err(chain_error(format!(
                    "hash {hash:#x} does not belong into bucket {bucket}"
                )));
            }

            let index = to_offset(record_offset)
                .ok()
                .and_then(|offset| offset.checked_sub(self.sections.records))
                .filter(|relative| relative % self.schema.record_size() == 0)
                .map(|relative| relative / self.schema.record_size())
                .filter(|&index| index < self.num_records)
                .ok_or_else(|| {
                    chain_error(format!(
                        "record offset {record_offset:#x} of hash {hash:#x} is not a record"
                    ))
                })?;

            entries.push((hash, index));
        }

        Ok(entries)
    }

    fn raw_record(&self, index: usize) -> Result<RawRecord, Error> {
        let width = self.schema.offset_width;
        let mut reader = Reader::new(self.data);
        reader.seek(self.sections.records + index * self.schema.record_size())?;

        let name_offset = reader.read_uint(width)?;
        let name_len = reader.read_u32()?;
        let hash = reader.read_u64()?;
        let counter_index = reader.read_uint(width)?;
        let num_counters = reader.read_u32()?;
        let (value_offset, value_len) = if self.schema.has_value_profiles() {
            (reader.read_uint(width)?, reader.read_u32()?)
        } else {
            (0, 0)
        };

        Ok(RawRecord {
            name_offset,
            name_len,
            hash,
            counter_index,
            num_counters,
            value_offset,
            value_len,
        })
    }

    /// Returns a reader over `len` bytes at `offset` relative to a section.
    fn section_slice(
        &self,
        start: usize,
        end: usize,
        offset: u64,
        len: u64,
        what: &str,
    ) -> Result<&'data [u8], Error> {
        offset
            .checked_add(len)
            .filter(|&slice_end| slice_end <= (end - start) as u64)
            .map(|slice_end| &self.data[start + offset as usize..start + slice_end as usize])
            .ok_or_else(|| {
                corrupt(format!(
                    "{what} at {offset:#x} with length {len} is outside of its section"
                ))
            })
    }

    /// Decodes the record at the given position of the record table.
    fn record(&self, index: usize) -> Result<FunctionRecord, Error> {
        let record_offset = self.sections.records + index * self.schema.record_size();
        let raw = self.raw_record(index)?;

        let name_bytes = self
            .section_slice(
                self.sections.names,
                self.data.len(),
                raw.name_offset,
                raw.name_len.into(),
                "name",
            )
            .map_err(|e| e.at_offset(record_offset))?;
        let name = std::str::from_utf8(name_bytes).map_err(|e| {
            Error::new(ErrorKind::InvalidEncoding)
                .at_offset(record_offset)
                .with_detail("function name is not valid UTF-8")
                .with_source(e)
        })?;
        let with_context = |e: Error| e.in_function(name, raw.hash).at_offset(record_offset);

        let counter_size = self.schema.counter_width.size() as u64;
        let counter_bytes = raw
            .counter_index
            .checked_mul(counter_size)
            .ok_or_else(|| corrupt("counter index overflows"))
            .and_then(|offset| {
                self.section_slice(
                    self.sections.counters,
                    self.sections.counters_end(),
                    offset,
                    u64::from(raw.num_counters) * counter_size,
                    "counters",
                )
            })
            .map_err(with_context)?;
        let mut counter_reader = Reader::new(counter_bytes);
        let counters = (0..raw.num_counters)
            .map(|_| counter_reader.read_uint(self.schema.counter_width))
            .collect::<Result<Vec<_>, _>>()
            .map_err(with_context)?;

        let values = match self.sections.value_profiles {
            Some(start) if raw.value_len > 0 => {
                let bytes = self
                    .section_slice(
                        start,
                        self.sections.names,
                        raw.value_offset,
                        raw.value_len.into(),
                        "value profile",
                    )
                    .map_err(with_context)?;
                let mut reader = Reader::new(bytes);
                let blob = value_prof::read_blob(&mut reader).map_err(with_context)?;
                if !reader.is_empty() {
                    return Err(with_context(corrupt(
                        "value profile is shorter than its record declares",
                    )));
                }
                Some(value_prof::decode_blob(blob, None).map_err(with_context)?)
            }
            _ => None,
        };

        Ok(FunctionRecord {
            name: name.to_owned(),
            hash: raw.hash,
            counters,
            values,
        })
    }

    /// Returns all records with the given structural hash.
    ///
    /// Records sharing a hash are all returned, in the order of the hash chain.
    pub fn lookup(&self, hash: u64) -> Result<Vec<FunctionRecord>, Error> {
        let bucket = (hash & (self.num_buckets as u64 - 1)) as usize;
        self.chain(bucket)?
            .into_iter()
            .filter(|&(entry_hash, _)| entry_hash == hash)
            .map(|(_, index)| self.record(index))
            .collect()
    }

    /// Returns the record with the given identity.
    pub fn get(&self, name: &str, hash: u64) -> Result<Option<FunctionRecord>, Error> {
        Ok(self
            .lookup(hash)?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Iterates over all records in the order of the record table.
    pub fn records(&self) -> impl Iterator<Item = Result<FunctionRecord, Error>> + '_ {
        (0..self.num_records).map(move |index| self.record(index))
    }

    /// Decodes all records into an [`InstrProfile`].
    ///
    /// In best-effort mode, records that fail to decode are reported as skipped.
    pub fn to_profile(&self, options: &ReadOptions) -> Result<InstrProfile, Error> {
        let mut profile = InstrProfile::new(ProfileFormat::Indexed);
        profile.version = Some(self.version);
        profile.kind = self.kind;

        for record in self.records() {
            match record {
                Ok(record) => profile.records.push(record),
                Err(error) => options.recover(error, &mut profile.skipped)?,
            }
        }

        Ok(profile)
    }
}

/// Parses an indexed profile and decodes all of its records.
pub fn parse(data: &[u8], options: &ReadOptions) -> Result<InstrProfile, Error> {
    IndexedProfile::parse(data)?.to_profile(options)
}

fn push_uint(out: &mut Vec<u8>, value: u64, width: Width) -> Result<(), Error> {
    match width {
        Width::U32 => {
            let value = u32::try_from(value).map_err(|_| {
                Error::new(ErrorKind::WriteFailed)
                    .with_detail(format!("{value} does not fit into 32 bits"))
            })?;
            out.extend_from_slice(&value.to_le_bytes());
        }
        Width::U64 => out.extend_from_slice(&value.to_le_bytes()),
    }
    Ok(())
}

/// Serializes profiles into the indexed format.
#[derive(Clone, Debug)]
pub struct IndexedWriter {
    version: ProfileVersion,
}

impl IndexedWriter {
    /// Creates a writer for the given version.
    pub fn new(version: ProfileVersion) -> Self {
        Self { version }
    }

    /// Writes the profile into `writer`.
    ///
    /// Fails with [`ErrorKind::WriteFailed`] if a value does not fit the field widths of the target
    /// version. Value profiles are dropped for versions that cannot store them.
    #[tracing::instrument(level = "trace", name = "IndexedWriter::serialize", skip_all)]
    pub fn serialize<W: Write>(&self, profile: &InstrProfile, writer: &mut W) -> Result<(), Error> {
        let schema = &self.version.schema().indexed;
        let width = schema.offset_width;
        let records = &profile.records;

        let num_buckets = records.len().max(1).next_power_of_two();
        let mut buckets = vec![Vec::new(); num_buckets];
        for (index, record) in records.iter().enumerate() {
            buckets[(record.hash & (num_buckets as u64 - 1)) as usize].push((record.hash, index));
        }

        let mut names = IndexMap::new();
        let mut names_blob = Vec::new();
        let mut values_blob = Vec::new();
        let mut value_refs = Vec::with_capacity(records.len());
        for record in records {
            let with_function = |e: Error| e.in_function(record.name.clone(), record.hash);
            if !names.contains_key(record.name.as_str()) {
                names.insert(record.name.as_str(), names_blob.len() as u64);
                names_blob.extend_from_slice(record.name.as_bytes());
            }

            let values = record.values.as_ref().filter(|values| !values.is_empty());
            let value_ref = match values {
                Some(values) if schema.has_value_profiles() => {
                    let offset = values_blob.len() as u64;
                    value_prof::encode(values, &mut values_blob).map_err(with_function)?;
                    (offset, values_blob.len() as u64 - offset)
                }
                Some(_) => {
                    tracing::warn!(
                        function = %record.id(),
                        version = %self.version,
                        "dropping value profile"
                    );
                    (0, 0)
                }
                None => (0, 0),
            };
            value_refs.push(value_ref);
        }

        let header_size = schema.header_size();
        let hash_table = header_size;
        let chains_start = hash_table + 8 + 8 * num_buckets;
        let mut chain_offsets = Vec::with_capacity(num_buckets);
        let mut offset = chains_start;
        for chain in &buckets {
            if chain.is_empty() {
                chain_offsets.push(0);
            } else {
                chain_offsets.push(offset as u64);
                offset += 4 + chain.len() * schema.chain_entry_size();
            }
        }
        let records_offset = offset;
        let counters_offset = records_offset + records.len() * schema.record_size();
        let num_counters: usize = records.iter().map(|r| r.counters.len()).sum();
        let counters_end = counters_offset + num_counters * schema.counter_width.size();
        let (value_profiles_offset, names_offset) = if schema.has_value_profiles() {
            (counters_end, counters_end + values_blob.len())
        } else {
            (counters_end, counters_end)
        };

        let mut out = vec![0; header_size];

        out.extend_from_slice(&(num_buckets as u64).to_le_bytes());
        for chain_offset in &chain_offsets {
            out.extend_from_slice(&chain_offset.to_le_bytes());
        }
        for chain in &buckets {
            if chain.is_empty() {
                continue;
            }
            out.extend_from_slice(&(chain.len() as u32).to_le_bytes());
            for &(hash, index) in chain {
                out.extend_from_slice(&hash.to_le_bytes());
                let record_offset = records_offset + index * schema.record_size();
                push_uint(&mut out, record_offset as u64, width)?;
            }
        }

        let mut counter_index = 0u64;
        for (record, &(value_offset, value_len)) in records.iter().zip(&value_refs) {
            let with_function = |e: Error| e.in_function(record.name.clone(), record.hash);
            let too_large = |what: &str| {
                with_function(
                    Error::new(ErrorKind::WriteFailed).with_detail(format!("{what} is too large")),
                )
            };

            push_uint(&mut out, names[record.name.as_str()], width).map_err(with_function)?;
            let name_len = u32::try_from(record.name.len()).map_err(|_| too_large("name"))?;
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(&record.hash.to_le_bytes());
            push_uint(&mut out, counter_index, width).map_err(with_function)?;
            let num_counters =
                u32::try_from(record.counters.len()).map_err(|_| too_large("counter count"))?;
            out.extend_from_slice(&num_counters.to_le_bytes());
            if schema.has_value_profiles() {
                push_uint(&mut out, value_offset, width).map_err(with_function)?;
                let value_len = u32::try_from(value_len).map_err(|_| too_large("value profile"))?;
                out.extend_from_slice(&value_len.to_le_bytes());
            }
            counter_index += record.counters.len() as u64;
        }

        for record in records {
            for &counter in &record.counters {
                push_uint(&mut out, counter, schema.counter_width)
                    .map_err(|e| e.in_function(record.name.clone(), record.hash))?;
            }
        }
        if schema.has_value_profiles() {
            out.extend_from_slice(&values_blob);
        }
        out.extend_from_slice(&names_blob);
        debug_assert_eq!(out.len(), names_offset + names_blob.len());

        let checksum = crc32(&out[header_size..]);
        let mut header = Vec::with_capacity(header_size);
        header.extend_from_slice(&INDEXED_MAGIC.to_le_bytes());
        header.extend_from_slice(&profile.kind.version_word(self.version.tag()).to_le_bytes());
        for field in schema.header {
            let value = match field {
                IndexedHeaderField::HashType => 0,
                IndexedHeaderField::Checksum => checksum.into(),
                IndexedHeaderField::HashTableOffset => hash_table as u64,
                IndexedHeaderField::RecordsOffset => records_offset as u64,
                IndexedHeaderField::CountersOffset => counters_offset as u64,
                IndexedHeaderField::ValueProfileOffset => value_profiles_offset as u64,
                IndexedHeaderField::NamesOffset => names_offset as u64,
            };
            push_uint(&mut header, value, width)?;
        }
        out[..header_size].copy_from_slice(&header);

        tracing::debug!(
            records = records.len(),
            buckets = num_buckets,
            size = out.len(),
            "writing indexed profile"
        );

        writer
            .write_all(&out)
            .map_err(|e| Error::new(ErrorKind::WriteFailed).with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(profile: &InstrProfile, version: ProfileVersion) -> Vec<u8> {
        let mut out = Vec::new();
        IndexedWriter::new(version)
            .serialize(profile, &mut out)
            .unwrap();
        out
    }

    fn sample() -> InstrProfile {
        let mut profile = InstrProfile::new(ProfileFormat::Indexed);
        profile.records = vec![
            FunctionRecord::new("main", 0x10, vec![1, 2, 3]),
            FunctionRecord::new("foo", 0x21, vec![4]),
            FunctionRecord::new("bar", 0x10, vec![5, 6]),
        ];
        profile
    }

    #[test]
    fn test_duplicate_hashes() {
        let data = write(&sample(), ProfileVersion::Llvm14);
        let indexed = IndexedProfile::parse(&data).unwrap();
        assert_eq!(indexed.len(), 3);

        let found = indexed.lookup(0x10).unwrap();
        let names: Vec<_> = found.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["main", "bar"]);

        assert_eq!(
            indexed.get("bar", 0x10).unwrap().unwrap().counters,
            vec![5, 6]
        );
        assert!(indexed.get("foo", 0x10).unwrap().is_none());
        assert!(indexed.lookup(0x99).unwrap().is_empty());
    }

    #[test]
    fn test_narrow_counters() {
        let data = write(&sample(), ProfileVersion::Llvm11);
        let profile = parse(&data, &ReadOptions::default()).unwrap();
        assert_eq!(profile.records, sample().records);

        let mut large = sample();
        large.records[1].counters[0] = u64::from(u32::MAX) + 1;
        let err = IndexedWriter::new(ProfileVersion::Llvm11)
            .serialize(&large, &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert_eq!(err.function().unwrap().name, "foo");
    }

    #[test]
    fn test_checksum() {
        let mut data = write(&sample(), ProfileVersion::Llvm13);
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let err = IndexedProfile::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = write(&sample(), ProfileVersion::Llvm12);
        data[0] = 0;
        let err = IndexedProfile::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadMagic);
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = write(&sample(), ProfileVersion::Llvm12);
        data[8] = 10;
        let err = IndexedProfile::parse(&data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
        assert_eq!(err.found_version(), Some(10));
    }

    #[test]
    fn test_corrupt_record_is_skippable() {
        let data = write(&sample(), ProfileVersion::Llvm12);
        let indexed = IndexedProfile::parse(&data).unwrap();
        let mut data = data.clone();

        // point the counters of the second record far past the counter section
        let record = indexed.sections.records + indexed.schema.record_size();
        let counter_index = record + 8 + 4 + 8;
        data[counter_index..counter_index + 8].copy_from_slice(&1000u64.to_le_bytes());

        let indexed = IndexedProfile::parse(&data).unwrap();
        let err = indexed.to_profile(&ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);

        let profile = indexed.to_profile(&ReadOptions::best_effort()).unwrap();
        assert_eq!(profile.records.len(), 2);
        assert_eq!(profile.skipped.len(), 1);
        assert_eq!(
            profile.skipped[0].function.as_ref().unwrap().name.as_str(),
            "foo"
        );
    }

    #[test]
    fn test_empty_profile() {
        let profile = InstrProfile::new(ProfileFormat::Indexed);
        for version in ProfileVersion::ALL {
            let data = write(&profile, version);
            let indexed = IndexedProfile::parse(&data).unwrap();
            assert!(indexed.is_empty());
            assert_eq!(indexed.version(), version);
        }
    }
}
