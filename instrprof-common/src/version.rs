//! Per-version layout tables for all supported toolchain releases.
//!
//! Every supported version has exactly one [`VersionSchema`] entry in [`SCHEMAS`]. Readers never
//! branch on a version number directly, instead they consult the schema of the version tag they
//! found in the input. Supporting another release amounts to appending a row to the table, plus
//! whatever handling a genuinely new field needs.

use std::fmt;

use serde::Serialize;

use crate::error::Error;

/// Version tags of all supported toolchain releases, in ascending order.
pub const SUPPORTED_VERSION_TAGS: [u64; 4] = [11, 12, 13, 14];

/// A supported toolchain release that produced a profile or coverage mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProfileVersion {
    /// Toolchain release 11.
    Llvm11,
    /// Toolchain release 12.
    Llvm12,
    /// Toolchain release 13.
    Llvm13,
    /// Toolchain release 14.
    Llvm14,
}

impl ProfileVersion {
    /// All supported versions, oldest first.
    pub const ALL: [ProfileVersion; 4] = [
        ProfileVersion::Llvm11,
        ProfileVersion::Llvm12,
        ProfileVersion::Llvm13,
        ProfileVersion::Llvm14,
    ];

    /// The most recent supported version, used by writers by default.
    pub const LATEST: ProfileVersion = ProfileVersion::Llvm14;

    /// Resolves an embedded version tag.
    ///
    /// Fails with `UnsupportedVersion` if the tag matches none of the table entries.
    pub fn from_tag(tag: u64) -> Result<Self, Error> {
        VersionSchema::lookup(tag).map(|schema| schema.version)
    }

    /// The tag written into file headers for this version.
    pub fn tag(self) -> u64 {
        self.schema().tag
    }

    /// The layout table of this version.
    pub fn schema(self) -> &'static VersionSchema {
        match self {
            ProfileVersion::Llvm11 => &SCHEMAS[0],
            ProfileVersion::Llvm12 => &SCHEMAS[1],
            ProfileVersion::Llvm13 => &SCHEMAS[2],
            ProfileVersion::Llvm14 => &SCHEMAS[3],
        }
    }
}

impl fmt::Display for ProfileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LLVM {}", self.tag())
    }
}

/// Width of an integer field whose size changed between versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    /// A 32-bit field.
    U32,
    /// A 64-bit field.
    U64,
}

impl Width {
    /// The size of the field in bytes.
    pub fn size(self) -> usize {
        match self {
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }

    /// The largest value that fits into a field of this width.
    pub fn max_value(self) -> u64 {
        match self {
            Width::U32 => u32::MAX as u64,
            Width::U64 => u64::MAX,
        }
    }
}

/// A 64-bit field of the raw profile header, following magic and version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawHeaderField {
    /// Size in bytes of the binary id section.
    BinaryIdsSize,
    /// Number of per-function data records.
    DataSize,
    /// Padding between the data records and the counters.
    PaddingBytesBeforeCounters,
    /// Number of 64-bit counters.
    CountersSize,
    /// Padding between the counters and the names.
    PaddingBytesAfterCounters,
    /// Size in bytes of the names section.
    NamesSize,
    /// Base address used to resolve counter pointers.
    CountersDelta,
    /// Base address of the names section in the profiled process.
    NamesDelta,
    /// The last value kind known to the runtime.
    ValueKindLast,
}

/// Layout of a raw (per-process dump) profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSchema {
    /// Header fields after magic and version, in file order.
    pub header: &'static [RawHeaderField],
    /// Counter pointers are relative to their data record instead of absolute addresses.
    pub relative_counters: bool,
}

impl RawSchema {
    /// Whether a binary id section follows the header.
    pub fn has_binary_ids(&self) -> bool {
        self.header.contains(&RawHeaderField::BinaryIdsSize)
    }

    /// Size of the full header including magic and version.
    pub fn header_size(&self) -> usize {
        16 + 8 * self.header.len()
    }
}

/// A field of the indexed profile header, following magic and version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexedHeaderField {
    /// The hash function used for the table. Only `0` is defined.
    HashType,
    /// CRC32 of everything following the header.
    Checksum,
    /// Absolute offset of the hash table.
    HashTableOffset,
    /// Absolute offset of the function record table.
    RecordsOffset,
    /// Absolute offset of the counter section.
    CountersOffset,
    /// Absolute offset of the value profile section.
    ValueProfileOffset,
    /// Absolute offset of the names section.
    NamesOffset,
}

/// Layout of an indexed (on-disk summary) profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedSchema {
    /// Header fields after magic and version, in file order.
    pub header: &'static [IndexedHeaderField],
    /// Width of header fields and of offsets stored in the hash table and records.
    pub offset_width: Width,
    /// Width of a single counter value.
    pub counter_width: Width,
}

impl IndexedSchema {
    /// Whether the header carries a checksum.
    pub fn has_checksum(&self) -> bool {
        self.header.contains(&IndexedHeaderField::Checksum)
    }

    /// Whether records may carry value profile data.
    pub fn has_value_profiles(&self) -> bool {
        self.header.contains(&IndexedHeaderField::ValueProfileOffset)
    }

    /// Size of the full header including magic and version.
    pub fn header_size(&self) -> usize {
        16 + self.offset_width.size() * self.header.len()
    }

    /// Size of a single entry in a hash table chain.
    pub fn chain_entry_size(&self) -> usize {
        8 + self.offset_width.size()
    }

    /// Size of a single function record.
    pub fn record_size(&self) -> usize {
        let ow = self.offset_width.size();
        let base = ow + 4 + 8 + ow + 4;
        if self.has_value_profiles() {
            base + ow + 4
        } else {
            base
        }
    }
}

/// Layout of a coverage mapping section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingSchema {
    /// The filename table carries a compression header.
    pub compressed_filenames: bool,
    /// Branch regions with two counters may occur.
    pub branch_regions: bool,
    /// The first filename is the compilation directory for relative names.
    pub compilation_dir: bool,
    /// Function records are padded to 8 bytes.
    pub aligned_records: bool,
}

/// The layout of all encodings for a single supported version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionSchema {
    /// The version this entry describes.
    pub version: ProfileVersion,
    /// The tag embedded in file headers.
    pub tag: u64,
    /// Raw profile layout.
    pub raw: RawSchema,
    /// Indexed profile layout.
    pub indexed: IndexedSchema,
    /// Coverage mapping layout.
    pub mapping: MappingSchema,
}

impl VersionSchema {
    /// Finds the table entry for an embedded version tag.
    pub fn lookup(tag: u64) -> Result<&'static VersionSchema, Error> {
        SCHEMAS
            .iter()
            .find(|schema| schema.tag == tag)
            .ok_or_else(|| Error::unsupported_version(tag))
    }
}

use IndexedHeaderField as I;
use RawHeaderField as R;

const RAW_HEADER: &[RawHeaderField] = &[
    R::DataSize,
    R::PaddingBytesBeforeCounters,
    R::CountersSize,
    R::PaddingBytesAfterCounters,
    R::NamesSize,
    R::CountersDelta,
    R::NamesDelta,
    R::ValueKindLast,
];

const RAW_HEADER_BINARY_IDS: &[RawHeaderField] = &[
    R::BinaryIdsSize,
    R::DataSize,
    R::PaddingBytesBeforeCounters,
    R::CountersSize,
    R::PaddingBytesAfterCounters,
    R::NamesSize,
    R::CountersDelta,
    R::NamesDelta,
    R::ValueKindLast,
];

/// The version table.
pub static SCHEMAS: [VersionSchema; 4] = [
    VersionSchema {
        version: ProfileVersion::Llvm11,
        tag: 11,
        raw: RawSchema {
            header: RAW_HEADER,
            relative_counters: false,
        },
        indexed: IndexedSchema {
            header: &[
                I::HashTableOffset,
                I::RecordsOffset,
                I::CountersOffset,
                I::NamesOffset,
            ],
            offset_width: Width::U32,
            counter_width: Width::U32,
        },
        mapping: MappingSchema {
            compressed_filenames: false,
            branch_regions: false,
            compilation_dir: false,
            aligned_records: false,
        },
    },
    VersionSchema {
        version: ProfileVersion::Llvm12,
        tag: 12,
        raw: RawSchema {
            header: RAW_HEADER,
            relative_counters: false,
        },
        indexed: IndexedSchema {
            header: &[
                I::HashType,
                I::HashTableOffset,
                I::RecordsOffset,
                I::CountersOffset,
                I::NamesOffset,
                I::ValueProfileOffset,
            ],
            offset_width: Width::U64,
            counter_width: Width::U64,
        },
        mapping: MappingSchema {
            compressed_filenames: true,
            branch_regions: true,
            compilation_dir: false,
            aligned_records: false,
        },
    },
    VersionSchema {
        version: ProfileVersion::Llvm13,
        tag: 13,
        raw: RawSchema {
            header: RAW_HEADER_BINARY_IDS,
            relative_counters: false,
        },
        indexed: IndexedSchema {
            header: &[
                I::HashType,
                I::Checksum,
                I::HashTableOffset,
                I::RecordsOffset,
                I::CountersOffset,
                I::ValueProfileOffset,
                I::NamesOffset,
            ],
            offset_width: Width::U64,
            counter_width: Width::U64,
        },
        mapping: MappingSchema {
            compressed_filenames: true,
            branch_regions: true,
            compilation_dir: true,
            aligned_records: false,
        },
    },
    VersionSchema {
        version: ProfileVersion::Llvm14,
        tag: 14,
        raw: RawSchema {
            header: RAW_HEADER_BINARY_IDS,
            relative_counters: true,
        },
        indexed: IndexedSchema {
            header: &[
                I::HashType,
                I::HashTableOffset,
                I::RecordsOffset,
                I::CountersOffset,
                I::ValueProfileOffset,
                I::NamesOffset,
                I::Checksum,
            ],
            offset_width: Width::U64,
            counter_width: Width::U64,
        },
        mapping: MappingSchema {
            compressed_filenames: true,
            branch_regions: true,
            compilation_dir: true,
            aligned_records: true,
        },
    },
];
