use std::fmt;

use serde::Serialize;

use instrprof_common::{Error, ErrorKind, ProfileVersion, ReadOptions, Reader, VersionSchema};

use crate::record::{InstrProfile, ProfileKind};
use crate::{indexed, raw, text};

/// An on-disk encoding of execution count profiles.
///
/// Variants are ordered by how far the data has been processed: raw dumps are merged into text or
/// indexed profiles, never the other way round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProfileFormat {
    /// A raw profile dumped by an instrumented process.
    Raw,
    /// The human readable text format.
    Text,
    /// The indexed format produced by merging.
    Indexed,
}

impl ProfileFormat {
    /// Detects the encoding of a buffer by its magic.
    ///
    /// Buffers without a binary magic are treated as text if they start with printable ASCII.
    pub fn detect(data: &[u8]) -> Option<ProfileFormat> {
        if raw::is_raw(data) {
            Some(ProfileFormat::Raw)
        } else if indexed::is_indexed(data) {
            Some(ProfileFormat::Indexed)
        } else if text::is_text(data) {
            Some(ProfileFormat::Text)
        } else {
            None
        }
    }
}

impl fmt::Display for ProfileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileFormat::Raw => write!(f, "raw"),
            ProfileFormat::Text => write!(f, "text"),
            ProfileFormat::Indexed => write!(f, "indexed"),
        }
    }
}

/// The identifying fields of a profile, read without decoding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileHeader {
    /// The encoding of the profile.
    pub format: ProfileFormat,
    /// The toolchain version. Text profiles do not record one.
    pub version: Option<ProfileVersion>,
    /// The variant flags.
    pub kind: ProfileKind,
}

/// Reads the magic and version of a profile.
///
/// Only the first 16 bytes of binary profiles are inspected. For text profiles, the leading header
/// lines are parsed.
pub fn peek(data: &[u8]) -> Result<ProfileHeader, Error> {
    let format = ProfileFormat::detect(data).ok_or_else(|| {
        Error::new(ErrorKind::BadMagic)
            .at_offset(0)
            .with_detail("not a raw, indexed or text profile")
    })?;

    if format == ProfileFormat::Text {
        return Ok(ProfileHeader {
            format,
            version: None,
            kind: text::peek_kind(data)?,
        });
    }

    let endian = match raw::detect_magic(data) {
        Some((endian, _)) => endian,
        None => scroll::Endian::Little,
    };
    let mut reader = Reader::with_endian(data, endian);
    reader.skip(8)?;
    let word = reader.read_u64()?;

    let (tag, kind) = ProfileKind::split_version(word);
    let schema = VersionSchema::lookup(tag).map_err(|e| e.at_offset(8))?;

    Ok(ProfileHeader {
        format,
        version: Some(schema.version),
        kind,
    })
}

/// Decodes a profile in any supported encoding and version.
///
/// This is a shortcut for [`read_profile_with`] using strict [`ReadOptions`].
pub fn read_profile(data: &[u8]) -> Result<InstrProfile, Error> {
    read_profile_with(data, &ReadOptions::default())
}

/// Decodes a profile in any supported encoding and version.
///
/// The encoding is detected from the magic, the version from the embedded version tag. Fails with
/// [`ErrorKind::BadMagic`] if the buffer is neither a binary nor a text profile, and with
/// [`ErrorKind::UnsupportedVersion`] if the tag names no supported version.
#[tracing::instrument(level = "trace", name = "read_profile", skip_all)]
pub fn read_profile_with(data: &[u8], options: &ReadOptions) -> Result<InstrProfile, Error> {
    let profile = match ProfileFormat::detect(data) {
        Some(ProfileFormat::Raw) => raw::parse(data, options)?,
        Some(ProfileFormat::Indexed) => indexed::parse(data, options)?,
        Some(ProfileFormat::Text) => text::parse(data, options)?,
        None => {
            return Err(Error::new(ErrorKind::BadMagic)
                .at_offset(0)
                .with_detail("not a raw, indexed or text profile"))
        }
    };

    tracing::debug!(
        format = %profile.format,
        records = profile.records.len(),
        skipped = profile.skipped.len(),
        "read profile"
    );

    Ok(profile)
}
