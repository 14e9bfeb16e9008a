//! The value profile blob shared by raw and indexed profiles.
//!
//! ```text
//! total_size u32, num_value_kinds u32,
//! repeat num_value_kinds times:
//!   kind u32, num_value_sites u32,
//!   site_count [u8; num_value_sites], padding to 8 bytes,
//!   [{ value u64, count u64 }; sum(site_count)]
//! ```
//!
//! `total_size` covers the entire blob and is a multiple of 8.

use instrprof_common::{align_up, Error, ErrorKind, Reader};

use crate::record::{ValueData, ValueKind, ValueProfile};

/// Size of the blob header.
const HEADER_SIZE: usize = 8;

/// Reads the framing of a blob and returns a reader over the full blob.
///
/// Errors in here desynchronize all blobs that follow, so they are never recoverable.
pub(crate) fn read_blob<'data>(reader: &mut Reader<'data>) -> Result<Reader<'data>, Error> {
    let start = reader.offset();
    let total_size = reader.read_u32()? as usize;
    if total_size < HEADER_SIZE || total_size % 8 != 0 {
        return Err(Error::new(ErrorKind::InvalidEncoding)
            .at_offset(start)
            .with_detail(format!("invalid value profile size {total_size}")));
    }

    reader.seek(start)?;
    let blob = reader.read_bytes(total_size)?;
    Ok(Reader::with_endian(blob, reader.endian()))
}

/// Decodes a blob returned by [`read_blob`].
///
/// If `declared_sites` is given, the number of sites per kind must match it.
pub(crate) fn decode_blob(
    mut blob: Reader<'_>,
    declared_sites: Option<[u16; 2]>,
) -> Result<ValueProfile, Error> {
    let total_size = blob.remaining();
    blob.skip(4)?;
    let num_kinds = blob.read_u32()?;
    if num_kinds as usize > ValueKind::ALL.len() {
        return Err(Error::new(ErrorKind::InvalidEncoding)
            .with_detail(format!("{num_kinds} value kinds in value profile")));
    }

    let mut profile = ValueProfile::default();
    let mut seen = [false; 2];

    for _ in 0..num_kinds {
        let raw_kind = blob.read_u32()?;
        let kind = ValueKind::from_u32(raw_kind)
            .filter(|kind| !seen[kind.as_u32() as usize])
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidEncoding)
                    .with_detail(format!("unexpected value kind {raw_kind}"))
            })?;
        seen[kind.as_u32() as usize] = true;

        let num_sites = blob.read_u32()? as usize;
        let site_counts = blob.read_bytes(num_sites)?;
        blob.align_to(8)?;

        let sites = profile.sites_mut(kind);
        for &count in site_counts {
            let mut site = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let value = blob.read_u64()?;
                let count = blob.read_u64()?;
                site.push(ValueData { value, count });
            }
            sites.push(site);
        }
    }

    if !blob.is_empty() {
        return Err(Error::new(ErrorKind::InvalidEncoding).with_detail(format!(
            "value profile declares {total_size} bytes but uses {}",
            blob.offset()
        )));
    }

    if let Some(declared) = declared_sites {
        for kind in ValueKind::ALL {
            let expected = declared[kind.as_u32() as usize] as usize;
            let found = profile.sites(kind).len();
            if expected != found {
                return Err(Error::new(ErrorKind::InvalidEncoding).with_detail(format!(
                    "expected {expected} {kind:?} sites, found {found}"
                )));
            }
        }
    }

    Ok(profile)
}

/// The number of bytes [`encode`] produces for the given profile.
pub(crate) fn encoded_size(profile: &ValueProfile) -> usize {
    let mut size = HEADER_SIZE;
    for kind in ValueKind::ALL {
        let sites = profile.sites(kind);
        if sites.is_empty() {
            continue;
        }
        let num_values: usize = sites.iter().map(Vec::len).sum();
        size += 8 + align_up(sites.len(), 8) + 16 * num_values;
    }
    size
}

/// Appends the little-endian encoding of a value profile to `out`.
///
/// Kinds without sites are omitted. Sites with more than 255 values cannot be represented and fail
/// with [`ErrorKind::WriteFailed`].
pub(crate) fn encode(profile: &ValueProfile, out: &mut Vec<u8>) -> Result<(), Error> {
    let start = out.len();
    let total_size = u32::try_from(encoded_size(profile)).map_err(|_| {
        Error::new(ErrorKind::WriteFailed).with_detail("value profile exceeds 4GiB")
    })?;
    let num_kinds = ValueKind::ALL
        .iter()
        .filter(|&&kind| !profile.sites(kind).is_empty())
        .count() as u32;

    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(&num_kinds.to_le_bytes());

    for kind in ValueKind::ALL {
        let sites = profile.sites(kind);
        if sites.is_empty() {
            continue;
        }

        out.extend_from_slice(&kind.as_u32().to_le_bytes());
        out.extend_from_slice(&(sites.len() as u32).to_le_bytes());
        for site in sites {
            let count = u8::try_from(site.len()).map_err(|_| {
                Error::new(ErrorKind::WriteFailed)
                    .with_detail(format!("{} values in a single {kind:?} site", site.len()))
            })?;
            out.push(count);
        }
        out.resize(start + align_up(out.len() - start, 8), 0);

        for data in sites.iter().flatten() {
            out.extend_from_slice(&data.value.to_le_bytes());
            out.extend_from_slice(&data.count.to_le_bytes());
        }
    }

    debug_assert_eq!(out.len() - start, total_size as usize);
    Ok(())
}
