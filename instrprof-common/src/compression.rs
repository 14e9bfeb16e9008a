use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, ErrorKind};
use crate::reader::Reader;

/// Reads a possibly compressed chunk.
///
/// A chunk starts with the ULEB128 encoded uncompressed and compressed sizes. A compressed size of
/// zero means the payload is stored verbatim, otherwise it is a zlib stream that must inflate to
/// exactly the uncompressed size.
pub fn read_chunk<'data>(reader: &mut Reader<'data>) -> Result<Cow<'data, [u8]>, Error> {
    let start = reader.offset();
    let uncompressed_len = reader.read_uleb128()?;
    let compressed_len = reader.read_uleb128()?;

    if compressed_len == 0 {
        let len = usize::try_from(uncompressed_len).map_err(|_| {
            Error::new(ErrorKind::TruncatedInput).at_offset(start)
        })?;
        return reader.read_bytes(len).map(Cow::Borrowed);
    }

    let len = usize::try_from(compressed_len)
        .map_err(|_| Error::new(ErrorKind::TruncatedInput).at_offset(start))?;
    let compressed = reader.read_bytes(len)?;

    let invalid = |detail: String| {
        Error::new(ErrorKind::InvalidEncoding)
            .at_offset(start)
            .with_detail(detail)
    };

    let mut decompressed = Vec::new();
    let mut decoder = ZlibDecoder::new(compressed);
    decoder
        .by_ref()
        .take(uncompressed_len)
        .read_to_end(&mut decompressed)
        .map_err(|e| invalid(format!("bad zlib payload: {e}")))?;

    // The payload must be exhausted. Since the decoder reads from a slice, any error here means
    // there was more data.
    if decompressed.len() as u64 != uncompressed_len || !matches!(decoder.read(&mut [0; 1]), Ok(0))
    {
        return Err(invalid(format!(
            "chunk does not inflate to {uncompressed_len} bytes"
        )));
    }

    Ok(Cow::Owned(decompressed))
}

/// Appends `payload` as a chunk readable by [`read_chunk`], compressing it if requested.
pub fn write_chunk(payload: &[u8], compress: bool, out: &mut Vec<u8>) -> Result<(), Error> {
    let write_failed = |e: std::io::Error| Error::new(ErrorKind::WriteFailed).with_source(e);

    let compressed = if compress && !payload.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).map_err(write_failed)?;
        Some(encoder.finish().map_err(write_failed)?)
    } else {
        None
    };

    leb128::write::unsigned(out, payload.len() as u64).map_err(write_failed)?;
    match compressed {
        Some(compressed) => {
            leb128::write::unsigned(out, compressed.len() as u64).map_err(write_failed)?;
            out.extend_from_slice(&compressed);
        }
        None => {
            leb128::write::unsigned(out, 0).map_err(write_failed)?;
            out.extend_from_slice(payload);
        }
    }

    Ok(())
}
