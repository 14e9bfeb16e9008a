//! A bounds-checked cursor over immutable input buffers.
//!
//! See the [`Reader`] struct for more documentation.

use std::str;

use scroll::{Endian, Pread};

use crate::error::{Error, ErrorKind};

/// The longest valid encoding of a 64-bit LEB128 integer.
pub const MAX_ULEB128_LEN: usize = 10;

/// Reads primitive values from a byte buffer.
///
/// The reader keeps track of an absolute offset into the buffer it was created from, so that errors
/// and alignment are always expressed relative to the start of the input. Every read checks bounds
/// first and fails with [`ErrorKind::TruncatedInput`] instead of panicking.
///
/// # Example
///
/// ```
/// use instrprof_common::Reader;
///
/// let mut reader = Reader::new(&[0x2a, 0, 0, 0, 0xe5, 0x8e, 0x26]);
/// assert_eq!(reader.read_u32().unwrap(), 42);
/// assert_eq!(reader.read_uleb128().unwrap(), 624_485);
/// assert!(reader.is_empty());
/// ```
#[derive(Clone, Debug)]
pub struct Reader<'data> {
    data: &'data [u8],
    offset: usize,
    endian: Endian,
}

impl<'data> Reader<'data> {
    /// Creates a little-endian reader positioned at the start of `data`.
    pub fn new(data: &'data [u8]) -> Self {
        Self::with_endian(data, Endian::Little)
    }

    /// Creates a reader with the given byte order.
    pub fn with_endian(data: &'data [u8], endian: Endian) -> Self {
        Self {
            data,
            offset: 0,
            endian,
        }
    }

    /// The full underlying buffer.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The current absolute offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The byte order used for fixed-width integers.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Returns `true` if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread part of the buffer.
    pub fn rest(&self) -> &'data [u8] {
        self.data.get(self.offset..).unwrap_or_default()
    }

    fn truncated(&self, needed: usize) -> Error {
        Error::new(ErrorKind::TruncatedInput)
            .at_offset(self.offset)
            .with_detail(format!(
                "{needed} bytes required, {} available",
                self.remaining()
            ))
    }

    /// Moves the cursor to an absolute offset.
    pub fn seek(&mut self, offset: usize) -> Result<(), Error> {
        if offset > self.data.len() {
            return Err(Error::new(ErrorKind::TruncatedInput)
                .at_offset(offset)
                .with_detail("seek past the end of input"));
        }
        self.offset = offset;
        Ok(())
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.read_bytes(len).map(|_| ())
    }

    /// Skips padding up to the next multiple of `align`, measured from the buffer start.
    pub fn align_to(&mut self, align: usize) -> Result<(), Error> {
        debug_assert!(align.is_power_of_two());
        let padding = (align - self.offset % align) % align;
        self.skip(padding)
    }

    /// Reads `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'data [u8], Error> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| self.truncated(len))?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| self.truncated(len))?;
        self.offset = end;
        Ok(bytes)
    }

    /// Reads `len` bytes as UTF-8 string.
    pub fn read_str(&mut self, len: usize) -> Result<&'data str, Error> {
        let start = self.offset;
        let bytes = self.read_bytes(len)?;
        str::from_utf8(bytes).map_err(|e| {
            Error::new(ErrorKind::InvalidEncoding)
                .at_offset(start)
                .with_source(e)
        })
    }

    /// Reads a string prefixed by its ULEB128 encoded length.
    pub fn read_uleb_str(&mut self) -> Result<&'data str, Error> {
        let len = self.read_uleb128()?;
        let len = usize::try_from(len).map_err(|_| self.truncated(usize::MAX))?;
        self.read_str(len)
    }

    fn read_fixed<T>(&mut self, size: usize) -> Result<T, Error>
    where
        T: scroll::ctx::TryFromCtx<'data, Endian, Error = scroll::Error>,
    {
        if self.remaining() < size {
            return Err(self.truncated(size));
        }
        let mut offset = self.offset;
        let value = self.data.gread_with(&mut offset, self.endian)?;
        self.offset = offset;
        Ok(value)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        self.read_fixed(1)
    }

    /// Reads a 16-bit integer in the reader's byte order.
    pub fn read_u16(&mut self) -> Result<u16, Error> {
        self.read_fixed(2)
    }

    /// Reads a 32-bit integer in the reader's byte order.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        self.read_fixed(4)
    }

    /// Reads a 64-bit integer in the reader's byte order.
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        self.read_fixed(8)
    }

    /// Reads an unsigned integer of the given byte width (4 or 8), widened to 64 bits.
    pub fn read_uint(&mut self, width: crate::Width) -> Result<u64, Error> {
        match width {
            crate::Width::U32 => self.read_u32().map(u64::from),
            crate::Width::U64 => self.read_u64(),
        }
    }

    /// Reads an unsigned LEB128 encoded integer.
    ///
    /// Encodings longer than [`MAX_ULEB128_LEN`] bytes or exceeding 64 bits fail with
    /// [`ErrorKind::InvalidEncoding`], since they signal corruption rather than a large value.
    pub fn read_uleb128(&mut self) -> Result<u64, Error> {
        let start = self.offset;
        let mut rest = self.rest();
        let available = rest.len();

        match leb128::read::unsigned(&mut rest) {
            Ok(value) => {
                self.offset += available - rest.len();
                Ok(value)
            }
            Err(leb128::read::Error::Overflow) => Err(Error::new(ErrorKind::InvalidEncoding)
                .at_offset(start)
                .with_detail("LEB128 value exceeds 64 bits")),
            Err(leb128::read::Error::IoError(e)) => Err(Error::new(ErrorKind::TruncatedInput)
                .at_offset(start)
                .with_source(e)),
        }
    }

    /// Reads an unsigned LEB128 integer that must fit into 32 bits.
    pub fn read_uleb128_u32(&mut self) -> Result<u32, Error> {
        let start = self.offset;
        let value = self.read_uleb128()?;
        u32::try_from(value).map_err(|_| {
            Error::new(ErrorKind::InvalidEncoding)
                .at_offset(start)
                .with_detail(format!("value {value} exceeds 32 bits"))
        })
    }

    /// Creates a reader over `len` bytes at absolute `offset`, sharing this reader's byte order.
    ///
    /// The returned reader reports offsets relative to the start of the sub-slice. An out of
    /// bounds range fails with [`ErrorKind::CorruptIndex`], since it can only be produced by an
    /// offset read from the input.
    pub fn sub_reader(&self, offset: usize, len: usize) -> Result<Reader<'data>, Error> {
        let slice = offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                Error::new(ErrorKind::CorruptIndex)
                    .at_offset(offset)
                    .with_detail(format!("range of {len} bytes is out of bounds"))
            })?;
        Ok(Reader::with_endian(slice, self.endian))
    }
}

/// Rounds `value` up to the next multiple of `align`.
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
