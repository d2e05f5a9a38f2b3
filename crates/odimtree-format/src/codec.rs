//! Little-endian field helpers shared by every structure parser and writer.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// Offset and length field widths taken from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    /// Size of file addresses in bytes.
    pub offset: u8,
    /// Size of lengths in bytes.
    pub length: u8,
}

impl Default for Sizes {
    fn default() -> Self {
        Sizes { offset: 8, length: 8 }
    }
}

impl Sizes {
    /// Validate that both widths are 2, 4, or 8.
    pub fn new(offset: u8, length: u8) -> Result<Sizes, FormatError> {
        if !matches!(offset, 2 | 4 | 8) {
            return Err(FormatError::InvalidOffsetSize(offset));
        }
        if !matches!(length, 2 | 4 | 8) {
            return Err(FormatError::InvalidLengthSize(length));
        }
        Ok(Sizes { offset, length })
    }

    /// The all-ones "undefined address" value for this offset width.
    pub fn undefined(&self) -> u64 {
        match self.offset {
            2 => 0xFFFF,
            4 => 0xFFFF_FFFF,
            _ => u64::MAX,
        }
    }

    pub fn is_undefined(&self, addr: u64) -> bool {
        addr == self.undefined()
    }

    pub fn read_offset(&self, data: &[u8], pos: usize) -> Result<u64, FormatError> {
        read_uint(data, pos, self.offset as usize)
    }

    pub fn read_length(&self, data: &[u8], pos: usize) -> Result<u64, FormatError> {
        read_uint(data, pos, self.length as usize)
    }

    pub fn write_offset(&self, buf: &mut Vec<u8>, value: u64) -> Result<(), FormatError> {
        write_uint(buf, value, self.offset as usize)
    }

    pub fn write_length(&self, buf: &mut Vec<u8>, value: u64) -> Result<(), FormatError> {
        write_uint(buf, value, self.length as usize)
    }

    /// Write the undefined address.
    pub fn write_undefined(&self, buf: &mut Vec<u8>) {
        buf.extend(std::iter::repeat(0xFF).take(self.offset as usize));
    }
}

pub fn ensure_len(data: &[u8], offset: usize, needed: usize) -> Result<(), FormatError> {
    match offset.checked_add(needed) {
        Some(end) if end <= data.len() => Ok(()),
        _ => Err(FormatError::UnexpectedEof {
            expected: offset.saturating_add(needed),
            available: data.len(),
        }),
    }
}

/// Read an unsigned integer of 1, 2, 4, or 8 bytes.
pub fn read_uint(data: &[u8], pos: usize, nbytes: usize) -> Result<u64, FormatError> {
    ensure_len(data, pos, nbytes)?;
    let slice = &data[pos..pos + nbytes];
    Ok(match nbytes {
        1 => slice[0] as u64,
        2 => LittleEndian::read_u16(slice) as u64,
        4 => LittleEndian::read_u32(slice) as u64,
        8 => LittleEndian::read_u64(slice),
        n => LittleEndian::read_uint(slice, n),
    })
}

/// Append `value` as an `nbytes`-wide little-endian integer.
pub fn write_uint(buf: &mut Vec<u8>, value: u64, nbytes: usize) -> Result<(), FormatError> {
    if nbytes < 8 && value >> (nbytes * 8) != 0 {
        return Err(FormatError::ValueTooWide {
            value,
            width: nbytes,
        });
    }
    buf.extend_from_slice(&value.to_le_bytes()[..nbytes]);
    Ok(())
}

/// Read a null-terminated string; returns the string and the bytes consumed
/// including the terminator.
pub fn read_cstring(data: &[u8], pos: usize) -> Result<(String, usize), FormatError> {
    ensure_len(data, pos, 1)?;
    let rest = &data[pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(FormatError::UnexpectedEof {
            expected: data.len() + 1,
            available: data.len(),
        })?;
    Ok((String::from_utf8_lossy(&rest[..nul]).into_owned(), nul + 1))
}

/// Round up to the next multiple of 8.
pub fn pad8(x: usize) -> usize {
    (x + 7) & !7
}
