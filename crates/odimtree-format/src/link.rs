//! Link-storage messages of "new style" groups: Link (0x0006),
//! Link Info (0x0002) and Group Info (0x000A).

use crate::codec::{ensure_len, read_cstring, read_uint, write_uint, Sizes};
use crate::error::FormatError;

/// What a link points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Hard link to an object header address.
    Hard(u64),
    /// Soft link holding a path inside the same file.
    Soft(String),
    /// External link to an object in another file.
    External { filename: String, path: String },
}

/// A parsed Link message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub name: String,
    pub target: LinkTarget,
    pub creation_order: Option<u64>,
}

const LINK_CREATION_ORDER: u8 = 0x04;
const LINK_TYPE_PRESENT: u8 = 0x08;
const LINK_CHARSET_PRESENT: u8 = 0x10;

impl LinkMessage {
    pub fn hard(name: &str, address: u64) -> LinkMessage {
        LinkMessage {
            name: name.to_string(),
            target: LinkTarget::Hard(address),
            creation_order: None,
        }
    }

    pub fn parse(data: &[u8], sizes: Sizes) -> Result<LinkMessage, FormatError> {
        ensure_len(data, 0, 2)?;
        if data[0] != 1 {
            return Err(FormatError::InvalidStructureVersion {
                kind: "link",
                version: data[0],
            });
        }
        let flags = data[1];
        let mut pos = 2;

        let link_type = if flags & LINK_TYPE_PRESENT != 0 {
            pos += 1;
            read_uint(data, pos - 1, 1)? as u8
        } else {
            0
        };
        let creation_order = if flags & LINK_CREATION_ORDER != 0 {
            pos += 8;
            Some(read_uint(data, pos - 8, 8)?)
        } else {
            None
        };
        if flags & LINK_CHARSET_PRESENT != 0 {
            pos += 1;
        }

        let width = 1usize << (flags & 0x03);
        let name_len = read_uint(data, pos, width)? as usize;
        pos += width;
        ensure_len(data, pos, name_len)?;
        let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
        pos += name_len;

        let target = match link_type {
            0 => LinkTarget::Hard(sizes.read_offset(data, pos)?),
            1 => {
                let len = read_uint(data, pos, 2)? as usize;
                ensure_len(data, pos + 2, len)?;
                LinkTarget::Soft(String::from_utf8_lossy(&data[pos + 2..pos + 2 + len]).into_owned())
            }
            64 => {
                // length(2) flags(1) filename\0 path\0
                let (filename, used) = read_cstring(data, pos + 3)?;
                let (path, _) = read_cstring(data, pos + 3 + used)?;
                LinkTarget::External { filename, path }
            }
            other => {
                return Err(FormatError::Unsupported(format!("user-defined link type {other}")))
            }
        };

        Ok(LinkMessage {
            name,
            target,
            creation_order,
        })
    }

    pub fn serialize(&self, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let name = self.name.as_bytes();
        let width_bits: u8 = match name.len() {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            _ => 2,
        };
        let mut flags = width_bits;
        if self.creation_order.is_some() {
            flags |= LINK_CREATION_ORDER;
        }
        let type_byte = match &self.target {
            LinkTarget::Hard(_) => None,
            LinkTarget::Soft(_) => Some(1u8),
            LinkTarget::External { .. } => Some(64u8),
        };
        if type_byte.is_some() {
            flags |= LINK_TYPE_PRESENT;
        }

        let mut buf = vec![1, flags];
        if let Some(t) = type_byte {
            buf.push(t);
        }
        if let Some(order) = self.creation_order {
            buf.extend_from_slice(&order.to_le_bytes());
        }
        write_uint(&mut buf, name.len() as u64, 1 << width_bits)?;
        buf.extend_from_slice(name);

        match &self.target {
            LinkTarget::Hard(addr) => sizes.write_offset(&mut buf, *addr)?,
            LinkTarget::Soft(path) => {
                write_uint(&mut buf, path.len() as u64, 2)?;
                buf.extend_from_slice(path.as_bytes());
            }
            LinkTarget::External { filename, path } => {
                let len = filename.len() + path.len() + 3;
                write_uint(&mut buf, len as u64, 2)?;
                buf.push(0);
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
            }
        }
        Ok(buf)
    }
}

/// Link Info message: where a group keeps links that outgrew compact storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Fractal heap holding dense link storage, if any.
    pub fractal_heap_address: Option<u64>,
    pub name_index_address: Option<u64>,
}

impl LinkInfo {
    /// Link info of a group whose links are all stored compactly.
    pub fn compact() -> LinkInfo {
        LinkInfo {
            fractal_heap_address: None,
            name_index_address: None,
        }
    }

    pub fn parse(data: &[u8], sizes: Sizes) -> Result<LinkInfo, FormatError> {
        ensure_len(data, 0, 2)?;
        if data[0] != 0 {
            return Err(FormatError::InvalidStructureVersion {
                kind: "link info",
                version: data[0],
            });
        }
        let mut pos = 2;
        if data[1] & 0x01 != 0 {
            // maximum creation index
            pos += 8;
        }
        let heap = sizes.read_offset(data, pos)?;
        let index = sizes.read_offset(data, pos + sizes.offset as usize)?;
        let defined = |a: u64| (!sizes.is_undefined(a)).then_some(a);
        Ok(LinkInfo {
            fractal_heap_address: defined(heap),
            name_index_address: defined(index),
        })
    }

    pub fn serialize(&self, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let mut buf = vec![0, 0];
        for addr in [self.fractal_heap_address, self.name_index_address] {
            match addr {
                Some(a) => sizes.write_offset(&mut buf, a)?,
                None => sizes.write_undefined(&mut buf),
            }
        }
        Ok(buf)
    }
}

/// Group Info message with library defaults (no stored thresholds).
pub fn group_info_message() -> Vec<u8> {
    vec![0, 0]
}
