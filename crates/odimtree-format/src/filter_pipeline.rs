//! HDF5 Filter Pipeline message (type 0x000B).

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, pad8};
use crate::error::FormatError;

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SZIP: u16 = 4;

/// One filter of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    pub filter_id: u16,
    pub name: Option<String>,
    /// Bit 0: the filter is optional.
    pub flags: u16,
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    pub fn deflate(level: u32) -> FilterDescription {
        FilterDescription {
            filter_id: FILTER_DEFLATE,
            name: None,
            flags: 0,
            client_data: vec![level],
        }
    }

    pub fn shuffle(element_size: u32) -> FilterDescription {
        FilterDescription {
            filter_id: FILTER_SHUFFLE,
            name: None,
            flags: 0,
            client_data: vec![element_size],
        }
    }
}

/// Ordered filters applied to every chunk on write (and reversed on read).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescription>,
}

impl FilterPipeline {
    pub fn parse(data: &[u8]) -> Result<FilterPipeline, FormatError> {
        ensure_len(data, 0, 2)?;
        let version = data[0];
        let count = data[1] as usize;
        let mut pos = match version {
            // six reserved bytes
            1 => 8,
            2 => 2,
            v => {
                return Err(FormatError::InvalidStructureVersion {
                    kind: "filter pipeline",
                    version: v,
                })
            }
        };

        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            ensure_len(data, pos, 2)?;
            let filter_id = LittleEndian::read_u16(&data[pos..pos + 2]);
            pos += 2;
            let name_len = if version == 1 || filter_id >= 256 {
                ensure_len(data, pos, 2)?;
                let n = LittleEndian::read_u16(&data[pos..pos + 2]) as usize;
                pos += 2;
                n
            } else {
                0
            };
            ensure_len(data, pos, 4)?;
            let flags = LittleEndian::read_u16(&data[pos..pos + 2]);
            let values = LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
            pos += 4;

            let name = if name_len > 0 {
                ensure_len(data, pos, name_len)?;
                let raw = &data[pos..pos + name_len];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                pos += if version == 1 { pad8(name_len) } else { name_len };
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            } else {
                None
            };

            ensure_len(data, pos, 4 * values)?;
            let client_data = (0..values)
                .map(|i| LittleEndian::read_u32(&data[pos + 4 * i..pos + 4 * i + 4]))
                .collect();
            pos += 4 * values;
            if version == 1 && values % 2 == 1 {
                pos += 4;
            }

            filters.push(FilterDescription {
                filter_id,
                name,
                flags,
                client_data,
            });
        }
        Ok(FilterPipeline { filters })
    }

    /// Encode as a version 2 pipeline message.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![2, self.filters.len() as u8];
        for f in &self.filters {
            buf.extend_from_slice(&f.filter_id.to_le_bytes());
            let name = f.name.as_deref().filter(|_| f.filter_id >= 256);
            if f.filter_id >= 256 {
                let len = name.map(|n| n.len() + 1).unwrap_or(0);
                buf.extend_from_slice(&(len as u16).to_le_bytes());
            }
            buf.extend_from_slice(&f.flags.to_le_bytes());
            buf.extend_from_slice(&(f.client_data.len() as u16).to_le_bytes());
            if let Some(n) = name {
                buf.extend_from_slice(n.as_bytes());
                buf.push(0);
            }
            for v in &f.client_data {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
