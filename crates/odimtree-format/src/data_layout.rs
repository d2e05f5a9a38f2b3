//! HDF5 Data Layout message (type 0x0008).

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, Sizes};
use crate::error::FormatError;

/// Where and how a dataset's raw data is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLayout {
    /// Data embedded in the layout message itself.
    Compact { data: Vec<u8> },
    /// One contiguous block; `None` when storage was never allocated.
    Contiguous { address: Option<u64>, size: u64 },
    /// Chunks indexed by a version 1 B-tree.
    Chunked {
        btree_address: Option<u64>,
        /// Chunk extent per dimension, plus the element size as last entry.
        dimensions: Vec<u32>,
    },
}

impl DataLayout {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<DataLayout, FormatError> {
        ensure_len(data, 0, 2)?;
        match data[0] {
            1 | 2 => Self::parse_v1v2(data, sizes),
            3 => Self::parse_v3(data, sizes),
            4 => match data[1] {
                0 | 1 => Self::parse_v3(data, sizes),
                2 => Err(FormatError::Unsupported(
                    "version 4 chunk indexes".into(),
                )),
                3 => Err(FormatError::Unsupported("virtual datasets".into())),
                c => Err(FormatError::InvalidLayoutClass(c)),
            },
            v => Err(FormatError::InvalidStructureVersion {
                kind: "data layout",
                version: v,
            }),
        }
    }

    fn defined(sizes: Sizes, addr: u64) -> Option<u64> {
        (!sizes.is_undefined(addr)).then_some(addr)
    }

    fn parse_v1v2(data: &[u8], sizes: Sizes) -> Result<DataLayout, FormatError> {
        // version, ndims, class, 5 reserved
        ensure_len(data, 0, 8)?;
        let ndims = data[1] as usize;
        let class = data[2];
        let mut pos = 8;
        let address = if class != 0 {
            let a = sizes.read_offset(data, pos)?;
            pos += sizes.offset as usize;
            Some(a)
        } else {
            None
        };
        ensure_len(data, pos, 4 * ndims)?;
        let dimensions: Vec<u32> = (0..ndims)
            .map(|i| LittleEndian::read_u32(&data[pos + 4 * i..pos + 4 * i + 4]))
            .collect();
        pos += 4 * ndims;

        match class {
            0 => {
                let size = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
                ensure_len(data, pos + 4, size)?;
                Ok(DataLayout::Compact {
                    data: data[pos + 4..pos + 4 + size].to_vec(),
                })
            }
            1 => Ok(DataLayout::Contiguous {
                address: address.and_then(|a| Self::defined(sizes, a)),
                // the last dimension is the element size
                size: dimensions.iter().map(|&d| d as u64).product(),
            }),
            2 => Ok(DataLayout::Chunked {
                btree_address: address.and_then(|a| Self::defined(sizes, a)),
                dimensions,
            }),
            c => Err(FormatError::InvalidLayoutClass(c)),
        }
    }

    fn parse_v3(data: &[u8], sizes: Sizes) -> Result<DataLayout, FormatError> {
        let pos = 2;
        match data[1] {
            0 => {
                let size = sizes_u16(data, pos)?;
                ensure_len(data, pos + 2, size)?;
                Ok(DataLayout::Compact {
                    data: data[pos + 2..pos + 2 + size].to_vec(),
                })
            }
            1 => {
                let addr = sizes.read_offset(data, pos)?;
                Ok(DataLayout::Contiguous {
                    address: Self::defined(sizes, addr),
                    size: sizes.read_length(data, pos + sizes.offset as usize)?,
                })
            }
            2 => {
                ensure_len(data, pos, 1)?;
                let ndims = data[pos] as usize;
                let addr = sizes.read_offset(data, pos + 1)?;
                let dims_at = pos + 1 + sizes.offset as usize;
                ensure_len(data, dims_at, 4 * ndims)?;
                Ok(DataLayout::Chunked {
                    btree_address: Self::defined(sizes, addr),
                    dimensions: (0..ndims)
                        .map(|i| LittleEndian::read_u32(&data[dims_at + 4 * i..dims_at + 4 * i + 4]))
                        .collect(),
                })
            }
            c => Err(FormatError::InvalidLayoutClass(c)),
        }
    }

    /// Encode as a version 3 layout message.
    pub fn serialize(&self, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let mut buf = vec![3];
        match self {
            DataLayout::Compact { data } => {
                let len = u16::try_from(data.len()).map_err(|_| {
                    FormatError::Unsupported(format!("compact data of {} bytes", data.len()))
                })?;
                buf.push(0);
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(data);
            }
            DataLayout::Contiguous { address, size } => {
                buf.push(1);
                match address {
                    Some(a) => sizes.write_offset(&mut buf, *a)?,
                    None => sizes.write_undefined(&mut buf),
                }
                sizes.write_length(&mut buf, *size)?;
            }
            DataLayout::Chunked {
                btree_address,
                dimensions,
            } => {
                buf.push(2);
                buf.push(dimensions.len() as u8);
                match btree_address {
                    Some(a) => sizes.write_offset(&mut buf, *a)?,
                    None => sizes.write_undefined(&mut buf),
                }
                for d in dimensions {
                    buf.extend_from_slice(&d.to_le_bytes());
                }
            }
        }
        Ok(buf)
    }
}

fn sizes_u16(data: &[u8], pos: usize) -> Result<usize, FormatError> {
    ensure_len(data, pos, 2)?;
    Ok(LittleEndian::read_u16(&data[pos..pos + 2]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_roundtrips() {
        let sizes = Sizes::default();
        for layout in [
            DataLayout::Compact { data: vec![1, 2, 3, 4] },
            DataLayout::Contiguous {
                address: Some(0x800),
                size: 4000,
            },
            DataLayout::Contiguous {
                address: None,
                size: 16,
            },
            DataLayout::Chunked {
                btree_address: Some(0x1200),
                dimensions: vec![10, 20, 8],
            },
        ] {
            let bytes = layout.serialize(sizes).unwrap();
            assert_eq!(DataLayout::parse(&bytes, sizes).unwrap(), layout);
        }
    }

    #[test]
    fn v1_contiguous() {
        let mut data = vec![1, 3, 1, 0, 0, 0, 0, 0];
        data.extend_from_slice(&0x400u64.to_le_bytes());
        for d in [4u32, 5, 8] {
            data.extend_from_slice(&d.to_le_bytes());
        }
        let layout = DataLayout::parse(&data, Sizes::default()).unwrap();
        assert_eq!(
            layout,
            DataLayout::Contiguous {
                address: Some(0x400),
                size: 160
            }
        );
    }

    #[test]
    fn v4_chunk_indexes_unsupported() {
        assert!(matches!(
            DataLayout::parse(&[4, 2, 0, 0], Sizes::default()),
            Err(FormatError::Unsupported(_))
        ));
        assert_eq!(
            DataLayout::parse(&[3, 7], Sizes::default()),
            Err(FormatError::InvalidLayoutClass(7))
        );
    }
}
