//! HDF5 Dataspace message (type 0x0001).

use crate::codec::{ensure_len, Sizes};
use crate::error::FormatError;

/// Type of dataspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceType {
    /// Single element.
    Scalar,
    /// N-dimensional array.
    Simple,
    /// No data at all.
    Null,
}

/// Parsed HDF5 dataspace message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    pub space_type: DataspaceType,
    /// Current dimension sizes (empty for scalar and null spaces).
    pub dimensions: Vec<u64>,
    /// Maximum dimension sizes, if present. `u64::MAX` means unlimited.
    pub max_dimensions: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Dataspace {
        Dataspace {
            space_type: DataspaceType::Scalar,
            dimensions: Vec::new(),
            max_dimensions: None,
        }
    }

    /// Simple dataspace; rank 0 collapses to a scalar space.
    pub fn simple(dims: &[u64]) -> Dataspace {
        if dims.is_empty() {
            return Self::scalar();
        }
        Dataspace {
            space_type: DataspaceType::Simple,
            dimensions: dims.to_vec(),
            max_dimensions: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Number of elements described by this dataspace.
    pub fn num_elements(&self) -> u64 {
        match self.space_type {
            DataspaceType::Null => 0,
            DataspaceType::Scalar => 1,
            DataspaceType::Simple => self.dimensions.iter().product(),
        }
    }

    /// Parse a dataspace message.
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Dataspace, FormatError> {
        ensure_len(data, 0, 4)?;
        let version = data[0];
        let rank = data[1] as usize;
        let flags = data[2];

        let (space_type, mut pos) = match version {
            1 => {
                ensure_len(data, 0, 8)?;
                let st = if rank == 0 {
                    DataspaceType::Scalar
                } else {
                    DataspaceType::Simple
                };
                (st, 8)
            }
            2 => {
                let st = match data[3] {
                    0 => DataspaceType::Scalar,
                    1 => DataspaceType::Simple,
                    2 => DataspaceType::Null,
                    other => return Err(FormatError::InvalidDataspaceType(other)),
                };
                (st, 4)
            }
            v => {
                return Err(FormatError::InvalidStructureVersion {
                    kind: "dataspace",
                    version: v,
                })
            }
        };

        let ls = sizes.length as usize;
        let mut dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimensions.push(sizes.read_length(data, pos)?);
            pos += ls;
        }
        let max_dimensions = if flags & 0x01 != 0 {
            let mut max = Vec::with_capacity(rank);
            for _ in 0..rank {
                max.push(sizes.read_length(data, pos)?);
                pos += ls;
            }
            Some(max)
        } else {
            None
        };

        Ok(Dataspace {
            space_type,
            dimensions,
            max_dimensions,
        })
    }

    /// Serialize as a version 2 dataspace message.
    pub fn serialize(&self, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let type_byte = match self.space_type {
            DataspaceType::Scalar => 0,
            DataspaceType::Simple => 1,
            DataspaceType::Null => 2,
        };
        let flags = u8::from(self.max_dimensions.is_some());
        let mut buf = vec![2, self.rank() as u8, flags, type_byte];
        for &dim in &self.dimensions {
            sizes.write_length(&mut buf, dim)?;
        }
        if let Some(max) = &self.max_dimensions {
            for &dim in max {
                if dim == u64::MAX {
                    buf.extend(std::iter::repeat(0xFF).take(sizes.length as usize));
                } else {
                    sizes.write_length(&mut buf, dim)?;
                }
            }
        }
        Ok(buf)
    }
}
