//! Shared object header messages.
//!
//! When a header message has its shared flag set, its body is a pointer to
//! the real message rather than the message itself. The engine only needs
//! the case where a datatype is committed in another object header.

use crate::codec::{ensure_len, Sizes};
use crate::error::FormatError;

/// Where a shared message lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedRef {
    /// The message lives in the object header at this address.
    ObjectHeader(u64),
    /// The message lives in the shared-message heap (SOHM).
    Heap([u8; 8]),
}

impl SharedRef {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<SharedRef, FormatError> {
        ensure_len(data, 0, 2)?;
        let version = data[0];
        let kind = data[1];
        match version {
            1 => Ok(SharedRef::ObjectHeader(sizes.read_offset(data, 8)?)),
            2 => Ok(SharedRef::ObjectHeader(sizes.read_offset(data, 2)?)),
            3 if kind == 1 => {
                ensure_len(data, 2, 8)?;
                let mut id = [0u8; 8];
                id.copy_from_slice(&data[2..10]);
                Ok(SharedRef::Heap(id))
            }
            3 => Ok(SharedRef::ObjectHeader(sizes.read_offset(data, 2)?)),
            v => Err(FormatError::InvalidStructureVersion {
                kind: "shared message",
                version: v,
            }),
        }
    }

    /// Address of the committed object, or an error for heap-shared messages.
    pub fn committed_address(&self) -> Result<u64, FormatError> {
        match self {
            SharedRef::ObjectHeader(addr) => Ok(*addr),
            SharedRef::Heap(_) => Err(FormatError::Unsupported(
                "messages shared through the SOHM heap".into(),
            )),
        }
    }

    /// Encode a version 3 pointer to a committed object header.
    pub fn serialize_committed(address: u64, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let mut buf = vec![3, 2];
        sizes.write_offset(&mut buf, address)?;
        Ok(buf)
    }
}
