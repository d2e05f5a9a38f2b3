//! HDF5 file signature detection.

use crate::error::FormatError;

/// The 8-byte HDF5 magic signature.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n'];

/// Locate the superblock signature.
///
/// The signature sits at offset 0 or, when a user block precedes it, at
/// 512, 1024, 2048, ... (powers of two from 512).
pub fn find_signature(data: &[u8]) -> Result<usize, FormatError> {
    let candidates = std::iter::once(0).chain(std::iter::successors(Some(512usize), |o| {
        o.checked_mul(2)
    }));
    for offset in candidates {
        if offset + 8 > data.len() {
            break;
        }
        if data[offset..offset + 8] == HDF5_SIGNATURE {
            return Ok(offset);
        }
    }
    Err(FormatError::SignatureNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_start() {
        let mut data = vec![0u8; 64];
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(find_signature(&data), Ok(0));
    }

    #[test]
    fn after_user_block() {
        let mut data = vec![0u8; 2048];
        data[1024..1032].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(find_signature(&data), Ok(1024));
    }

    #[test]
    fn misaligned_is_ignored() {
        let mut data = vec![0u8; 1024];
        data[100..108].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(find_signature(&data), Err(FormatError::SignatureNotFound));
        assert_eq!(find_signature(&[]), Err(FormatError::SignatureNotFound));
    }
}
