//! HDF5 superblock: parsing for versions 0 to 3, encoding of version 2,
//! and in-place EOF patching for append-style updates.

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::jenkins_lookup3;
use crate::codec::{ensure_len, Sizes};
use crate::error::FormatError;
use crate::signature::HDF5_SIGNATURE;

/// Parsed HDF5 superblock (all versions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Superblock version (0–3).
    pub version: u8,
    /// Size of offsets in bytes (2, 4, or 8).
    pub offset_size: u8,
    /// Size of lengths in bytes (2, 4, or 8).
    pub length_size: u8,
    /// Absolute file address all other addresses are relative to.
    pub base_address: u64,
    /// End-of-file address.
    pub eof_address: u64,
    /// Root group object header address.
    pub root_group_address: u64,
    /// Group leaf node K (v0/v1 only).
    pub group_leaf_node_k: Option<u16>,
    /// Group internal node K (v0/v1 only).
    pub group_internal_node_k: Option<u16>,
    /// Indexed storage internal node K (v1 only).
    pub indexed_storage_internal_node_k: Option<u16>,
    /// File consistency flags.
    pub consistency_flags: u32,
    /// Superblock extension object header address (v2/v3 only).
    pub extension_address: Option<u64>,
}

impl Superblock {
    /// Parse a superblock from `data` starting at `signature_offset`.
    pub fn parse(data: &[u8], signature_offset: usize) -> Result<Superblock, FormatError> {
        ensure_len(data, signature_offset, 9)?;
        let d = &data[signature_offset..];
        if d[..8] != HDF5_SIGNATURE {
            return Err(FormatError::SignatureNotFound);
        }

        match d[8] {
            0 | 1 => Self::parse_v0v1(d, d[8]),
            2 | 3 => Self::parse_v2v3(d, d[8]),
            v => Err(FormatError::UnsupportedVersion(v)),
        }
    }

    pub fn sizes(&self) -> Sizes {
        Sizes {
            offset: self.offset_size,
            length: self.length_size,
        }
    }

    /// Position of the fixed-width fields that follow the version bytes.
    fn v0v1_field_start(version: u8) -> usize {
        // v1 adds indexed-storage K and two reserved bytes
        if version == 0 {
            24
        } else {
            28
        }
    }

    fn parse_v0v1(d: &[u8], version: u8) -> Result<Superblock, FormatError> {
        let var_start = Self::v0v1_field_start(version);
        ensure_len(d, 0, var_start)?;
        let sizes = Sizes::new(d[13], d[14])?;

        let group_leaf_node_k = LittleEndian::read_u16(&d[16..18]);
        let group_internal_node_k = LittleEndian::read_u16(&d[18..20]);
        let indexed_storage_internal_node_k = if version == 1 {
            Some(LittleEndian::read_u16(&d[20..22]))
        } else {
            None
        };
        let consistency_flags = LittleEndian::read_u32(&d[var_start - 4..var_start]);

        let os = sizes.offset as usize;
        // base, free-space, eof, driver, then the root symbol table entry
        ensure_len(d, var_start, 4 * os + 2 * os + 24)?;
        let base_address = sizes.read_offset(d, var_start)?;
        let eof_address = sizes.read_offset(d, var_start + 2 * os)?;
        let root_group_address = sizes.read_offset(d, var_start + 5 * os)?;

        Ok(Superblock {
            version,
            offset_size: sizes.offset,
            length_size: sizes.length,
            base_address,
            eof_address,
            root_group_address,
            group_leaf_node_k: Some(group_leaf_node_k),
            group_internal_node_k: Some(group_internal_node_k),
            indexed_storage_internal_node_k,
            consistency_flags,
            extension_address: None,
        })
    }

    fn parse_v2v3(d: &[u8], version: u8) -> Result<Superblock, FormatError> {
        ensure_len(d, 0, 12)?;
        let sizes = Sizes::new(d[9], d[10])?;
        let os = sizes.offset as usize;
        let body = 12 + 4 * os;
        ensure_len(d, 0, body + 4)?;

        let stored = LittleEndian::read_u32(&d[body..body + 4]);
        let computed = jenkins_lookup3(&d[..body]);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let extension = sizes.read_offset(d, 12 + os)?;
        Ok(Superblock {
            version,
            offset_size: sizes.offset,
            length_size: sizes.length,
            base_address: sizes.read_offset(d, 12)?,
            eof_address: sizes.read_offset(d, 12 + 2 * os)?,
            root_group_address: sizes.read_offset(d, 12 + 3 * os)?,
            group_leaf_node_k: None,
            group_internal_node_k: None,
            indexed_storage_internal_node_k: None,
            consistency_flags: d[11] as u32,
            extension_address: (!sizes.is_undefined(extension)).then_some(extension),
        })
    }

    /// Number of bytes the encoded superblock occupies.
    pub fn encoded_len(&self) -> usize {
        let os = self.offset_size as usize;
        match self.version {
            0 | 1 => Self::v0v1_field_start(self.version) + 4 * os + 2 * os + 24,
            _ => 12 + 4 * os + 4,
        }
    }

    fn eof_field_position(&self) -> usize {
        let os = self.offset_size as usize;
        match self.version {
            0 | 1 => Self::v0v1_field_start(self.version) + 2 * os,
            _ => 12 + 2 * os,
        }
    }

    /// Encode a version 2 superblock.
    pub fn serialize_v2(&self) -> Result<Vec<u8>, FormatError> {
        let sizes = self.sizes();
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&HDF5_SIGNATURE);
        buf.push(2);
        buf.push(sizes.offset);
        buf.push(sizes.length);
        buf.push(self.consistency_flags as u8);
        sizes.write_offset(&mut buf, self.base_address)?;
        match self.extension_address {
            Some(addr) => sizes.write_offset(&mut buf, addr)?,
            None => sizes.write_undefined(&mut buf),
        }
        sizes.write_offset(&mut buf, self.eof_address)?;
        sizes.write_offset(&mut buf, self.root_group_address)?;
        let checksum = jenkins_lookup3(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Return a copy of the on-disk superblock bytes `raw` with the EOF
    /// address replaced by `eof`, refreshing the checksum where the version
    /// carries one.
    pub fn patch_eof(&self, raw: &[u8], eof: u64) -> Result<Vec<u8>, FormatError> {
        let len = self.encoded_len();
        ensure_len(raw, 0, len)?;
        let mut out = raw[..len].to_vec();
        let mut field = Vec::with_capacity(8);
        self.sizes().write_offset(&mut field, eof)?;
        let pos = self.eof_field_position();
        out[pos..pos + field.len()].copy_from_slice(&field);
        if self.version >= 2 {
            let body = len - 4;
            let checksum = jenkins_lookup3(&out[..body]);
            out[body..].copy_from_slice(&checksum.to_le_bytes());
        }
        Ok(out)
    }
}

/// B-tree 'K' values message (0x0013), stored in the superblock extension
/// of version 2+ files that use non-default fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeKValues {
    pub indexed_storage_internal_k: u16,
    pub group_internal_k: u16,
    pub group_leaf_k: u16,
}

impl Default for BTreeKValues {
    fn default() -> Self {
        BTreeKValues {
            indexed_storage_internal_k: 32,
            group_internal_k: 16,
            group_leaf_k: 4,
        }
    }
}

impl BTreeKValues {
    pub fn parse(data: &[u8]) -> Result<BTreeKValues, FormatError> {
        ensure_len(data, 0, 7)?;
        if data[0] != 0 {
            return Err(FormatError::InvalidStructureVersion {
                kind: "B-tree K values",
                version: data[0],
            });
        }
        Ok(BTreeKValues {
            indexed_storage_internal_k: LittleEndian::read_u16(&data[1..3]),
            group_internal_k: LittleEndian::read_u16(&data[3..5]),
            group_leaf_k: LittleEndian::read_u16(&data[5..7]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&self.indexed_storage_internal_k.to_le_bytes());
        buf.extend_from_slice(&self.group_internal_k.to_le_bytes());
        buf.extend_from_slice(&self.group_leaf_k.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset_size: u8) -> Superblock {
        Superblock {
            version: 2,
            offset_size,
            length_size: 8,
            base_address: 0,
            eof_address: 4096,
            root_group_address: 48,
            group_leaf_node_k: None,
            group_internal_node_k: None,
            indexed_storage_internal_node_k: None,
            consistency_flags: 0,
            extension_address: None,
        }
    }

    fn build_v0(offset_size: u8, root: u64, eof: u64) -> Vec<u8> {
        let os = offset_size as usize;
        let mut d = Vec::new();
        d.extend_from_slice(&HDF5_SIGNATURE);
        d.extend_from_slice(&[0, 0, 0, 0, 0, offset_size, 8, 0]);
        d.extend_from_slice(&4u16.to_le_bytes());
        d.extend_from_slice(&16u16.to_le_bytes());
        d.extend_from_slice(&0u32.to_le_bytes());
        for v in [0u64, u64::MAX, eof, u64::MAX] {
            d.extend_from_slice(&v.to_le_bytes()[..os]);
        }
        d.extend_from_slice(&0u64.to_le_bytes()[..os]);
        d.extend_from_slice(&root.to_le_bytes()[..os]);
        d.extend_from_slice(&[0u8; 24]);
        d
    }

    #[test]
    fn v2_roundtrip() {
        let sb = sample(8);
        let bytes = sb.serialize_v2().unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(Superblock::parse(&bytes, 0).unwrap(), sb);
    }

    #[test]
    fn v2_small_offsets() {
        let mut sb = sample(4);
        sb.extension_address = Some(40);
        let bytes = sb.serialize_v2().unwrap();
        assert_eq!(bytes.len(), sb.encoded_len());
        let parsed = Superblock::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.extension_address, Some(40));
    }

    #[test]
    fn v2_checksum_detected() {
        let mut bytes = sample(8).serialize_v2().unwrap();
        bytes[20] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&bytes, 0),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn v0_parse() {
        let bytes = build_v0(8, 96, 2000);
        let sb = Superblock::parse(&bytes, 0).unwrap();
        assert_eq!(sb.version, 0);
        assert_eq!(sb.root_group_address, 96);
        assert_eq!(sb.eof_address, 2000);
        assert_eq!(sb.group_leaf_node_k, Some(4));
        assert_eq!(sb.encoded_len(), bytes.len());
    }

    #[test]
    fn patch_eof_v0_and_v2() {
        let raw = build_v0(8, 96, 2000);
        let sb = Superblock::parse(&raw, 0).unwrap();
        let patched = sb.patch_eof(&raw, 5000).unwrap();
        assert_eq!(Superblock::parse(&patched, 0).unwrap().eof_address, 5000);

        let sb2 = sample(8);
        let raw2 = sb2.serialize_v2().unwrap();
        let patched2 = sb2.patch_eof(&raw2, 9999).unwrap();
        assert_eq!(Superblock::parse(&patched2, 0).unwrap().eof_address, 9999);
    }

    #[test]
    fn k_values_roundtrip() {
        let k = BTreeKValues {
            indexed_storage_internal_k: 64,
            group_internal_k: 32,
            group_leaf_k: 8,
        };
        assert_eq!(BTreeKValues::parse(&k.serialize()).unwrap(), k);
    }
}
