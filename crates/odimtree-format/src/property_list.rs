//! File creation properties.
//!
//! Every field defaults to the value the reference library uses, so a
//! default-constructed property list produces an ordinary HDF5 file.

use crate::codec::Sizes;
use crate::error::FormatError;
use crate::superblock::BTreeKValues;

/// Format-level parameters fixed when a file is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCreateProps {
    /// Bytes reserved ahead of the superblock (0 or a power of two ≥ 512).
    pub userblock: u64,
    /// Size of offsets in bytes (2, 4, or 8).
    pub offset_size: u8,
    /// Size of lengths in bytes (2, 4, or 8).
    pub length_size: u8,
    pub group_leaf_node_k: u16,
    pub group_internal_node_k: u16,
    /// Chunk B-tree fan-out: nodes hold up to `2 * k` entries.
    pub indexed_storage_internal_node_k: u16,
    /// Metadata is padded to a multiple of this many bytes (0 disables).
    pub meta_block_size: u64,
}

impl Default for FileCreateProps {
    fn default() -> Self {
        let k = BTreeKValues::default();
        Self {
            userblock: 0,
            offset_size: 8,
            length_size: 8,
            group_leaf_node_k: k.group_leaf_k,
            group_internal_node_k: k.group_internal_k,
            indexed_storage_internal_node_k: k.indexed_storage_internal_k,
            meta_block_size: 2048,
        }
    }
}

impl FileCreateProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a user block of `bytes` ahead of the HDF5 data.
    pub fn userblock(mut self, bytes: u64) -> Self {
        self.userblock = bytes;
        self
    }

    /// Set offset and length sizes.
    pub fn sizes(mut self, offset_size: u8, length_size: u8) -> Self {
        self.offset_size = offset_size;
        self.length_size = length_size;
        self
    }

    /// Set the group B-tree leaf and internal node K.
    pub fn sym_k(mut self, leaf: u16, internal: u16) -> Self {
        self.group_leaf_node_k = leaf;
        self.group_internal_node_k = internal;
        self
    }

    /// Set the chunk index B-tree K.
    pub fn istore_k(mut self, k: u16) -> Self {
        self.indexed_storage_internal_node_k = k;
        self
    }

    pub fn meta_block_size(mut self, bytes: u64) -> Self {
        self.meta_block_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.userblock != 0 && (self.userblock < 512 || !self.userblock.is_power_of_two()) {
            return Err(FormatError::InvalidCreationProperty(format!(
                "user block of {} bytes must be 0 or a power of two >= 512",
                self.userblock
            )));
        }
        Sizes::new(self.offset_size, self.length_size)?;
        if self.group_leaf_node_k == 0
            || self.group_internal_node_k == 0
            || self.indexed_storage_internal_node_k == 0
        {
            return Err(FormatError::InvalidCreationProperty(
                "B-tree K values must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn file_sizes(&self) -> Sizes {
        Sizes {
            offset: self.offset_size,
            length: self.length_size,
        }
    }

    pub fn k_values(&self) -> BTreeKValues {
        BTreeKValues {
            indexed_storage_internal_k: self.indexed_storage_internal_node_k,
            group_internal_k: self.group_internal_node_k,
            group_leaf_k: self.group_leaf_node_k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library() {
        let p = FileCreateProps::new();
        assert_eq!(p.k_values(), BTreeKValues::default());
        assert_eq!(p.file_sizes(), Sizes::default());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn builder_chain() {
        let p = FileCreateProps::new()
            .userblock(1024)
            .sizes(4, 4)
            .sym_k(8, 32)
            .istore_k(64)
            .meta_block_size(4096);
        assert_eq!(p.userblock, 1024);
        assert_eq!(p.file_sizes(), Sizes::new(4, 4).unwrap());
        assert_eq!(p.group_leaf_node_k, 8);
        assert_eq!(p.indexed_storage_internal_node_k, 64);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validation_failures() {
        assert!(FileCreateProps::new().userblock(600).validate().is_err());
        assert!(FileCreateProps::new().userblock(256).validate().is_err());
        assert_eq!(
            FileCreateProps::new().sizes(3, 8).validate(),
            Err(FormatError::InvalidOffsetSize(3))
        );
        assert!(FileCreateProps::new().istore_k(0).validate().is_err());
    }
}
