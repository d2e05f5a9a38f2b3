//! Engine configuration: compression directives, file creation properties
//! and engine-wide options.

use crate::error::{Error, Result};

/// File creation properties: user block, address widths, B-tree fan-out
/// and metadata block size. Defaults match the HDF5 library defaults.
pub use odimtree_format::property_list::FileCreateProps as CreationProperties;

/// Per-dataset compression directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// zlib deflate, level 1 to 9.
    Deflate(u8),
    /// Block-based (SZIP) compression. Recognised but not encodable.
    Szip { mask: u32, block: u32 },
}

impl Compression {
    pub fn deflate(level: u8) -> Result<Compression> {
        if !(1..=9).contains(&level) {
            return Err(Error::Unsupported(format!("deflate level {level}")));
        }
        Ok(Compression::Deflate(level))
    }
}

/// Engine-wide options, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Applied by writes to datasets that carry no compression of their own.
    pub default_compression: Compression,
    /// Verify v2 object header checksums while reading.
    pub verify_checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_compression: Compression::None,
            verify_checksums: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_compression(mut self, compression: Compression) -> Self {
        self.default_compression = compression;
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_level_range() {
        assert_eq!(Compression::deflate(6).unwrap(), Compression::Deflate(6));
        assert!(Compression::deflate(0).is_err());
        assert!(Compression::deflate(10).is_err());
    }

    #[test]
    fn builder() {
        let cfg = EngineConfig::new()
            .default_compression(Compression::Deflate(3))
            .verify_checksums(false);
        assert_eq!(cfg.default_compression, Compression::Deflate(3));
        assert!(!cfg.verify_checksums);
        assert!(EngineConfig::default().verify_checksums);
    }
}
