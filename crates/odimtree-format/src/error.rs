//! Error types for HDF5 format parsing and serialization.

use thiserror::Error;

/// Errors that can occur when decoding or encoding HDF5 binary structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// The HDF5 magic signature was not found at any valid offset.
    #[error("HDF5 signature not found at any valid offset")]
    SignatureNotFound,
    /// The superblock version is not supported.
    #[error("unsupported superblock version: {0}")]
    UnsupportedVersion(u8),
    /// Unexpected end of data.
    #[error("unexpected EOF: need {expected} bytes, have {available}")]
    UnexpectedEof {
        /// Number of bytes expected.
        expected: usize,
        /// Number of bytes actually available.
        available: usize,
    },
    /// Invalid offset size (must be 2, 4, or 8).
    #[error("invalid offset size: {0} (must be 2, 4, or 8)")]
    InvalidOffsetSize(u8),
    /// Invalid length size (must be 2, 4, or 8).
    #[error("invalid length size: {0} (must be 2, 4, or 8)")]
    InvalidLengthSize(u8),
    /// Invalid object header version.
    #[error("invalid object header version: {0}")]
    InvalidObjectHeaderVersion(u8),
    /// Unknown message type that is marked as must-understand.
    #[error("unsupported message type {0:#06x} marked as must-understand")]
    UnsupportedMessage(u16),
    /// Metadata checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// The checksum stored in the file.
        expected: u32,
        /// The checksum we computed.
        computed: u32,
    },
    /// A block did not start with the expected four-byte signature.
    #[error("invalid {0} signature")]
    InvalidSignature(&'static str),
    /// A structure carried a version this crate does not decode.
    #[error("unsupported {kind} version {version}")]
    InvalidStructureVersion {
        /// Structure name.
        kind: &'static str,
        /// Version found on disk.
        version: u8,
    },
    /// Unknown datatype class.
    #[error("invalid datatype class: {0}")]
    InvalidDatatypeClass(u8),
    /// Unsupported datatype version for a class.
    #[error("unsupported datatype version {version} for class {class}")]
    InvalidDatatypeVersion {
        /// Datatype class.
        class: u8,
        /// Version nibble.
        version: u8,
    },
    /// Invalid string padding nibble.
    #[error("invalid string padding: {0}")]
    InvalidStringPadding(u8),
    /// Invalid character set nibble.
    #[error("invalid character set: {0}")]
    InvalidCharacterSet(u8),
    /// Invalid reference type nibble.
    #[error("invalid reference type: {0}")]
    InvalidReferenceType(u8),
    /// Dataspace type not recognised.
    #[error("invalid dataspace type: {0}")]
    InvalidDataspaceType(u8),
    /// Data layout class not recognised.
    #[error("invalid layout class: {0}")]
    InvalidLayoutClass(u8),
    /// A B-tree node of an unexpected type was found.
    #[error("unexpected B-tree node type {0}")]
    InvalidBTreeNodeType(u8),
    /// Path component could not be resolved.
    #[error("path not found: {0}")]
    PathNotFound(String),
    /// A required header message is absent.
    #[error("object header at {address:#x} has no {message} message")]
    MissingMessage {
        /// Object header address.
        address: u64,
        /// Message name.
        message: &'static str,
    },
    /// A filter in the pipeline has no codec here.
    #[error("unsupported filter id {0}")]
    UnsupportedFilter(u16),
    /// Decompression failed.
    #[error("decompression failed: {0}")]
    DecompressionError(String),
    /// Compression failed.
    #[error("compression failed: {0}")]
    CompressionError(String),
    /// Fletcher32 checksum of a chunk did not match.
    #[error("fletcher32 mismatch in chunk")]
    Fletcher32Mismatch,
    /// A structure is valid HDF5 but outside the supported subset.
    #[error("unsupported feature: {0}")]
    Unsupported(String),
    /// A value cannot be encoded with the configured field width.
    #[error("value {value} does not fit in {width} bytes")]
    ValueTooWide {
        /// The value.
        value: u64,
        /// Field width in bytes.
        width: usize,
    },
    /// File creation properties outside what the format allows.
    #[error("invalid file creation property: {0}")]
    InvalidCreationProperty(String),
    /// An object header has no free NIL slot to chain a continuation from.
    #[error("object header at {0:#x} has no free slot for new messages")]
    NoFreeSlot(u64),
}
