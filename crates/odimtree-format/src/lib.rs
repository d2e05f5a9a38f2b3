//! Pure-Rust reader and writer for the HDF5 structures used by `odimtree`.
//!
//! The crate knows nothing about nodes or marks. It decodes superblocks,
//! object headers, groups, datatypes and storage layouts, and encodes a
//! complete object graph (or an append to an existing file) back into
//! standard HDF5 bytes.

pub mod attribute;
pub mod btree;
pub mod checksum;
pub mod codec;
pub mod data_layout;
pub mod data_read;
pub mod dataspace;
pub mod datatype;
pub mod error;
pub mod file_writer;
pub mod filter_pipeline;
pub mod filters;
pub mod global_heap;
pub mod group;
pub mod link;
pub mod message_type;
pub mod object_header;
pub mod object_header_writer;
pub mod property_list;
pub mod shared_message;
pub mod signature;
pub mod superblock;

pub use codec::Sizes;
pub use error::FormatError;
pub use property_list::FileCreateProps;
