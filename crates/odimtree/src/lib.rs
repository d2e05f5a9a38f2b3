//! Node-tree engine for ODIM weather-radar HDF5 files.
//!
//! A file is modelled as a [`Collection`] of [`Node`]s keyed by path. Reading
//! happens in two phases: [`Engine::read_structure`] discovers shapes and
//! types, then selected payloads are pulled in with
//! [`Engine::fetch_marked`] (or lazily through a [`LazyLoader`]).
//!
//! # Reading
//!
//! ```no_run
//! use odimtree::{Engine, LazyLoader};
//!
//! let mut lazy = LazyLoader::open("pvol.h5", Engine::default()).unwrap();
//! lazy.preload(Some(&["DBZH"][..])).unwrap();
//! let data = lazy.get_dataset("/dataset1/data1/data").unwrap();
//! println!("{:?} {:?}", data.dims(), data.format());
//! ```
//!
//! # Writing
//!
//! ```no_run
//! use odimtree::{Collection, CreationProperties, Engine, Node, Payload};
//!
//! let mut c = Collection::with_filename("out.h5");
//! c.add(Node::group("/what").unwrap()).unwrap();
//! c.add(Node::string_attribute("/what/object", "PVOL").unwrap()).unwrap();
//! c.add(Node::dataset("/image", Payload::from_values(&[2, 2], &[1u8, 2, 3, 4]).unwrap()).unwrap())
//!     .unwrap();
//! Engine::default()
//!     .write_full(&mut c, &CreationProperties::default(), None)
//!     .unwrap();
//! ```

pub mod collection;
pub mod compound;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod format;
pub mod lazy;
pub mod node;
pub mod read;
pub mod write;

pub use collection::Collection;
pub use compound::{CompoundMember, CompoundTypeDescription, ObjectId};
pub use config::{Compression, CreationProperties, EngineConfig};
pub use diagnostics::{Diagnostics, Severity};
pub use engine::Engine;
pub use error::{Error, Rejected, Result};
pub use format::{Element, FormatSpecifier};
pub use lazy::LazyLoader;
pub use node::{Buffer, Fetch, Mark, Node, NodeKind, Payload, Transition};
