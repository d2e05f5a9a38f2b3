//! Error types for the node-tree engine.

use odimtree_format::error::FormatError;
use thiserror::Error;

use crate::node::{Mark, Node};

/// Errors reported by collection, translator, read and write operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Parent of a node is absent from the collection.
    #[error("parent of {0} does not exist")]
    MissingParent(String),

    /// Parent exists but cannot hold a child of this kind.
    #[error("{parent} cannot hold {child}")]
    InvalidParentKind { parent: String, child: String },

    #[error("duplicate path: {0}")]
    DuplicatePath(String),

    /// Empty path, empty component or a path not starting at the root.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// The format specifier cannot be used where it was given.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Buffer size does not match the declared shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("compound member {member} has rank {rank}, at most 4 is supported")]
    CompoundRankTooLarge { member: String, rank: usize },

    #[error("compound format without a compound description")]
    MissingCompoundDescription,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HDF5 format error: {0}")]
    Format(#[from] FormatError),

    /// A node of a batch fetch failed; no node of the batch was changed.
    #[error("fetching {path} failed: {source}")]
    FetchFailed {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no such node: {0}")]
    NotFound(String),

    #[error("{path} is not a {expected}")]
    WrongKind { path: String, expected: &'static str },

    /// An existing object header has no room for an appended message.
    #[error("object {0} has no free header slot for an update")]
    NoUpdateSlot(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Illegal lifecycle mark change.
    #[error("cannot move {path} from {from:?} to {to:?}")]
    Transition { path: String, from: Mark, to: Mark },
}

/// A node refused by [`Collection::add`](crate::Collection::add). The node
/// is handed back so the caller keeps ownership.
#[derive(Debug, Error)]
#[error("node {} rejected: {reason}", .node.path())]
pub struct Rejected {
    pub node: Node,
    pub reason: Error,
}

pub type Result<T> = std::result::Result<T, Error>;
