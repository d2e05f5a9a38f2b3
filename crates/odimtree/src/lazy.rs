//! On-demand payload loading over a structure-only collection.

use std::path::Path;

use tracing::debug;

use crate::collection::Collection;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::node::{Fetch, Node, NodeKind};

/// Owns a collection read with [`Engine::read_structure`] and fetches
/// payloads the first time they are asked for.
#[derive(Debug)]
pub struct LazyLoader {
    engine: Engine,
    collection: Collection,
}

impl LazyLoader {
    /// Take over `collection`, fetching through a default engine.
    pub fn wrap(collection: Collection) -> LazyLoader {
        Self::with_engine(collection, Engine::default())
    }

    pub fn with_engine(collection: Collection, engine: Engine) -> LazyLoader {
        LazyLoader { engine, collection }
    }

    /// Read the structure of `path` and wrap it.
    pub fn open(path: impl AsRef<Path>, engine: Engine) -> Result<LazyLoader> {
        let collection = engine.read_structure(path, "")?;
        Ok(Self::with_engine(collection, engine))
    }

    /// Fetch every unfetched dataset, keeping only the quantities in
    /// `quantities` among those tagged with one.
    ///
    /// A dataset `<c>/dataN/data` is tagged when `<c>/dataN/what/quantity`
    /// exists. Untagged datasets are always fetched, as is everything when
    /// `quantities` is `None` or empty. Returns the number fetched.
    pub fn preload(&mut self, quantities: Option<&[&str]>) -> Result<usize> {
        let allowed = quantities.filter(|q| !q.is_empty());
        let wanted: Vec<String> = self
            .collection
            .iter()
            .filter(|n| n.kind() == NodeKind::Dataset && n.fetch() != Fetch::Full)
            .filter(|n| match (allowed, self.quantity_of(n)) {
                (Some(allowed), Some(quantity)) => allowed.contains(&quantity.as_str()),
                _ => true,
            })
            .map(|n| n.path().to_string())
            .collect();
        if wanted.is_empty() {
            return Ok(0);
        }
        for path in &wanted {
            self.collection.select(path)?;
        }
        let count = self.engine.fetch_marked(&mut self.collection)?;
        debug!(count, "preloaded");
        Ok(count)
    }

    /// The ODIM quantity tag of a `.../dataN/data` dataset.
    fn quantity_of(&self, node: &Node) -> Option<String> {
        if node.name() != "data" {
            return None;
        }
        let group = node.parent();
        let group_name = group.rsplit('/').next()?;
        if !is_data_group(group_name) {
            return None;
        }
        self.collection
            .get_by_name(&format!("{group}/what/quantity"))?
            .string_value()
            .ok()
    }

    fn loaded(&mut self, path: &str, kind: NodeKind) -> Result<&Node> {
        let node = self
            .collection
            .get_by_name(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.kind() != kind {
            return Err(Error::WrongKind {
                path: path.to_string(),
                expected: kind.name(),
            });
        }
        if node.fetch() == Fetch::Full {
            return self
                .collection
                .get_by_name(path)
                .ok_or_else(|| Error::NotFound(path.to_string()));
        }
        self.engine.fetch_one(&mut self.collection, path)
    }

    /// The dataset at `path`, fetched on first access.
    pub fn get_dataset(&mut self, path: &str) -> Result<&Node> {
        self.loaded(path, NodeKind::Dataset)
    }

    /// The attribute at `path`, fetched on first access.
    pub fn get_attribute(&mut self, path: &str) -> Result<&Node> {
        self.loaded(path, NodeKind::Attribute)
    }

    /// Whether `path` holds its full payload. Never fetches.
    pub fn is_loaded(&self, path: &str) -> bool {
        self.collection
            .get_by_name(path)
            .is_some_and(|n| n.fetch() == Fetch::Full)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.collection.has_by_name(path)
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn into_inner(self) -> Collection {
        self.collection
    }
}

fn is_data_group(name: &str) -> bool {
    name.strip_prefix("data")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
