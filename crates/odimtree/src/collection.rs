//! Path-indexed, insertion-ordered node collections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::compound::{CompoundTypeDescription, ObjectId};
use crate::error::{Error, Rejected, Result};
use crate::node::{normalize_path, Mark, Node, NodeKind};

/// The nodes of one file tree, unique by path.
///
/// Every non-root node's parent is present and may hold it: attributes and
/// references hang off groups or datasets, everything else off groups. The
/// root (`""`) is an implicit parent of every kind.
#[derive(Debug, Default)]
pub struct Collection {
    filename: Option<PathBuf>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Collection {
    pub fn new() -> Collection {
        Collection::default()
    }

    pub fn with_filename(filename: impl Into<PathBuf>) -> Collection {
        Collection {
            filename: Some(filename.into()),
            ..Collection::default()
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: impl Into<PathBuf>) {
        self.filename = Some(filename.into());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    fn check(&self, node: &Node) -> Result<()> {
        if self.index.contains_key(node.path()) {
            return Err(Error::DuplicatePath(node.path().to_string()));
        }
        let parent = node.parent();
        if parent.is_empty() {
            return Ok(());
        }
        let parent_node = self
            .get_by_name(parent)
            .ok_or_else(|| Error::MissingParent(node.path().to_string()))?;
        if !parent_node.kind().can_hold(node.kind()) {
            return Err(Error::InvalidParentKind {
                parent: format!("{} {}", parent_node.kind().name(), parent),
                child: format!("{} {}", node.kind().name(), node.path()),
            });
        }
        Ok(())
    }

    /// Insert `node`, taking ownership. A rejected node is handed back
    /// inside the error and the collection is left untouched.
    pub fn add(&mut self, node: Node) -> std::result::Result<(), Box<Rejected>> {
        if let Err(reason) = self.check(&node) {
            return Err(Box::new(Rejected { node, reason }));
        }
        self.index.insert(node.path().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn get_by_name(&self, path: &str) -> Option<&Node> {
        let path = normalize_path(path).ok()?;
        self.index.get(&path).map(|&i| &self.nodes[i])
    }

    pub fn get_mut_by_name(&mut self, path: &str) -> Option<&mut Node> {
        let path = normalize_path(path).ok()?;
        let i = *self.index.get(&path)?;
        Some(&mut self.nodes[i])
    }

    pub fn get_by_index(&self, i: usize) -> Option<&Node> {
        self.nodes.get(i)
    }

    pub fn has_by_name(&self, path: &str) -> bool {
        self.get_by_name(path).is_some()
    }

    pub(crate) fn position(&self, path: &str) -> Option<usize> {
        self.index.get(path).copied()
    }

    pub(crate) fn node_at_mut(&mut self, i: usize) -> &mut Node {
        &mut self.nodes[i]
    }

    /// Set every node's mark.
    pub fn mark_all(&mut self, mark: Mark) {
        for node in &mut self.nodes {
            node.set_mark(mark);
        }
    }

    /// The compound description of the named type identified by `id`.
    pub fn find_compound_description(&self, id: ObjectId) -> Option<&CompoundTypeDescription> {
        self.nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::NamedType)
            .filter_map(Node::compound)
            .find(|c| c.id == id)
    }

    /// Remove the node at `path` together with every node below it,
    /// returning the removed nodes in collection order.
    pub fn remove(&mut self, path: &str) -> Result<Vec<Node>> {
        let path = normalize_path(path)?;
        if !self.index.contains_key(&path) {
            return Err(Error::NotFound(path));
        }
        let prefix = format!("{path}/");
        let (removed, kept): (Vec<Node>, Vec<Node>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|n| n.path() == path || n.path().starts_with(&prefix));
        self.nodes = kept;
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.path().to_string(), i))
            .collect();
        Ok(removed)
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundTypeDescription;
    use crate::format::FormatSpecifier;
    use crate::node::Payload;

    fn sample() -> Collection {
        let mut c = Collection::with_filename("volume.h5");
        c.add(Node::group("/what").unwrap()).unwrap();
        c.add(Node::string_attribute("/what/object", "PVOL").unwrap()).unwrap();
        c.add(Node::group("/dataset1").unwrap()).unwrap();
        c.add(Node::group("/dataset1/data1").unwrap()).unwrap();
        c.add(
            Node::dataset(
                "/dataset1/data1/data",
                Payload::from_values(&[2, 2], &[1u8, 2, 3, 4]).unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
        c
    }

    #[test]
    fn lookup_by_name_and_index() {
        let c = sample();
        assert_eq!(c.len(), 5);
        assert_eq!(c.filename(), Some(Path::new("volume.h5")));
        assert!(c.has_by_name("/dataset1/data1"));
        assert!(c.has_by_name("dataset1/data1/"));
        assert_eq!(c.get_by_index(1).unwrap().path(), "/what/object");
        assert!(c.get_by_index(9).is_none());
    }

    #[test]
    fn invariant_violations_hand_node_back() {
        let mut c = sample();
        let err = c.add(Node::scalar_attribute("/missing/gain", 1.0f64).unwrap()).unwrap_err();
        assert!(matches!(err.reason, Error::MissingParent(_)));
        assert_eq!(err.node.path(), "/missing/gain");

        let err = c.add(Node::group("/what/object/sub").unwrap()).unwrap_err();
        assert!(matches!(err.reason, Error::InvalidParentKind { .. }));

        let err = c.add(Node::group("/what").unwrap()).unwrap_err();
        assert!(matches!(err.reason, Error::DuplicatePath(_)));

        // a dataset may not hold a group, but may hold attributes
        assert!(c.add(Node::group("/dataset1/data1/data/g").unwrap()).is_err());
        assert!(c
            .add(Node::scalar_attribute("/dataset1/data1/data/gain", 0.5f64).unwrap())
            .is_ok());
        assert_eq!(c.len(), 6);
    }

    #[test]
    fn dataset_directly_under_root() {
        let mut c = Collection::new();
        let node = Node::dataset("/top", Payload::from_values(&[1], &[1i8]).unwrap()).unwrap();
        assert!(c.add(node).is_ok());
    }

    #[test]
    fn mark_all_and_remove_subtree() {
        let mut c = sample();
        c.mark_all(Mark::Select);
        assert!(c.iter().all(|n| n.mark() == Mark::Select));

        let removed = c.remove("/dataset1").unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(c.len(), 2);
        assert!(!c.has_by_name("/dataset1/data1/data"));
        assert_eq!(c.get_by_name("/what/object").unwrap().path(), "/what/object");
        assert!(matches!(c.remove("/dataset1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn compound_lookup_by_identity() {
        let mut c = Collection::new();
        for (name, objno) in [("/t1", 100), ("/t2", 200)] {
            let mut desc = CompoundTypeDescription::new("pair", 8);
            desc.add_member("a", 0, 4, FormatSpecifier::I32, &[]).unwrap();
            desc.id = ObjectId::new(1, objno);
            c.add(Node::named_compound(name, desc).unwrap()).unwrap();
        }
        let found = c.find_compound_description(ObjectId::new(1, 200)).unwrap();
        assert_eq!(found.id.objno, 200);
        assert!(c.find_compound_description(ObjectId::new(2, 200)).is_none());
    }
}
