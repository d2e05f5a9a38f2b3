//! Tree nodes: groups, datasets, attributes, named types and references.
//!
//! A node owns its payload bytes. Buffers are move-only: anything handed to
//! a node is moved in, and [`Node::take_data`] moves it back out.

use odimtree_format::datatype::Datatype;

use crate::compound::CompoundTypeDescription;
use crate::config::Compression;
use crate::error::{Error, Result};
use crate::format::{from_native_type, to_native_type, Element, FormatSpecifier};

/// Lifecycle state directing the engine's next action on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    /// Present in the backing file and unchanged.
    Original,
    /// Authored in memory, not yet written.
    Created,
    /// Present in the backing file with an in-memory payload change.
    Changed,
    /// Full fetch requested.
    Select,
    /// Metadata-only fetch requested.
    SelectMeta,
}

/// Events that move a node between marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Select,
    SelectMeta,
    Deselect,
    /// A requested fetch completed.
    Fetched,
    /// The node was written to the backing file.
    Written,
    /// The payload was replaced.
    Modified,
}

impl Mark {
    /// The mark after `event`, or `None` if the event is illegal here.
    pub fn apply(self, event: Transition) -> Option<Mark> {
        use Mark::*;
        match (self, event) {
            (Original | Select | SelectMeta, Transition::Select) => Some(Select),
            (Original | Select | SelectMeta, Transition::SelectMeta) => Some(SelectMeta),
            (Original | Select | SelectMeta, Transition::Deselect) => Some(Original),
            (Select | SelectMeta, Transition::Fetched) => Some(Original),
            (_, Transition::Written) => Some(Original),
            (Created, Transition::Modified) => Some(Created),
            (_, Transition::Modified) => Some(Changed),
            _ => None,
        }
    }

    pub fn is_selected(self) -> bool {
        matches!(self, Mark::Select | Mark::SelectMeta)
    }
}

/// How much of a node has been populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    NotFetched,
    /// Type and shape only; the payload bytes are absent.
    Metadata,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Dataset,
    Attribute,
    NamedType,
    Reference,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Group => "group",
            NodeKind::Dataset => "dataset",
            NodeKind::Attribute => "attribute",
            NodeKind::NamedType => "named type",
            NodeKind::Reference => "reference",
        }
    }

    /// Whether a node of this kind may hold a `child`.
    pub fn can_hold(self, child: NodeKind) -> bool {
        match child {
            NodeKind::Attribute | NodeKind::Reference => {
                matches!(self, NodeKind::Group | NodeKind::Dataset)
            }
            NodeKind::Group | NodeKind::Dataset | NodeKind::NamedType => self == NodeKind::Group,
        }
    }
}

/// Owned, move-only byte buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Buffer(Vec<u8>);

impl Buffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer(bytes)
    }
}

/// Normalize a node path to `/a/b` form.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_end_matches('/');
    let body = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if body.is_empty() || body.split('/').any(str::is_empty) {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(format!("/{body}"))
}

/// Parent path of a normalized path; the root is `""`.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn point_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Typed, shaped bytes of a dataset or attribute.
#[derive(Debug, PartialEq)]
pub struct Payload {
    dims: Vec<usize>,
    format: FormatSpecifier,
    /// Native datatype of `data`.
    datatype: Datatype,
    data: Option<Buffer>,
    /// Bytes exactly as stored on disk, when read from a file.
    raw: Option<Buffer>,
    compound: Option<CompoundTypeDescription>,
    /// Path of the named type this payload's datatype is committed as.
    named_type: Option<String>,
}

impl Payload {
    /// Numeric payload of `format`; `data` must hold one native element per
    /// point.
    pub fn new(dims: &[usize], format: FormatSpecifier, data: Vec<u8>) -> Result<Payload> {
        if !format.is_authorable() {
            return Err(Error::UnsupportedFormat(format!("cannot author {format} data")));
        }
        let datatype = to_native_type(format, None, None)?;
        Self::with_native_type(dims, datatype, data)
    }

    /// Payload of native values.
    pub fn from_values<T: Element>(dims: &[usize], values: &[T]) -> Result<Payload> {
        let mut data = Vec::with_capacity(values.len() * std::mem::size_of::<T>());
        for v in values {
            v.write_ne(&mut data);
        }
        Self::new(dims, T::FORMAT, data)
    }

    /// Fixed-length string payload sized to the longest value plus a
    /// terminator.
    pub fn strings(dims: &[usize], values: &[&str]) -> Result<Payload> {
        let width = values.iter().map(|s| s.len()).max().unwrap_or(0) + 1;
        let mut data = vec![0u8; width * values.len()];
        for (i, v) in values.iter().enumerate() {
            data[i * width..i * width + v.len()].copy_from_slice(v.as_bytes());
        }
        Self::with_native_type(dims, Datatype::c_string(width as u32), data)
    }

    /// Compound payload laid out as `desc` describes.
    pub fn from_compound(
        dims: &[usize],
        desc: CompoundTypeDescription,
        data: Vec<u8>,
    ) -> Result<Payload> {
        let datatype = to_native_type(FormatSpecifier::Compound, None, Some(&desc))?;
        Self::build(dims, datatype, data, Some(desc))
    }

    /// Payload with a pre-resolved native datatype.
    pub fn with_native_type(dims: &[usize], datatype: Datatype, data: Vec<u8>) -> Result<Payload> {
        if from_native_type(&datatype) == FormatSpecifier::Compound {
            return Err(Error::MissingCompoundDescription);
        }
        Self::build(dims, datatype, data, None)
    }

    fn build(
        dims: &[usize],
        datatype: Datatype,
        data: Vec<u8>,
        compound: Option<CompoundTypeDescription>,
    ) -> Result<Payload> {
        let expected = point_count(dims) * datatype.type_size() as usize;
        if data.len() != expected {
            return Err(Error::ShapeMismatch(format!(
                "{} bytes for extent {dims:?} of {}-byte elements",
                data.len(),
                datatype.type_size()
            )));
        }
        Ok(Payload {
            dims: dims.to_vec(),
            format: from_native_type(&datatype),
            datatype,
            data: Some(Buffer(data)),
            raw: None,
            compound,
            named_type: None,
        })
    }

    /// Shape and type only, as discovered before a fetch.
    pub(crate) fn metadata(
        dims: Vec<usize>,
        datatype: Datatype,
        compound: Option<CompoundTypeDescription>,
    ) -> Payload {
        Payload {
            format: from_native_type(&datatype),
            dims,
            datatype,
            data: None,
            raw: None,
            compound,
            named_type: None,
        }
    }

    /// Commit this payload's datatype as the named type at `path`.
    pub fn with_named_type(mut self, path: impl Into<String>) -> Payload {
        self.named_type = Some(path.into());
        self
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of the extents; 1 for a scalar.
    pub fn point_count(&self) -> usize {
        point_count(&self.dims)
    }

    pub fn format(&self) -> FormatSpecifier {
        self.format
    }

    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    pub fn element_size(&self) -> usize {
        self.datatype.type_size() as usize
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_ref().map(Buffer::as_bytes)
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_ref().map(Buffer::as_bytes)
    }

    pub fn compound(&self) -> Option<&CompoundTypeDescription> {
        self.compound.as_ref()
    }

    pub fn named_type(&self) -> Option<&str> {
        self.named_type.as_deref()
    }

    pub(crate) fn set_named_type(&mut self, path: Option<String>) {
        self.named_type = path;
    }

    pub(crate) fn set_compound(&mut self, compound: Option<CompoundTypeDescription>) {
        self.compound = compound;
    }

    pub(crate) fn fill(&mut self, data: Vec<u8>, raw: Vec<u8>) {
        self.data = Some(Buffer(data));
        self.raw = Some(Buffer(raw));
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum NodeBody {
    Group,
    Dataset {
        payload: Payload,
        compression: Option<Compression>,
        chunk_dims: Option<Vec<usize>>,
    },
    Attribute {
        payload: Payload,
    },
    NamedType {
        datatype: Datatype,
        compound: Option<CompoundTypeDescription>,
    },
    Reference {
        target: String,
    },
}

/// One element of a [`Collection`](crate::Collection).
#[derive(Debug, PartialEq)]
pub struct Node {
    path: String,
    mark: Mark,
    fetch: Fetch,
    pub(crate) body: NodeBody,
}

impl Node {
    fn authored(path: &str, body: NodeBody) -> Result<Node> {
        Ok(Node {
            path: normalize_path(path)?,
            mark: Mark::Created,
            fetch: Fetch::Full,
            body,
        })
    }

    pub fn group(path: &str) -> Result<Node> {
        Self::authored(path, NodeBody::Group)
    }

    pub fn dataset(path: &str, payload: Payload) -> Result<Node> {
        Self::authored(
            path,
            NodeBody::Dataset {
                payload,
                compression: None,
                chunk_dims: None,
            },
        )
    }

    pub fn attribute(path: &str, payload: Payload) -> Result<Node> {
        Self::authored(path, NodeBody::Attribute { payload })
    }

    /// Scalar numeric attribute.
    pub fn scalar_attribute<T: Element>(path: &str, value: T) -> Result<Node> {
        Self::attribute(path, Payload::from_values(&[], &[value])?)
    }

    /// Scalar string attribute.
    pub fn string_attribute(path: &str, value: &str) -> Result<Node> {
        Self::attribute(path, Payload::strings(&[], &[value])?)
    }

    /// Named type to be committed, described by a compound description.
    pub fn named_compound(path: &str, desc: CompoundTypeDescription) -> Result<Node> {
        let datatype = desc.to_datatype()?;
        Self::authored(
            path,
            NodeBody::NamedType {
                datatype,
                compound: Some(desc),
            },
        )
    }

    /// Named type for a scalar format.
    pub fn named_type(path: &str, format: FormatSpecifier, string_size: Option<usize>) -> Result<Node> {
        let datatype = to_native_type(format, string_size, None)?;
        Self::authored(
            path,
            NodeBody::NamedType {
                datatype,
                compound: None,
            },
        )
    }

    /// Reference attribute pointing at the object at `target`.
    pub fn reference(path: &str, target: &str) -> Result<Node> {
        let target = normalize_path(target)?;
        Self::authored(path, NodeBody::Reference { target })
    }

    /// Structure-only node discovered in a file.
    pub(crate) fn discovered(path: String, body: NodeBody, fetch: Fetch) -> Node {
        Node {
            path,
            mark: Mark::Original,
            fetch,
            body,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    pub fn parent(&self) -> &str {
        parent_path(&self.path)
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Group => NodeKind::Group,
            NodeBody::Dataset { .. } => NodeKind::Dataset,
            NodeBody::Attribute { .. } => NodeKind::Attribute,
            NodeBody::NamedType { .. } => NodeKind::NamedType,
            NodeBody::Reference { .. } => NodeKind::Reference,
        }
    }

    pub fn mark(&self) -> Mark {
        self.mark
    }

    pub fn fetch(&self) -> Fetch {
        self.fetch
    }

    /// True once a payload has been populated, fully or metadata only.
    pub fn is_fetched(&self) -> bool {
        self.fetch != Fetch::NotFetched
    }

    /// Move to the mark `event` leads to.
    pub fn apply(&mut self, event: Transition) -> Result<()> {
        match self.mark.apply(event) {
            Some(next) => {
                self.mark = next;
                Ok(())
            }
            None => Err(Error::Transition {
                path: self.path.clone(),
                from: self.mark,
                to: match event {
                    Transition::Select => Mark::Select,
                    Transition::SelectMeta => Mark::SelectMeta,
                    Transition::Modified => Mark::Changed,
                    _ => Mark::Original,
                },
            }),
        }
    }

    pub(crate) fn set_mark(&mut self, mark: Mark) {
        self.mark = mark;
    }

    pub(crate) fn set_fetch(&mut self, fetch: Fetch) {
        self.fetch = fetch;
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            NodeBody::Dataset { payload, .. } | NodeBody::Attribute { payload } => Some(payload),
            _ => None,
        }
    }

    pub(crate) fn payload_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.body {
            NodeBody::Dataset { payload, .. } | NodeBody::Attribute { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn dims(&self) -> &[usize] {
        self.payload().map(Payload::dims).unwrap_or(&[])
    }

    pub fn format(&self) -> Option<FormatSpecifier> {
        match &self.body {
            NodeBody::NamedType { datatype, .. } => Some(from_native_type(datatype)),
            _ => self.payload().map(Payload::format),
        }
    }

    /// Native payload bytes. `None` until fully fetched, including after a
    /// metadata-only fetch.
    pub fn data(&self) -> Option<&[u8]> {
        if self.fetch != Fetch::Full {
            return None;
        }
        self.payload().and_then(Payload::data)
    }

    /// On-disk payload bytes, for nodes read from a file.
    pub fn raw_data(&self) -> Option<&[u8]> {
        if self.fetch != Fetch::Full {
            return None;
        }
        self.payload().and_then(Payload::raw)
    }

    pub fn compound(&self) -> Option<&CompoundTypeDescription> {
        match &self.body {
            NodeBody::NamedType { compound, .. } => compound.as_ref(),
            _ => self.payload().and_then(Payload::compound),
        }
    }

    /// Datatype of a named type node.
    pub fn named_datatype(&self) -> Option<&Datatype> {
        match &self.body {
            NodeBody::NamedType { datatype, .. } => Some(datatype),
            _ => None,
        }
    }

    /// Target path of a reference node.
    pub fn reference_target(&self) -> Option<&str> {
        match &self.body {
            NodeBody::Reference { target } => Some(target),
            _ => None,
        }
    }

    pub fn compression(&self) -> Option<Compression> {
        match &self.body {
            NodeBody::Dataset { compression, .. } => *compression,
            _ => None,
        }
    }

    pub fn chunk_dims(&self) -> Option<&[usize]> {
        match &self.body {
            NodeBody::Dataset { chunk_dims, .. } => chunk_dims.as_deref(),
            _ => None,
        }
    }

    pub fn set_compression(&mut self, compression: Compression) -> Result<()> {
        match &mut self.body {
            NodeBody::Dataset {
                compression: slot, ..
            } => {
                *slot = Some(compression);
                Ok(())
            }
            _ => Err(self.wrong_kind("dataset")),
        }
    }

    /// Chunk shape used when the dataset is compressed.
    pub fn set_chunk_dims(&mut self, dims: &[usize]) -> Result<()> {
        let rank = self.dims().len();
        if dims.len() != rank || dims.contains(&0) {
            return Err(Error::ShapeMismatch(format!(
                "chunk shape {dims:?} for rank {rank}"
            )));
        }
        match &mut self.body {
            NodeBody::Dataset { chunk_dims, .. } => {
                *chunk_dims = Some(dims.to_vec());
                Ok(())
            }
            _ => Err(self.wrong_kind("dataset")),
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> Error {
        Error::WrongKind {
            path: self.path.clone(),
            expected,
        }
    }

    fn numeric_data<T: Element>(&self) -> Result<&[u8]> {
        let payload = self.payload().ok_or_else(|| self.wrong_kind("dataset or attribute"))?;
        if payload.format() != T::FORMAT {
            return Err(Error::UnsupportedFormat(format!(
                "{} holds {}, not {}",
                self.path,
                payload.format(),
                T::FORMAT
            )));
        }
        self.data().ok_or_else(|| Error::NotFound(format!("payload of {}", self.path)))
    }

    /// The single value of a scalar (or one-point) payload.
    pub fn scalar<T: Element>(&self) -> Result<T> {
        let data = self.numeric_data::<T>()?;
        if data.len() != std::mem::size_of::<T>() {
            return Err(Error::ShapeMismatch(format!("{} is not a scalar", self.path)));
        }
        Ok(T::read_ne(data))
    }

    pub fn values<T: Element>(&self) -> Result<Vec<T>> {
        let data = self.numeric_data::<T>()?;
        Ok(data
            .chunks_exact(std::mem::size_of::<T>())
            .map(T::read_ne)
            .collect())
    }

    /// Every string of a string payload, cut at the first NUL.
    pub fn string_values(&self) -> Result<Vec<String>> {
        let payload = self.payload().ok_or_else(|| self.wrong_kind("dataset or attribute"))?;
        if payload.format() != FormatSpecifier::String {
            return Err(Error::UnsupportedFormat(format!("{} is not a string", self.path)));
        }
        let data = self
            .data()
            .ok_or_else(|| Error::NotFound(format!("payload of {}", self.path)))?;
        let width = payload.element_size().max(1);
        Ok(data
            .chunks(width)
            .map(|s| {
                let end = s.iter().position(|&b| b == 0).unwrap_or(s.len());
                String::from_utf8_lossy(&s[..end]).into_owned()
            })
            .collect())
    }

    /// The first string of a string payload.
    pub fn string_value(&self) -> Result<String> {
        self.string_values()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ShapeMismatch(format!("{} holds no string", self.path)))
    }

    /// Move the native payload out of the node.
    pub fn take_data(&mut self) -> Option<Buffer> {
        if self.fetch != Fetch::Full {
            return None;
        }
        self.payload_mut().and_then(|p| p.data.take())
    }

    /// Replace the native payload. The buffer must match the node's shape and
    /// element size. An `Original` node becomes `Changed`.
    pub fn set_data(&mut self, data: Buffer) -> Result<()> {
        let path = self.path.clone();
        let payload = self
            .payload_mut()
            .ok_or_else(|| Error::WrongKind {
                path: path.clone(),
                expected: "dataset or attribute",
            })?;
        let expected = payload.point_count() * payload.element_size();
        if data.len() != expected {
            return Err(Error::ShapeMismatch(format!(
                "{} bytes for {path}, expected {expected}",
                data.len()
            )));
        }
        payload.data = Some(data);
        payload.raw = None;
        self.fetch = Fetch::Full;
        self.apply(Transition::Modified)
    }
}
