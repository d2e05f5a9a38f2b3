//! Read engine: structure discovery, node selection and payload fetch.
//!
//! Reading is split into two phases. [`Engine::read_structure`] walks the
//! file and builds a collection of shape-and-type nodes, fetching attribute
//! values eagerly. [`Engine::fetch_marked`] later pulls in the payloads of
//! whatever nodes have been selected.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use odimtree_format::attribute::{AttributeMessage, AttributeType};
use odimtree_format::codec::Sizes;
use odimtree_format::data_layout::DataLayout;
use odimtree_format::data_read::read_raw_data;
use odimtree_format::dataspace::Dataspace;
use odimtree_format::datatype::{Datatype, ReferenceType};
use odimtree_format::error::FormatError;
use odimtree_format::filter_pipeline::{FilterPipeline, FILTER_DEFLATE, FILTER_SZIP};
use odimtree_format::global_heap::read_vl_strings;
use odimtree_format::group::{group_entries, group_storage, resolve_path};
use odimtree_format::link::LinkTarget;
use odimtree_format::message_type::MessageType;
use odimtree_format::object_header::ObjectHeader;
use odimtree_format::shared_message::SharedRef;
use odimtree_format::signature::find_signature;
use odimtree_format::superblock::Superblock;
use tracing::{debug, info, warn};

use crate::collection::Collection;
use crate::compound::{CompoundTypeDescription, ObjectId};
use crate::config::Compression;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::format::{fix_type, from_native_type, to_native_data, FormatSpecifier};
use crate::node::{normalize_path, parent_path, Fetch, Mark, Node, NodeBody, NodeKind, Payload, Transition};

/// Identity handed to each opened file, used in [`ObjectId`]s.
static NEXT_FILENO: AtomicU64 = AtomicU64::new(1);

/// A memory-mapped HDF5 file, addressed relative to its base.
pub(crate) struct FileImage {
    map: Mmap,
    base: usize,
    pub(crate) superblock: Superblock,
    pub(crate) sizes: Sizes,
    pub(crate) fileno: u64,
    verify: bool,
}

impl FileImage {
    pub(crate) fn open(path: &Path, verify: bool) -> Result<FileImage> {
        let file = File::open(path)?;
        // SAFETY: read-only mapping. Modifying the file while it is mapped is
        // unsupported, as is any concurrent use of one file.
        let map = unsafe { Mmap::map(&file)? };
        let base = find_signature(&map)?;
        let superblock = Superblock::parse(&map, base)?;
        Ok(FileImage {
            sizes: superblock.sizes(),
            map,
            base,
            superblock,
            fileno: NEXT_FILENO.fetch_add(1, Ordering::Relaxed),
            verify,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.map[self.base..]
    }

    pub(crate) fn root(&self) -> u64 {
        self.superblock.root_group_address
    }

    pub(crate) fn header(&self, address: u64) -> Result<ObjectHeader> {
        Ok(ObjectHeader::parse_with(self.data(), address, self.sizes, self.verify)?)
    }

    /// Object header address of a normalized path; `""` is the root.
    pub(crate) fn resolve(&self, path: &str) -> Result<u64> {
        Ok(resolve_path(self.data(), self.root(), path, self.sizes, self.verify)?)
    }

    /// Datatype described by a possibly shared datatype message, and the
    /// address of the committed type when it is shared.
    fn datatype(&self, header: &ObjectHeader) -> Result<(Datatype, Option<u64>)> {
        let msg = header
            .find(MessageType::Datatype)
            .ok_or(FormatError::MissingMessage {
                address: header.address,
                message: "datatype",
            })?;
        if !msg.is_shared() {
            return Ok((Datatype::parse(&msg.data)?.0, None));
        }
        let committed = SharedRef::parse(&msg.data, self.sizes)?.committed_address()?;
        let (dt, _) = self.datatype(&self.header(committed)?)?;
        Ok((dt, Some(committed)))
    }

    fn committed_datatype(&self, address: u64) -> Result<Datatype> {
        Ok(self.datatype(&self.header(address)?)?.0)
    }
}

/// What kind of object an object header describes.
fn classify(header: &ObjectHeader, sizes: Sizes) -> Result<Option<NodeKind>> {
    if header.has(MessageType::DataLayout) {
        return Ok(Some(NodeKind::Dataset));
    }
    if group_storage(header, sizes)?.is_some() {
        return Ok(Some(NodeKind::Group));
    }
    if header.has(MessageType::Datatype) {
        return Ok(Some(NodeKind::NamedType));
    }
    Ok(None)
}

fn to_usize_dims(space: &Dataspace) -> Vec<usize> {
    space.dimensions.iter().map(|&d| d as usize).collect()
}

/// Canonical type exposed before any value is known. Variable-length strings
/// get their final width from the values.
fn metadata_type(disk: &Datatype) -> Result<Datatype> {
    match disk {
        Datatype::VariableLength { is_string: true, .. } => Ok(Datatype::c_string(1)),
        other => fix_type(other),
    }
}

/// Convert stored element bytes to native values.
fn decode_values(
    image: &FileImage,
    disk: &Datatype,
    raw: &[u8],
    count: usize,
) -> Result<(Datatype, Vec<u8>)> {
    if let Datatype::VariableLength { is_string: true, .. } = disk {
        let strings = read_vl_strings(image.data(), raw, count, image.sizes)?;
        let width = strings.iter().map(Vec::len).max().unwrap_or(0) + 1;
        let mut native = vec![0u8; width * count];
        for (i, s) in strings.iter().enumerate() {
            native[i * width..i * width + s.len()].copy_from_slice(s);
        }
        return Ok((Datatype::c_string(width as u32), native));
    }
    let fixed = fix_type(disk)?;
    let native = to_native_data(raw, disk, &fixed, count)?;
    Ok((fixed, native))
}

/// Dataset shape, type and storage as recorded in its object header.
struct DatasetInfo {
    dims: Vec<u64>,
    disk_type: Datatype,
    committed: Option<u64>,
    layout: DataLayout,
    pipeline: Option<FilterPipeline>,
}

impl DatasetInfo {
    fn read(image: &FileImage, header: &ObjectHeader) -> Result<DatasetInfo> {
        let space = header
            .find(MessageType::Dataspace)
            .ok_or(FormatError::MissingMessage {
                address: header.address,
                message: "dataspace",
            })?;
        let layout = header
            .find(MessageType::DataLayout)
            .ok_or(FormatError::MissingMessage {
                address: header.address,
                message: "data layout",
            })?;
        let (disk_type, committed) = image.datatype(header)?;
        Ok(DatasetInfo {
            dims: Dataspace::parse(&space.data, image.sizes)?.dimensions,
            disk_type,
            committed,
            layout: DataLayout::parse(&layout.data, image.sizes)?,
            pipeline: header
                .find(MessageType::FilterPipeline)
                .map(|m| FilterPipeline::parse(&m.data))
                .transpose()?,
        })
    }

    fn udims(&self) -> Vec<usize> {
        self.dims.iter().map(|&d| d as usize).collect()
    }

    fn compression(&self) -> Option<Compression> {
        let pipeline = self.pipeline.as_ref()?;
        pipeline.filters.iter().find_map(|f| match f.filter_id {
            FILTER_DEFLATE => Some(Compression::Deflate(
                f.client_data.first().map_or(6, |&l| l.clamp(1, 9) as u8),
            )),
            FILTER_SZIP => Some(Compression::Szip {
                mask: f.client_data.first().copied().unwrap_or(0),
                block: f.client_data.get(1).copied().unwrap_or(0),
            }),
            _ => None,
        })
    }

    fn chunk_dims(&self) -> Option<Vec<usize>> {
        match &self.layout {
            DataLayout::Chunked { dimensions, .. } if !dimensions.is_empty() => Some(
                dimensions[..dimensions.len() - 1]
                    .iter()
                    .map(|&d| d as usize)
                    .collect(),
            ),
            _ => None,
        }
    }

    fn read_values(&self, image: &FileImage) -> Result<(Datatype, Vec<u8>, Vec<u8>)> {
        let element_size = self.disk_type.type_size() as usize;
        let raw = read_raw_data(
            image.data(),
            &self.layout,
            &self.dims,
            element_size,
            self.pipeline.as_ref(),
            image.sizes,
        )?;
        let count = self.dims.iter().product::<u64>() as usize;
        let (fixed, native) = decode_values(image, &self.disk_type, &raw, count)?;
        Ok((fixed, native, raw))
    }
}

/// A decoded attribute message.
enum AttrValue {
    Data(Payload),
    /// Object reference to the header at this address.
    Reference(u64),
}

/// Discovery state of one `read_structure` call.
struct Walker<'a> {
    image: &'a FileImage,
    collection: Collection,
    /// Header address to node path for everything discovered.
    paths: HashMap<u64, String>,
    visited: HashSet<u64>,
    /// Reference attributes, resolved once the walk is complete.
    references: Vec<(String, u64)>,
}

impl<'a> Walker<'a> {
    fn named_type_of(&self, committed: Option<u64>) -> Option<String> {
        let address = committed?;
        let path = self.paths.get(&address)?;
        let node = self.collection.get_by_name(path)?;
        (node.kind() == NodeKind::NamedType).then(|| path.clone())
    }

    /// Compound description for a fixed type, shared with the named type it
    /// was committed as when that type is in the collection.
    fn compound_for(
        &self,
        fixed: &Datatype,
        committed: Option<u64>,
        name: &str,
    ) -> Result<Option<CompoundTypeDescription>> {
        if from_native_type(fixed) != FormatSpecifier::Compound {
            return Ok(None);
        }
        if let Some(address) = committed {
            let id = ObjectId::new(self.image.fileno, address);
            if let Some(desc) = self.collection.find_compound_description(id) {
                return Ok(Some(desc.clone()));
            }
        }
        let id = committed.map_or_else(ObjectId::default, |a| ObjectId::new(self.image.fileno, a));
        Ok(Some(CompoundTypeDescription::from_datatype(name, id, fixed)?))
    }

    fn insert(&mut self, node: Node) -> Result<()> {
        self.collection.add(node).map_err(|rejected| rejected.reason)
    }

    fn attribute(&self, msg: &AttributeMessage) -> Result<AttrValue> {
        let (disk, committed) = match &msg.datatype {
            AttributeType::Inline(dt) => (dt.clone(), None),
            AttributeType::Committed(address) => {
                (self.image.committed_datatype(*address)?, Some(*address))
            }
        };
        let count = msg.dataspace.num_elements() as usize;
        if let Datatype::Reference {
            ref_type: ReferenceType::Object,
            ..
        } = disk
        {
            let address = self.image.sizes.read_offset(&msg.raw_data, 0)?;
            if count != 1 {
                warn!(attribute = %msg.name, count, "only the first object reference is kept");
            }
            return Ok(AttrValue::Reference(address));
        }
        let width = disk.type_size() as usize;
        let raw = msg
            .raw_data
            .get(..width * count)
            .ok_or(FormatError::UnexpectedEof {
                expected: width * count,
                available: msg.raw_data.len(),
            })?;
        let (fixed, native) = decode_values(self.image, &disk, raw, count)?;
        let compound = self.compound_for(&fixed, committed, &msg.name)?;
        let mut payload = Payload::metadata(to_usize_dims(&msg.dataspace), fixed, compound);
        payload.fill(native, raw.to_vec());
        payload.set_named_type(self.named_type_of(committed));
        Ok(AttrValue::Data(payload))
    }

    fn attributes(&mut self, header: &ObjectHeader, owner: &str) -> Result<()> {
        for msg in header.find_all(MessageType::Attribute) {
            let attr = AttributeMessage::parse(&msg.data, self.image.sizes)?;
            let path = format!("{owner}/{}", attr.name);
            match self.attribute(&attr)? {
                AttrValue::Data(payload) => {
                    let node = Node::discovered(path, NodeBody::Attribute { payload }, Fetch::Full);
                    self.insert(node)?;
                }
                AttrValue::Reference(address) => self.references.push((path, address)),
            }
        }
        Ok(())
    }

    /// Visit the object at `address`, known as `path` (`""` for the root).
    fn visit(&mut self, address: u64, path: &str) -> Result<()> {
        if !self.visited.insert(address) {
            debug!(path, address, "object already visited, not following again");
            return Ok(());
        }
        let image = self.image;
        let header = image.header(address)?;
        let Some(kind) = classify(&header, image.sizes)? else {
            warn!(path, address, "skipping object of unknown kind");
            return Ok(());
        };
        if !path.is_empty() {
            self.paths.insert(address, path.to_string());
        }
        let name = path.rsplit('/').next().unwrap_or("");
        match kind {
            NodeKind::Group => {
                if !path.is_empty() {
                    let node = Node::discovered(path.to_string(), NodeBody::Group, Fetch::Full);
                    self.insert(node)?;
                }
                self.attributes(&header, path)?;
                for entry in group_entries(image.data(), &header, image.sizes)? {
                    let child = format!("{path}/{}", entry.name);
                    match entry.target {
                        LinkTarget::Hard(target) => self.visit(target, &child)?,
                        LinkTarget::Soft(target) => {
                            debug!(path = %child, %target, "soft link not followed")
                        }
                        LinkTarget::External { filename, path: target } => {
                            debug!(path = %child, %filename, %target, "external link not followed")
                        }
                    }
                }
            }
            NodeKind::Dataset => {
                let info = DatasetInfo::read(image, &header)?;
                let fixed = metadata_type(&info.disk_type)?;
                let compound = self.compound_for(&fixed, info.committed, name)?;
                let mut payload = Payload::metadata(info.udims(), fixed, compound);
                payload.set_named_type(self.named_type_of(info.committed));
                let body = NodeBody::Dataset {
                    payload,
                    compression: info.compression(),
                    chunk_dims: info.chunk_dims(),
                };
                self.insert(Node::discovered(path.to_string(), body, Fetch::NotFetched))?;
                self.attributes(&header, path)?;
            }
            NodeKind::NamedType => {
                let (disk, _) = image.datatype(&header)?;
                let datatype = fix_type(&disk)?;
                let compound = match from_native_type(&datatype) {
                    FormatSpecifier::Compound => Some(CompoundTypeDescription::from_datatype(
                        name,
                        ObjectId::new(image.fileno, address),
                        &datatype,
                    )?),
                    _ => None,
                };
                let body = NodeBody::NamedType { datatype, compound };
                self.insert(Node::discovered(path.to_string(), body, Fetch::Full))?;
                self.attributes(&header, path)?;
            }
            NodeKind::Attribute | NodeKind::Reference => {}
        }
        Ok(())
    }

    /// Address to path map of the whole file, for references that point
    /// outside the walked subtree.
    fn full_map(&self) -> Result<HashMap<u64, String>> {
        let image = self.image;
        let mut map = HashMap::new();
        let mut queue = vec![(image.root(), String::new())];
        let mut seen = HashSet::new();
        while let Some((address, path)) = queue.pop() {
            if !seen.insert(address) {
                continue;
            }
            if !path.is_empty() {
                map.insert(address, path.clone());
            }
            let header = image.header(address)?;
            if group_storage(&header, image.sizes)?.is_none() {
                continue;
            }
            for entry in group_entries(image.data(), &header, image.sizes)? {
                if let Some(target) = entry.address() {
                    queue.push((target, format!("{path}/{}", entry.name)));
                }
            }
        }
        Ok(map)
    }

    fn resolve_references(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.references);
        let mut outside: Option<HashMap<u64, String>> = None;
        for (path, address) in pending {
            let target = match self.paths.get(&address) {
                Some(target) => target.clone(),
                None => {
                    if outside.is_none() {
                        outside = Some(self.full_map()?);
                    }
                    match outside.as_ref().and_then(|m| m.get(&address)) {
                        Some(target) => target.clone(),
                        None => {
                            warn!(%path, address, "dangling object reference skipped");
                            continue;
                        }
                    }
                }
            };
            let node = Node::discovered(path, NodeBody::Reference { target }, Fetch::Full);
            self.insert(node)?;
        }
        Ok(())
    }
}

impl Engine {
    /// Open `path` and build a collection of every object at or below
    /// `from_path` (`""` or `"/"` for the whole file).
    ///
    /// Nodes are marked `Original`. Attribute values are read now, dataset
    /// payloads are left for [`fetch_marked`](Self::fetch_marked).
    pub fn read_structure(&self, path: impl AsRef<Path>, from_path: &str) -> Result<Collection> {
        self.diagnostics
            .scope(|| self.read_structure_scoped(path.as_ref(), from_path))
    }

    #[tracing::instrument(skip_all, fields(file = %path.display(), from = from_path))]
    fn read_structure_scoped(&self, path: &Path, from_path: &str) -> Result<Collection> {
        let image = FileImage::open(path, self.config.verify_checksums)?;
        let start = match from_path.trim_matches('/') {
            "" => String::new(),
            _ => normalize_path(from_path)?,
        };
        let mut walker = Walker {
            image: &image,
            collection: Collection::with_filename(path),
            paths: HashMap::new(),
            visited: HashSet::new(),
            references: Vec::new(),
        };

        // ancestors of the start point, so every parent is present
        let mut prefix = String::new();
        let components: Vec<&str> = start.split('/').filter(|c| !c.is_empty()).collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            prefix = format!("{prefix}/{component}");
            let address = image.resolve(&prefix)?;
            walker.visited.insert(address);
            walker.paths.insert(address, prefix.clone());
            walker.insert(Node::discovered(prefix.clone(), NodeBody::Group, Fetch::Full))?;
        }

        let address = image.resolve(&start)?;
        walker.visit(address, &start)?;
        walker.resolve_references()?;
        info!(nodes = walker.collection.len(), "structure read");
        Ok(walker.collection)
    }

    /// Fetch every `Select`/`SelectMeta` node of `collection`.
    ///
    /// All selected nodes are read before any is modified: on failure the
    /// collection is unchanged, marks included, and the error names the
    /// failing path. Returns the number of nodes fetched; with nothing
    /// selected this is a no-op that does not touch the file.
    pub fn fetch_marked(&self, collection: &mut Collection) -> Result<usize> {
        self.diagnostics.scope(|| self.fetch_marked_scoped(collection))
    }

    #[tracing::instrument(skip_all)]
    fn fetch_marked_scoped(&self, collection: &mut Collection) -> Result<usize> {
        let selected: Vec<usize> = collection
            .iter()
            .enumerate()
            .filter(|(_, n)| n.mark().is_selected())
            .map(|(i, _)| i)
            .collect();
        if selected.is_empty() {
            return Ok(0);
        }
        let filename = collection
            .filename()
            .ok_or_else(|| Error::NotFound("backing file of collection".into()))?;
        let image = FileImage::open(filename, self.config.verify_checksums)?;

        let mut staged = Vec::with_capacity(selected.len());
        for &i in &selected {
            let Some(node) = collection.get_by_index(i) else {
                continue;
            };
            let fetched = fetch_node(&image, node).map_err(|e| {
                warn!(path = node.path(), error = %e, "fetch failed, batch abandoned");
                Error::FetchFailed {
                    path: node.path().to_string(),
                    source: Box::new(e),
                }
            })?;
            staged.push((i, fetched));
        }

        let count = staged.len();
        for (i, fetched) in staged {
            let node = collection.node_at_mut(i);
            if let Some((payload, fetch)) = fetched {
                if let Some(slot) = node.payload_mut() {
                    *slot = payload;
                }
                node.set_fetch(fetch);
            }
            node.apply(Transition::Fetched)?;
        }
        debug!(count, "fetched");
        Ok(count)
    }

    /// Select `path`, fetch everything selected, and return the node.
    pub fn fetch_one<'c>(&self, collection: &'c mut Collection, path: &str) -> Result<&'c Node> {
        collection.select(path)?;
        self.fetch_marked(collection)?;
        collection
            .get_by_name(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }
}

/// Read one selected node. `None` means there is nothing to populate.
fn fetch_node(image: &FileImage, node: &Node) -> Result<Option<(Payload, Fetch)>> {
    let metadata_only = node.mark() == Mark::SelectMeta;
    match node.kind() {
        NodeKind::Dataset => {
            // a loaded payload outlives later metadata-only selections
            if metadata_only && node.fetch() == Fetch::Full {
                return Ok(None);
            }
            let header = image.header(image.resolve(node.path())?)?;
            let info = DatasetInfo::read(image, &header)?;
            let named_type = node.payload().and_then(|p| p.named_type().map(str::to_string));
            // descriptions keep the identity assigned when the structure was read
            let previous = node.compound().cloned();

            let (mut payload, fetch) = if metadata_only {
                let fixed = metadata_type(&info.disk_type)?;
                (Payload::metadata(info.udims(), fixed, None), Fetch::Metadata)
            } else {
                let (fixed, native, raw) = info.read_values(image)?;
                let mut payload = Payload::metadata(info.udims(), fixed, None);
                payload.fill(native, raw);
                (payload, Fetch::Full)
            };
            if payload.format() == FormatSpecifier::Compound {
                let desc = match previous {
                    Some(desc) => desc,
                    None => CompoundTypeDescription::from_datatype(
                        node.name(),
                        ObjectId::default(),
                        payload.datatype(),
                    )?,
                };
                payload.set_compound(Some(desc));
            }
            payload.set_named_type(named_type);
            Ok(Some((payload, fetch)))
        }
        NodeKind::Attribute => {
            let owner = parent_path(node.path());
            let header = image.header(image.resolve(owner)?)?;
            for msg in header.find_all(MessageType::Attribute) {
                let attr = AttributeMessage::parse(&msg.data, image.sizes)?;
                if attr.name != node.name() {
                    continue;
                }
                let disk = match &attr.datatype {
                    AttributeType::Inline(dt) => dt.clone(),
                    AttributeType::Committed(address) => image.committed_datatype(*address)?,
                };
                let count = attr.dataspace.num_elements() as usize;
                let width = disk.type_size() as usize;
                let raw = attr.raw_data.get(..width * count).ok_or(FormatError::UnexpectedEof {
                    expected: width * count,
                    available: attr.raw_data.len(),
                })?;
                let (fixed, native) = decode_values(image, &disk, raw, count)?;
                let mut payload = Payload::metadata(to_usize_dims(&attr.dataspace), fixed, None);
                payload.fill(native, raw.to_vec());
                payload.set_compound(node.compound().cloned());
                payload.set_named_type(node.payload().and_then(|p| p.named_type().map(str::to_string)));
                return Ok(Some((payload, Fetch::Full)));
            }
            Err(Error::NotFound(node.path().to_string()))
        }
        NodeKind::Group | NodeKind::NamedType => {
            image.resolve(node.path())?;
            Ok(None)
        }
        NodeKind::Reference => {
            image.resolve(node.parent())?;
            Ok(None)
        }
    }
}

/// Node selection.
impl Collection {
    fn transition(&mut self, path: &str, event: Transition) -> Result<()> {
        let node = self
            .get_mut_by_name(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        node.apply(event)
    }

    /// Request a full fetch of `path`.
    pub fn select(&mut self, path: &str) -> Result<()> {
        self.transition(path, Transition::Select)
    }

    /// Undo a selection of `path`.
    pub fn deselect(&mut self, path: &str) -> Result<()> {
        self.transition(path, Transition::Deselect)
    }

    fn select_where(&mut self, event: Transition, pred: impl Fn(&Node) -> bool) -> usize {
        let mut count = 0;
        for node in self.iter_mut() {
            if pred(node) && node.apply(event).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Select every node read from the file. Authored and changed nodes are
    /// left alone. Returns the number selected.
    pub fn select_all(&mut self) -> usize {
        self.select_where(Transition::Select, |_| true)
    }

    /// Select every node read from the file for a type-and-shape fetch.
    pub fn select_metadata_only(&mut self) -> usize {
        self.select_where(Transition::SelectMeta, |_| true)
    }

    pub fn select_datasets_only(&mut self) -> usize {
        self.select_where(Transition::Select, |n| n.kind() == NodeKind::Dataset)
    }
}
