//! Write engine: full rewrites and append-only updates.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use odimtree_format::codec::{pad8, Sizes};
use odimtree_format::dataspace::Dataspace;
use odimtree_format::datatype::Datatype;
use odimtree_format::error::FormatError;
use odimtree_format::file_writer::{
    append_messages, encode_attribute, encode_link, write_file, AttrValue, AttributeSpec,
    ObjectKind, ObjectRef, ObjectSpec, ObjectWriter, Patch, Storage, TypeSpec,
};
use odimtree_format::filter_pipeline::{FilterDescription, FilterPipeline};
use odimtree_format::group::{group_storage, resolve_path, GroupStorage};
use odimtree_format::message_type::MessageType;
use odimtree_format::object_header::ObjectHeader;
use odimtree_format::signature::find_signature;
use odimtree_format::superblock::{BTreeKValues, Superblock};
use tracing::{debug, error, info};

use crate::collection::Collection;
use crate::config::{Compression, CreationProperties};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::node::{Mark, Node, NodeBody, NodeKind, Payload, Transition};

/// Default chunk B-tree K when a file does not record one.
const DEFAULT_ISTORE_K: u16 = 32;

/// Where a node's object lives.
#[derive(Debug, Clone, Copy)]
enum Owner {
    /// One of the objects being written.
    New(usize),
    /// An object already in the file.
    Existing(u64),
}

/// Messages bound for an object already in the file.
enum Pending {
    Link(String, ObjectRef),
    Attribute(AttributeSpec),
}

/// Turns collection nodes into format-level object specs.
struct Planner<'c> {
    collection: &'c Collection,
    sizes: Sizes,
    /// Compression for datasets that carry none of their own.
    compression: Option<Compression>,
    objects: Vec<ObjectSpec>,
    owners: HashMap<String, Owner>,
    appends: BTreeMap<u64, (String, Vec<Pending>)>,
    /// Existing file contents, used to resolve paths during an update.
    existing: Option<(&'c [u8], u64, bool)>,
}

impl<'c> Planner<'c> {
    fn new(collection: &'c Collection, sizes: Sizes, compression: Option<Compression>) -> Self {
        Planner {
            collection,
            sizes,
            compression,
            objects: Vec::new(),
            owners: HashMap::new(),
            appends: BTreeMap::new(),
            existing: None,
        }
    }

    fn owner(&mut self, path: &str) -> Result<Owner> {
        if let Some(owner) = self.owners.get(path) {
            return Ok(*owner);
        }
        let (data, root, verify) = self
            .existing
            .ok_or_else(|| Error::MissingParent(path.to_string()))?;
        let address = resolve_path(data, root, path, self.sizes, verify)?;
        let owner = Owner::Existing(address);
        self.owners.insert(path.to_string(), owner);
        Ok(owner)
    }

    fn object_ref(&mut self, path: &str) -> Result<ObjectRef> {
        Ok(match self.owner(path)? {
            Owner::New(i) => ObjectRef::New(i),
            Owner::Existing(address) => ObjectRef::Existing(address),
        })
    }

    fn push_object(&mut self, node: &Node, spec: ObjectSpec) -> Result<()> {
        let index = self.objects.len();
        self.objects.push(spec);
        self.owners.insert(node.path().to_string(), Owner::New(index));
        let link = ObjectRef::New(index);
        match self.owner(node.parent())? {
            Owner::New(parent) => match &mut self.objects[parent].kind {
                ObjectKind::Group { links } => links.push((node.name().to_string(), link)),
                _ => return Err(Error::MissingParent(node.path().to_string())),
            },
            Owner::Existing(address) => {
                self.pending(address, node.parent())
                    .push(Pending::Link(node.name().to_string(), link));
            }
        }
        Ok(())
    }

    fn pending(&mut self, address: u64, path: &str) -> &mut Vec<Pending> {
        &mut self
            .appends
            .entry(address)
            .or_insert_with(|| (path.to_string(), Vec::new()))
            .1
    }

    fn push_attribute(&mut self, node: &Node, spec: AttributeSpec) -> Result<()> {
        match self.owner(node.parent())? {
            Owner::New(parent) => self.objects[parent].attributes.push(spec),
            Owner::Existing(address) => {
                self.pending(address, node.parent())
                    .push(Pending::Attribute(spec));
            }
        }
        Ok(())
    }

    /// Datatype of a payload, committed when it names a named type.
    fn type_spec(&mut self, node: &Node, payload: &Payload) -> Result<TypeSpec> {
        let Some(named) = payload.named_type() else {
            return Ok(TypeSpec::Inline(payload.datatype().clone()));
        };
        let target = self
            .collection
            .get_by_name(named)
            .ok_or_else(|| Error::NotFound(named.to_string()))?;
        if target.named_datatype() != Some(payload.datatype()) {
            return Err(Error::UnsupportedFormat(format!(
                "{} does not match named type {named}",
                node.path()
            )));
        }
        Ok(TypeSpec::Committed(self.object_ref(target.path())?))
    }

    fn storage(&self, node: &Node, payload: &Payload) -> Result<Storage> {
        if payload.rank() == 0 {
            return Ok(Storage::Contiguous);
        }
        let chunk_dims = || -> Vec<u64> {
            match node.chunk_dims() {
                Some(dims) => dims.iter().map(|&d| d as u64).collect(),
                None => payload.dims().iter().map(|&d| d.max(1) as u64).collect(),
            }
        };
        match node.compression().or(self.compression) {
            None | Some(Compression::None) => match node.chunk_dims() {
                Some(_) => Ok(Storage::Chunked {
                    chunk_dims: chunk_dims(),
                    pipeline: FilterPipeline::default(),
                }),
                None => Ok(Storage::Contiguous),
            },
            Some(Compression::Deflate(level)) => Ok(Storage::Chunked {
                chunk_dims: chunk_dims(),
                pipeline: FilterPipeline {
                    filters: vec![FilterDescription::deflate(u32::from(level))],
                },
            }),
            Some(Compression::Szip { .. }) => Err(Error::Unsupported(format!(
                "szip compression requested for {}",
                node.path()
            ))),
        }
    }

    fn payload_bytes(node: &Node) -> Result<&[u8]> {
        node.data().ok_or_else(|| {
            Error::Unsupported(format!("{} has no fetched payload to write", node.path()))
        })
    }

    fn attribute_spec(&mut self, node: &Node, payload: &Payload) -> Result<AttributeSpec> {
        let dims: Vec<u64> = payload.dims().iter().map(|&d| d as u64).collect();
        Ok(AttributeSpec {
            name: node.name().to_string(),
            datatype: self.type_spec(node, payload)?,
            dataspace: Dataspace::simple(&dims),
            value: AttrValue::Raw(Self::payload_bytes(node)?.to_vec()),
        })
    }

    fn plan(&mut self, node: &Node) -> Result<()> {
        match &node.body {
            NodeBody::Group => self.push_object(node, ObjectSpec::group()),
            NodeBody::Dataset { payload, .. } => {
                let spec = ObjectSpec {
                    kind: ObjectKind::Dataset {
                        datatype: self.type_spec(node, payload)?,
                        dims: payload.dims().iter().map(|&d| d as u64).collect(),
                        element_size: payload.element_size(),
                        raw: Self::payload_bytes(node)?.to_vec(),
                        storage: self.storage(node, payload)?,
                    },
                    attributes: Vec::new(),
                };
                self.push_object(node, spec)
            }
            NodeBody::NamedType { datatype, .. } => {
                let spec = ObjectSpec {
                    kind: ObjectKind::NamedType {
                        datatype: datatype.clone(),
                    },
                    attributes: Vec::new(),
                };
                self.push_object(node, spec)
            }
            NodeBody::Attribute { payload } => {
                let spec = self.attribute_spec(node, payload)?;
                self.push_attribute(node, spec)
            }
            NodeBody::Reference { target } => {
                let spec = AttributeSpec {
                    name: node.name().to_string(),
                    datatype: TypeSpec::Inline(Datatype::object_reference(self.sizes.offset)),
                    dataspace: Dataspace::scalar(),
                    value: AttrValue::Reference(self.object_ref(target)?),
                };
                self.push_attribute(node, spec)
            }
        }
    }
}

/// References may point forward in collection order, so they are planned
/// after every object exists.
fn plan_all<'n>(planner: &mut Planner<'_>, nodes: impl Iterator<Item = &'n Node> + Clone) -> Result<()> {
    for node in nodes.clone().filter(|n| n.kind() != NodeKind::Reference) {
        planner.plan(node)?;
    }
    for node in nodes.filter(|n| n.kind() == NodeKind::Reference) {
        planner.plan(node)?;
    }
    Ok(())
}

fn report_failure<T>(path: &Path, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!(file = %path.display(), error = %e, critical = true, "write failed, file left unusable");
    }
    result
}

impl Engine {
    /// Create (or truncate) the collection's backing file and write every
    /// node into it in collection order.
    ///
    /// `compression` applies to datasets without their own; when `None` the
    /// engine default is used. Every node ends up `Original`.
    pub fn write_full(
        &self,
        collection: &mut Collection,
        props: &CreationProperties,
        compression: Option<Compression>,
    ) -> Result<()> {
        self.diagnostics
            .scope(|| self.write_full_scoped(collection, props, compression))
    }

    #[tracing::instrument(skip_all, fields(nodes = collection.len()))]
    fn write_full_scoped(
        &self,
        collection: &mut Collection,
        props: &CreationProperties,
        compression: Option<Compression>,
    ) -> Result<()> {
        let path = collection
            .filename()
            .ok_or_else(|| Error::NotFound("backing file of collection".into()))?
            .to_path_buf();
        props.validate()?;

        let compression = Some(compression.unwrap_or(self.config.default_compression));
        let mut planner = Planner::new(collection, props.file_sizes(), compression);
        planner.objects.push(ObjectSpec::group());
        planner.owners.insert(String::new(), Owner::New(0));
        plan_all(&mut planner, collection.iter())?;
        let bytes = write_file(props, &planner.objects)?;

        report_failure(&path, fs::write(&path, &bytes).map_err(Error::from))?;
        for node in collection.iter_mut() {
            node.apply(Transition::Written)?;
        }
        info!(file = %path.display(), bytes = bytes.len(), "collection written");
        Ok(())
    }

    /// Append every `Created` node to the existing backing file. Nodes
    /// already in the file are left untouched.
    pub fn update(&self, collection: &mut Collection, compression: Option<Compression>) -> Result<()> {
        self.diagnostics
            .scope(|| self.update_scoped(collection, compression))
    }

    #[tracing::instrument(skip_all, fields(nodes = collection.len()))]
    fn update_scoped(&self, collection: &mut Collection, compression: Option<Compression>) -> Result<()> {
        let path = collection
            .filename()
            .ok_or_else(|| Error::NotFound("backing file of collection".into()))?
            .to_path_buf();
        if let Some(changed) = collection.iter().find(|n| n.mark() == Mark::Changed) {
            return Err(Error::Unsupported(format!(
                "{} was modified in place; use write_full",
                changed.path()
            )));
        }
        let created: Vec<usize> = collection
            .iter()
            .enumerate()
            .filter(|(_, n)| n.mark() == Mark::Created)
            .map(|(i, _)| i)
            .collect();
        if created.is_empty() {
            debug!("nothing to append");
            return Ok(());
        }

        let file = fs::read(&path)?;
        let base = find_signature(&file)?;
        let superblock = Superblock::parse(&file, base)?;
        let data = &file[base..];
        let sizes = superblock.sizes();
        let verify = self.config.verify_checksums;
        let istore_k = istore_k(&superblock, data, verify)?;

        let compression = Some(compression.unwrap_or(self.config.default_compression));
        let mut planner = Planner::new(collection, sizes, compression);
        planner.existing = Some((data, superblock.root_group_address, verify));
        planner.owners.insert(
            String::new(),
            Owner::Existing(superblock.root_group_address),
        );
        let nodes = created.iter().filter_map(|&i| collection.get_by_index(i));
        plan_all(&mut planner, nodes)?;

        let start = pad8(superblock.eof_address.max(data.len() as u64) as usize) as u64;
        let placement = ObjectWriter::new(sizes, istore_k, &planner.objects).place(start, 0)?;

        let mut cursor = start + placement.bytes.len() as u64;
        let mut tail = Vec::new();
        let mut patches: Vec<Patch> = Vec::new();
        for (address, (owner, pending)) in planner.appends {
            let header = ObjectHeader::parse_with(data, address, sizes, verify)?;
            let mut messages = Vec::with_capacity(pending.len());
            for item in pending {
                match item {
                    Pending::Link(name, target) => {
                        if let Some(GroupStorage::SymbolTable(_)) = group_storage(&header, sizes)? {
                            return Err(Error::Unsupported(format!(
                                "adding {name} to symbol-table group {owner}"
                            )));
                        }
                        let target = match target {
                            ObjectRef::New(i) => placement.addresses[i],
                            ObjectRef::Existing(a) => a,
                        };
                        messages.push((MessageType::Link, encode_link(&name, target, sizes)?));
                    }
                    Pending::Attribute(spec) => messages.push((
                        MessageType::Attribute,
                        encode_attribute(&spec, &placement.addresses, sizes)?,
                    )),
                }
            }
            let (patch, block) = append_messages(data, &header, sizes, messages, cursor)
                .map_err(|e| match e {
                    FormatError::NoFreeSlot(_) => Error::NoUpdateSlot(owner.clone()),
                    other => Error::Format(other),
                })?;
            cursor += block.len() as u64;
            tail.extend_from_slice(&block);
            patches.push(patch);
        }

        let sb_bytes = superblock.patch_eof(&file[base..], cursor)?;
        report_failure(
            &path,
            apply_update(&path, base as u64, &sb_bytes, &patches, start, &placement.bytes, &tail),
        )?;
        for &i in &created {
            collection.node_at_mut(i).apply(Transition::Written)?;
        }
        info!(file = %path.display(), appended = created.len(), "collection updated");
        Ok(())
    }
}

/// Chunk B-tree K recorded in the superblock or its extension.
fn istore_k(superblock: &Superblock, data: &[u8], verify: bool) -> Result<u16> {
    if let Some(k) = superblock.indexed_storage_internal_node_k {
        return Ok(k);
    }
    let Some(address) = superblock.extension_address else {
        return Ok(DEFAULT_ISTORE_K);
    };
    let extension = ObjectHeader::parse_with(data, address, superblock.sizes(), verify)?;
    match extension.find(MessageType::BTreeKValues) {
        Some(msg) => Ok(BTreeKValues::parse(&msg.data)?.indexed_storage_internal_k),
        None => Ok(DEFAULT_ISTORE_K),
    }
}

fn apply_update(
    path: &Path,
    base: u64,
    superblock: &[u8],
    patches: &[Patch],
    start: u64,
    objects: &[u8],
    tail: &[u8],
) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(base + start))?;
    file.write_all(objects)?;
    file.write_all(tail)?;
    for patch in patches {
        file.seek(SeekFrom::Start(base + patch.offset))?;
        file.write_all(&patch.bytes)?;
    }
    file.seek(SeekFrom::Start(base))?;
    file.write_all(superblock)?;
    file.flush()?;
    Ok(())
}
