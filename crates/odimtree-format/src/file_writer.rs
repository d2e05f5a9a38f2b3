//! Object-graph writer: lays out groups, datasets and committed datatypes,
//! assigns addresses in two passes and encodes every header and data block.
//!
//! The same placement routine serves a fresh file (objects start right
//! after the superblock) and an append (objects start at the current EOF
//! and may link to objects that already exist).

use crate::attribute::{AttributeMessage, AttributeType};
use crate::btree::{ChunkIndexWriter, ChunkRecord};
use crate::codec::Sizes;
use crate::data_layout::DataLayout;
use crate::data_read::for_each_chunk_row;
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::FormatError;
use crate::filter_pipeline::FilterPipeline;
use crate::filters::compress_chunk;
use crate::link::{group_info_message, LinkInfo, LinkMessage};
use crate::message_type::MessageType;
use crate::object_header::{ObjectHeader, MSG_FLAG_SHARED};
use crate::object_header_writer::ObjectHeaderWriter;
use crate::property_list::FileCreateProps;
use crate::shared_message::SharedRef;
use crate::superblock::{BTreeKValues, Superblock};

/// Header message flag: the message is constant.
const MSG_FLAG_CONSTANT: u8 = 0x01;

/// Fill value message v3: late allocation, fill written only if set.
const FILL_VALUE_MESSAGE: [u8; 2] = [3, 0x0a];

/// An object to be written, or one already present in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRef {
    /// Index into the writer's object list.
    New(usize),
    /// Object header address of an existing object.
    Existing(u64),
}

/// Datatype of a dataset or attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Inline(Datatype),
    /// Shared with a committed datatype object.
    Committed(ObjectRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Encoded element bytes in file order.
    Raw(Vec<u8>),
    /// A single object reference.
    Reference(ObjectRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub name: String,
    pub datatype: TypeSpec,
    pub dataspace: Dataspace,
    pub value: AttrValue,
}

/// How a dataset's raw data is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    Contiguous,
    Chunked {
        chunk_dims: Vec<u64>,
        pipeline: FilterPipeline,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Group {
        links: Vec<(String, ObjectRef)>,
    },
    Dataset {
        datatype: TypeSpec,
        dims: Vec<u64>,
        element_size: usize,
        raw: Vec<u8>,
        storage: Storage,
    },
    NamedType {
        datatype: Datatype,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSpec {
    pub kind: ObjectKind,
    pub attributes: Vec<AttributeSpec>,
}

impl ObjectSpec {
    pub fn group() -> ObjectSpec {
        ObjectSpec {
            kind: ObjectKind::Group { links: Vec::new() },
            attributes: Vec::new(),
        }
    }
}

/// Bytes of a placed region and the header address of every object in it.
#[derive(Debug, Clone)]
pub struct Placement {
    pub addresses: Vec<u64>,
    pub bytes: Vec<u8>,
}

/// Raw data of one dataset, ready to be laid out.
enum DataBlob {
    None,
    Contiguous(Vec<u8>),
    Chunked {
        /// `(offsets, stored bytes)` in row-major chunk order.
        chunks: Vec<(Vec<u64>, Vec<u8>)>,
        layout_dims: Vec<u32>,
        bound: Vec<u64>,
    },
}

/// Where a dataset's data landed.
#[derive(Clone, Default)]
struct DataLocation {
    address: Option<u64>,
    size: u64,
    chunks: Vec<ChunkRecord>,
}

fn resolve(addresses: &[u64], r: ObjectRef) -> Result<u64, FormatError> {
    match r {
        ObjectRef::Existing(addr) => Ok(addr),
        ObjectRef::New(i) => addresses
            .get(i)
            .copied()
            .ok_or_else(|| FormatError::Unsupported(format!("link to unknown object #{i}"))),
    }
}

/// Encode one attribute message.
pub fn encode_attribute(
    attr: &AttributeSpec,
    addresses: &[u64],
    sizes: Sizes,
) -> Result<Vec<u8>, FormatError> {
    let datatype = match &attr.datatype {
        TypeSpec::Inline(dt) => AttributeType::Inline(dt.clone()),
        TypeSpec::Committed(r) => AttributeType::Committed(resolve(addresses, *r)?),
    };
    let raw_data = match &attr.value {
        AttrValue::Raw(bytes) => bytes.clone(),
        AttrValue::Reference(r) => {
            let mut buf = Vec::with_capacity(sizes.offset as usize);
            sizes.write_offset(&mut buf, resolve(addresses, *r)?)?;
            buf
        }
    };
    AttributeMessage {
        name: attr.name.clone(),
        datatype,
        dataspace: attr.dataspace.clone(),
        raw_data,
    }
    .serialize(sizes)
}

/// Encode a hard link message.
pub fn encode_link(name: &str, address: u64, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
    LinkMessage::hard(name, address).serialize(sizes)
}

/// Split `raw` into full-size chunks (edge chunks zero padded) in row-major
/// chunk order.
pub fn split_into_chunks(
    raw: &[u8],
    dims: &[u64],
    chunk_dims: &[u64],
    element_size: usize,
) -> Vec<(Vec<u64>, Vec<u8>)> {
    if dims.iter().any(|&d| d == 0) {
        return Vec::new();
    }
    let counts: Vec<u64> = dims
        .iter()
        .zip(chunk_dims)
        .map(|(&d, &c)| d.div_ceil(c))
        .collect();
    let chunk_bytes = chunk_dims.iter().product::<u64>() as usize * element_size;
    let mut out = Vec::new();
    let mut idx = vec![0u64; dims.len()];
    loop {
        let offsets: Vec<u64> = idx.iter().zip(chunk_dims).map(|(&i, &c)| i * c).collect();
        let mut chunk = vec![0u8; chunk_bytes];
        for_each_chunk_row(&offsets, chunk_dims, dims, |src, dst, len| {
            let (s, t, n) = (src * element_size, dst * element_size, len * element_size);
            chunk[s..s + n].copy_from_slice(&raw[t..t + n]);
        });
        out.push((offsets, chunk));

        let mut d = dims.len();
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < counts[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

/// Lays out a list of objects at a given file address.
pub struct ObjectWriter<'a> {
    sizes: Sizes,
    istore_k: u16,
    objects: &'a [ObjectSpec],
}

impl<'a> ObjectWriter<'a> {
    pub fn new(sizes: Sizes, istore_k: u16, objects: &'a [ObjectSpec]) -> ObjectWriter<'a> {
        ObjectWriter {
            sizes,
            istore_k,
            objects,
        }
    }

    fn prepare_data(&self) -> Result<Vec<DataBlob>, FormatError> {
        self.objects
            .iter()
            .map(|obj| match &obj.kind {
                ObjectKind::Dataset {
                    dims,
                    element_size,
                    raw,
                    storage,
                    ..
                } => {
                    let expected = dims.iter().product::<u64>() as usize * element_size;
                    if raw.len() != expected {
                        return Err(FormatError::Unsupported(format!(
                            "dataset buffer of {} bytes for extent {dims:?}",
                            raw.len()
                        )));
                    }
                    match storage {
                        Storage::Chunked { chunk_dims, pipeline } if !dims.is_empty() => {
                            if chunk_dims.len() != dims.len() || chunk_dims.contains(&0) {
                                return Err(FormatError::Unsupported(format!(
                                    "chunk shape {chunk_dims:?} for extent {dims:?}"
                                )));
                            }
                            let mut chunks = Vec::new();
                            for (offsets, plain) in
                                split_into_chunks(raw, dims, chunk_dims, *element_size)
                            {
                                let stored = if pipeline.is_empty() {
                                    plain
                                } else {
                                    compress_chunk(&plain, pipeline, *element_size)?
                                };
                                chunks.push((offsets, stored));
                            }
                            let mut layout_dims = Vec::with_capacity(dims.len() + 1);
                            for &c in chunk_dims {
                                layout_dims.push(u32::try_from(c).map_err(|_| {
                                    FormatError::Unsupported(format!("chunk extent {c}"))
                                })?);
                            }
                            layout_dims.push(*element_size as u32);
                            let mut bound = dims.clone();
                            bound.push(0);
                            Ok(DataBlob::Chunked {
                                chunks,
                                layout_dims,
                                bound,
                            })
                        }
                        _ if raw.is_empty() => Ok(DataBlob::None),
                        _ => Ok(DataBlob::Contiguous(raw.clone())),
                    }
                }
                _ => Ok(DataBlob::None),
            })
            .collect()
    }

    fn encode_header(
        &self,
        obj: &ObjectSpec,
        addresses: &[u64],
        blob: &DataBlob,
        location: &DataLocation,
    ) -> Result<Vec<u8>, FormatError> {
        let sizes = self.sizes;
        let mut w = ObjectHeaderWriter::new();
        match &obj.kind {
            ObjectKind::Group { links } => {
                w.add_message(MessageType::LinkInfo, LinkInfo::compact().serialize(sizes)?);
                w.add_message(MessageType::GroupInfo, group_info_message());
                for (name, target) in links {
                    w.add_message(
                        MessageType::Link,
                        encode_link(name, resolve(addresses, *target)?, sizes)?,
                    );
                }
            }
            ObjectKind::Dataset {
                datatype,
                dims,
                storage,
                ..
            } => {
                match datatype {
                    TypeSpec::Inline(dt) => w.add_message_with_flags(
                        MessageType::Datatype,
                        dt.serialize()?,
                        MSG_FLAG_CONSTANT,
                    ),
                    TypeSpec::Committed(r) => w.add_message_with_flags(
                        MessageType::Datatype,
                        SharedRef::serialize_committed(resolve(addresses, *r)?, sizes)?,
                        MSG_FLAG_CONSTANT | MSG_FLAG_SHARED,
                    ),
                }
                w.add_message(MessageType::Dataspace, Dataspace::simple(dims).serialize(sizes)?);
                w.add_message(MessageType::FillValue, FILL_VALUE_MESSAGE.to_vec());
                let layout = match blob {
                    DataBlob::Chunked { layout_dims, .. } => {
                        if let Storage::Chunked { pipeline, .. } = storage {
                            if !pipeline.is_empty() {
                                w.add_message(MessageType::FilterPipeline, pipeline.serialize());
                            }
                        }
                        DataLayout::Chunked {
                            btree_address: location.address,
                            dimensions: layout_dims.clone(),
                        }
                    }
                    _ => DataLayout::Contiguous {
                        address: location.address,
                        size: location.size,
                    },
                };
                w.add_message(MessageType::DataLayout, layout.serialize(sizes)?);
            }
            ObjectKind::NamedType { datatype } => {
                w.add_message_with_flags(
                    MessageType::Datatype,
                    datatype.serialize()?,
                    MSG_FLAG_CONSTANT,
                );
            }
        }
        for attr in &obj.attributes {
            w.add_message(MessageType::Attribute, encode_attribute(attr, addresses, sizes)?);
        }
        w.reserve_slot(sizes);
        w.serialize()
    }

    /// Place every object starting at relative address `start`. Headers come
    /// first, padded to a multiple of `meta_block` (if non-zero), then data.
    pub fn place(&self, start: u64, meta_block: u64) -> Result<Placement, FormatError> {
        let blobs = self.prepare_data()?;
        let index_writer = |blob: &DataBlob| match blob {
            DataBlob::Chunked { layout_dims, .. } => Some(ChunkIndexWriter::new(
                self.sizes,
                self.istore_k,
                layout_dims.len(),
            )),
            _ => None,
        };

        // Pass 1: header sizes with placeholder addresses.
        let placeholder = vec![0u64; self.objects.len()];
        let dummy = DataLocation {
            address: Some(0),
            ..DataLocation::default()
        };
        let mut header_lens = Vec::with_capacity(self.objects.len());
        for (obj, blob) in self.objects.iter().zip(&blobs) {
            header_lens.push(self.encode_header(obj, &placeholder, blob, &dummy)?.len() as u64);
        }

        let mut cursor = start;
        let mut addresses = Vec::with_capacity(self.objects.len());
        for len in &header_lens {
            addresses.push(cursor);
            cursor += len;
        }
        let metadata_end = if meta_block > 0 {
            cursor.div_ceil(meta_block) * meta_block
        } else {
            cursor
        };
        cursor = metadata_end;

        // Data blocks follow the metadata in object order.
        let mut locations = Vec::with_capacity(blobs.len());
        for blob in &blobs {
            let location = match blob {
                DataBlob::None => DataLocation::default(),
                DataBlob::Contiguous(bytes) => {
                    let loc = DataLocation {
                        address: Some(cursor),
                        size: bytes.len() as u64,
                        chunks: Vec::new(),
                    };
                    cursor += bytes.len() as u64;
                    loc
                }
                DataBlob::Chunked { chunks, .. } if chunks.is_empty() => DataLocation::default(),
                DataBlob::Chunked { chunks, .. } => {
                    let index_at = cursor;
                    let index_len = index_writer(blob)
                        .map(|w| w.encoded_len(chunks.len()) as u64)
                        .unwrap_or(0);
                    cursor += index_len;
                    let mut records = Vec::with_capacity(chunks.len());
                    for (offsets, bytes) in chunks {
                        let size = u32::try_from(bytes.len()).map_err(|_| {
                            FormatError::Unsupported(format!("chunk of {} bytes", bytes.len()))
                        })?;
                        let mut key = offsets.clone();
                        key.push(0);
                        records.push(ChunkRecord {
                            size,
                            filter_mask: 0,
                            offsets: key,
                            address: cursor,
                        });
                        cursor += bytes.len() as u64;
                    }
                    DataLocation {
                        address: Some(index_at),
                        size: 0,
                        chunks: records,
                    }
                }
            };
            locations.push(location);
        }

        // Pass 2: real addresses.
        let mut bytes = Vec::with_capacity((cursor - start) as usize);
        for (i, obj) in self.objects.iter().enumerate() {
            let header = self.encode_header(obj, &addresses, &blobs[i], &locations[i])?;
            if header.len() as u64 != header_lens[i] {
                return Err(FormatError::Unsupported(format!(
                    "object #{i} header changed size between layout passes"
                )));
            }
            bytes.extend_from_slice(&header);
        }
        bytes.resize((metadata_end - start) as usize, 0);
        for (blob, location) in blobs.iter().zip(&locations) {
            match blob {
                DataBlob::None => {}
                DataBlob::Contiguous(data) => bytes.extend_from_slice(data),
                DataBlob::Chunked { chunks, bound, .. } => {
                    let Some(index_at) = location.address else {
                        continue;
                    };
                    if let Some(w) = index_writer(blob) {
                        bytes.extend_from_slice(&w.serialize(index_at, &location.chunks, bound)?);
                    }
                    for (_, data) in chunks {
                        bytes.extend_from_slice(data);
                    }
                }
            }
        }
        debug_assert_eq!(bytes.len() as u64, cursor - start);
        Ok(Placement { addresses, bytes })
    }
}

/// Write a complete file. `objects[0]` is the root group.
pub fn write_file(props: &FileCreateProps, objects: &[ObjectSpec]) -> Result<Vec<u8>, FormatError> {
    props.validate()?;
    if !matches!(objects.first().map(|o| &o.kind), Some(ObjectKind::Group { .. })) {
        return Err(FormatError::Unsupported("first object must be the root group".into()));
    }
    let sizes = props.file_sizes();
    let mut superblock = Superblock {
        version: 2,
        offset_size: sizes.offset,
        length_size: sizes.length,
        base_address: props.userblock,
        eof_address: 0,
        root_group_address: 0,
        group_leaf_node_k: None,
        group_internal_node_k: None,
        indexed_storage_internal_node_k: None,
        consistency_flags: 0,
        extension_address: None,
    };
    let sb_len = superblock.encoded_len() as u64;

    let extension = if props.k_values() != BTreeKValues::default() {
        let mut w = ObjectHeaderWriter::new();
        w.add_message(MessageType::BTreeKValues, props.k_values().serialize());
        Some(w.serialize()?)
    } else {
        None
    };
    let start = sb_len + extension.as_ref().map_or(0, |e| e.len() as u64);
    superblock.extension_address = extension.as_ref().map(|_| sb_len);

    let placement = ObjectWriter::new(sizes, props.indexed_storage_internal_node_k, objects)
        .place(start, props.meta_block_size)?;
    superblock.root_group_address = placement.addresses[0];
    superblock.eof_address = start + placement.bytes.len() as u64;

    let mut file = vec![0u8; props.userblock as usize];
    file.extend_from_slice(&superblock.serialize_v2()?);
    if let Some(ext) = extension {
        file.extend_from_slice(&ext);
    }
    file.extend_from_slice(&placement.bytes);
    Ok(file)
}

/// A byte range to overwrite in an existing file, relative to the base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Attach `messages` to the existing object `header` by turning one of its
/// free slots into a continuation to a new block placed at `at`.
///
/// Returns the patch for the header chunk and the new block, which carries
/// its own free slot for later appends.
pub fn append_messages(
    data: &[u8],
    header: &ObjectHeader,
    sizes: Sizes,
    messages: Vec<(MessageType, Vec<u8>)>,
    at: u64,
) -> Result<(Patch, Vec<u8>), FormatError> {
    let mut w = ObjectHeaderWriter::new();
    for (msg_type, body) in messages {
        w.add_message(msg_type, body);
    }
    w.reserve_slot(sizes);
    let block = if header.version == 1 {
        w.serialize_v1_continuation()?
    } else {
        w.serialize_continuation()?
    };
    let (offset, bytes) = header.chain_continuation(data, sizes, at, block.len() as u64)?;
    Ok((
        Patch {
            offset: offset as u64,
            bytes,
        },
        block,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_read::read_raw_data;
    use crate::datatype::Datatype;
    use crate::filter_pipeline::FilterDescription;
    use crate::group::{group_entries, resolve_path};

    fn f32_dataset(dims: &[u64], storage: Storage) -> ObjectSpec {
        let n: u64 = dims.iter().product();
        let raw: Vec<u8> = (0..n).flat_map(|v| (v as f32).to_le_bytes()).collect();
        ObjectSpec {
            kind: ObjectKind::Dataset {
                datatype: TypeSpec::Inline(Datatype::native_float(4)),
                dims: dims.to_vec(),
                element_size: 4,
                raw,
                storage,
            },
            attributes: Vec::new(),
        }
    }

    fn read_back(file: &[u8], path: &str) -> Vec<u8> {
        let sb = Superblock::parse(file, 0).unwrap();
        let sizes = sb.sizes();
        let addr = resolve_path(file, sb.root_group_address, path, sizes, true).unwrap();
        let header = ObjectHeader::parse(file, addr, sizes).unwrap();
        let dims = Dataspace::parse(&header.find(MessageType::Dataspace).unwrap().data, sizes)
            .unwrap()
            .dimensions;
        let layout = DataLayout::parse(&header.find(MessageType::DataLayout).unwrap().data, sizes)
            .unwrap();
        let pipeline = header
            .find(MessageType::FilterPipeline)
            .map(|m| FilterPipeline::parse(&m.data).unwrap());
        read_raw_data(file, &layout, &dims, 4, pipeline.as_ref(), sizes).unwrap()
    }

    #[test]
    fn split_pads_edge_chunks() {
        let raw: Vec<u8> = (0..6).collect();
        let chunks = split_into_chunks(&raw, &[2, 3], &[2, 2], 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (vec![0, 0], vec![0, 1, 3, 4]));
        assert_eq!(chunks[1], (vec![0, 2], vec![2, 0, 5, 0]));
    }

    #[test]
    fn contiguous_and_chunked_files_read_back() {
        let mut root = ObjectSpec::group();
        root.kind = ObjectKind::Group {
            links: vec![
                ("plain".into(), ObjectRef::New(1)),
                ("packed".into(), ObjectRef::New(2)),
            ],
        };
        let plain = f32_dataset(&[6, 7], Storage::Contiguous);
        let packed = f32_dataset(
            &[6, 7],
            Storage::Chunked {
                chunk_dims: vec![4, 4],
                pipeline: FilterPipeline {
                    filters: vec![FilterDescription::shuffle(4), FilterDescription::deflate(6)],
                },
            },
        );
        let objects = vec![root, plain, packed];
        let file = write_file(&FileCreateProps::new().istore_k(1), &objects).unwrap();
        assert_eq!(read_back(&file, "/plain"), read_back(&file, "/packed"));
        let ObjectKind::Dataset { raw, .. } = &objects[1].kind else {
            unreachable!()
        };
        assert_eq!(&read_back(&file, "/plain"), raw);
    }

    #[test]
    fn userblock_and_small_sizes() {
        let props = FileCreateProps::new().userblock(512).sizes(4, 4).meta_block_size(0);
        let file = write_file(&props, &[ObjectSpec::group()]).unwrap();
        assert_eq!(crate::signature::find_signature(&file).unwrap(), 512);
        let sb = Superblock::parse(&file, 512).unwrap();
        assert_eq!(sb.base_address, 512);
        assert_eq!(sb.eof_address as usize, file.len() - 512);
        let rel = &file[512..];
        let header = ObjectHeader::parse(rel, sb.root_group_address, sb.sizes()).unwrap();
        assert!(group_entries(rel, &header, sb.sizes()).unwrap().is_empty());
    }

    #[test]
    fn non_default_k_writes_extension() {
        let props = FileCreateProps::new().sym_k(8, 32);
        let file = write_file(&props, &[ObjectSpec::group()]).unwrap();
        let sb = Superblock::parse(&file, 0).unwrap();
        let ext = ObjectHeader::parse(&file, sb.extension_address.unwrap(), sb.sizes()).unwrap();
        let k = BTreeKValues::parse(&ext.find(MessageType::BTreeKValues).unwrap().data).unwrap();
        assert_eq!(k.group_leaf_k, 8);
        assert_eq!(k.group_internal_k, 32);
    }

    #[test]
    fn metadata_is_padded_to_meta_block() {
        let mut root = ObjectSpec::group();
        root.kind = ObjectKind::Group {
            links: vec![("d".into(), ObjectRef::New(1))],
        };
        let objects = vec![root, f32_dataset(&[2], Storage::Contiguous)];
        let file = write_file(&FileCreateProps::new().meta_block_size(1024), &objects).unwrap();
        // data starts at the first 1 KiB boundary
        assert_eq!(file.len(), 1024 + 8);
    }

    #[test]
    fn append_links_through_continuation() {
        let sizes = Sizes::default();
        let props = FileCreateProps::new().meta_block_size(0);
        let mut file = write_file(&props, &[ObjectSpec::group()]).unwrap();
        let sb = Superblock::parse(&file, 0).unwrap();

        let new_objects = vec![ObjectSpec::group()];
        let eof = sb.eof_address;
        let placed = ObjectWriter::new(sizes, 32, &new_objects).place(eof, 0).unwrap();
        let root = ObjectHeader::parse(&file, sb.root_group_address, sizes).unwrap();
        let block_at = eof + placed.bytes.len() as u64;
        let link = encode_link("what", placed.addresses[0], sizes).unwrap();
        let (patch, block) =
            append_messages(&file, &root, sizes, vec![(MessageType::Link, link)], block_at).unwrap();

        let at = patch.offset as usize;
        file[at..at + patch.bytes.len()].copy_from_slice(&patch.bytes);
        file.extend_from_slice(&placed.bytes);
        file.extend_from_slice(&block);
        let new_eof = file.len() as u64;
        let patched = sb.patch_eof(&file, new_eof).unwrap();
        file[..patched.len()].copy_from_slice(&patched);

        let sb = Superblock::parse(&file, 0).unwrap();
        assert_eq!(sb.eof_address, new_eof);
        assert_eq!(
            resolve_path(&file, sb.root_group_address, "/what", sizes, true).unwrap(),
            eof
        );
    }
}
