//! Version 1 B-trees: type 0 (group symbol nodes) and type 1 (raw data
//! chunks). Reading walks any depth; writing builds the chunk index.

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, Sizes};
use crate::error::FormatError;

const TREE_SIGNATURE: [u8; 4] = *b"TREE";

/// Node type of group B-trees.
pub const GROUP_NODE: u8 = 0;
/// Node type of chunk index B-trees.
pub const CHUNK_NODE: u8 = 1;

/// A parsed B-tree v1 node with keys kept as raw bytes.
#[derive(Debug, Clone)]
pub struct BTreeV1Node {
    pub node_type: u8,
    /// 0 for leaves.
    pub level: u8,
    /// `children.len() + 1` raw keys.
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<u64>,
}

impl BTreeV1Node {
    pub fn parse(
        data: &[u8],
        address: u64,
        sizes: Sizes,
        key_size: usize,
    ) -> Result<BTreeV1Node, FormatError> {
        let os = sizes.offset as usize;
        let offset = address as usize;
        ensure_len(data, offset, 8 + 2 * os)?;
        if data[offset..offset + 4] != TREE_SIGNATURE {
            return Err(FormatError::InvalidSignature("TREE"));
        }
        let node_type = data[offset + 4];
        let level = data[offset + 5];
        let used = LittleEndian::read_u16(&data[offset + 6..offset + 8]) as usize;

        let mut pos = offset + 8 + 2 * os;
        ensure_len(data, pos, used * (key_size + os) + key_size)?;
        let mut keys = Vec::with_capacity(used + 1);
        let mut children = Vec::with_capacity(used);
        for _ in 0..used {
            keys.push(data[pos..pos + key_size].to_vec());
            pos += key_size;
            children.push(sizes.read_offset(data, pos)?);
            pos += os;
        }
        keys.push(data[pos..pos + key_size].to_vec());

        Ok(BTreeV1Node {
            node_type,
            level,
            keys,
            children,
        })
    }
}

/// Walk a B-tree from `root` and return `(key, child)` for every leaf entry
/// in key order.
fn collect_leaves(
    data: &[u8],
    root: u64,
    sizes: Sizes,
    node_type: u8,
    key_size: usize,
) -> Result<Vec<(Vec<u8>, u64)>, FormatError> {
    let mut out = Vec::new();
    let mut stack = vec![(root, u8::MAX)];
    let mut visited = 0usize;
    while let Some((addr, parent_level)) = stack.pop() {
        visited += 1;
        if visited > data.len() {
            return Err(FormatError::Unsupported("cyclic B-tree".into()));
        }
        let node = BTreeV1Node::parse(data, addr, sizes, key_size)?;
        if node.node_type != node_type {
            return Err(FormatError::InvalidBTreeNodeType(node.node_type));
        }
        if node.level >= parent_level {
            return Err(FormatError::Unsupported(format!(
                "B-tree node at {addr:#x} does not descend"
            )));
        }
        if node.level == 0 {
            out.extend(node.keys.into_iter().zip(node.children));
        } else {
            // reversed so the leftmost child is visited first
            for &child in node.children.iter().rev() {
                stack.push((child, node.level));
            }
        }
    }
    Ok(out)
}

/// Addresses of all symbol table nodes ("SNOD") below a group B-tree.
pub fn collect_group_nodes(data: &[u8], root: u64, sizes: Sizes) -> Result<Vec<u64>, FormatError> {
    Ok(collect_leaves(data, root, sizes, GROUP_NODE, sizes.length as usize)?
        .into_iter()
        .map(|(_, child)| child)
        .collect())
}

/// One stored chunk of a chunked dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Stored (possibly filtered) size in bytes.
    pub size: u32,
    /// Bit `i` set means filter `i` was skipped for this chunk.
    pub filter_mask: u32,
    /// Element offsets of the chunk's first element, one per dimension.
    pub offsets: Vec<u64>,
    pub address: u64,
}

/// Key width of a chunk B-tree: size(4) + mask(4) + one u64 per layout dim.
fn chunk_key_size(layout_dims: usize) -> usize {
    8 + 8 * layout_dims
}

/// Every chunk indexed by the type 1 B-tree at `root`.
///
/// `layout_dims` is the layout message's dimensionality (rank + 1).
pub fn collect_chunks(
    data: &[u8],
    root: u64,
    sizes: Sizes,
    layout_dims: usize,
) -> Result<Vec<ChunkRecord>, FormatError> {
    let leaves = collect_leaves(data, root, sizes, CHUNK_NODE, chunk_key_size(layout_dims))?;
    Ok(leaves
        .into_iter()
        .map(|(key, address)| ChunkRecord {
            size: LittleEndian::read_u32(&key[0..4]),
            filter_mask: LittleEndian::read_u32(&key[4..8]),
            offsets: (0..layout_dims)
                .map(|d| LittleEndian::read_u64(&key[8 + 8 * d..16 + 8 * d]))
                .collect(),
            address,
        })
        .collect())
}

/// Serializes a chunk index for chunks already placed in the file.
pub struct ChunkIndexWriter {
    sizes: Sizes,
    /// Entries per node; HDF5 allows up to 2K.
    capacity: usize,
    layout_dims: usize,
}

impl ChunkIndexWriter {
    pub fn new(sizes: Sizes, istore_k: u16, layout_dims: usize) -> ChunkIndexWriter {
        ChunkIndexWriter {
            sizes,
            capacity: 2 * istore_k.max(1) as usize,
            layout_dims,
        }
    }

    fn node_len(&self) -> usize {
        let os = self.sizes.offset as usize;
        let key = chunk_key_size(self.layout_dims);
        8 + 2 * os + self.capacity * (key + os) + key
    }

    /// Encoded size of the whole tree for `count` chunks.
    pub fn encoded_len(&self, count: usize) -> usize {
        let mut nodes = 0;
        let mut level_count = count.max(1);
        loop {
            let here = level_count.div_ceil(self.capacity);
            nodes += here;
            if here == 1 {
                break;
            }
            level_count = here;
        }
        nodes * self.node_len()
    }

    fn encode_key(&self, buf: &mut Vec<u8>, size: u32, mask: u32, offsets: &[u64]) {
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&mask.to_le_bytes());
        for d in 0..self.layout_dims {
            buf.extend_from_slice(&offsets.get(d).copied().unwrap_or(0).to_le_bytes());
        }
    }

    fn encode_node(
        &self,
        level: u8,
        entries: &[(u32, u32, Vec<u64>, u64)],
        final_key: &[u64],
    ) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(self.node_len());
        buf.extend_from_slice(&TREE_SIGNATURE);
        buf.push(CHUNK_NODE);
        buf.push(level);
        buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        self.sizes.write_undefined(&mut buf);
        self.sizes.write_undefined(&mut buf);
        for (size, mask, offsets, child) in entries {
            self.encode_key(&mut buf, *size, *mask, offsets);
            self.sizes.write_offset(&mut buf, *child)?;
        }
        self.encode_key(&mut buf, 0, 0, final_key);
        // nodes are allocated at full capacity
        buf.resize(self.node_len(), 0);
        Ok(buf)
    }

    /// Build the tree at `address`; chunks must be sorted by offsets.
    ///
    /// `bound` is the dataset extent (padded with the element-size slot),
    /// used as the right-most key.
    pub fn serialize(
        &self,
        address: u64,
        chunks: &[ChunkRecord],
        bound: &[u64],
    ) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::with_capacity(self.encoded_len(chunks.len()));
        let node_len = self.node_len() as u64;

        // Bottom-up: each level is a list of (size, mask, first offsets, address).
        let mut level: Vec<(u32, u32, Vec<u64>, u64)> = chunks
            .iter()
            .map(|c| (c.size, c.filter_mask, c.offsets.clone(), c.address))
            .collect();
        let mut depth = 0u8;
        let mut nodes: Vec<Vec<u8>> = Vec::new();
        // Addresses are assigned after the fact, so record the nodes per level
        // and lay out the root first.
        let mut levels: Vec<Vec<Vec<(u32, u32, Vec<u64>, u64)>>> = Vec::new();
        loop {
            let groups: Vec<_> = if level.is_empty() {
                vec![Vec::new()]
            } else {
                level.chunks(self.capacity).map(|g| g.to_vec()).collect()
            };
            let single = groups.len() == 1;
            levels.push(groups);
            if single {
                break;
            }
            // Parent entries point at the nodes of this level; placeholders
            // until addresses are known.
            level = levels[depth as usize]
                .iter()
                .map(|g| (0, 0, g[0].2.clone(), 0))
                .collect();
            depth += 1;
        }

        // Root is written first, then each lower level left to right.
        let mut next = address;
        let mut addresses: Vec<Vec<u64>> = vec![Vec::new(); levels.len()];
        for lvl in (0..levels.len()).rev() {
            for _ in &levels[lvl] {
                addresses[lvl].push(next);
                next += node_len;
            }
        }
        for lvl in (0..levels.len()).rev() {
            for (i, group) in levels[lvl].iter().enumerate() {
                let entries: Vec<_> = if lvl == 0 {
                    group.clone()
                } else {
                    let child_base: usize = i * self.capacity;
                    group
                        .iter()
                        .enumerate()
                        .map(|(j, e)| (e.0, e.1, e.2.clone(), addresses[lvl - 1][child_base + j]))
                        .collect()
                };
                let final_key = match levels[lvl].get(i + 1) {
                    Some(next_group) => next_group[0].2.clone(),
                    None => bound.to_vec(),
                };
                nodes.push(self.encode_node(lvl as u8, &entries, &final_key)?);
            }
        }
        for node in nodes {
            out.extend_from_slice(&node);
        }
        Ok(out)
    }
}
