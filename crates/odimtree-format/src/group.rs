//! Group membership: symbol-table groups (local heap + B-tree + SNOD nodes)
//! and link-message groups with compact storage.

use byteorder::{ByteOrder, LittleEndian};

use crate::btree::collect_group_nodes;
use crate::codec::{ensure_len, read_cstring, Sizes};
use crate::error::FormatError;
use crate::link::{LinkInfo, LinkMessage, LinkTarget};
use crate::message_type::MessageType;
use crate::object_header::ObjectHeader;

/// Local heap header: the data segment that holds symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHeap {
    pub data_segment_size: u64,
    pub data_segment_address: u64,
}

impl LocalHeap {
    pub fn parse(data: &[u8], address: u64, sizes: Sizes) -> Result<LocalHeap, FormatError> {
        let offset = address as usize;
        let ls = sizes.length as usize;
        ensure_len(data, offset, 8 + 2 * ls + sizes.offset as usize)?;
        if &data[offset..offset + 4] != b"HEAP" {
            return Err(FormatError::InvalidSignature("HEAP"));
        }
        if data[offset + 4] != 0 {
            return Err(FormatError::InvalidStructureVersion {
                kind: "local heap",
                version: data[offset + 4],
            });
        }
        Ok(LocalHeap {
            data_segment_size: sizes.read_length(data, offset + 8)?,
            // the free-list head sits between size and address
            data_segment_address: sizes.read_offset(data, offset + 8 + 2 * ls)?,
        })
    }

    /// Null-terminated string at `offset` within the data segment.
    pub fn string_at(&self, data: &[u8], offset: u64) -> Result<String, FormatError> {
        if offset >= self.data_segment_size {
            return Err(FormatError::UnexpectedEof {
                expected: offset as usize + 1,
                available: self.data_segment_size as usize,
            });
        }
        let (name, _) = read_cstring(data, (self.data_segment_address + offset) as usize)?;
        Ok(name)
    }
}

/// Symbol Table message (0x0011) of an old-style group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub local_heap_address: u64,
}

impl SymbolTableMessage {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<SymbolTableMessage, FormatError> {
        Ok(SymbolTableMessage {
            btree_address: sizes.read_offset(data, 0)?,
            local_heap_address: sizes.read_offset(data, sizes.offset as usize)?,
        })
    }
}

/// A named member of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub target: LinkTarget,
}

impl GroupEntry {
    /// Object header address for hard links.
    pub fn address(&self) -> Option<u64> {
        match self.target {
            LinkTarget::Hard(addr) => Some(addr),
            _ => None,
        }
    }
}

fn snod_entries(
    data: &[u8],
    address: u64,
    heap: &LocalHeap,
    sizes: Sizes,
    out: &mut Vec<GroupEntry>,
) -> Result<(), FormatError> {
    let offset = address as usize;
    ensure_len(data, offset, 8)?;
    if &data[offset..offset + 4] != b"SNOD" {
        return Err(FormatError::InvalidSignature("SNOD"));
    }
    let count = LittleEndian::read_u16(&data[offset + 6..offset + 8]) as usize;
    let os = sizes.offset as usize;
    // name offset, header address, cache type, reserved, scratch pad
    let entry_len = 2 * os + 4 + 4 + 16;
    ensure_len(data, offset + 8, count * entry_len)?;
    for i in 0..count {
        let pos = offset + 8 + i * entry_len;
        let name_offset = sizes.read_offset(data, pos)?;
        let object = sizes.read_offset(data, pos + os)?;
        out.push(GroupEntry {
            name: heap.string_at(data, name_offset)?,
            target: LinkTarget::Hard(object),
        });
    }
    Ok(())
}

/// Members of a symbol-table group.
pub fn symbol_table_entries(
    data: &[u8],
    table: &SymbolTableMessage,
    sizes: Sizes,
) -> Result<Vec<GroupEntry>, FormatError> {
    let heap = LocalHeap::parse(data, table.local_heap_address, sizes)?;
    let mut entries = Vec::new();
    for node in collect_group_nodes(data, table.btree_address, sizes)? {
        snod_entries(data, node, &heap, sizes, &mut entries)?;
    }
    Ok(entries)
}

/// How a group stores its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStorage {
    SymbolTable(SymbolTableMessage),
    /// Link messages directly in the object header.
    Links,
}

/// Storage style of the object at `header`, or `None` if it is not a group.
pub fn group_storage(header: &ObjectHeader, sizes: Sizes) -> Result<Option<GroupStorage>, FormatError> {
    if let Some(msg) = header.find(MessageType::SymbolTable) {
        return Ok(Some(GroupStorage::SymbolTable(SymbolTableMessage::parse(&msg.data, sizes)?)));
    }
    if header.has(MessageType::LinkInfo)
        || header.has(MessageType::Link)
        || header.has(MessageType::GroupInfo)
    {
        return Ok(Some(GroupStorage::Links));
    }
    Ok(None)
}

/// Members of the group whose header is `header`, in storage order.
pub fn group_entries(
    data: &[u8],
    header: &ObjectHeader,
    sizes: Sizes,
) -> Result<Vec<GroupEntry>, FormatError> {
    match group_storage(header, sizes)? {
        Some(GroupStorage::SymbolTable(table)) => symbol_table_entries(data, &table, sizes),
        Some(GroupStorage::Links) => {
            if let Some(msg) = header.find(MessageType::LinkInfo) {
                if LinkInfo::parse(&msg.data, sizes)?.fractal_heap_address.is_some() {
                    return Err(FormatError::Unsupported(format!(
                        "dense link storage in group at {:#x}",
                        header.address
                    )));
                }
            }
            header
                .find_all(MessageType::Link)
                .map(|m| {
                    let link = LinkMessage::parse(&m.data, sizes)?;
                    Ok(GroupEntry {
                        name: link.name,
                        target: link.target,
                    })
                })
                .collect()
        }
        None => Err(FormatError::MissingMessage {
            address: header.address,
            message: "group",
        }),
    }
}

/// Resolve a slash-separated path to an object header address, following
/// hard links from `root`.
pub fn resolve_path(
    data: &[u8],
    root: u64,
    path: &str,
    sizes: Sizes,
    verify: bool,
) -> Result<u64, FormatError> {
    let mut current = root;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let header = ObjectHeader::parse_with(data, current, sizes, verify)?;
        current = group_entries(data, &header, sizes)?
            .into_iter()
            .find(|e| e.name == component)
            .and_then(|e| e.address())
            .ok_or_else(|| FormatError::PathNotFound(path.to_string()))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::group_info_message;
    use crate::object_header_writer::ObjectHeaderWriter;

    /// Heap + SNOD + single-leaf B-tree for the given children.
    fn symbol_table_file(children: &[(&str, u64)]) -> (Vec<u8>, SymbolTableMessage) {
        let mut names = vec![0u8]; // offset 0 is the empty name
        let mut offsets = Vec::new();
        for (name, _) in children {
            offsets.push(names.len() as u64);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let segment_at = 32u64;
        let snod_at = segment_at + names.len() as u64;
        let entry_len = 40;
        let tree_at = snod_at + 8 + (children.len() * entry_len) as u64;

        let mut file = Vec::new();
        file.extend_from_slice(b"HEAP\0\0\0\0");
        file.extend_from_slice(&(names.len() as u64).to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes());
        file.extend_from_slice(&segment_at.to_le_bytes());
        file.extend_from_slice(&names);

        file.extend_from_slice(b"SNOD\x01\0");
        file.extend_from_slice(&(children.len() as u16).to_le_bytes());
        for ((_, addr), off) in children.iter().zip(&offsets) {
            file.extend_from_slice(&off.to_le_bytes());
            file.extend_from_slice(&addr.to_le_bytes());
            file.extend_from_slice(&[0; 24]);
        }

        file.extend_from_slice(b"TREE\0\0");
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&snod_at.to_le_bytes());
        file.extend_from_slice(&(names.len() as u64).to_le_bytes());

        let table = SymbolTableMessage {
            btree_address: tree_at,
            local_heap_address: 0,
        };
        (file, table)
    }

    #[test]
    fn symbol_table_listing() {
        let (file, table) = symbol_table_file(&[("dataset1", 0x800), ("how", 0x900), ("what", 0xA00)]);
        let entries = symbol_table_entries(&file, &table, Sizes::default()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["dataset1", "how", "what"]);
        assert_eq!(entries[1].address(), Some(0x900));
    }

    #[test]
    fn link_group_listing_and_resolution() {
        let sizes = Sizes::default();
        let mut child = ObjectHeaderWriter::new();
        child.add_message(MessageType::LinkInfo, LinkInfo::compact().serialize(sizes).unwrap());
        child.add_message(MessageType::GroupInfo, group_info_message());
        let child_bytes = child.serialize().unwrap();

        let root_with = |child_at: u64| {
            let mut root = ObjectHeaderWriter::new();
            root.add_message(MessageType::LinkInfo, LinkInfo::compact().serialize(sizes).unwrap());
            root.add_message(MessageType::GroupInfo, group_info_message());
            let link = LinkMessage::hard("what", child_at).serialize(sizes).unwrap();
            root.add_message(MessageType::Link, link);
            root
        };
        // the link's address field has a fixed width
        let root_len = root_with(0).encoded_len() as u64;
        let mut file = root_with(root_len).serialize().unwrap();
        file.extend_from_slice(&child_bytes);

        let header = ObjectHeader::parse(&file, 0, sizes).unwrap();
        let entries = group_entries(&file, &header, sizes).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(resolve_path(&file, 0, "/what", sizes, true).unwrap(), root_len);
        assert!(matches!(
            resolve_path(&file, 0, "/where", sizes, true),
            Err(FormatError::PathNotFound(_))
        ));
    }

    #[test]
    fn dense_storage_rejected() {
        let sizes = Sizes::default();
        let info = LinkInfo {
            fractal_heap_address: Some(0x400),
            name_index_address: Some(0x500),
        };
        let mut w = ObjectHeaderWriter::new();
        w.add_message(MessageType::LinkInfo, info.serialize(sizes).unwrap());
        let bytes = w.serialize().unwrap();
        let header = ObjectHeader::parse(&bytes, 0, sizes).unwrap();
        assert!(matches!(
            group_entries(&bytes, &header, sizes),
            Err(FormatError::Unsupported(_))
        ));
    }
}
