//! Global heap collections ("GCOL") and variable-length string values.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, pad8, Sizes};
use crate::error::FormatError;

/// Objects of one global heap collection, keyed by heap index.
#[derive(Debug, Clone, Default)]
pub struct GlobalHeapCollection {
    objects: HashMap<u16, Vec<u8>>,
}

impl GlobalHeapCollection {
    pub fn parse(data: &[u8], address: u64, sizes: Sizes) -> Result<GlobalHeapCollection, FormatError> {
        let start = address as usize;
        let ls = sizes.length as usize;
        ensure_len(data, start, 8 + ls)?;
        if &data[start..start + 4] != b"GCOL" {
            return Err(FormatError::InvalidSignature("GCOL"));
        }
        if data[start + 4] != 1 {
            return Err(FormatError::InvalidStructureVersion {
                kind: "global heap",
                version: data[start + 4],
            });
        }
        let size = sizes.read_length(data, start + 8)? as usize;
        let end = (start + size).min(data.len());

        let mut objects = HashMap::new();
        let mut pos = start + 8 + ls;
        // index(2) refcount(2) reserved(4) size(ls)
        while pos + 8 + ls <= end {
            let index = LittleEndian::read_u16(&data[pos..pos + 2]);
            if index == 0 {
                // free space runs to the end of the collection
                break;
            }
            let len = sizes.read_length(data, pos + 8)? as usize;
            let body = pos + 8 + ls;
            ensure_len(data, body, len)?;
            objects.insert(index, data[body..body + len].to_vec());
            pos = body + pad8(len);
        }
        Ok(GlobalHeapCollection { objects })
    }

    pub fn get(&self, index: u16) -> Option<&[u8]> {
        self.objects.get(&index).map(Vec::as_slice)
    }
}

/// Size of one stored variable-length element: length, collection, index.
pub fn vl_element_size(sizes: Sizes) -> usize {
    4 + sizes.offset as usize + 4
}

/// Resolve every variable-length string element in `raw` through the
/// global heap. Null (zero-length) elements read as empty strings.
pub fn read_vl_strings(
    data: &[u8],
    raw: &[u8],
    count: usize,
    sizes: Sizes,
) -> Result<Vec<Vec<u8>>, FormatError> {
    let width = vl_element_size(sizes);
    ensure_len(raw, 0, count * width)?;
    let mut collections: HashMap<u64, GlobalHeapCollection> = HashMap::new();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let at = i * width;
        let len = LittleEndian::read_u32(&raw[at..at + 4]) as usize;
        let collection = sizes.read_offset(raw, at + 4)?;
        let index = LittleEndian::read_u32(&raw[at + 4 + sizes.offset as usize..at + width]);
        if len == 0 || collection == 0 || sizes.is_undefined(collection) {
            out.push(Vec::new());
            continue;
        }
        if !collections.contains_key(&collection) {
            collections.insert(collection, GlobalHeapCollection::parse(data, collection, sizes)?);
        }
        let bytes = collections
            .get(&collection)
            .and_then(|c| c.get(index as u16))
            .ok_or_else(|| {
                FormatError::Unsupported(format!(
                    "global heap object {index} missing from collection at {collection:#x}"
                ))
            })?;
        let mut value = bytes[..len.min(bytes.len())].to_vec();
        if let Some(nul) = value.iter().position(|&b| b == 0) {
            value.truncate(nul);
        }
        out.push(value);
    }
    Ok(out)
}
