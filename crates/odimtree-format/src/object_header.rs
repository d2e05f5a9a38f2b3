//! HDF5 object header parsing (v1 and v2), tracking where every message and
//! chunk lives so that free NIL slots can later be patched in place.

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::jenkins_lookup3;
use crate::codec::{ensure_len, read_uint, Sizes};
use crate::error::FormatError;
use crate::message_type::MessageType;

/// OHDR signature for v2 object headers.
pub(crate) const OHDR_SIGNATURE: [u8; 4] = *b"OHDR";

/// OCHK signature for v2 continuation chunks.
pub(crate) const OCHK_SIGNATURE: [u8; 4] = *b"OCHK";

/// Header message flag: message data is a shared-message reference.
pub const MSG_FLAG_SHARED: u8 = 0x02;

/// Header message flag: fail to open the object if the type is unknown.
const MSG_FLAG_FAIL_IF_UNKNOWN: u8 = 0x80;

/// Where a message sits inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLocation {
    /// Index into [`ObjectHeader::chunks`].
    pub chunk: usize,
    /// Position of the message header (type/size/flags prefix).
    pub header_offset: usize,
    /// Position of the message body.
    pub data_offset: usize,
}

/// A contiguous run of header messages: chunk 0 or a continuation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderChunk {
    /// First byte of the chunk (the OHDR/OCHK signature for v2).
    pub start: usize,
    /// One past the last byte, including any trailing checksum.
    pub end: usize,
    /// Whether the last four bytes are a lookup3 checksum of the rest.
    pub checksummed: bool,
}

/// A single parsed header message.
#[derive(Debug, Clone)]
pub struct HeaderMessage {
    pub msg_type: MessageType,
    pub flags: u8,
    /// Creation order (v2 only, when tracking is enabled).
    pub creation_order: Option<u16>,
    pub data: Vec<u8>,
    pub location: MessageLocation,
}

impl HeaderMessage {
    pub fn is_shared(&self) -> bool {
        self.flags & MSG_FLAG_SHARED != 0
    }
}

/// Parsed HDF5 object header.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    /// Address the header was parsed from.
    pub address: u64,
    /// Header version (1 or 2).
    pub version: u8,
    /// Object header flags (v2 only; 0 for v1).
    pub flags: u8,
    /// All non-NIL messages in on-disk order across every chunk.
    pub messages: Vec<HeaderMessage>,
    /// NIL messages, i.e. free space that can be reused.
    pub free_slots: Vec<HeaderMessage>,
    pub chunks: Vec<HeaderChunk>,
}

impl ObjectHeader {
    /// Parse an object header at `address`, verifying v2 checksums.
    pub fn parse(data: &[u8], address: u64, sizes: Sizes) -> Result<ObjectHeader, FormatError> {
        Self::parse_with(data, address, sizes, true)
    }

    /// Parse an object header, optionally skipping checksum verification.
    pub fn parse_with(
        data: &[u8],
        address: u64,
        sizes: Sizes,
        verify: bool,
    ) -> Result<ObjectHeader, FormatError> {
        let offset = address as usize;
        ensure_len(data, offset, 4)?;
        let mut header = if data[offset..offset + 4] == OHDR_SIGNATURE {
            Self::parse_v2_prefix(data, offset, verify)?
        } else {
            Self::parse_v1_prefix(data, offset)?
        };
        header.address = address;

        // Walk chunk 0, then every continuation block it (transitively) points to.
        let mut next = 0;
        while next < header.chunks.len() {
            let pending = header.walk_chunk(data, next, sizes)?;
            for (cont_addr, cont_len) in pending {
                if header.chunks.iter().any(|c| c.start == cont_addr as usize) {
                    return Err(FormatError::Unsupported(format!(
                        "cyclic continuation at {cont_addr:#x}"
                    )));
                }
                let chunk = header.continuation_chunk(data, cont_addr, cont_len, verify)?;
                header.chunks.push(chunk);
            }
            next += 1;
        }
        Ok(header)
    }

    fn parse_v1_prefix(data: &[u8], offset: usize) -> Result<ObjectHeader, FormatError> {
        // version(1) reserved(1) num_messages(2) ref_count(4) header_size(4), padded to 16
        ensure_len(data, offset, 16)?;
        let version = data[offset];
        if version != 1 {
            return Err(FormatError::InvalidObjectHeaderVersion(version));
        }
        let size = LittleEndian::read_u32(&data[offset + 8..offset + 12]) as usize;
        let start = offset + 16;
        ensure_len(data, start, size)?;
        Ok(ObjectHeader {
            address: 0,
            version: 1,
            flags: 0,
            messages: Vec::new(),
            free_slots: Vec::new(),
            chunks: vec![HeaderChunk {
                start,
                end: start + size,
                checksummed: false,
            }],
        })
    }

    fn parse_v2_prefix(
        data: &[u8],
        offset: usize,
        verify: bool,
    ) -> Result<ObjectHeader, FormatError> {
        ensure_len(data, offset, 6)?;
        let version = data[offset + 4];
        if version != 2 {
            return Err(FormatError::InvalidObjectHeaderVersion(version));
        }
        let flags = data[offset + 5];
        let mut pos = offset + 6;
        if flags & 0x20 != 0 {
            // access, modification, change, birth times
            pos += 16;
        }
        if flags & 0x10 != 0 {
            // max compact / min dense attribute counts
            pos += 4;
        }
        let width = 1usize << (flags & 0x03);
        let chunk0_size = read_uint(data, pos, width)? as usize;
        pos += width;

        let end = pos + chunk0_size + 4;
        ensure_len(data, offset, end - offset)?;
        if verify {
            verify_checksum(&data[offset..end])?;
        }
        Ok(ObjectHeader {
            address: 0,
            version: 2,
            flags,
            messages: Vec::new(),
            free_slots: Vec::new(),
            chunks: vec![HeaderChunk {
                start: offset,
                end,
                checksummed: true,
            }],
        })
    }

    fn continuation_chunk(
        &self,
        data: &[u8],
        addr: u64,
        len: u64,
        verify: bool,
    ) -> Result<HeaderChunk, FormatError> {
        let start = addr as usize;
        let end = start + len as usize;
        ensure_len(data, start, len as usize)?;
        if self.version == 1 {
            return Ok(HeaderChunk {
                start,
                end,
                checksummed: false,
            });
        }
        if data[start..start + 4] != OCHK_SIGNATURE {
            return Err(FormatError::InvalidSignature("OCHK"));
        }
        if verify {
            verify_checksum(&data[start..end])?;
        }
        Ok(HeaderChunk {
            start,
            end,
            checksummed: true,
        })
    }

    /// Byte range holding the messages of chunk `index`.
    fn message_area(&self, data: &[u8], index: usize) -> (usize, usize) {
        let chunk = self.chunks[index];
        if self.version == 1 {
            return (chunk.start, chunk.end);
        }
        let start = if index == 0 {
            let mut pos = chunk.start + 6;
            if self.flags & 0x20 != 0 {
                pos += 16;
            }
            if self.flags & 0x10 != 0 {
                pos += 4;
            }
            pos + (1usize << (self.flags & 0x03))
        } else {
            chunk.start + 4
        };
        debug_assert!(start <= data.len());
        (start, chunk.end - 4)
    }

    /// Decode the messages of one chunk; returns continuation targets found.
    fn walk_chunk(
        &mut self,
        data: &[u8],
        index: usize,
        sizes: Sizes,
    ) -> Result<Vec<(u64, u64)>, FormatError> {
        let (mut pos, end) = self.message_area(data, index);
        let tracks_order = self.version == 2 && self.flags & 0x04 != 0;
        let prefix = match (self.version, tracks_order) {
            (1, _) => 8,
            (_, true) => 6,
            (_, false) => 4,
        };
        let mut continuations = Vec::new();

        while pos + prefix <= end {
            let header_offset = pos;
            let (raw_type, size, flags) = if self.version == 1 {
                (
                    LittleEndian::read_u16(&data[pos..pos + 2]),
                    LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize,
                    data[pos + 4],
                )
            } else {
                (
                    data[pos] as u16,
                    LittleEndian::read_u16(&data[pos + 1..pos + 3]) as usize,
                    data[pos + 3],
                )
            };
            let creation_order = if tracks_order {
                Some(LittleEndian::read_u16(&data[pos + 4..pos + 6]))
            } else {
                None
            };
            pos += prefix;
            if pos + size > end {
                return Err(FormatError::UnexpectedEof {
                    expected: pos + size,
                    available: end,
                });
            }

            let msg_type = MessageType::from_u16(raw_type);
            if let MessageType::Unknown(id) = msg_type {
                if flags & MSG_FLAG_FAIL_IF_UNKNOWN != 0 {
                    return Err(FormatError::UnsupportedMessage(id));
                }
            }
            let message = HeaderMessage {
                msg_type,
                flags,
                creation_order,
                data: data[pos..pos + size].to_vec(),
                location: MessageLocation {
                    chunk: index,
                    header_offset,
                    data_offset: pos,
                },
            };
            pos += size;

            match msg_type {
                MessageType::Nil => self.free_slots.push(message),
                MessageType::Continuation => {
                    let addr = sizes.read_offset(&message.data, 0)?;
                    let len = sizes.read_length(&message.data, sizes.offset as usize)?;
                    continuations.push((addr, len));
                    self.messages.push(message);
                }
                _ => self.messages.push(message),
            }
        }
        Ok(continuations)
    }

    /// First message of the given type.
    pub fn find(&self, msg_type: MessageType) -> Option<&HeaderMessage> {
        self.messages.iter().find(|m| m.msg_type == msg_type)
    }

    /// All messages of the given type.
    pub fn find_all(&self, msg_type: MessageType) -> impl Iterator<Item = &HeaderMessage> {
        self.messages.iter().filter(move |m| m.msg_type == msg_type)
    }

    pub fn has(&self, msg_type: MessageType) -> bool {
        self.find(msg_type).is_some()
    }

    /// Turn a free NIL slot into a continuation message pointing at
    /// `(cont_addr, cont_len)`.
    ///
    /// Returns the start of the affected chunk and its rewritten bytes,
    /// checksum included, ready to be written back over the original.
    pub fn chain_continuation(
        &self,
        data: &[u8],
        sizes: Sizes,
        cont_addr: u64,
        cont_len: u64,
    ) -> Result<(usize, Vec<u8>), FormatError> {
        let needed = sizes.offset as usize + sizes.length as usize;
        let slot = self
            .free_slots
            .iter()
            .find(|s| s.data.len() >= needed)
            .ok_or(FormatError::NoFreeSlot(self.address))?;
        let chunk = self.chunks[slot.location.chunk];
        let mut bytes = data[chunk.start..chunk.end].to_vec();

        let rel_header = slot.location.header_offset - chunk.start;
        if self.version == 1 {
            bytes[rel_header..rel_header + 2]
                .copy_from_slice(&MessageType::Continuation.to_u16().to_le_bytes());
        } else {
            bytes[rel_header] = MessageType::Continuation.to_u16() as u8;
        }

        let mut body = Vec::with_capacity(slot.data.len());
        sizes.write_offset(&mut body, cont_addr)?;
        sizes.write_length(&mut body, cont_len)?;
        body.resize(slot.data.len(), 0);
        let rel_data = slot.location.data_offset - chunk.start;
        bytes[rel_data..rel_data + body.len()].copy_from_slice(&body);

        if chunk.checksummed {
            let body_end = bytes.len() - 4;
            let checksum = jenkins_lookup3(&bytes[..body_end]);
            bytes[body_end..].copy_from_slice(&checksum.to_le_bytes());
        }
        Ok((chunk.start, bytes))
    }
}

fn verify_checksum(block: &[u8]) -> Result<(), FormatError> {
    let body = block.len() - 4;
    let stored = LittleEndian::read_u32(&block[body..]);
    let computed = jenkins_lookup3(&block[..body]);
    if stored != computed {
        return Err(FormatError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }
    Ok(())
}
