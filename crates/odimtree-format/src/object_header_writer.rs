//! Object header writer for the v2 format, including continuation blocks.

use crate::checksum::jenkins_lookup3;
use crate::codec::{pad8, Sizes};
use crate::error::FormatError;
use crate::message_type::MessageType;
use crate::object_header::{OCHK_SIGNATURE, OHDR_SIGNATURE};

/// Per-message prefix in v2 headers: type(1) + size(2) + flags(1).
const V2_MESSAGE_PREFIX: usize = 4;

/// Writer for v2 object headers with proper checksums.
#[derive(Debug, Default, Clone)]
pub struct ObjectHeaderWriter {
    messages: Vec<(MessageType, Vec<u8>, u8)>,
}

impl ObjectHeaderWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the header with default flags (0).
    pub fn add_message(&mut self, msg_type: MessageType, data: Vec<u8>) {
        self.messages.push((msg_type, data, 0));
    }

    /// Add a message with specific flags.
    pub fn add_message_with_flags(&mut self, msg_type: MessageType, data: Vec<u8>, flags: u8) {
        self.messages.push((msg_type, data, flags));
    }

    /// Append a NIL message wide enough to become a continuation message
    /// when new messages are attached to this object later.
    pub fn reserve_slot(&mut self, sizes: Sizes) {
        let width = sizes.offset as usize + sizes.length as usize;
        self.messages.push((MessageType::Nil, vec![0; width], 0));
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn messages_len(&self) -> usize {
        self.messages
            .iter()
            .map(|(_, data, _)| V2_MESSAGE_PREFIX + data.len())
            .sum()
    }

    /// Chunk-size field width and matching flag bits.
    fn size_field(total: usize) -> (u8, usize) {
        if total <= 0xFF {
            (0x00, 1)
        } else if total <= 0xFFFF {
            (0x01, 2)
        } else {
            (0x02, 4)
        }
    }

    /// Encoded size of [`serialize`](Self::serialize) without building it.
    pub fn encoded_len(&self) -> usize {
        let total = self.messages_len();
        4 + 2 + Self::size_field(total).1 + total + 4
    }

    /// Encoded size of [`serialize_continuation`](Self::serialize_continuation).
    pub fn continuation_len(&self) -> usize {
        4 + self.messages_len() + 4
    }

    fn write_messages(&self, buf: &mut Vec<u8>) -> Result<(), FormatError> {
        for (msg_type, data, flags) in &self.messages {
            let size = u16::try_from(data.len()).map_err(|_| {
                FormatError::Unsupported(format!(
                    "{msg_type:?} message of {} bytes exceeds header message limit",
                    data.len()
                ))
            })?;
            buf.push(msg_type.to_u16() as u8);
            buf.extend_from_slice(&size.to_le_bytes());
            buf.push(*flags);
            buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Serialize the complete v2 object header (OHDR + messages + checksum).
    pub fn serialize(&self) -> Result<Vec<u8>, FormatError> {
        let total = self.messages_len();
        let (flags, width) = Self::size_field(total);

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&OHDR_SIGNATURE);
        buf.push(2);
        buf.push(flags);
        buf.extend_from_slice(&(total as u64).to_le_bytes()[..width]);
        self.write_messages(&mut buf)?;

        let checksum = jenkins_lookup3(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Serialize the messages as an OCHK continuation block.
    pub fn serialize_continuation(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(self.continuation_len());
        buf.extend_from_slice(&OCHK_SIGNATURE);
        self.write_messages(&mut buf)?;
        let checksum = jenkins_lookup3(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Serialize the messages as a v1 continuation block: a bare run of
    /// 8-byte aligned messages with no signature or checksum.
    pub fn serialize_v1_continuation(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        for (msg_type, data, flags) in &self.messages {
            let padded = pad8(data.len());
            let size = u16::try_from(padded).map_err(|_| {
                FormatError::Unsupported(format!(
                    "{msg_type:?} message of {} bytes exceeds header message limit",
                    data.len()
                ))
            })?;
            buf.extend_from_slice(&msg_type.to_u16().to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
            buf.push(*flags);
            buf.extend_from_slice(&[0; 3]);
            buf.extend_from_slice(data);
            buf.resize(buf.len() + padded - data.len(), 0);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_header::ObjectHeader;

    #[test]
    fn predicted_lengths_match() {
        let mut w = ObjectHeaderWriter::new();
        w.add_message(MessageType::Datatype, vec![0; 20]);
        w.reserve_slot(Sizes::default());
        assert_eq!(w.serialize().unwrap().len(), w.encoded_len());
        assert_eq!(w.serialize_continuation().unwrap().len(), w.continuation_len());

        // crossing the one-byte chunk-size boundary widens the field
        w.add_message(MessageType::Attribute, vec![1; 300]);
        let bytes = w.serialize().unwrap();
        assert_eq!(bytes.len(), w.encoded_len());
        assert_eq!(bytes[5] & 0x03, 0x01);
    }

    #[test]
    fn flags_survive_parse() {
        let mut w = ObjectHeaderWriter::new();
        w.add_message_with_flags(MessageType::Datatype, vec![0x10, 0, 0, 0, 4, 0, 0, 0], 0x01);
        let bytes = w.serialize().unwrap();
        let oh = ObjectHeader::parse(&bytes, 0, Sizes::default()).unwrap();
        assert_eq!(oh.messages[0].flags, 0x01);
    }

    #[test]
    fn v1_block_is_aligned() {
        let mut w = ObjectHeaderWriter::new();
        w.add_message(MessageType::Attribute, vec![3; 5]);
        w.reserve_slot(Sizes::default());
        let block = w.serialize_v1_continuation().unwrap();
        assert_eq!(block.len(), 8 + 8 + 8 + 16);
        assert_eq!(&block[2..4], &8u16.to_le_bytes());
    }

    #[test]
    fn oversized_message_rejected() {
        let mut w = ObjectHeaderWriter::new();
        w.add_message(MessageType::Attribute, vec![0; 70_000]);
        assert!(matches!(w.serialize(), Err(FormatError::Unsupported(_))));
    }
}
