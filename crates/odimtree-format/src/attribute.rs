//! HDF5 Attribute message (type 0x000C).

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, pad8, Sizes};
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::FormatError;
use crate::shared_message::SharedRef;

/// The type of an attribute: either inline or committed elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    Inline(Datatype),
    /// Shared datatype; the address of the committed type's object header.
    Committed(u64),
}

/// A parsed HDF5 attribute message.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: AttributeType,
    pub dataspace: Dataspace,
    /// Value bytes. May carry trailing message padding; callers trim it to
    /// `num_elements * type_size`.
    pub raw_data: Vec<u8>,
}

fn extract_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl AttributeMessage {
    /// Parse an attribute message from raw message bytes.
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<AttributeMessage, FormatError> {
        ensure_len(data, 0, 8)?;
        let version = data[0];
        let flags = data[1];
        let name_size = LittleEndian::read_u16(&data[2..4]) as usize;
        let type_size = LittleEndian::read_u16(&data[4..6]) as usize;
        let space_size = LittleEndian::read_u16(&data[6..8]) as usize;

        let (mut pos, padded) = match version {
            1 => (8, true),
            2 => (8, false),
            // v3 adds a name character-set byte
            3 => (9, false),
            v => {
                return Err(FormatError::InvalidStructureVersion {
                    kind: "attribute",
                    version: v,
                })
            }
        };
        let step = |n: usize| if padded { pad8(n) } else { n };

        ensure_len(data, pos, name_size)?;
        let name = extract_name(&data[pos..pos + name_size]);
        pos += step(name_size);

        ensure_len(data, pos, type_size)?;
        let type_bytes = &data[pos..pos + type_size];
        let datatype = if version >= 2 && flags & 0x01 != 0 {
            AttributeType::Committed(SharedRef::parse(type_bytes, sizes)?.committed_address()?)
        } else {
            AttributeType::Inline(Datatype::parse(type_bytes)?.0)
        };
        pos += step(type_size);

        ensure_len(data, pos, space_size)?;
        if version >= 2 && flags & 0x02 != 0 {
            return Err(FormatError::Unsupported("shared attribute dataspace".into()));
        }
        let dataspace = Dataspace::parse(&data[pos..pos + space_size], sizes)?;
        pos += step(space_size);

        Ok(AttributeMessage {
            name,
            datatype,
            dataspace,
            raw_data: data.get(pos..).unwrap_or(&[]).to_vec(),
        })
    }

    /// Serialize as a version 2 attribute message.
    ///
    /// A committed datatype is written as a shared-message pointer.
    pub fn serialize(&self, sizes: Sizes) -> Result<Vec<u8>, FormatError> {
        let mut name = self.name.as_bytes().to_vec();
        name.push(0);
        let (flags, type_bytes) = match &self.datatype {
            AttributeType::Inline(dt) => (0u8, dt.serialize()?),
            AttributeType::Committed(addr) => (0x01, SharedRef::serialize_committed(*addr, sizes)?),
        };
        let space_bytes = self.dataspace.serialize(sizes)?;
        let field = |len: usize| {
            u16::try_from(len)
                .map_err(|_| FormatError::Unsupported(format!("attribute field of {len} bytes")))
        };

        let mut buf = vec![2, flags];
        buf.extend_from_slice(&field(name.len())?.to_le_bytes());
        buf.extend_from_slice(&field(type_bytes.len())?.to_le_bytes());
        buf.extend_from_slice(&field(space_bytes.len())?.to_le_bytes());
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&type_bytes);
        buf.extend_from_slice(&space_bytes);
        buf.extend_from_slice(&self.raw_data);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_roundtrip_string_attribute() {
        let attr = AttributeMessage {
            name: "quantity".into(),
            datatype: AttributeType::Inline(Datatype::c_string(5)),
            dataspace: Dataspace::scalar(),
            raw_data: b"DBZH\0".to_vec(),
        };
        let bytes = attr.serialize(Sizes::default()).unwrap();
        assert_eq!(AttributeMessage::parse(&bytes, Sizes::default()).unwrap(), attr);
    }

    #[test]
    fn committed_type_pointer() {
        let attr = AttributeMessage {
            name: "rec".into(),
            datatype: AttributeType::Committed(0x1234),
            dataspace: Dataspace::simple(&[2]),
            raw_data: vec![0; 16],
        };
        let bytes = attr.serialize(Sizes::default()).unwrap();
        assert_eq!(bytes[1], 0x01);
        let parsed = AttributeMessage::parse(&bytes, Sizes::default()).unwrap();
        assert_eq!(parsed.datatype, AttributeType::Committed(0x1234));
    }

    #[test]
    fn v1_fields_are_padded() {
        let dt = Datatype::native_float(8).serialize().unwrap();
        let ds = Dataspace::scalar().serialize(Sizes::default()).unwrap();
        let mut data = vec![1, 0];
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&(dt.len() as u16).to_le_bytes());
        data.extend_from_slice(&(ds.len() as u16).to_le_bytes());
        data.extend_from_slice(b"gain\0\0\0\0");
        data.extend_from_slice(&dt);
        data.resize(data.len() + pad8(dt.len()) - dt.len(), 0);
        data.extend_from_slice(&ds);
        data.resize(data.len() + pad8(ds.len()) - ds.len(), 0);
        data.extend_from_slice(&0.5f64.to_le_bytes());

        let attr = AttributeMessage::parse(&data, Sizes::default()).unwrap();
        assert_eq!(attr.name, "gain");
        assert_eq!(attr.raw_data, 0.5f64.to_le_bytes().to_vec());
    }
}
