//! Object header message type identifiers.

/// Header message types the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nil,
    Dataspace,
    LinkInfo,
    Datatype,
    FillValueOld,
    FillValue,
    Link,
    DataLayout,
    GroupInfo,
    FilterPipeline,
    Attribute,
    Continuation,
    SymbolTable,
    ModificationTime,
    BTreeKValues,
    AttributeInfo,
    ReferenceCount,
    /// Any other type, kept with its raw ID.
    Unknown(u16),
}

impl MessageType {
    pub fn from_u16(val: u16) -> MessageType {
        match val {
            0x0000 => MessageType::Nil,
            0x0001 => MessageType::Dataspace,
            0x0002 => MessageType::LinkInfo,
            0x0003 => MessageType::Datatype,
            0x0004 => MessageType::FillValueOld,
            0x0005 => MessageType::FillValue,
            0x0006 => MessageType::Link,
            0x0008 => MessageType::DataLayout,
            0x000A => MessageType::GroupInfo,
            0x000B => MessageType::FilterPipeline,
            0x000C => MessageType::Attribute,
            0x0010 => MessageType::Continuation,
            0x0011 => MessageType::SymbolTable,
            0x0012 => MessageType::ModificationTime,
            0x0013 => MessageType::BTreeKValues,
            0x0015 => MessageType::AttributeInfo,
            0x0016 => MessageType::ReferenceCount,
            other => MessageType::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            MessageType::Nil => 0x0000,
            MessageType::Dataspace => 0x0001,
            MessageType::LinkInfo => 0x0002,
            MessageType::Datatype => 0x0003,
            MessageType::FillValueOld => 0x0004,
            MessageType::FillValue => 0x0005,
            MessageType::Link => 0x0006,
            MessageType::DataLayout => 0x0008,
            MessageType::GroupInfo => 0x000A,
            MessageType::FilterPipeline => 0x000B,
            MessageType::Attribute => 0x000C,
            MessageType::Continuation => 0x0010,
            MessageType::SymbolTable => 0x0011,
            MessageType::ModificationTime => 0x0012,
            MessageType::BTreeKValues => 0x0013,
            MessageType::AttributeInfo => 0x0015,
            MessageType::ReferenceCount => 0x0016,
            MessageType::Unknown(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip() {
        for id in [0x00u16, 0x01, 0x03, 0x06, 0x08, 0x0C, 0x10, 0x11, 0x13] {
            assert_eq!(MessageType::from_u16(id).to_u16(), id);
        }
        assert_eq!(MessageType::from_u16(0x10), MessageType::Continuation);
    }

    #[test]
    fn unknown_keeps_id() {
        assert_eq!(MessageType::from_u16(0x0007), MessageType::Unknown(7));
        assert_eq!(MessageType::Unknown(0x99).to_u16(), 0x99);
    }
}
