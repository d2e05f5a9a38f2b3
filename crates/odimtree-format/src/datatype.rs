//! HDF5 Datatype message (type 0x0003): parsing of all twelve classes and
//! encoding of the classes the writer produces.

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ensure_len, read_cstring, read_uint};
use crate::error::FormatError;

/// Byte order of numeric data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeByteOrder {
    LittleEndian,
    BigEndian,
    Vax,
}

impl DatatypeByteOrder {
    /// Byte order of the running platform.
    pub fn native() -> DatatypeByteOrder {
        if cfg!(target_endian = "big") {
            DatatypeByteOrder::BigEndian
        } else {
            DatatypeByteOrder::LittleEndian
        }
    }
}

/// String padding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminate,
    NullPad,
    SpacePad,
}

/// Character set encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Ascii,
    Utf8,
}

/// Reference type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    Object,
    DatasetRegion,
}

/// A member of a compound datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    /// Byte offset within the compound.
    pub byte_offset: u64,
    pub datatype: Datatype,
}

/// A member of an enumeration datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumMember {
    pub name: String,
    /// Raw value bytes (length = base type size).
    pub value: Vec<u8>,
}

/// Parsed HDF5 datatype.
#[derive(Debug, Clone, PartialEq)]
pub enum Datatype {
    /// Class 0: fixed-point (integer) types.
    FixedPoint {
        size: u32,
        byte_order: DatatypeByteOrder,
        signed: bool,
        bit_offset: u16,
        bit_precision: u16,
    },
    /// Class 1: floating-point types.
    FloatingPoint {
        size: u32,
        byte_order: DatatypeByteOrder,
        bit_offset: u16,
        bit_precision: u16,
        exponent_location: u8,
        exponent_size: u8,
        mantissa_location: u8,
        mantissa_size: u8,
        exponent_bias: u32,
    },
    /// Class 2: time.
    Time { size: u32, bit_precision: u16 },
    /// Class 3: fixed-length string.
    String {
        size: u32,
        padding: StringPadding,
        charset: CharacterSet,
    },
    /// Class 4: bit field.
    BitField {
        size: u32,
        byte_order: DatatypeByteOrder,
        bit_offset: u16,
        bit_precision: u16,
    },
    /// Class 5: opaque.
    Opaque { size: u32, tag: Vec<u8> },
    /// Class 6: compound (class 11 complex numbers are folded in here too).
    Compound {
        size: u32,
        members: Vec<CompoundMember>,
    },
    /// Class 7: reference.
    Reference { size: u32, ref_type: ReferenceType },
    /// Class 8: enumeration.
    Enumeration {
        size: u32,
        base_type: Box<Datatype>,
        members: Vec<EnumMember>,
    },
    /// Class 9: variable-length sequence or string.
    VariableLength {
        size: u32,
        is_string: bool,
        padding: Option<StringPadding>,
        charset: Option<CharacterSet>,
        base_type: Box<Datatype>,
    },
    /// Class 10: array.
    Array {
        base_type: Box<Datatype>,
        dimensions: Vec<u32>,
    },
}

fn parse_string_padding(val: u8) -> Result<StringPadding, FormatError> {
    match val {
        0 => Ok(StringPadding::NullTerminate),
        1 => Ok(StringPadding::NullPad),
        2 => Ok(StringPadding::SpacePad),
        _ => Err(FormatError::InvalidStringPadding(val)),
    }
}

fn parse_charset(val: u8) -> Result<CharacterSet, FormatError> {
    match val {
        0 => Ok(CharacterSet::Ascii),
        1 => Ok(CharacterSet::Utf8),
        _ => Err(FormatError::InvalidCharacterSet(val)),
    }
}

fn padding_bits(padding: StringPadding) -> u8 {
    match padding {
        StringPadding::NullTerminate => 0,
        StringPadding::NullPad => 1,
        StringPadding::SpacePad => 2,
    }
}

fn charset_bits(charset: CharacterSet) -> u8 {
    match charset {
        CharacterSet::Ascii => 0,
        CharacterSet::Utf8 => 1,
    }
}

fn byte_order_bit(order: DatatypeByteOrder) -> u8 {
    match order {
        DatatypeByteOrder::BigEndian => 0x01,
        _ => 0x00,
    }
}

/// Bytes used for member offsets in version 3 compound encodings.
fn offset_bytes_for_size(compound_size: u32) -> usize {
    if compound_size <= 0xFF {
        1
    } else if compound_size <= 0xFFFF {
        2
    } else {
        4
    }
}

impl Datatype {
    /// Native-order integer of `size` bytes.
    pub fn native_int(size: u32, signed: bool) -> Datatype {
        Datatype::FixedPoint {
            size,
            byte_order: DatatypeByteOrder::native(),
            signed,
            bit_offset: 0,
            bit_precision: (size * 8) as u16,
        }
    }

    /// Native-order IEEE float; `size` is 4 or 8.
    pub fn native_float(size: u32) -> Datatype {
        let (exponent_location, exponent_size, mantissa_size, exponent_bias) = if size == 4 {
            (23, 8, 23, 127)
        } else {
            (52, 11, 52, 1023)
        };
        Datatype::FloatingPoint {
            size,
            byte_order: DatatypeByteOrder::native(),
            bit_offset: 0,
            bit_precision: (size * 8) as u16,
            exponent_location,
            exponent_size,
            mantissa_location: 0,
            mantissa_size,
            exponent_bias,
        }
    }

    /// Null-terminated ASCII string of `size` bytes.
    pub fn c_string(size: u32) -> Datatype {
        Datatype::String {
            size,
            padding: StringPadding::NullTerminate,
            charset: CharacterSet::Ascii,
        }
    }

    /// Object reference with the file's address width.
    pub fn object_reference(offset_size: u8) -> Datatype {
        Datatype::Reference {
            size: offset_size as u32,
            ref_type: ReferenceType::Object,
        }
    }

    /// Parse a datatype message.
    ///
    /// Returns `(Datatype, bytes_consumed)` for recursive parsing.
    pub fn parse(data: &[u8]) -> Result<(Datatype, usize), FormatError> {
        ensure_len(data, 0, 8)?;

        let class_id = data[0] & 0x0F;
        let version = data[0] >> 4;
        let (bf0, bf1) = (data[1], data[2]);
        let size = LittleEndian::read_u32(&data[4..8]);
        let mut pos = 8;

        let order = |bf0: u8| {
            if bf0 & 0x01 == 0 {
                DatatypeByteOrder::LittleEndian
            } else {
                DatatypeByteOrder::BigEndian
            }
        };

        let dt = match class_id {
            0 => {
                ensure_len(data, pos, 4)?;
                let dt = Datatype::FixedPoint {
                    size,
                    byte_order: order(bf0),
                    signed: bf0 & 0x08 != 0,
                    bit_offset: LittleEndian::read_u16(&data[pos..pos + 2]),
                    bit_precision: LittleEndian::read_u16(&data[pos + 2..pos + 4]),
                };
                pos += 4;
                dt
            }
            1 => {
                ensure_len(data, pos, 12)?;
                let byte_order = if bf0 & 0x40 != 0 {
                    DatatypeByteOrder::Vax
                } else {
                    order(bf0)
                };
                let dt = Datatype::FloatingPoint {
                    size,
                    byte_order,
                    bit_offset: LittleEndian::read_u16(&data[pos..pos + 2]),
                    bit_precision: LittleEndian::read_u16(&data[pos + 2..pos + 4]),
                    exponent_location: data[pos + 4],
                    exponent_size: data[pos + 5],
                    mantissa_location: data[pos + 6],
                    mantissa_size: data[pos + 7],
                    exponent_bias: LittleEndian::read_u32(&data[pos + 8..pos + 12]),
                };
                pos += 12;
                dt
            }
            2 => {
                ensure_len(data, pos, 2)?;
                let bit_precision = LittleEndian::read_u16(&data[pos..pos + 2]);
                pos += 2;
                Datatype::Time { size, bit_precision }
            }
            3 => Datatype::String {
                size,
                padding: parse_string_padding(bf0 & 0x0F)?,
                charset: parse_charset(bf0 >> 4)?,
            },
            4 => {
                ensure_len(data, pos, 4)?;
                let dt = Datatype::BitField {
                    size,
                    byte_order: order(bf0),
                    bit_offset: LittleEndian::read_u16(&data[pos..pos + 2]),
                    bit_precision: LittleEndian::read_u16(&data[pos + 2..pos + 4]),
                };
                pos += 4;
                dt
            }
            5 => {
                let tag_len = bf0 as usize;
                ensure_len(data, pos, tag_len)?;
                let tag = data[pos..pos + tag_len].to_vec();
                pos += (tag_len + 7) & !7;
                Datatype::Opaque { size, tag }
            }
            6 | 11 => {
                let count = u16::from_le_bytes([bf0, bf1]) as usize;
                let members = if class_id == 11 {
                    Self::parse_members_v3(data, &mut pos, count, size)?
                } else {
                    match version {
                        1 | 2 => Self::parse_members_v1v2(data, &mut pos, count, version)?,
                        3 => Self::parse_members_v3(data, &mut pos, count, size)?,
                        _ => {
                            return Err(FormatError::InvalidDatatypeVersion {
                                class: class_id,
                                version,
                            })
                        }
                    }
                };
                Datatype::Compound { size, members }
            }
            7 => {
                let ref_type = match bf0 & 0x0F {
                    0 => ReferenceType::Object,
                    1 => ReferenceType::DatasetRegion,
                    other => return Err(FormatError::InvalidReferenceType(other)),
                };
                Datatype::Reference { size, ref_type }
            }
            8 => {
                let count = u16::from_le_bytes([bf0, bf1]) as usize;
                let (base_type, consumed) = Datatype::parse(&data[pos..])?;
                pos += consumed;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    let (name, used) = read_cstring(data, pos)?;
                    pos += if version >= 3 { used } else { (used + 7) & !7 };
                    names.push(name);
                }
                let width = base_type.type_size() as usize;
                ensure_len(data, pos, width * count)?;
                let mut members = Vec::with_capacity(count);
                for name in names {
                    members.push(EnumMember {
                        name,
                        value: data[pos..pos + width].to_vec(),
                    });
                    pos += width;
                }
                Datatype::Enumeration {
                    size,
                    base_type: Box::new(base_type),
                    members,
                }
            }
            9 => {
                let is_string = bf0 & 0x0F == 1;
                let (padding, charset) = if is_string {
                    (
                        Some(parse_string_padding(bf0 >> 4)?),
                        Some(parse_charset(bf1 & 0x0F)?),
                    )
                } else {
                    (None, None)
                };
                let (base_type, consumed) = Datatype::parse(&data[pos..])?;
                pos += consumed;
                Datatype::VariableLength {
                    size,
                    is_string,
                    padding,
                    charset,
                    base_type: Box::new(base_type),
                }
            }
            10 => {
                ensure_len(data, pos, 1)?;
                let ndims = data[pos] as usize;
                pos += if version >= 3 { 1 } else { 4 };
                ensure_len(data, pos, ndims * 4)?;
                let dimensions: Vec<u32> = (0..ndims)
                    .map(|i| LittleEndian::read_u32(&data[pos + 4 * i..pos + 4 * i + 4]))
                    .collect();
                pos += ndims * 4;
                if version < 3 {
                    // permutation indices, never used by the library
                    pos += ndims * 4;
                }
                let (base_type, consumed) = Datatype::parse(data.get(pos..).unwrap_or(&[]))?;
                pos += consumed;
                Datatype::Array {
                    base_type: Box::new(base_type),
                    dimensions,
                }
            }
            _ => return Err(FormatError::InvalidDatatypeClass(class_id)),
        };
        Ok((dt, pos))
    }

    fn parse_members_v1v2(
        data: &[u8],
        pos: &mut usize,
        count: usize,
        version: u8,
    ) -> Result<Vec<CompoundMember>, FormatError> {
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let (name, used) = read_cstring(data, *pos)?;
            *pos += (used + 7) & !7;
            let byte_offset = read_uint(data, *pos, 4)?;
            *pos += 4;

            let mut dimensions = Vec::new();
            if version == 1 {
                // ndims(1) reserved(3) permutation(4) reserved(4) dims(4 x 4)
                ensure_len(data, *pos, 28)?;
                let ndims = (data[*pos] as usize).min(4);
                let dims_at = *pos + 12;
                for i in 0..ndims {
                    dimensions.push(LittleEndian::read_u32(
                        &data[dims_at + 4 * i..dims_at + 4 * i + 4],
                    ));
                }
                *pos += 28;
            }

            let (member_dt, consumed) = Datatype::parse(&data[*pos..])?;
            *pos += consumed;
            let datatype = if dimensions.is_empty() {
                member_dt
            } else {
                Datatype::Array {
                    base_type: Box::new(member_dt),
                    dimensions,
                }
            };
            members.push(CompoundMember {
                name,
                byte_offset,
                datatype,
            });
        }
        Ok(members)
    }

    fn parse_members_v3(
        data: &[u8],
        pos: &mut usize,
        count: usize,
        size: u32,
    ) -> Result<Vec<CompoundMember>, FormatError> {
        let width = offset_bytes_for_size(size);
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let (name, used) = read_cstring(data, *pos)?;
            *pos += used;
            let byte_offset = read_uint(data, *pos, width)?;
            *pos += width;
            let (datatype, consumed) = Datatype::parse(&data[*pos..])?;
            *pos += consumed;
            members.push(CompoundMember {
                name,
                byte_offset,
                datatype,
            });
        }
        Ok(members)
    }

    fn build_header(class: u8, version: u8, bf: [u8; 3], size: u32) -> Vec<u8> {
        let mut buf = vec![(class & 0x0F) | (version << 4), bf[0], bf[1], bf[2]];
        buf.extend_from_slice(&size.to_le_bytes());
        buf
    }

    /// Highest encoding version needed by this type and its children.
    fn encoding_version(&self) -> u8 {
        match self {
            Datatype::Compound { members, .. } => members
                .iter()
                .map(|m| m.datatype.encoding_version())
                .max()
                .unwrap_or(1)
                .max(3),
            Datatype::Array { .. } => 3,
            Datatype::VariableLength { base_type, .. } => base_type.encoding_version(),
            _ => 1,
        }
    }

    /// Serialize to datatype message bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, FormatError> {
        let buf = match self {
            Datatype::FixedPoint {
                size,
                byte_order,
                signed,
                bit_offset,
                bit_precision,
            } => {
                let bf0 = byte_order_bit(*byte_order) | if *signed { 0x08 } else { 0 };
                let mut buf = Self::build_header(0, 1, [bf0, 0, 0], *size);
                buf.extend_from_slice(&bit_offset.to_le_bytes());
                buf.extend_from_slice(&bit_precision.to_le_bytes());
                buf
            }
            Datatype::FloatingPoint {
                size,
                byte_order,
                bit_offset,
                bit_precision,
                exponent_location,
                exponent_size,
                mantissa_location,
                mantissa_size,
                exponent_bias,
            } => {
                // mantissa normalization 2: most significant bit implied
                let mut bf0 = 0x20 | byte_order_bit(*byte_order);
                if *byte_order == DatatypeByteOrder::Vax {
                    bf0 |= 0x41;
                }
                let sign_location = (*bit_offset + *bit_precision).saturating_sub(1) as u8;
                let mut buf = Self::build_header(1, 1, [bf0, sign_location, 0], *size);
                buf.extend_from_slice(&bit_offset.to_le_bytes());
                buf.extend_from_slice(&bit_precision.to_le_bytes());
                buf.extend_from_slice(&[
                    *exponent_location,
                    *exponent_size,
                    *mantissa_location,
                    *mantissa_size,
                ]);
                buf.extend_from_slice(&exponent_bias.to_le_bytes());
                buf
            }
            Datatype::String {
                size,
                padding,
                charset,
            } => {
                let bf0 = padding_bits(*padding) | (charset_bits(*charset) << 4);
                Self::build_header(3, 1, [bf0, 0, 0], *size)
            }
            Datatype::Compound { size, members } => {
                let count = u16::try_from(members.len()).map_err(|_| {
                    FormatError::Unsupported(format!("{} compound members", members.len()))
                })?;
                let [lo, hi] = count.to_le_bytes();
                let mut buf = Self::build_header(6, self.encoding_version(), [lo, hi, 0], *size);
                let width = offset_bytes_for_size(*size);
                for member in members {
                    buf.extend_from_slice(member.name.as_bytes());
                    buf.push(0);
                    crate::codec::write_uint(&mut buf, member.byte_offset, width)?;
                    buf.extend_from_slice(&member.datatype.serialize()?);
                }
                buf
            }
            Datatype::Reference { size, ref_type } => {
                let bf0 = match ref_type {
                    ReferenceType::Object => 0,
                    ReferenceType::DatasetRegion => 1,
                };
                Self::build_header(7, 1, [bf0, 0, 0], *size)
            }
            Datatype::Array {
                base_type,
                dimensions,
            } => {
                let mut buf = Self::build_header(10, 3, [0, 0, 0], self.type_size());
                buf.push(dimensions.len() as u8);
                for d in dimensions {
                    buf.extend_from_slice(&d.to_le_bytes());
                }
                buf.extend_from_slice(&base_type.serialize()?);
                buf
            }
            Datatype::VariableLength {
                size,
                is_string,
                padding,
                charset,
                base_type,
            } => {
                let mut bf0 = u8::from(*is_string);
                if let Some(p) = padding {
                    bf0 |= padding_bits(*p) << 4;
                }
                let bf1 = charset.map(charset_bits).unwrap_or(0);
                let mut buf = Self::build_header(9, 1, [bf0, bf1, 0], *size);
                buf.extend_from_slice(&base_type.serialize()?);
                buf
            }
            other => {
                return Err(FormatError::Unsupported(format!(
                    "encoding datatype {other:?}"
                )))
            }
        };
        Ok(buf)
    }

    /// Size in bytes of one element of this type.
    pub fn type_size(&self) -> u32 {
        match self {
            Datatype::FixedPoint { size, .. }
            | Datatype::FloatingPoint { size, .. }
            | Datatype::Time { size, .. }
            | Datatype::String { size, .. }
            | Datatype::BitField { size, .. }
            | Datatype::Opaque { size, .. }
            | Datatype::Compound { size, .. }
            | Datatype::Reference { size, .. }
            | Datatype::Enumeration { size, .. }
            | Datatype::VariableLength { size, .. } => *size,
            Datatype::Array {
                base_type,
                dimensions,
            } => base_type.type_size() * dimensions.iter().product::<u32>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_dt_header(class: u8, version: u8, bf: [u8; 3], size: u32) -> Vec<u8> {
        Datatype::build_header(class, version, bf, size)
    }

    fn fixed_point_bytes(size: u32, be: bool, signed: bool) -> Vec<u8> {
        let bf0 = u8::from(be) | if signed { 0x08 } else { 0 };
        let mut buf = build_dt_header(0, 1, [bf0, 0, 0], size);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&((size * 8) as u16).to_le_bytes());
        buf
    }

    #[test]
    fn big_endian_u32() {
        let (dt, used) = Datatype::parse(&fixed_point_bytes(4, true, false)).unwrap();
        assert_eq!(used, 12);
        assert!(matches!(
            dt,
            Datatype::FixedPoint {
                size: 4,
                byte_order: DatatypeByteOrder::BigEndian,
                signed: false,
                ..
            }
        ));
    }

    #[test]
    fn float_sign_location_follows_width() {
        let f32_bytes = Datatype::native_float(4).serialize().unwrap();
        let f64_bytes = Datatype::native_float(8).serialize().unwrap();
        assert_eq!(f32_bytes[2], 31);
        assert_eq!(f64_bytes[2], 63);
        assert_eq!(f64_bytes[1] & 0x30, 0x20);
        assert_eq!(Datatype::parse(&f64_bytes).unwrap().0, Datatype::native_float(8));
    }

    #[test]
    fn string_roundtrip() {
        let dt = Datatype::String {
            size: 16,
            padding: StringPadding::SpacePad,
            charset: CharacterSet::Utf8,
        };
        let bytes = dt.serialize().unwrap();
        assert_eq!(Datatype::parse(&bytes).unwrap(), (dt, 8));
    }

    #[test]
    fn compound_with_array_member_roundtrip() {
        let dt = Datatype::Compound {
            size: 24,
            members: vec![
                CompoundMember {
                    name: "id".into(),
                    byte_offset: 0,
                    datatype: Datatype::native_int(4, true),
                },
                CompoundMember {
                    name: "xy".into(),
                    byte_offset: 8,
                    datatype: Datatype::Array {
                        base_type: Box::new(Datatype::native_float(8)),
                        dimensions: vec![2],
                    },
                },
            ],
        };
        let bytes = dt.serialize().unwrap();
        assert_eq!(bytes[0] >> 4, 3);
        let (parsed, used) = Datatype::parse(&bytes).unwrap();
        assert_eq!(parsed, dt);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn compound_v1_member_dims_become_array() {
        let mut buf = build_dt_header(6, 1, [1, 0, 0], 12);
        buf.extend_from_slice(b"v\0\0\0\0\0\0\0");
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.push(1); // ndims
        buf.extend_from_slice(&[0; 3]);
        buf.extend_from_slice(&[0; 4]); // permutation
        buf.extend_from_slice(&[0; 4]); // reserved
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[0; 12]);
        buf.extend_from_slice(&fixed_point_bytes(4, false, true));
        let (dt, used) = Datatype::parse(&buf).unwrap();
        assert_eq!(used, buf.len());
        match dt {
            Datatype::Compound { members, .. } => {
                assert_eq!(members[0].name, "v");
                assert_eq!(members[0].datatype.type_size(), 12);
            }
            other => panic!("expected compound, got {other:?}"),
        }
    }

    #[test]
    fn compound_v2_names_are_padded() {
        let mut buf = build_dt_header(6, 2, [1, 0, 0], 8);
        buf.extend_from_slice(b"value\0\0\0");
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&Datatype::native_float(8).serialize().unwrap());
        let (dt, used) = Datatype::parse(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(dt.type_size(), 8);
    }

    #[test]
    fn enum_parse() {
        let mut buf = build_dt_header(8, 3, [2, 0, 0], 1);
        buf.extend_from_slice(&fixed_point_bytes(1, false, false));
        buf.extend_from_slice(b"OFF\0ON\0");
        buf.extend_from_slice(&[0, 1]);
        let (dt, used) = Datatype::parse(&buf).unwrap();
        assert_eq!(used, buf.len());
        match dt {
            Datatype::Enumeration { members, .. } => {
                assert_eq!(members[1].name, "ON");
                assert_eq!(members[1].value, vec![1]);
            }
            other => panic!("expected enum, got {other:?}"),
        }
    }

    #[test]
    fn reference_roundtrip() {
        let dt = Datatype::object_reference(8);
        let bytes = dt.serialize().unwrap();
        assert_eq!(Datatype::parse(&bytes).unwrap().0, dt);
    }

    #[test]
    fn invalid_class() {
        let buf = build_dt_header(12, 1, [0, 0, 0], 4);
        assert_eq!(Datatype::parse(&buf), Err(FormatError::InvalidDatatypeClass(12)));
    }
}
