//! Format/type translator.
//!
//! [`FormatSpecifier`] is the small portable type tag carried by every node.
//! This module maps it to and from the native [`Datatype`] written to disk,
//! and normalizes ("fixes") any datatype read from a file into its canonical
//! native equivalent so that in-memory values are directly usable.

use std::fmt;
use std::str::FromStr;

use odimtree_format::datatype::{Datatype, DatatypeByteOrder, StringPadding};

use crate::compound::CompoundTypeDescription;
use crate::error::{Error, Result};

/// Portable element type of a node payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatSpecifier {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Compound,
    /// Only produced when inspecting existing data.
    Array,
    /// Only produced when inspecting existing data.
    Undefined,
}

/// Legacy format names, first match wins when printing.
const NAMES: &[(&str, FormatSpecifier)] = &[
    ("schar", FormatSpecifier::I8),
    ("char", FormatSpecifier::I8),
    ("uchar", FormatSpecifier::U8),
    ("short", FormatSpecifier::I16),
    ("ushort", FormatSpecifier::U16),
    ("int", FormatSpecifier::I32),
    ("uint", FormatSpecifier::U32),
    ("long", FormatSpecifier::I64),
    ("ulong", FormatSpecifier::U64),
    ("llong", FormatSpecifier::I64),
    ("ullong", FormatSpecifier::U64),
    ("float", FormatSpecifier::F32),
    ("double", FormatSpecifier::F64),
    ("hsize", FormatSpecifier::U64),
    ("hssize", FormatSpecifier::I64),
    ("herr", FormatSpecifier::I32),
    ("hbool", FormatSpecifier::U8),
    ("string", FormatSpecifier::String),
    ("compound", FormatSpecifier::Compound),
    ("array", FormatSpecifier::Array),
    ("undefined", FormatSpecifier::Undefined),
];

impl FormatSpecifier {
    /// Whether new data may be authored with this format.
    pub fn is_authorable(self) -> bool {
        !matches!(self, FormatSpecifier::Array | FormatSpecifier::Undefined)
    }

    /// Element width of the fixed-size numeric formats.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            FormatSpecifier::I8 | FormatSpecifier::U8 => Some(1),
            FormatSpecifier::I16 | FormatSpecifier::U16 => Some(2),
            FormatSpecifier::I32 | FormatSpecifier::U32 | FormatSpecifier::F32 => Some(4),
            FormatSpecifier::I64 | FormatSpecifier::U64 | FormatSpecifier::F64 => Some(8),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, f)| *f == self)
            .map(|(n, _)| *n)
            .unwrap_or("undefined")
    }
}

impl fmt::Display for FormatSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatSpecifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NAMES
            .iter()
            .find(|(n, _)| *n == s)
            .map(|(_, f)| *f)
            .ok_or_else(|| Error::UnsupportedFormat(s.to_string()))
    }
}

/// Resolve a format specifier to the native datatype used on disk.
///
/// `string_size` is the byte width of a `String` element, terminator
/// included. `compound` must describe a `Compound` format.
pub fn to_native_type(
    spec: FormatSpecifier,
    string_size: Option<usize>,
    compound: Option<&CompoundTypeDescription>,
) -> Result<Datatype> {
    Ok(match spec {
        FormatSpecifier::I8 => Datatype::native_int(1, true),
        FormatSpecifier::U8 => Datatype::native_int(1, false),
        FormatSpecifier::I16 => Datatype::native_int(2, true),
        FormatSpecifier::U16 => Datatype::native_int(2, false),
        FormatSpecifier::I32 => Datatype::native_int(4, true),
        FormatSpecifier::U32 => Datatype::native_int(4, false),
        FormatSpecifier::I64 => Datatype::native_int(8, true),
        FormatSpecifier::U64 => Datatype::native_int(8, false),
        FormatSpecifier::F32 => Datatype::native_float(4),
        FormatSpecifier::F64 => Datatype::native_float(8),
        FormatSpecifier::String => match string_size {
            Some(size) if size > 0 => Datatype::c_string(size as u32),
            _ => {
                return Err(Error::UnsupportedFormat(
                    "string format without a size".into(),
                ))
            }
        },
        FormatSpecifier::Compound => compound
            .ok_or(Error::MissingCompoundDescription)?
            .to_datatype()?,
        FormatSpecifier::Array | FormatSpecifier::Undefined => {
            return Err(Error::UnsupportedFormat(format!(
                "{spec} has no native type"
            )))
        }
    })
}

/// Classify a native datatype. Anything outside the fixed scalar table that
/// is not a string, compound or array is `Undefined`.
pub fn from_native_type(dt: &Datatype) -> FormatSpecifier {
    const SCALARS: [FormatSpecifier; 10] = [
        FormatSpecifier::I8,
        FormatSpecifier::U8,
        FormatSpecifier::I16,
        FormatSpecifier::U16,
        FormatSpecifier::I32,
        FormatSpecifier::U32,
        FormatSpecifier::I64,
        FormatSpecifier::U64,
        FormatSpecifier::F32,
        FormatSpecifier::F64,
    ];
    for spec in SCALARS {
        if to_native_type(spec, None, None).ok().as_ref() == Some(dt) {
            return spec;
        }
    }
    match dt {
        Datatype::String { .. } => FormatSpecifier::String,
        Datatype::VariableLength { is_string: true, .. } => FormatSpecifier::String,
        Datatype::Compound { .. } => FormatSpecifier::Compound,
        Datatype::Array { .. } => FormatSpecifier::Array,
        _ => FormatSpecifier::Undefined,
    }
}

/// Byte width of one element of `spec`. Strings, compounds and arrays have
/// no width without further information.
pub fn size_of(spec: FormatSpecifier) -> Result<usize> {
    let dt = to_native_type(spec, None, None)?;
    Ok(dt.type_size() as usize)
}

fn is_native(order: DatatypeByteOrder) -> bool {
    order == DatatypeByteOrder::native()
}

/// Natural alignment of a fixed datatype.
fn alignment(dt: &Datatype) -> u64 {
    match dt {
        Datatype::FixedPoint { size, .. }
        | Datatype::FloatingPoint { size, .. }
        | Datatype::BitField { size, .. }
        | Datatype::Reference { size, .. }
        | Datatype::Time { size, .. } => (*size as u64).clamp(1, 8),
        Datatype::Enumeration { base_type, .. } | Datatype::Array { base_type, .. } => {
            alignment(base_type)
        }
        Datatype::Compound { members, .. } => {
            members.iter().map(|m| alignment(&m.datatype)).max().unwrap_or(1)
        }
        _ => 1,
    }
}

/// Normalize an on-disk datatype to its canonical native equivalent.
///
/// Numbers move to native byte order, strings become null terminated,
/// enumerations collapse to their integer base, and compounds are rebuilt
/// member by member with naturally aligned offsets. Variable-length strings
/// are fixed by the reader once their longest value is known.
pub fn fix_type(dt: &Datatype) -> Result<Datatype> {
    Ok(match dt {
        Datatype::FixedPoint { size, signed, .. } => Datatype::native_int(*size, *signed),
        Datatype::FloatingPoint { size: 4 | 8, .. } => Datatype::native_float(dt.type_size()),
        Datatype::FloatingPoint { size, .. } => {
            return Err(Error::UnsupportedFormat(format!("{size}-byte float")))
        }
        Datatype::BitField {
            size,
            bit_offset,
            bit_precision,
            ..
        } => Datatype::BitField {
            size: *size,
            byte_order: DatatypeByteOrder::native(),
            bit_offset: *bit_offset,
            bit_precision: *bit_precision,
        },
        Datatype::String { size, padding, .. } => match padding {
            StringPadding::NullTerminate => Datatype::c_string(*size),
            // room for a terminator the stored value may lack
            _ => Datatype::c_string(size + 1),
        },
        Datatype::Enumeration { base_type, .. } => fix_type(base_type)?,
        Datatype::Array {
            base_type,
            dimensions,
        } => Datatype::Array {
            base_type: Box::new(fix_type(base_type)?),
            dimensions: dimensions.clone(),
        },
        Datatype::Compound { members, .. } => {
            let mut fixed = Vec::with_capacity(members.len());
            let mut offset = 0u64;
            let mut max_align = 1u64;
            for member in members {
                let datatype = fix_type(&member.datatype)?;
                let align = alignment(&datatype);
                max_align = max_align.max(align);
                offset = offset.div_ceil(align) * align;
                let width = datatype.type_size() as u64;
                fixed.push(odimtree_format::datatype::CompoundMember {
                    name: member.name.clone(),
                    byte_offset: offset,
                    datatype,
                });
                offset += width;
            }
            Datatype::Compound {
                size: (offset.div_ceil(max_align) * max_align) as u32,
                members: fixed,
            }
        }
        Datatype::VariableLength { .. } => {
            return Err(Error::UnsupportedFormat(
                "variable-length data outside a top-level string".into(),
            ))
        }
        Datatype::Reference { .. } | Datatype::Opaque { .. } | Datatype::Time { .. } => dt.clone(),
    })
}

/// Convert `count` elements stored as `from` into the fixed layout `to`
/// produced by [`fix_type`].
pub fn to_native_data(raw: &[u8], from: &Datatype, to: &Datatype, count: usize) -> Result<Vec<u8>> {
    let src_size = from.type_size() as usize;
    let dst_size = to.type_size() as usize;
    if raw.len() < src_size * count {
        return Err(Error::ShapeMismatch(format!(
            "{} bytes for {count} elements of {src_size} bytes",
            raw.len()
        )));
    }
    let mut out = vec![0u8; dst_size * count];
    for i in 0..count {
        convert_element(
            &raw[i * src_size..(i + 1) * src_size],
            from,
            to,
            &mut out[i * dst_size..(i + 1) * dst_size],
        );
    }
    Ok(out)
}

fn convert_element(src: &[u8], from: &Datatype, to: &Datatype, dst: &mut [u8]) {
    match (from, to) {
        (Datatype::FixedPoint { byte_order, .. }, _)
        | (Datatype::FloatingPoint { byte_order, .. }, _)
        | (Datatype::BitField { byte_order, .. }, _) => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            if !is_native(*byte_order) {
                dst[..n].reverse();
            }
        }
        (Datatype::Enumeration { base_type, .. }, _) => convert_element(src, base_type, to, dst),
        (Datatype::String { padding, .. }, _) => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            if *padding == StringPadding::SpacePad {
                let end = dst[..n].iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
                dst[end..].fill(0);
            }
            // null terminated output
            if let Some(last) = dst.last_mut() {
                *last = 0;
            }
        }
        (
            Datatype::Array { base_type: a, .. },
            Datatype::Array { base_type: b, .. },
        ) => {
            let (sa, sb) = (a.type_size() as usize, b.type_size() as usize);
            if sa == 0 || sb == 0 {
                return;
            }
            for (s, d) in src.chunks_exact(sa).zip(dst.chunks_exact_mut(sb)) {
                convert_element(s, a, b, d);
            }
        }
        (Datatype::Compound { members: fm, .. }, Datatype::Compound { members: tm, .. }) => {
            for (f, t) in fm.iter().zip(tm) {
                let (fs, ts) = (f.datatype.type_size() as usize, t.datatype.type_size() as usize);
                let (fo, to_) = (f.byte_offset as usize, t.byte_offset as usize);
                if fo + fs <= src.len() && to_ + ts <= dst.len() {
                    convert_element(
                        &src[fo..fo + fs],
                        &f.datatype,
                        &t.datatype,
                        &mut dst[to_..to_ + ts],
                    );
                }
            }
        }
        _ => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// Fixed-width numeric element that can be viewed in a node payload.
pub trait Element: Copy {
    const FORMAT: FormatSpecifier;

    fn read_ne(bytes: &[u8]) -> Self;

    fn write_ne(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($($ty:ty => $spec:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const FORMAT: FormatSpecifier = FormatSpecifier::$spec;

                fn read_ne(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_ne_bytes(buf)
                }

                fn write_ne(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_element!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);
