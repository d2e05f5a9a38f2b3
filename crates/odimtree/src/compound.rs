//! Descriptions of struct-like compound types.

use odimtree_format::datatype::{CompoundMember as DiskMember, Datatype};

use crate::error::{Error, Result};
use crate::format::{from_native_type, to_native_type, FormatSpecifier};

/// Highest member rank a compound description can carry.
pub const MAX_MEMBER_RANK: usize = 4;

/// Identity of a committed datatype: the file it was read from and the
/// address of its object header there. Authored descriptions use the
/// default (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectId {
    pub fileno: u64,
    pub objno: u64,
}

impl ObjectId {
    pub fn new(fileno: u64, objno: u64) -> ObjectId {
        ObjectId { fileno, objno }
    }
}

/// One named field of a compound type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundMember {
    pub name: String,
    /// Byte offset inside the compound element.
    pub offset: usize,
    /// Byte width of one scalar element of the member.
    pub element_size: usize,
    pub format: FormatSpecifier,
    /// Array extents of the member; empty for a scalar member.
    pub dims: Vec<usize>,
}

impl CompoundMember {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total bytes the member occupies.
    pub fn byte_len(&self) -> usize {
        self.element_size * self.dims.iter().product::<usize>()
    }
}

/// A compound datatype as named, offset-addressed members.
///
/// `Clone` is a deep copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundTypeDescription {
    pub type_name: String,
    pub id: ObjectId,
    /// Byte size of one compound element.
    pub size: usize,
    members: Vec<CompoundMember>,
}

impl CompoundTypeDescription {
    pub fn new(type_name: impl Into<String>, size: usize) -> CompoundTypeDescription {
        CompoundTypeDescription {
            type_name: type_name.into(),
            id: ObjectId::default(),
            size,
            members: Vec::new(),
        }
    }

    /// Append a member. Fails on a rank above four, an undefined format,
    /// or a member that runs past the compound size.
    pub fn add_member(
        &mut self,
        name: impl Into<String>,
        offset: usize,
        element_size: usize,
        format: FormatSpecifier,
        dims: &[usize],
    ) -> Result<()> {
        let name = name.into();
        if dims.len() > MAX_MEMBER_RANK {
            return Err(Error::CompoundRankTooLarge {
                member: name,
                rank: dims.len(),
            });
        }
        if !format.is_authorable() {
            return Err(Error::UnsupportedFormat(format!("member {name} of format {format}")));
        }
        let member = CompoundMember {
            name,
            offset,
            element_size,
            format,
            dims: dims.to_vec(),
        };
        if member.offset + member.byte_len() > self.size {
            return Err(Error::ShapeMismatch(format!(
                "member {} ends at byte {} of a {}-byte compound",
                member.name,
                member.offset + member.byte_len(),
                self.size
            )));
        }
        self.members.push(member);
        Ok(())
    }

    pub fn members(&self) -> &[CompoundMember] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&CompoundMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Describe a (fixed) compound datatype.
    pub fn from_datatype(
        type_name: impl Into<String>,
        id: ObjectId,
        dt: &Datatype,
    ) -> Result<CompoundTypeDescription> {
        let Datatype::Compound { size, members } = dt else {
            return Err(Error::UnsupportedFormat("not a compound datatype".into()));
        };
        let mut desc = CompoundTypeDescription::new(type_name, *size as usize);
        desc.id = id;
        for m in members {
            let (base, dims) = match &m.datatype {
                Datatype::Array {
                    base_type,
                    dimensions,
                } => (
                    base_type.as_ref(),
                    dimensions.iter().map(|&d| d as usize).collect(),
                ),
                other => (other, Vec::new()),
            };
            let format = from_native_type(base);
            if format == FormatSpecifier::Compound {
                return Err(Error::UnsupportedFormat(format!(
                    "nested compound member {}",
                    m.name
                )));
            }
            desc.add_member(
                m.name.clone(),
                m.byte_offset as usize,
                base.type_size() as usize,
                format,
                &dims,
            )?;
        }
        Ok(desc)
    }

    /// Build the native compound datatype.
    pub fn to_datatype(&self) -> Result<Datatype> {
        let mut members = Vec::with_capacity(self.members.len());
        for m in &self.members {
            if m.format == FormatSpecifier::Compound {
                return Err(Error::UnsupportedFormat(format!(
                    "nested compound member {}",
                    m.name
                )));
            }
            let base = to_native_type(m.format, Some(m.element_size), None)?;
            let datatype = if m.dims.is_empty() {
                base
            } else {
                Datatype::Array {
                    base_type: Box::new(base),
                    dimensions: m.dims.iter().map(|&d| d as u32).collect(),
                }
            };
            members.push(DiskMember {
                name: m.name.clone(),
                byte_offset: m.offset as u64,
                datatype,
            });
        }
        Ok(Datatype::Compound {
            size: self.size as u32,
            members,
        })
    }

    /// Same member layout, ignoring the type name and identity.
    pub fn same_layout(&self, other: &CompoundTypeDescription) -> bool {
        self.size == other.size && self.members == other.members
    }
}
