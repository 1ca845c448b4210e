//! Type registration: primitive ids, field definitions, composite interning.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::layout::{self, Atomicity};
use crate::metadata::MetadataManager;

/// First id handed to a composite type; everything below is reserved for
/// primitives.
pub const FIRST_COMPOSITE_TYPE_ID: u32 = 100;

/// The primitive leaf types a field can decode to.
///
/// Ids are part of the wire contract: observers map `FieldEntry::type_id`
/// straight through this table without consulting the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Primitive {
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    Char = 12,
}

impl Primitive {
    #[inline]
    pub fn type_id(self) -> u32 {
        self as u32
    }

    pub fn from_type_id(id: u32) -> Option<Self> {
        Some(match id {
            1 => Primitive::Bool,
            2 => Primitive::Int8,
            3 => Primitive::Int16,
            4 => Primitive::Int32,
            5 => Primitive::Int64,
            6 => Primitive::UInt8,
            7 => Primitive::UInt16,
            8 => Primitive::UInt32,
            9 => Primitive::UInt64,
            10 => Primitive::Float32,
            11 => Primitive::Float64,
            12 => Primitive::Char,
            _ => return None,
        })
    }

    /// Byte size of a value of this primitive.
    pub fn size(self) -> u32 {
        match self {
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 | Primitive::Char => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float32 => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Float64 => 8,
        }
    }
}

/// One field of a composite type under registration.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef<'a> {
    /// Field name; encode nesting as `parent.child`.
    pub name: &'a str,
    /// Primitive or previously registered composite id.
    pub type_id: u32,
    /// Byte offset within the parent value.
    pub offset: u32,
    /// Byte size of the field.
    pub size: u32,
    /// Read protocol observers must use for this field.
    pub atomicity: Atomicity,
}

impl<'a> FieldDef<'a> {
    /// A primitive field; size is derived from the primitive.
    pub fn new(name: &'a str, primitive: Primitive, offset: u32, atomicity: Atomicity) -> Self {
        Self {
            name,
            type_id: primitive.type_id(),
            offset,
            size: primitive.size(),
            atomicity,
        }
    }

    /// A field of a previously registered composite type.
    pub fn composite(
        name: &'a str,
        type_id: u32,
        offset: u32,
        size: u32,
        atomicity: Atomicity,
    ) -> Self {
        Self {
            name,
            type_id,
            offset,
            size,
            atomicity,
        }
    }
}

/// Interns composite type definitions and hands out dense ids.
pub(crate) struct TypeRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    by_name: HashMap<String, u32>,
    next_id: u32,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                by_name: HashMap::new(),
                next_id: FIRST_COMPOSITE_TYPE_ID,
            }),
        }
    }

    /// Register `(name, size, fields)` and return its id.
    ///
    /// Re-registering an already known name returns the existing id without
    /// touching shared memory; the schema is frozen after first write.
    pub(crate) fn register(
        &self,
        metadata: &MetadataManager,
        name: &str,
        size: u32,
        fields: &[FieldDef<'_>],
    ) -> Result<u32> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }

        let field_offset = if fields.is_empty() {
            0
        } else {
            metadata.allocate_field_entries(fields.len() as u32, |slots| {
                for (slot, def) in slots.iter_mut().zip(fields) {
                    layout::write_inline_name(&mut slot.name, def.name);
                    slot.type_id = def.type_id;
                    slot.offset = def.offset;
                    slot.size = def.size;
                    slot.atomicity = def.atomicity as u8;
                    slot._pad = [0; 3];
                }
            })?
        };

        let id = inner.next_id;
        metadata.allocate_type_entry(|entry| {
            entry.type_id = id;
            entry.size = size;
            entry.field_offset = field_offset;
            entry.field_count = fields.len() as u32;
            layout::write_inline_name(&mut entry.name, name);
        })?;

        inner.next_id += 1;
        inner.by_name.insert(name.to_owned(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_ids_roundtrip() {
        for id in 1..=12 {
            let p = Primitive::from_type_id(id).unwrap();
            assert_eq!(p.type_id(), id);
        }
        assert!(Primitive::from_type_id(0).is_none());
        assert!(Primitive::from_type_id(13).is_none());
        assert!(Primitive::from_type_id(FIRST_COMPOSITE_TYPE_ID).is_none());
    }

    #[test]
    fn primitive_sizes() {
        assert_eq!(Primitive::Bool.size(), 1);
        assert_eq!(Primitive::Int16.size(), 2);
        assert_eq!(Primitive::Float32.size(), 4);
        assert_eq!(Primitive::Float64.size(), 8);
    }

    #[test]
    fn field_def_derives_primitive_size() {
        let f = FieldDef::new("bid", Primitive::Float64, 0, Atomicity::Atomic);
        assert_eq!(f.size, 8);
        assert_eq!(f.type_id, Primitive::Float64.type_id());
    }
}
