use std::fmt::{self, Debug, Formatter};

use byteorder::{ByteOrder, LittleEndian};

use crate::script::mem::{BaseTag, ObjectHandle, Tag};

bitflags! {
    pub struct StructFlags: u8 {
        /// Instances embed references that must be released on teardown
        const NEEDS_DROP = 0x2;
    }
}

/// A resolved type: the tag plus, for aggregate instances, the definition
/// the layout comes from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TypeInfo {
    pub tag: Tag,
    pub definition: Option<ObjectHandle>,
}

impl TypeInfo {
    pub fn native(tag: Tag) -> TypeInfo {
        TypeInfo {
            tag,
            definition: None,
        }
    }

    pub fn instance_of(definition: ObjectHandle) -> TypeInfo {
        TypeInfo {
            tag: Tag::STRUCT_INSTANCE,
            definition: Some(definition),
        }
    }
}

/// One field of an aggregate definition. `offset` is a byte offset into the
/// instance data (instance fields) or into `static_data` (static fields).
#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub type_info: TypeInfo,
    pub offset: usize,
}

/// An aggregate definition: instance-field layout, static-field layout and
/// the owned bytes backing the static fields. Lives on the object arena and
/// is reference counted by every stack slot, instance cell and schema entry
/// that points at it.
pub struct StructDefinition {
    pub name: Option<String>,
    pub fields: Vec<FieldSchema>,
    pub statics: Vec<FieldSchema>,
    pub flags: StructFlags,
    pub instance_size: usize,
    pub static_size: usize,
    pub static_data: Vec<u8>,
}

impl StructDefinition {
    pub fn new(name: Option<String>) -> Self {
        StructDefinition {
            name,
            fields: Vec::new(),
            statics: Vec::new(),
            flags: StructFlags::empty(),
            instance_size: 0,
            static_size: 0,
            static_data: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn static_field(&self, name: &str) -> Option<&FieldSchema> {
        self.statics.iter().find(|f| f.name == name)
    }

    /// Append an instance field of `size` bytes at the current end of the
    /// layout. `needs_drop` marks fields whose teardown must release
    /// embedded references.
    pub fn push_field(&mut self, name: String, type_info: TypeInfo, size: usize, needs_drop: bool) {
        self.fields.push(FieldSchema {
            name,
            type_info,
            offset: self.instance_size,
        });
        self.instance_size += size;

        if needs_drop {
            self.flags |= StructFlags::NEEDS_DROP;
        }
    }

    pub fn push_static(&mut self, name: String, type_info: TypeInfo, size: usize) {
        self.statics.push(FieldSchema {
            name,
            type_info,
            offset: self.static_size,
        });
        self.static_size += size;

        if type_info.tag.is_reference() {
            self.flags |= StructFlags::NEEDS_DROP;
        }
    }

    /// Cells an inline instance of this definition occupies: the leading
    /// definition-reference cell, the field data, and a terminal cell for
    /// the end sentinel (empty aggregates still take two cells).
    pub fn stack_span(&self) -> usize {
        1 + data_cells(self.instance_size).max(1)
    }
}

impl Debug for StructDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructDefinition")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .field("statics", &self.statics.len())
            .field("instance_size", &self.instance_size)
            .field("static_size", &self.static_size)
            .field("flags", &self.flags)
            .finish()
    }
}

pub fn data_cells(size_bytes: usize) -> usize {
    (size_bytes + 7) / 8
}

/// Read a field out of packed little-endian data, widened to cell bits.
pub fn read_field_bits(data: &[u8], field: &FieldSchema) -> u64 {
    let size = match field.type_info.tag.base() {
        BaseTag::StructInstance | BaseTag::StructEnd => return 0,
        base => base.size_bytes().unwrap_or(0),
    };

    if size == 0 || field.offset + size > data.len() {
        return 0;
    }

    LittleEndian::read_uint(&data[field.offset..], size)
}

/// Store cell bits into packed little-endian data, truncated to the field's
/// width.
pub fn write_field_bits(data: &mut [u8], field: &FieldSchema, bits: u64) {
    let size = match field.type_info.tag.base() {
        BaseTag::StructInstance | BaseTag::StructEnd => return,
        base => base.size_bytes().unwrap_or(0),
    };

    if size == 0 || field.offset + size > data.len() {
        return;
    }

    LittleEndian::write_uint(&mut data[field.offset..], bits & width_mask(size), size);
}

fn width_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::script::mem::{decode_i16, decode_i32, encode_i16, encode_i32};

    #[test]
    fn layout_appends_in_order() {
        let mut def = StructDefinition::new(Some("pair".to_string()));
        def.push_field("first".to_string(), TypeInfo::native(Tag::I32), 4, false);
        def.push_field("second".to_string(), TypeInfo::native(Tag::I16), 2, false);

        assert_eq!(def.field("first").unwrap().offset, 0);
        assert_eq!(def.field("second").unwrap().offset, 4);
        assert_eq!(def.instance_size, 6);
        assert_eq!(def.stack_span(), 2);
        assert!(!def.flags.contains(StructFlags::NEEDS_DROP));
    }

    #[test]
    fn reference_fields_mark_the_definition() {
        let mut def = StructDefinition::new(None);
        def.push_field("other".to_string(), TypeInfo::native(Tag::STRUCT), 8, true);
        assert!(def.flags.contains(StructFlags::NEEDS_DROP));
    }

    #[test]
    fn packed_fields_round_trip() {
        let mut def = StructDefinition::new(None);
        def.push_field("a".to_string(), TypeInfo::native(Tag::I32), 4, false);
        def.push_field("b".to_string(), TypeInfo::native(Tag::I16), 2, false);

        let mut data = vec![0u8; def.instance_size];
        write_field_bits(&mut data, def.field("a").unwrap(), encode_i32(-77));
        write_field_bits(&mut data, def.field("b").unwrap(), encode_i16(-3));

        let a = read_field_bits(&data, def.field("a").unwrap());
        let b = read_field_bits(&data, def.field("b").unwrap());
        assert_eq!(decode_i32(a), -77);
        assert_eq!(decode_i16(b), -3);
    }

    #[test]
    fn empty_definition_still_spans_two_cells() {
        let def = StructDefinition::new(None);
        assert_eq!(def.stack_span(), 2);
    }
}
