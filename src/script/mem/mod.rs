use std::fmt::{self, Debug, Display, Formatter};

use num_traits::FromPrimitive;
use serde::Serialize;

use crate::script::ErrorKind;

pub use arena::{ArenaObject, InstanceObject, ObjectArena, ObjectHandle};
pub use schema::{FieldSchema, StructDefinition, StructFlags, TypeInfo};
pub use stack::{StackIter, StackValue, ValueStack, STACK_CAPACITY};

pub mod arena;
pub mod schema;
pub mod stack;

/// Base kinds a stack cell can hold. The wire order does not matter, but
/// every kind must fit in the low 7 bits of a [`Tag`] byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum BaseTag {
    /// Placeholder for `let` declarations; fixed by the first assignment
    Acquire = 0,
    /// Reference to an aggregate definition
    Struct,
    /// Reference to a heap-allocated aggregate
    Object,
    /// Opaque pointer-sized value
    Ptr,
    /// Index into the host-function table
    NativeFunction,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    /// Source-text offset of a function body
    Function,
    I64,
    U64,
    F64,
    /// Only meaningful as a declared function return type
    Void,
    /// Leading or interior cell of an inline aggregate instance
    StructInstance,
    /// Terminal cell of an inline aggregate instance
    StructEnd,
}

impl BaseTag {
    /// Storage size in bytes inside field data. `None` for kinds whose size
    /// is not fixed by the tag alone.
    pub fn size_bytes(self) -> Option<usize> {
        match self {
            BaseTag::Acquire => None,
            BaseTag::Void => Some(0),
            BaseTag::I8 | BaseTag::U8 => Some(1),
            BaseTag::I16 | BaseTag::U16 => Some(2),
            BaseTag::I32 | BaseTag::U32 | BaseTag::F32 => Some(4),
            BaseTag::I64
            | BaseTag::U64
            | BaseTag::F64
            | BaseTag::Ptr
            | BaseTag::Function
            | BaseTag::NativeFunction
            | BaseTag::Struct
            | BaseTag::Object => Some(8),
            BaseTag::StructInstance | BaseTag::StructEnd => None,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BaseTag::Struct | BaseTag::Object)
    }
}

/// A slot tag: a [`BaseTag`] plus the dynamic-type flag in the high bit.
/// Values pushed on the stack carry base tags only; the flag belongs to
/// variable slots.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Tag(u8);

impl Tag {
    const DYNAMIC_FLAG: u8 = 0x80;

    pub const ACQUIRE: Tag = Tag(BaseTag::Acquire as u8);
    pub const DYNAMIC: Tag = Tag(BaseTag::Acquire as u8 | Tag::DYNAMIC_FLAG);
    pub const STRUCT: Tag = Tag(BaseTag::Struct as u8);
    pub const OBJECT: Tag = Tag(BaseTag::Object as u8);
    pub const PTR: Tag = Tag(BaseTag::Ptr as u8);
    pub const NATIVE_FUNCTION: Tag = Tag(BaseTag::NativeFunction as u8);
    pub const I8: Tag = Tag(BaseTag::I8 as u8);
    pub const U8: Tag = Tag(BaseTag::U8 as u8);
    pub const I16: Tag = Tag(BaseTag::I16 as u8);
    pub const U16: Tag = Tag(BaseTag::U16 as u8);
    pub const I32: Tag = Tag(BaseTag::I32 as u8);
    pub const U32: Tag = Tag(BaseTag::U32 as u8);
    pub const F32: Tag = Tag(BaseTag::F32 as u8);
    pub const FUNCTION: Tag = Tag(BaseTag::Function as u8);
    pub const I64: Tag = Tag(BaseTag::I64 as u8);
    pub const U64: Tag = Tag(BaseTag::U64 as u8);
    pub const F64: Tag = Tag(BaseTag::F64 as u8);
    pub const VOID: Tag = Tag(BaseTag::Void as u8);
    pub const STRUCT_INSTANCE: Tag = Tag(BaseTag::StructInstance as u8);
    pub const STRUCT_END: Tag = Tag(BaseTag::StructEnd as u8);

    pub fn from_base(base: BaseTag) -> Tag {
        Tag(base as u8)
    }

    pub fn base(self) -> BaseTag {
        BaseTag::from_u8(self.0 & !Tag::DYNAMIC_FLAG).expect("tag byte carries a valid base kind")
    }

    pub fn is_dynamic(self) -> bool {
        self.0 & Tag::DYNAMIC_FLAG != 0
    }

    pub fn with_dynamic(self) -> Tag {
        Tag(self.0 | Tag::DYNAMIC_FLAG)
    }

    pub fn strip_dynamic(self) -> Tag {
        Tag(self.0 & !Tag::DYNAMIC_FLAG)
    }

    pub fn is_reference(self) -> bool {
        self.base().is_reference()
    }

    /// Assignability rule: a slot accepts an incoming value if the slot is
    /// dynamic, still unacquired, or carries the same base kind. The
    /// returned tag is what the slot holds after the write.
    pub fn merge(self, incoming: Tag) -> Result<Tag, ErrorKind> {
        if self.is_dynamic() {
            return Ok(incoming.strip_dynamic().with_dynamic());
        }

        match self.base() {
            BaseTag::Acquire => Ok(incoming.strip_dynamic()),
            base if base == incoming.base() => Ok(self),
            _ => Err(ErrorKind::TypeMismatch),
        }
    }

    pub fn accepts(self, incoming: Tag) -> bool {
        self.merge(incoming).is_ok()
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_dynamic() {
            write!(f, "dyn {:?}", self.base())
        } else {
            write!(f, "{:?}", self.base())
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

/// Cell encoding helpers. Cells always hold the value's little-endian bytes
/// zero-extended to 64 bits, so narrow reads are plain truncations.
macro_rules! cell_codec {
    ($encode:ident, $decode:ident, $ty:ty, $un:ty) => {
        pub fn $encode(value: $ty) -> u64 {
            value as $un as u64
        }

        pub fn $decode(bits: u64) -> $ty {
            bits as $un as $ty
        }
    };
}

cell_codec!(encode_i8, decode_i8, i8, u8);
cell_codec!(encode_u8, decode_u8, u8, u8);
cell_codec!(encode_i16, decode_i16, i16, u16);
cell_codec!(encode_u16, decode_u16, u16, u16);
cell_codec!(encode_i32, decode_i32, i32, u32);
cell_codec!(encode_u32, decode_u32, u32, u32);
cell_codec!(encode_i64, decode_i64, i64, u64);
cell_codec!(encode_u64, decode_u64, u64, u64);

pub fn encode_f32(value: f32) -> u64 {
    value.to_bits() as u64
}

pub fn decode_f32(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

pub fn encode_f64(value: f64) -> u64 {
    value.to_bits()
}

pub fn decode_f64(bits: u64) -> f64 {
    f64::from_bits(bits)
}
