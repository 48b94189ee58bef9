use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::script::mem::{BaseTag, ObjectHandle, Tag, TypeInfo};
use crate::script::scope::Variable;
use crate::script::{ErrorKind, ExecutionContext};

lazy_static! {
    static ref TYPE_KEYWORDS: HashMap<&'static str, Tag> = {
        let mut table = HashMap::new();
        table.insert("var", Tag::DYNAMIC);
        table.insert("let", Tag::ACQUIRE);
        table.insert("i8", Tag::I8);
        table.insert("u8", Tag::U8);
        table.insert("i16", Tag::I16);
        table.insert("u16", Tag::U16);
        table.insert("i32", Tag::I32);
        table.insert("u32", Tag::U32);
        table.insert("i64", Tag::I64);
        table.insert("u64", Tag::U64);
        table.insert("f32", Tag::F32);
        table.insert("f64", Tag::F64);
        table.insert("void", Tag::VOID);
        table
    };
}

/// What a freshly parsed identifier turned out to be.
pub enum IdentClass {
    /// A keyword that was executed in place (`struct`)
    Handled,
    /// A declaration keyword, primitive type, or variable holding an
    /// aggregate definition. `source` is the variable the definition came
    /// from, if any.
    Type {
        info: TypeInfo,
        source: Option<Variable>,
    },
    Variable(Variable),
}

impl ExecutionContext<'_> {
    /// Pure type resolution: the keyword table first, then variables whose
    /// current value is an aggregate definition. No stack side effects, so
    /// parameter lists and struct bodies can resolve types safely.
    pub(crate) fn resolve_type(&self, identifier: &str) -> Option<(TypeInfo, Option<Variable>)> {
        if let Some(&tag) = TYPE_KEYWORDS.get(identifier) {
            return Some((TypeInfo::native(tag), None));
        }

        let variable = self.scopes.lookup(identifier)?;
        let value = self.stack.value_at(variable.stack_index);
        if value.tag.base() == BaseTag::Struct {
            let definition = ObjectHandle::from_bits(self.stack.cell(value.base));
            return Some((TypeInfo::instance_of(definition), Some(variable)));
        }

        None
    }

    /// Classify an identifier in expression position. `struct` opens an
    /// aggregate definition literal; unresolved names are `Undefined`.
    pub(crate) fn classify_identifier(
        &mut self,
        identifier: &str,
    ) -> Result<IdentClass, ErrorKind> {
        if identifier == "struct" {
            self.exec_struct()?;
            return Ok(IdentClass::Handled);
        }

        if let Some((info, source)) = self.resolve_type(identifier) {
            return Ok(IdentClass::Type { info, source });
        }

        match self.scopes.lookup(identifier) {
            Some(variable) => Ok(IdentClass::Variable(variable)),
            None => Err(self.fail(
                ErrorKind::Undefined,
                format!("variable '{}' is not defined in the current scope", identifier),
            )),
        }
    }
}
