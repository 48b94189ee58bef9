use crate::script::mem::schema::write_field_bits;
use crate::script::mem::{
    encode_f32, encode_f64, ArenaObject, BaseTag, StructDefinition, Tag, TypeInfo,
};
use crate::script::{ErrorKind, ExecutionContext};

bitflags! {
    struct NumberSuffix: u8 {
        const FRACTION = 0x1;
        const FLOAT = 0x2;
        const LONG = 0x4;
        const UNSIGNED = 0x8;
    }
}

impl ExecutionContext<'_> {
    /// Numeric literal: digits with at most one `.`, then any of the
    /// suffix letters `f`, `l`, `u` in any order. `1` is i32, `1.0` f64,
    /// `1.0f` f32, `1l` i64, `1u` u32, `1lu` u64. Out-of-range values
    /// clamp to the selected type.
    pub(crate) fn exec_number(&mut self) -> Result<(), ErrorKind> {
        let mut digits = String::new();
        let mut suffix = NumberSuffix::empty();

        while !self.eof() {
            let current = self.peek();
            if current.is_ascii_digit() {
                digits.push(self.bump() as char);
            } else if current == b'.' && !suffix.contains(NumberSuffix::FRACTION) {
                suffix |= NumberSuffix::FRACTION;
                digits.push(self.bump() as char);
            } else {
                break;
            }
        }

        loop {
            match self.peek() {
                b'f' => suffix |= NumberSuffix::FLOAT,
                b'l' => suffix |= NumberSuffix::LONG,
                b'u' => suffix |= NumberSuffix::UNSIGNED,
                _ => break,
            }
            self.pos += 1;
        }

        let (tag, bits) = if suffix.contains(NumberSuffix::FRACTION) {
            let value: f64 = digits.parse().unwrap_or(0.0);
            if suffix.contains(NumberSuffix::FLOAT) {
                (Tag::F32, encode_f32(value as f32))
            } else {
                (Tag::F64, encode_f64(value))
            }
        } else {
            // literals carry no sign, so clamping is against the maximum
            let value: u128 = digits.parse().unwrap_or(u128::MAX);
            if suffix.contains(NumberSuffix::LONG | NumberSuffix::UNSIGNED) {
                (Tag::U64, value.min(u64::MAX as u128) as u64)
            } else if suffix.contains(NumberSuffix::LONG) {
                (Tag::I64, value.min(i64::MAX as u128) as u64)
            } else if suffix.contains(NumberSuffix::UNSIGNED) {
                (Tag::U32, value.min(u32::MAX as u128) as u64)
            } else {
                (Tag::I32, value.min(i32::MAX as u128) as u64)
            }
        };

        debug!("literal '{}' as {:?}", digits, tag);
        match self.stack.push_cell(&mut self.arena, tag, bits) {
            Ok(_) => Ok(()),
            Err(kind) => Err(self.fail(kind, "numeric literal")),
        }
    }

    /// Function literal: record the offset of the parameter list, skip the
    /// body without evaluating it, push a FUNCTION value holding the
    /// offset. The declared return type is informational.
    pub(crate) fn exec_function_literal(&mut self, return_type: TypeInfo) -> Result<(), ErrorKind> {
        if self.peek() == b'(' {
            self.pos += 1;
        }
        self.skip_spaces();

        let body_start = self.pos;
        debug!(
            "function declaration at {} (returns {:?})",
            body_start, return_type.tag
        );

        // parameter syntax has no nesting
        while self.peek() != b')' {
            if self.eof() {
                return Err(self.fail(ErrorKind::Syntax, "unterminated parameter list"));
            }
            self.pos += 1;
        }
        self.pos += 1;

        self.skip_spaces();
        if self.peek() == b'=' {
            self.pos += 1;
        }
        if self.peek() == b'>' {
            self.pos += 1;
        }
        self.skip_spaces();

        if self.peek() == b'{' {
            self.pos += 1;
            let mut nested = 1;
            while nested > 0 {
                if self.eof() {
                    return Err(self.fail(ErrorKind::Syntax, "unterminated function body"));
                }
                match self.bump() {
                    b'{' => nested += 1,
                    b'}' => nested -= 1,
                    _ => {}
                }
            }
        } else {
            // single-expression body runs to the ';'
            while !self.eof() && self.peek() != b';' {
                self.pos += 1;
            }
            if self.peek() == b';' {
                self.pos += 1;
            }
        }

        match self
            .stack
            .push_cell(&mut self.arena, Tag::FUNCTION, body_start as u64)
        {
            Ok(_) => Ok(()),
            Err(kind) => Err(self.fail(kind, "function literal")),
        }
    }

    /// `[captures] (params) => body` — the bracketed header is consumed
    /// and ignored, then the plain function literal applies.
    pub(crate) fn exec_bound_function(&mut self, return_type: TypeInfo) -> Result<(), ErrorKind> {
        if self.peek() == b'[' {
            self.pos += 1;
        }
        while !self.eof() && self.peek() != b']' {
            self.pos += 1;
        }
        if self.peek() == b']' {
            self.pos += 1;
        }
        self.skip_spaces();

        self.exec_function_literal(return_type)
    }

    /// `struct Name? { field; ... }` — build a new aggregate definition.
    /// Static methods evaluate to FUNCTION values that stay stacked until
    /// the closing brace copies them into the definition's static data.
    pub(crate) fn exec_struct(&mut self) -> Result<(), ErrorKind> {
        self.skip_spaces();

        let name = if self.peek().is_ascii_alphabetic() {
            let parsed = self.parse_identifier();
            self.skip_spaces();
            Some(parsed)
        } else {
            None
        };

        if self.peek() != b'{' {
            return Err(self.fail(ErrorKind::Syntax, "expected '{' after struct"));
        }
        self.pos += 1;

        debug!("struct definition '{}'", name.as_deref().unwrap_or("<anonymous>"));

        let mut definition = StructDefinition::new(name);
        let static_start = self.stack.top();

        loop {
            self.skip_spaces();
            match self.peek() {
                b';' => {
                    self.pos += 1;
                }
                b'}' => {
                    self.pos += 1;
                    break;
                }
                0 => return Err(self.fail(ErrorKind::Syntax, "missing '}' in struct body")),
                c if c.is_ascii_alphabetic() => self.exec_struct_field(&mut definition)?,
                c => {
                    self.report(
                        ErrorKind::Syntax,
                        format!("unexpected character '{}' in struct body", c as char),
                    );
                    self.pos += 1;
                }
            }
        }

        // move the accumulated method values into the static data
        definition.static_data = vec![0u8; definition.static_size];
        for (index, field) in definition.statics.iter().enumerate() {
            let bits = self.stack.cell(static_start + index);
            write_field_bits(&mut definition.static_data, field, bits);
        }
        self.stack.set_top(static_start);

        let handle = self.arena.create(ArenaObject::Definition(definition));
        match self
            .stack
            .push_cell(&mut self.arena, Tag::STRUCT, handle.to_bits())
        {
            Ok(_) => Ok(()),
            Err(kind) => Err(self.fail(kind, "struct literal")),
        }
    }

    /// One struct body entry: `type name;` is an instance field,
    /// `type name(...) => ...` a static method.
    fn exec_struct_field(&mut self, definition: &mut StructDefinition) -> Result<(), ErrorKind> {
        self.skip_spaces();
        let type_name = self.parse_identifier();
        let (type_info, _) = match self.resolve_type(&type_name) {
            Some(resolved) => resolved,
            None => {
                return Err(self.fail(
                    ErrorKind::Undefined,
                    format!("unknown field type '{}'", type_name),
                ))
            }
        };

        self.skip_spaces();
        let field_name = self.parse_identifier();
        if field_name.is_empty() {
            return Err(self.fail(ErrorKind::Syntax, "expected field name"));
        }
        self.skip_spaces();

        if self.peek() == b'(' {
            self.exec_function_literal(type_info)?;
            definition.push_static(field_name, TypeInfo::native(Tag::FUNCTION), 8);
            return Ok(());
        }

        let (size, needs_drop) = match type_info.tag.base() {
            BaseTag::StructInstance => {
                let nested = match type_info.definition {
                    Some(h) => h,
                    None => return Err(self.fail(ErrorKind::Undefined, "field without layout")),
                };
                let (size, nested_drop) = match self.arena.definition(nested) {
                    Some(def) => (
                        def.instance_size,
                        def.flags.contains(crate::script::mem::StructFlags::NEEDS_DROP),
                    ),
                    None => return Err(self.fail(ErrorKind::Undefined, "dangling field type")),
                };
                // the schema keeps its own reference to the layout
                self.arena.retain(nested);
                (size, nested_drop)
            }
            _ if type_info.tag.is_dynamic() => (8, false),
            base => match base.size_bytes() {
                Some(size) if size > 0 => (size, type_info.tag.is_reference()),
                _ => {
                    return Err(self.fail(
                        ErrorKind::Syntax,
                        format!("field '{}' requires a sized type", field_name),
                    ))
                }
            },
        };

        definition.push_field(field_name, type_info, size, needs_drop);
        Ok(())
    }

    /// `X { field: expr, ... }` — build an inline instance of an aggregate
    /// definition. Field values stay stacked until the instance is pushed,
    /// then the whole scaffold collapses away beneath it.
    pub(crate) fn exec_instance_literal(&mut self, info: TypeInfo) -> Result<(), ErrorKind> {
        let definition = match info.definition {
            Some(h) => h,
            None => return Err(self.fail(ErrorKind::Undefined, "instance literal without layout")),
        };

        let (instance_size, fields) = match self.arena.definition(definition) {
            Some(def) => (def.instance_size, def.fields.clone()),
            None => return Err(self.fail(ErrorKind::Undefined, "dangling definition")),
        };

        self.pos += 1; // '{'
        let literal_base = self.stack.top();
        let mut data = vec![0u8; instance_size];

        loop {
            self.skip_spaces();
            match self.peek() {
                b'}' => {
                    self.pos += 1;
                    break;
                }
                b',' => {
                    self.pos += 1;
                }
                0 => return Err(self.fail(ErrorKind::Syntax, "missing '}' in instance literal")),
                c if c.is_ascii_alphabetic() => {
                    let field_name = self.parse_identifier();
                    self.skip_spaces();
                    if self.peek() != b':' {
                        return Err(
                            self.fail(ErrorKind::Syntax, "expected ':' after field name")
                        );
                    }
                    self.pos += 1;

                    self.exec_expression_inner(true)?;

                    let value = match self.stack.last_value() {
                        Ok(v) => v,
                        Err(kind) => {
                            return Err(
                                self.fail(kind, format!("field '{}' has no value", field_name))
                            )
                        }
                    };

                    match fields.iter().find(|f| f.name == field_name) {
                        None => {
                            self.report(
                                ErrorKind::Undefined,
                                format!("no field '{}'", field_name),
                            );
                        }
                        Some(field) if !field.type_info.tag.accepts(value.tag) => {
                            self.report(
                                ErrorKind::TypeMismatch,
                                format!("field '{}' rejects {}", field_name, value.tag),
                            );
                        }
                        Some(field) if field.type_info.tag.base() == BaseTag::StructInstance => {
                            // nested instances are embedded without their
                            // leading definition cell
                            let nested_data = self.stack.instance_data(value);
                            let end = (field.offset + nested_data.len()).min(data.len());
                            data[field.offset..end]
                                .copy_from_slice(&nested_data[..end - field.offset]);
                        }
                        Some(field) => {
                            write_field_bits(&mut data, field, self.stack.cell(value.base));
                        }
                    }
                }
                c => {
                    self.report(
                        ErrorKind::Syntax,
                        format!("unexpected character '{}' in instance literal", c as char),
                    );
                    self.pos += 1;
                }
            }
        }

        // push first so the references the data points at are still held
        // by the stacked field values, then drop the scaffold
        let base = match self.stack.push_instance(&mut self.arena, definition, &data) {
            Ok(base) => base,
            Err(kind) => {
                self.stack.truncate_to(&mut self.arena, literal_base);
                return Err(self.fail(kind, "instance literal"));
            }
        };
        self.stack.collapse_frame(&mut self.arena, literal_base, base);
        Ok(())
    }
}
