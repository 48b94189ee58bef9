use std::mem;

use crate::script::exec::ident::IdentClass;
use crate::script::mem::schema::FieldSchema;
use crate::script::mem::{BaseTag, ObjectHandle, TypeInfo};
use crate::script::scope::Variable;
use crate::script::{ErrorKind, ExecutionContext};

pub mod call;
pub mod ident;
pub mod literal;
pub mod native;

/// Look-back state of the expression evaluator: the classification of the
/// most recent identifier. `pushed` records whether resolving an aggregate
/// type put the definition value on the stack as a side effect.
enum LastResult {
    Handled,
    Type { info: TypeInfo, pushed: bool },
    Variable(Variable),
}

impl ExecutionContext<'_> {
    /// Statement loop: evaluate an expression, consume an optional `;`,
    /// truncate expression residue back to the variable watermark, stop at
    /// `}` or end of input. A final non-`;`-terminated expression becomes
    /// the block's value; locals are released on exit.
    pub(crate) fn exec_block(&mut self) {
        let entry_top = self.stack.top();
        let saved_watermark = self.stack_variables;
        self.stack_variables = entry_top;

        let scoped = match self.scopes.push_scope(false) {
            Ok(()) => true,
            Err(kind) => {
                self.report(kind, "blocks nested too deep");
                false
            }
        };

        debug!("entering block (top: {})", entry_top);

        loop {
            self.skip_spaces();
            if self.eof() {
                break;
            }
            if self.peek() == b'}' {
                self.pos += 1;
                break;
            }

            let statement_start = self.pos;
            trace!("--- statement (top: {}) ---", self.stack.top());
            let _ = self.exec_expression();

            self.skip_spaces();
            let terminated = self.peek() == b';';
            if terminated {
                self.pos += 1;
            }
            self.skip_spaces();

            if self.peek() == b'}' {
                if terminated {
                    self.stack.truncate_to(&mut self.arena, self.stack_variables);
                }
                self.pos += 1;
                break;
            }

            self.stack.truncate_to(&mut self.arena, self.stack_variables);

            if self.pos == statement_start {
                // the expression consumed nothing; skip the offender
                self.report(
                    ErrorKind::Syntax,
                    format!("unexpected character '{}'", self.peek() as char),
                );
                self.pos += 1;
            }
        }

        // locals go away; a trailing expression value survives as the
        // block's value
        self.stack.collapse_frame(&mut self.arena, entry_top, self.stack_variables);
        self.stack_variables = saved_watermark;
        if scoped {
            self.scopes.pop_scope();
        }

        debug!("leaving block (top: {})", self.stack.top());
    }

    pub(crate) fn exec_expression(&mut self) -> Result<(), ErrorKind> {
        self.exec_expression_inner(false)
    }

    /// Character-dispatch loop. Returns at `;`, `)`, `}` (all left for the
    /// caller) or end of input; `,` additionally stops field-value
    /// expressions inside instance literals.
    pub(crate) fn exec_expression_inner(&mut self, stop_at_comma: bool) -> Result<(), ErrorKind> {
        let mut last = LastResult::Handled;

        while !self.eof() {
            self.skip_spaces();
            let current = self.peek();
            trace!("token '{}' at {}", current as char, self.pos);

            if current.is_ascii_alphabetic() {
                if let LastResult::Type { info, pushed } =
                    mem::replace(&mut last, LastResult::Handled)
                {
                    // type followed by a name: a declaration
                    if pushed {
                        let _ = self.stack.pop(&mut self.arena);
                    }
                    let name = self.parse_identifier();
                    if self.scopes.current().find(&name).is_some() {
                        return Err(self.fail(
                            ErrorKind::Redefined,
                            format!("variable '{}' is already defined", name),
                        ));
                    }
                    self.exec_declaration(name, info)?;
                    continue;
                }

                let name = self.parse_identifier();
                match self.classify_identifier(&name)? {
                    IdentClass::Handled => {}
                    IdentClass::Type { info, source } => {
                        let mut pushed = false;
                        if info.tag.base() == BaseTag::StructInstance {
                            if let Some(variable) = source {
                                // using an aggregate type brings the
                                // definition onto the stack
                                let value = self.stack.value_at(variable.stack_index);
                                if let Err(kind) = self.stack.push_copy(&mut self.arena, value) {
                                    return Err(self.fail(kind, "type reference"));
                                }
                                pushed = true;
                            }
                        }
                        last = LastResult::Type { info, pushed };
                    }
                    IdentClass::Variable(variable) => {
                        let value = self.stack.value_at(variable.stack_index);
                        if let Err(kind) = self.stack.push_copy(&mut self.arena, value) {
                            return Err(self.fail(kind, format!("variable '{}'", variable.name)));
                        }
                        last = LastResult::Variable(variable);
                    }
                }
                continue;
            }

            match current {
                b'0'..=b'9' | b'.' => {
                    let field_access = current == b'.'
                        && matches!(
                            self.stack.last_value().map(|v| v.tag.base()),
                            Ok(BaseTag::Struct | BaseTag::StructInstance | BaseTag::Object)
                        );

                    if field_access {
                        self.exec_field_access()?;
                    } else {
                        self.exec_number()?;
                    }
                    last = LastResult::Handled;
                }
                b'=' => {
                    self.pos += 1;
                    if let LastResult::Variable(variable) =
                        mem::replace(&mut last, LastResult::Handled)
                    {
                        self.exec_expression_inner(stop_at_comma)?;
                        self.exec_assignment(&variable)?;
                    }
                }
                b';' | b')' | b'}' => break,
                b',' => {
                    if stop_at_comma {
                        break;
                    }
                    // statement-sequencing operator: every sub-expression
                    // value stays stacked
                    self.pos += 1;
                    last = LastResult::Handled;
                }
                b'(' => match mem::replace(&mut last, LastResult::Handled) {
                    LastResult::Type { info, pushed } => {
                        if pushed {
                            let _ = self.stack.pop(&mut self.arena);
                        }
                        self.exec_function_literal(info)?;
                    }
                    _ => {
                        self.pos += 1;
                        self.exec_call()?;
                    }
                },
                b'[' => match mem::replace(&mut last, LastResult::Handled) {
                    LastResult::Type { info, pushed } => {
                        if pushed {
                            let _ = self.stack.pop(&mut self.arena);
                        }
                        self.exec_bound_function(info)?;
                    }
                    _ => {
                        self.report(ErrorKind::Syntax, "unexpected '['");
                        self.pos += 1;
                    }
                },
                b'{' => match mem::replace(&mut last, LastResult::Handled) {
                    LastResult::Type { info, pushed }
                        if info.tag.base() == BaseTag::StructInstance =>
                    {
                        if pushed {
                            let _ = self.stack.pop(&mut self.arena);
                        }
                        self.exec_instance_literal(info)?;
                    }
                    _ => {
                        self.pos += 1;
                        self.exec_block();
                    }
                },
                b'/' if self.peek_at(1) == b'/' => {
                    while !self.eof() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                    last = LastResult::Handled;
                }
                _ => {
                    self.report(
                        ErrorKind::Syntax,
                        format!("unknown character '{}'", current as char),
                    );
                    self.pos += 1;
                    last = LastResult::Handled;
                }
            }
        }

        Ok(())
    }

    /// `T name = expr` — evaluate the right-hand side and adopt its cells
    /// in place as the new variable's storage (no copy).
    fn exec_declaration(&mut self, name: String, info: TypeInfo) -> Result<(), ErrorKind> {
        self.skip_spaces();
        if self.peek() != b'=' {
            return Err(self.fail(
                ErrorKind::Syntax,
                format!("expected '=' in declaration of '{}'", name),
            ));
        }
        self.pos += 1;

        self.exec_expression()?;

        let value = match self.stack.last_value() {
            Ok(v) => v,
            Err(kind) => {
                return Err(self.fail(kind, format!("declaration of '{}' has no value", name)))
            }
        };

        let slot_tag = match info.tag.merge(value.tag) {
            Ok(tag) => tag,
            Err(kind) => {
                self.report(
                    kind,
                    format!("cannot initialize '{}' ({} from {})", name, info.tag, value.tag),
                );
                let _ = self.stack.pop(&mut self.arena);
                return Ok(());
            }
        };

        self.stack.set_tag(value.base, slot_tag);
        self.stack_variables = self.stack.top();

        match self.scopes.declare_local(&name, value.base) {
            Ok(variable) => {
                debug!(
                    "declared '{}' at {} as {:?}",
                    variable.name, variable.stack_index, slot_tag
                );
                Ok(())
            }
            Err(kind) => Err(self.fail(kind, format!("variable '{}'", name))),
        }
    }

    /// Assign the evaluated right-hand side (top of stack) to a variable's
    /// slot, then drop it from the stack.
    fn exec_assignment(&mut self, variable: &Variable) -> Result<(), ErrorKind> {
        let value = match self.stack.last_value() {
            Ok(v) => v,
            Err(kind) => {
                return Err(self.fail(
                    kind,
                    format!("assignment to '{}' has no value", variable.name),
                ))
            }
        };

        debug!("assign {:?} to '{}'", value.tag, variable.name);

        if let Err(kind) = self.stack.set_from(&mut self.arena, variable.stack_index, value) {
            self.report(
                kind,
                format!("cannot assign {} to '{}'", value.tag, variable.name),
            );
        }

        let _ = self.stack.pop(&mut self.arena);
        Ok(())
    }

    /// `.name` on the aggregate value currently on top of the stack:
    /// static fields for definitions, instance fields for inline and heap
    /// instances. The field value is pushed.
    fn exec_field_access(&mut self) -> Result<(), ErrorKind> {
        self.pos += 1; // '.'
        let field_name = self.parse_identifier();
        if field_name.is_empty() {
            return Err(self.fail(ErrorKind::Syntax, "expected field name after '.'"));
        }

        let value = match self.stack.last_value() {
            Ok(v) => v,
            Err(kind) => return Err(self.fail(kind, "field access")),
        };

        let handle = ObjectHandle::from_bits(self.stack.cell(value.base));

        let resolved = match value.tag.base() {
            BaseTag::Struct => self.arena.definition(handle).and_then(|def| {
                def.static_field(&field_name)
                    .map(|field| (field.clone(), def.static_data.clone()))
            }),
            BaseTag::StructInstance => {
                let data = self.stack.instance_data(value);
                self.arena
                    .definition(handle)
                    .and_then(|def| def.field(&field_name))
                    .map(|field| (field.clone(), data))
            }
            BaseTag::Object => self.arena.instance(handle).and_then(|instance| {
                self.arena
                    .definition(instance.definition)
                    .and_then(|def| def.field(&field_name))
                    .map(|field| (field.clone(), instance.data.clone()))
            }),
            _ => {
                return Err(self.fail(
                    ErrorKind::TypeMismatch,
                    "field access on a non-aggregate value",
                ))
            }
        };

        let (field, data) = match resolved {
            Some(resolved) => resolved,
            None => {
                return Err(self.fail(
                    ErrorKind::Undefined,
                    format!("no field '{}' on {}", field_name, value.tag),
                ))
            }
        };

        trace!("field '{}' ({:?} at {})", field.name, field.type_info.tag, field.offset);
        self.push_field_value(&field, &data)
    }

    fn push_field_value(&mut self, field: &FieldSchema, data: &[u8]) -> Result<(), ErrorKind> {
        match field.type_info.tag.base() {
            BaseTag::StructInstance => {
                let nested = match field.type_info.definition {
                    Some(h) => h,
                    None => return Err(self.fail(ErrorKind::Undefined, "field without layout")),
                };
                let size = self
                    .arena
                    .definition(nested)
                    .map(|d| d.instance_size)
                    .unwrap_or(0);
                let start = field.offset.min(data.len());
                let end = (field.offset + size).min(data.len());
                let bytes = data[start..end].to_vec();

                match self.stack.push_instance(&mut self.arena, nested, &bytes) {
                    Ok(_) => Ok(()),
                    Err(kind) => Err(self.fail(kind, "field value")),
                }
            }
            _ => {
                let bits = crate::script::mem::schema::read_field_bits(data, field);
                match self.stack.push_cell(&mut self.arena, field.type_info.tag, bits) {
                    Ok(_) => Ok(()),
                    Err(kind) => Err(self.fail(kind, "field value")),
                }
            }
        }
    }
}
