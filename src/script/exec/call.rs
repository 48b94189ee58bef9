use crate::script::mem::{BaseTag, StackValue};
use crate::script::{ErrorKind, ExecutionContext};

/// Call protocol. The callee value sits on top of the stack and the
/// opening `(` has been consumed; the frame base is the cell index just
/// above the callee. Arguments accumulate above the frame base, the callee
/// runs, and cleanup releases the argument cells while shifting any return
/// values down to the frame base.
impl ExecutionContext<'_> {
    pub(crate) fn exec_call(&mut self) -> Result<(), ErrorKind> {
        let callee = match self.stack.last_value() {
            Ok(v) => v,
            Err(_) => return Err(self.fail(ErrorKind::NotCallable, "call with no callee")),
        };

        match callee.tag.base() {
            BaseTag::NativeFunction => self.exec_call_native(callee),
            BaseTag::Function => self.exec_call_script(callee),
            _ => {
                self.report(
                    ErrorKind::NotCallable,
                    format!("value of type {} is not a function", callee.tag),
                );
                // still consume the argument list so the cursor and stack
                // stay consistent
                let frame_base = self.stack.top();
                self.exec_call_args(frame_base)?;
                self.stack.truncate_to(&mut self.arena, frame_base);
                Err(ErrorKind::NotCallable)
            }
        }
    }

    /// Evaluate the argument list up to the matching `)`. The comma is a
    /// non-popping separator, so every argument value remains stacked;
    /// the result is the argument region's size in cells.
    fn exec_call_args(&mut self, frame_base: usize) -> Result<usize, ErrorKind> {
        self.exec_expression()?;

        if self.peek() == b')' {
            self.pos += 1;
        } else {
            return Err(self.fail(ErrorKind::Syntax, "missing ')' after call arguments"));
        }

        Ok(self.stack.top() - frame_base)
    }

    fn exec_call_native(&mut self, callee: StackValue) -> Result<(), ErrorKind> {
        let index = self.stack.cell(callee.base) as usize;
        let frame_base = self.stack.top();
        let args_cells = self.exec_call_args(frame_base)?;

        let function = match self.host.get(index) {
            Some(f) => f,
            None => {
                return Err(self.fail(
                    ErrorKind::NotCallable,
                    format!("no host function at slot {}", index),
                ))
            }
        };

        debug!("calling host function #{} ({} argument cell(s))", index, args_cells);
        function.invoke(self);

        self.exec_call_cleanup(frame_base, args_cells);
        Ok(())
    }

    /// An in-source callee: move the cursor to the recorded body offset,
    /// re-parse the parameter list against the already-pushed arguments
    /// (their cells become the parameter storage, no copy), evaluate the
    /// body, then restore the cursor and clean the frame.
    fn exec_call_script(&mut self, callee: StackValue) -> Result<(), ErrorKind> {
        let body_start = self.stack.cell(callee.base) as usize;
        let frame_base = self.stack.top();
        let args_cells = self.exec_call_args(frame_base)?;

        let return_position = self.pos;
        let saved_watermark = self.stack_variables;

        debug!(
            "calling function at {} ({} argument cell(s))",
            body_start, args_cells
        );

        self.pos = body_start;
        self.skip_spaces();

        if let Err(kind) = self.scopes.push_scope(true) {
            self.report(kind, "call nesting too deep");
            self.pos = return_position;
            self.stack.truncate_to(&mut self.arena, frame_base);
            return Err(kind);
        }

        self.bind_parameters(frame_base, args_cells);

        // the argument cells are owned by the call until cleanup, bound or
        // not; the body's blocks truncate no further down than this
        self.stack.set_top(frame_base + args_cells);
        self.stack_variables = frame_base + args_cells;

        self.skip_spaces();
        if self.peek() == b'=' {
            self.pos += 1;
        }
        if self.peek() == b'>' {
            self.pos += 1;
        }

        let body_result = self.exec_expression();

        self.pos = return_position;
        self.exec_call_cleanup(frame_base, args_cells);
        self.scopes.pop_scope();
        self.stack_variables = saved_watermark;

        body_result
    }

    /// Re-entrant parameter binding: for each `type name` pair, adopt the
    /// next already-pushed argument in place as the parameter's storage.
    fn bind_parameters(&mut self, frame_base: usize, args_cells: usize) {
        if self.peek() == b')' {
            self.pos += 1;
            return;
        }

        let mut consumed = 0;
        self.stack.set_top(frame_base);

        loop {
            self.skip_spaces();
            if !self.peek().is_ascii_alphabetic() {
                break;
            }

            let type_name = self.parse_identifier();
            let type_info = match self.resolve_type(&type_name) {
                Some((info, _)) => info,
                None => {
                    self.report(
                        ErrorKind::Undefined,
                        format!("unknown parameter type '{}'", type_name),
                    );
                    break;
                }
            };

            self.skip_spaces();
            let name = self.parse_identifier();
            self.skip_spaces();

            if consumed >= args_cells {
                self.report(
                    ErrorKind::Syntax,
                    format!("missing argument for parameter '{}'", name),
                );
                break;
            }

            let argument = self.stack.value_at(frame_base + consumed);
            consumed += argument.span;

            let slot_tag = match type_info.tag.merge(argument.tag) {
                Ok(tag) => tag,
                Err(kind) => {
                    self.report(
                        kind,
                        format!("parameter '{}' rejects {}", name, argument.tag),
                    );
                    argument.tag
                }
            };

            self.stack.set_tag(argument.base, slot_tag);
            self.stack.set_top(argument.base + argument.span);
            self.stack_variables = self.stack.top();

            if let Err(kind) = self.scopes.declare_local(&name, argument.base) {
                self.report(kind, format!("parameter '{}'", name));
            }

            if self.peek() != b',' {
                break;
            }
            self.pos += 1;
        }

        if self.peek() == b')' {
            self.pos += 1;
        } else {
            self.report(ErrorKind::Syntax, "missing ')' after parameters");
        }
    }

    fn exec_call_cleanup(&mut self, frame_base: usize, args_cells: usize) {
        self.stack
            .collapse_frame(&mut self.arena, frame_base, frame_base + args_cells);
    }
}
