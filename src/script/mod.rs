use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use crate::script::exec::native::{install_builtins, HostFunction, HostTable};
use crate::script::mem::{ObjectArena, Tag, ValueStack};
use crate::script::scope::ScopeTable;

pub mod exec;
pub mod mem;
pub mod scope;
pub mod source;

/// Everything that can go wrong during evaluation. Failures are reported
/// through the diagnostics channel and never unwind; evaluation continues
/// best-effort with the next statement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Pop or read on an empty stack
    StackUnderflow,
    /// The fixed-capacity stack is full
    StackOverflow,
    /// A slot rejected an incoming value's tag
    TypeMismatch,
    /// Identifier does not resolve to a variable or type
    Undefined,
    /// Duplicate declaration within one scope
    Redefined,
    /// Call on a value that is not a function
    NotCallable,
    /// Malformed source that the evaluator cannot continue through
    Syntax,
    /// Calls nested deeper than the scope table allows
    ScopeOverflow,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StackUnderflow => "stack underflow",
            ErrorKind::StackOverflow => "stack overflow",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::Undefined => "undefined identifier",
            ErrorKind::Redefined => "redefined identifier",
            ErrorKind::NotCallable => "not callable",
            ErrorKind::Syntax => "syntax error",
            ErrorKind::ScopeOverflow => "scope overflow",
        };
        f.write_str(name)
    }
}

/// One entry in the diagnostics stream: the kind, the byte position the
/// cursor was at, and a human-readable detail.
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub position: usize,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "error at byte {}: {} ({})", self.position, self.message, self.kind)
    }
}

/// A single evaluation of a single source text: the cursor, the typed
/// stack, the scope table, the object arena and the host-function table all
/// live here. Strictly single-threaded; concurrent evaluations use
/// separate contexts.
pub struct ExecutionContext<'src> {
    pub(crate) source: &'src [u8],
    pub(crate) pos: usize,
    pub stack: ValueStack,
    pub arena: ObjectArena,
    pub(crate) scopes: ScopeTable,
    /// Highest stack cell owned by a declared variable; expression residue
    /// above this is truncated at statement boundaries.
    pub(crate) stack_variables: usize,
    pub(crate) host: HostTable,
    diagnostics: Vec<Diagnostic>,
    output: Vec<String>,
}

impl<'src> ExecutionContext<'src> {
    pub fn new(source: &'src str) -> Self {
        ExecutionContext {
            source: source.as_bytes(),
            pos: 0,
            stack: ValueStack::new(),
            arena: ObjectArena::new(),
            scopes: ScopeTable::new(),
            stack_variables: 0,
            host: HostTable::default(),
            diagnostics: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Execute the source as an implicit top-level block.
    pub fn run(&mut self) {
        debug!("executing {} byte(s) of source", self.source.len());
        self.exec_block();

        #[cfg(feature = "debug")]
        self.stack.debug_print();

        if !self.diagnostics.is_empty() {
            warn!("finished with {} diagnostic(s)", self.diagnostics.len());
        }
    }

    /// Bind a host function into the global scope under `name`. Globals
    /// occupy stack cells below the program's first watermark, so block
    /// truncation never touches them.
    pub fn register_native(&mut self, name: &str, function: impl HostFunction) {
        let index = self.host.add(name, function);

        let stack_index = match self
            .stack
            .push_cell(&mut self.arena, Tag::NATIVE_FUNCTION, index as u64)
        {
            Ok(i) => i,
            Err(kind) => {
                self.report(kind, format!("cannot seed global '{}'", name));
                return;
            }
        };
        self.stack_variables = self.stack.top();

        if let Err(kind) = self.scopes.declare_global(name, stack_index) {
            self.report(kind, format!("global '{}'", name));
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Append a line to the program's output (the `print` channel).
    pub fn emit(&mut self, line: String) {
        debug!("output: {}", line);
        self.output.push(line);
    }

    pub fn report(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            kind,
            position: self.pos,
            message: message.into(),
        };
        error!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    /// Report and hand the kind back, for `return Err(self.fail(..))` at
    /// the site that detected the failure. Errors propagating further out
    /// are control flow only and must not be re-reported.
    pub(crate) fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> ErrorKind {
        self.report(kind, message);
        kind
    }
}

/// Host entry point: execute `source` with the built-in globals installed
/// and forward its output. Diagnostics go to the log; embedders that need
/// to inspect them drive [`ExecutionContext`] directly.
pub fn run(source: &str) {
    let mut context = ExecutionContext::new(source);
    install_builtins(&mut context);
    context.run();

    for line in context.output() {
        println!("{}", line);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn eval(source: &str) -> ExecutionContext<'_> {
        let mut context = ExecutionContext::new(source);
        install_builtins(&mut context);
        context.run();
        context
    }

    fn kinds(context: &ExecutionContext<'_>) -> Vec<ErrorKind> {
        context.diagnostics().iter().map(|d| d.kind).collect()
    }

    #[test]
    fn prints_a_variable() {
        let context = eval("var a = 2; print(a);");
        assert_eq!(context.output(), ["2"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn reassigns_through_a_native_call() {
        let context = eval("var a = 2; a = add(a, 10); print(a);");
        assert_eq!(context.output(), ["12"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn calls_a_script_function_with_a_parameter() {
        let context = eval("var b = void(i32 x) => { x = add(x, 5); print(x); }; b(7);");
        assert_eq!(context.output(), ["12"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn evaluates_nested_call_arguments() {
        let context = eval("let a = 2; let b = 3; print(add(a, b));");
        assert_eq!(context.output(), ["5"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn static_methods_return_their_body_value() {
        let context = eval("let X = struct { i32 new() => { 17 } }; let c = X.new(); print(c);");
        assert_eq!(context.output(), ["17"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn declaring_an_i32_from_a_function_is_rejected() {
        let context = eval("var b = void(i32 x) => { print(x); }; i32 c = b;");
        assert!(kinds(&context).contains(&ErrorKind::TypeMismatch));
        assert!(context.output().is_empty());
    }

    #[test]
    fn a_mismatched_assignment_leaves_the_slot_untouched() {
        let context = eval("var b = void() => { 1; }; i32 c = 5; c = b; print(c);");
        assert!(kinds(&context).contains(&ErrorKind::TypeMismatch));
        assert_eq!(context.output(), ["5"]);
    }

    #[test]
    fn statement_residue_is_truncated_to_the_watermark() {
        let context = eval("1; 2; 3;");
        assert!(context.diagnostics().is_empty());
        assert_eq!(context.stack.top(), context.stack_variables);
    }

    #[test]
    fn block_locals_are_released_on_exit() {
        let context = eval("{ var a = 2; print(a); } print(a);");
        assert_eq!(context.output(), ["2"]);
        assert!(kinds(&context).contains(&ErrorKind::Undefined));
    }

    #[test]
    fn blocks_yield_their_final_expression() {
        let context = eval("print({ 17 });");
        assert_eq!(context.output(), ["17"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn semicolon_terminated_blocks_yield_nothing() {
        let context = eval("{ 17; } print(3);");
        assert_eq!(context.output(), ["3"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn aggregate_references_are_balanced_at_program_end() {
        let context = eval("let X = struct { i32 new() => { 17 } }; let c = X.new(); print(c);");
        assert_eq!(context.arena.live_objects(), 0);
    }

    #[test]
    fn instance_literals_and_field_access() {
        let context =
            eval("let X = struct { i32 a; i32 b; }; let v = X { a: 40, b: 2 }; print(v.a); print(v.b);");
        assert_eq!(context.output(), ["40", "2"]);
        assert!(context.diagnostics().is_empty());
        assert_eq!(context.arena.live_objects(), 0);
    }

    #[test]
    fn nested_aggregate_definitions_release_cleanly() {
        let context = eval("let X = struct { i32 a; }; let Y = struct { X inner; i32 c; };");
        assert!(context.diagnostics().is_empty());
        assert_eq!(context.arena.live_objects(), 0);
    }

    #[test]
    fn line_comments_are_skipped() {
        let context = eval("// nothing to see\nvar a = 1; print(a); // trailing\n");
        assert_eq!(context.output(), ["1"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn unknown_identifiers_are_reported() {
        let context = eval("print(q);");
        assert!(kinds(&context).contains(&ErrorKind::Undefined));
        assert!(context.output().is_empty());
    }

    #[test]
    fn dynamic_variables_rebind_to_any_kind() {
        let context = eval("var a = 2; a = 2.5; a = 3; print(a);");
        assert_eq!(context.output(), ["3"]);
        assert!(context.diagnostics().is_empty());
    }

    #[test]
    fn dynamic_rebinding_keeps_equal_span_instances() {
        let context = eval(
            "let X = struct { i32 a; i32 b; }; var v = X { a: 1, b: 2 }; v = X { a: 5, b: 6 }; print(v.a);",
        );
        assert_eq!(context.output(), ["5"]);
        assert!(context.diagnostics().is_empty());
        assert_eq!(context.arena.live_objects(), 0);
    }

    #[test]
    fn dynamic_rebinding_rejects_span_changes() {
        let context = eval("var x = 2; let X = struct { i32 a; }; x = X { a: 1 }; print(x);");
        assert!(kinds(&context).contains(&ErrorKind::TypeMismatch));
        assert_eq!(context.output(), ["2"]);
        assert_eq!(context.arena.live_objects(), 0);
    }

    #[test]
    fn let_variables_keep_their_acquired_kind() {
        let context = eval("let a = 2; a = 2.5; print(a);");
        assert!(kinds(&context).contains(&ErrorKind::TypeMismatch));
        assert_eq!(context.output(), ["2"]);
    }

    #[test]
    fn duplicate_declarations_are_reported() {
        let context = eval("var a = 1; var a = 2;");
        assert!(kinds(&context).contains(&ErrorKind::Redefined));
    }

    #[test]
    fn calling_a_number_is_not_callable() {
        let context = eval("var a = 2; a();");
        assert!(kinds(&context).contains(&ErrorKind::NotCallable));
    }

    #[test]
    fn print_rejects_non_integer_values() {
        let context = eval("print(2.5);");
        assert!(kinds(&context).contains(&ErrorKind::TypeMismatch));
        assert!(context.output().is_empty());
    }

    #[test]
    fn globals_can_be_shadowed_by_locals() {
        let context = eval("var print = 7; add(print, 1);");
        assert!(context.diagnostics().is_empty());
    }

    fn double(ctx: &mut ExecutionContext) {
        use crate::script::mem::{decode_i32, encode_i32};

        let value = match ctx.stack.iter().next() {
            Some(v) => v,
            None => return,
        };
        let doubled = decode_i32(ctx.stack.cell(value.base)).wrapping_mul(2);
        let _ = ctx
            .stack
            .push_cell(&mut ctx.arena, Tag::I32, encode_i32(doubled));
    }

    #[test]
    fn custom_natives_reach_the_stack() {
        let mut context = ExecutionContext::new("print(double(21));");
        install_builtins(&mut context);
        context.register_native("double", double);
        context.run();
        assert_eq!(context.output(), ["42"]);
    }
}
