//! The bytecode compiler: scope and closure resolution plus instruction
//! emission. One `FunctionContext` exists per function being compiled; the
//! contexts form a tree owned by the root (the implicit entry function).
//! While a function is open its context sits on `CompilerContext::stack`;
//! when it finishes it moves into its parent's child list, so teardown on
//! any path is a plain drop.

pub mod codegen;

use crate::ast::{BinOp, Block, UnOp};
use crate::bytecode::{Instruction, Opcode};

/// Name of the implicit function holding a unit's top-level statements.
pub const ENTRY_POINT: &str = "__main";

/// Local slots and capture slots are addressed with a single byte.
const MAX_LOCALS: u32 = 255;
const MAX_CAPTURES: u32 = 255;

#[derive(Debug, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

#[derive(Debug)]
struct LocalVariable {
    name: String,
    /// Dense per-function slot, 0..N-1.
    slot: u32,
    /// Capture slot, -1 while nothing nested references the variable.
    capture: i32,
    /// Set once the box-init for this variable has been emitted.
    uploaded: bool,
}

#[derive(Debug, Default)]
struct Scope {
    locals: Vec<LocalVariable>,
}

/// Per-function compilation state.
#[derive(Debug)]
pub struct FunctionContext {
    name: String,
    arguments: u32,
    vararg: bool,
    local_index: u32,
    capture_count: u32,
    scopes: Vec<Scope>,
    children: Vec<FunctionContext>,
    out: Vec<Instruction>,
    label_index: u32,
}

impl FunctionContext {
    fn new(name: String, arguments: u32, vararg: bool) -> Self {
        FunctionContext {
            name,
            arguments,
            vararg,
            local_index: 0,
            capture_count: 0,
            scopes: vec![Scope::default()],
            children: Vec::new(),
            out: Vec::new(),
            label_index: 0,
        }
    }
}

/// Where a resolved identifier lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Local(u32),
    /// `level` counts function boundaries between the reference and the
    /// owning function, starting at 1.
    Capture { slot: u32, level: u32 },
    /// Unresolved names fall back to the global table by name — this is the
    /// intended behavior, not an error.
    Global,
}

pub struct CompilerContext {
    stack: Vec<FunctionContext>,
    /// Instance-id counter for disambiguating nested function names. Never
    /// reset, so same-named functions from different compiles cannot
    /// collide.
    uuid: u64,
    file: String,
    last_line: u32,
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerContext {
    pub fn new() -> Self {
        CompilerContext { stack: Vec::new(), uuid: 0, file: String::new(), last_line: 0 }
    }

    /// Compile one unit into a flat instruction sequence: entry marker,
    /// top-level code, implicit return, then every nested function region.
    /// On failure all partially built contexts are torn down and the
    /// compiler is left ready for the next unit.
    pub fn compile(&mut self, block: &Block, file: &str) -> Result<Vec<Instruction>, CompileError> {
        self.file = file.to_string();
        self.last_line = 0;
        self.stack.clear();
        self.stack.push(FunctionContext::new(ENTRY_POINT.to_string(), 0, false));
        // entry marker with placeholder local/capture counts, patched below
        self.emit(Instruction::function(ENTRY_POINT, 0, 0, 0, false));

        let result = self.compile_unit(block);
        if result.is_err() {
            self.stack.clear();
        }
        result
    }

    fn compile_unit(&mut self, block: &Block) -> Result<Vec<Instruction>, CompileError> {
        block.compile(self)?;
        self.emit(Instruction::new(Opcode::LoadNull));
        self.emit_return();

        let Some(mut root) = self.stack.pop() else {
            return Err(self.error("compiler context stack underflow".into()));
        };
        if !self.stack.is_empty() {
            return Err(self.error("unterminated nested function context".into()));
        }

        // re-validate the ceilings for the unit as a whole
        if root.local_index > MAX_LOCALS {
            return Err(self.error("too many locals: over 256 locals in function".into()));
        }
        if root.capture_count > MAX_CAPTURES {
            return Err(self.error("too many captures: over 256 captured variables in function".into()));
        }

        // patch the entry marker now that the final counts are known
        root.out[0].b = root.local_index as i32;
        root.out[0].c = root.capture_count as i32;

        let mut out = Vec::new();
        out.append(&mut root.out);
        for child in root.children.drain(..) {
            flatten(child, &mut out);
        }
        Ok(out)
    }

    fn current(&mut self) -> &mut FunctionContext {
        self.stack.last_mut().expect("a function context is always open during compilation")
    }

    pub(crate) fn emit(&mut self, ins: Instruction) {
        self.current().out.push(ins);
    }

    pub(crate) fn error(&self, message: String) -> CompileError {
        CompileError { file: self.file.clone(), line: self.last_line, message }
    }

    /// Record the source line and emit debug metadata when it changes.
    pub(crate) fn set_line(&mut self, line: u32) {
        if line != self.last_line {
            self.last_line = line;
            let file = self.file.clone();
            self.emit(Instruction::debug_line(file, line));
        }
    }

    pub(crate) fn push_scope(&mut self) {
        self.current().scopes.push(Scope::default());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.current().scopes.pop();
    }

    /// Allocate the next local slot for `name` in the current scope.
    /// Returns `None` without allocating anything when the name is already
    /// declared in this exact scope; shadowing an outer scope is fine.
    pub fn register_local(&mut self, name: &str) -> Result<Option<u32>, CompileError> {
        let already_declared = self
            .current()
            .scopes
            .last()
            .is_some_and(|scope| scope.locals.iter().any(|v| v.name == name));
        if already_declared {
            return Ok(None);
        }

        let ctx = self.current();
        let slot = ctx.local_index;
        ctx.local_index += 1;
        let over_limit = ctx.local_index > MAX_LOCALS;
        if over_limit {
            return Err(self.error("too many locals: over 256 locals in function".into()));
        }
        let var = LocalVariable { name: name.to_string(), slot, capture: -1, uploaded: false };
        if let Some(scope) = self.current().scopes.last_mut() {
            scope.locals.push(var);
        }
        Ok(Some(slot))
    }

    /// Resolve a free identifier: innermost scope outward within the current
    /// function, then each enclosing function outward. Finding the name in
    /// an enclosing function marks that variable captured (allocating its
    /// capture slot on first use) and yields a capture access one level per
    /// function boundary crossed. Anything never found is a global.
    pub fn resolve(&mut self, name: &str) -> Result<Storage, CompileError> {
        let top = self.stack.len() - 1;
        let mut found = None;
        'search: for depth in (0..=top).rev() {
            let ctx = &self.stack[depth];
            for (si, scope) in ctx.scopes.iter().enumerate().rev() {
                if let Some(vi) = scope.locals.iter().rposition(|v| v.name == name) {
                    found = Some((depth, si, vi));
                    break 'search;
                }
            }
        }

        let Some((depth, si, vi)) = found else {
            return Ok(Storage::Global);
        };
        let level = (top - depth) as u32;
        if level == 0 {
            return Ok(Storage::Local(self.stack[depth].scopes[si].locals[vi].slot));
        }

        if self.stack[depth].scopes[si].locals[vi].capture < 0 {
            let next = self.stack[depth].capture_count;
            if next + 1 > MAX_CAPTURES {
                return Err(self
                    .error("too many captures: over 256 captured variables in function".into()));
            }
            self.stack[depth].capture_count = next + 1;
            self.stack[depth].scopes[si].locals[vi].capture = next as i32;
        }
        let slot = self.stack[depth].scopes[si].locals[vi].capture as u32;
        Ok(Storage::Capture { slot, level })
    }

    /// Open a child context for a nested function and emit the load-function
    /// instruction referencing it. The name is disambiguated with an
    /// instance id so repeated same-named functions never collide.
    pub fn add_function(&mut self, name: &str, arguments: u32, vararg: bool) {
        let unique = format!("{}#{}", name, self.uuid);
        self.uuid += 1;
        self.emit(Instruction::text(Opcode::LoadFn, unique.clone()));
        self.stack.push(FunctionContext::new(unique, arguments, vararg));
    }

    /// Close the innermost function context and move it under its parent.
    /// The parent then box-inits every local of its own scope stack that got
    /// captured but has not been uploaded yet — this runs at most once per
    /// variable, however many nested functions capture it.
    pub fn finalize_function(&mut self) -> Result<(), CompileError> {
        if self.stack.len() < 2 {
            return Err(self.error("finalize_function with no open nested function".into()));
        }
        let child = self.stack.pop().expect("checked above");
        let parent = self.current();
        for scope in parent.scopes.iter_mut() {
            for var in scope.locals.iter_mut() {
                if var.capture >= 0 && !var.uploaded {
                    var.uploaded = true;
                    parent
                        .out
                        .push(Instruction::int2(Opcode::CaptureInit, var.slot as i32, var.capture));
                }
            }
        }
        parent.children.push(child);
        Ok(())
    }

    pub(crate) fn make_label(&mut self, hint: &str) -> String {
        let ctx = self.current();
        let label = format!("#{}_{}_{}", hint, ctx.name, ctx.label_index);
        ctx.label_index += 1;
        label
    }

    // ---- small emission helpers, one per instruction family ----

    pub(crate) fn load_number(&mut self, n: f64) {
        self.emit(Instruction::num(Opcode::LoadNum, n));
    }

    pub(crate) fn load_string(&mut self, s: &str) {
        self.emit(Instruction::text(Opcode::LoadStr, s));
    }

    pub(crate) fn jump(&mut self, label: &str) {
        self.emit(Instruction::text(Opcode::Jump, label));
    }

    pub(crate) fn jump_false(&mut self, label: &str) {
        self.emit(Instruction::text(Opcode::JumpFalse, label));
    }

    pub(crate) fn place_label(&mut self, label: &str) {
        self.emit(Instruction::text(Opcode::Label, label));
    }

    /// Surface binary operators map 1:1 onto opcodes; compound assignment
    /// reuses the same opcode and leaves the load/store pair to the caller.
    pub(crate) fn binary_operation(&mut self, op: BinOp) {
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Mod => Opcode::Mod,
            BinOp::BitAnd => Opcode::BitAnd,
            BinOp::BitOr => Opcode::BitOr,
            BinOp::BitXor => Opcode::BitXor,
            BinOp::ShiftLeft => Opcode::ShiftLeft,
            BinOp::ShiftRight => Opcode::ShiftRight,
            BinOp::Eq => Opcode::Eq,
            BinOp::NotEq => Opcode::NotEq,
            BinOp::Lt => Opcode::Lt,
            BinOp::Gt => Opcode::Gt,
            BinOp::LtE => Opcode::LtE,
            BinOp::GtE => Opcode::GtE,
        };
        self.emit(Instruction::new(opcode));
    }

    pub(crate) fn unary_operation(&mut self, op: UnOp) {
        let opcode = match op {
            UnOp::Negate => Opcode::Negate,
            UnOp::BitNot => Opcode::BitNot,
            UnOp::Incr => Opcode::Incr,
            UnOp::Decr => Opcode::Decr,
        };
        self.emit(Instruction::new(opcode));
    }

    /// Emit the close-captures / return pair ending a function body.
    pub(crate) fn emit_return(&mut self) {
        self.emit(Instruction::new(Opcode::Close));
        self.emit(Instruction::new(Opcode::Return));
    }
}

fn flatten(mut ctx: FunctionContext, out: &mut Vec<Instruction>) {
    out.push(Instruction::function(
        ctx.name.clone(),
        ctx.arguments,
        ctx.local_index,
        ctx.capture_count,
        ctx.vararg,
    ));
    out.append(&mut ctx.out);
    for child in ctx.children.drain(..) {
        flatten(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn compile_src(src: &str) -> Result<Vec<Instruction>, CompileError> {
        let ast = parse(lex(src), "test")?;
        CompilerContext::new().compile(&ast, "test")
    }

    fn count_ops(code: &[Instruction], op: Opcode) -> usize {
        code.iter().filter(|i| i.op == op).count()
    }

    #[test]
    fn entry_marker_is_patched_with_counts() {
        let code = compile_src("local a = 1; local b = 2;").unwrap();
        assert_eq!(code[0].op, Opcode::Function);
        assert_eq!(code[0].text.as_deref(), Some(ENTRY_POINT));
        assert_eq!(code[0].b, 2); // two locals
        assert_eq!(code[0].c, 0); // nothing captured
    }

    #[test]
    fn one_box_init_regardless_of_capturing_function_count() {
        let code = compile_src(
            "local x = 1;\
             function f() { return x; }\
             function g() { return x + x; }\
             function h() { return x; }",
        )
        .unwrap();
        assert_eq!(count_ops(&code, Opcode::CaptureInit), 1);
        assert_eq!(code[0].c, 1);
    }

    #[test]
    fn capture_through_two_function_boundaries() {
        let code = compile_src(
            "local x = 1;\
             function outer() {\
                 function inner() { return x; }\
                 return inner;\
             }",
        )
        .unwrap();
        // inner reads x two levels up
        let cload = code
            .iter()
            .find(|i| i.op == Opcode::LoadCapture)
            .expect("capture load emitted");
        assert_eq!(cload.b, 2);
        // the box-init lands in the entry function, not in outer
        assert_eq!(count_ops(&code, Opcode::CaptureInit), 1);
    }

    #[test]
    fn unresolved_names_fall_back_to_globals() {
        let code = compile_src("return missing;").unwrap();
        let load = code.iter().find(|i| i.op == Opcode::LoadGlobal).expect("global load");
        assert_eq!(load.text.as_deref(), Some("missing"));
    }

    #[test]
    fn shadowing_across_scopes_allowed_redeclaration_rejected() {
        assert!(compile_src("local x = 1; { local x = 2; }").is_ok());
        let err = compile_src("local x = 1; local x = 2;").unwrap_err();
        assert!(err.message.contains("already declared"));
    }

    #[test]
    fn local_slots_are_dense_and_unique() {
        let code = compile_src("local a = 1; { local b = 2; } local c = 3;").unwrap();
        let stores: Vec<i32> =
            code.iter().filter(|i| i.op == Opcode::StoreLocal).map(|i| i.a).collect();
        assert_eq!(stores, vec![0, 1, 2]);
    }

    #[test]
    fn too_many_locals_is_a_compile_error() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("local v{} = {};", i, i));
        }
        let err = compile_src(&src).unwrap_err();
        assert!(err.message.contains("locals"), "got: {}", err.message);
        assert_eq!(err.file, "test");
    }

    #[test]
    fn compiler_is_reusable_after_failure() {
        let mut compiler = CompilerContext::new();
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("local v{} = {};", i, i));
        }
        let bad = parse(lex(&src), "bad").unwrap();
        assert!(compiler.compile(&bad, "bad").is_err());

        let good = parse(lex("local a = 1; return a;"), "good").unwrap();
        let code = compiler.compile(&good, "good").unwrap();
        assert_eq!(code[0].b, 1);
    }

    #[test]
    fn nested_function_names_are_disambiguated() {
        let mut compiler = CompilerContext::new();
        let first = parse(lex("function f() { return 1; }"), "a").unwrap();
        let second = parse(lex("function f() { return 2; }"), "b").unwrap();
        let code_a = compiler.compile(&first, "a").unwrap();
        let code_b = compiler.compile(&second, "b").unwrap();

        let name_of = |code: &[Instruction]| {
            code.iter()
                .find(|i| i.op == Opcode::LoadFn)
                .and_then(|i| i.text.clone())
                .expect("load-function emitted")
        };
        assert_ne!(name_of(&code_a), name_of(&code_b));
    }

    #[test]
    fn function_regions_follow_the_entry_body() {
        let code = compile_src("function f() { return 1; } return f();").unwrap();
        let markers: Vec<usize> = code
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::Function)
            .map(|(pos, _)| pos)
            .collect();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0], 0);
        // the entry body's Return sits before the nested region begins
        let ret_positions: Vec<usize> = code
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::Return)
            .map(|(pos, _)| pos)
            .collect();
        assert!(ret_positions.iter().any(|&p| p < markers[1]));
    }

    #[test]
    fn compound_assignment_reuses_plain_opcode() {
        let code = compile_src("local x = 1; x += 2;").unwrap();
        assert_eq!(count_ops(&code, Opcode::Add), 1);
    }

    #[test]
    fn statements_are_stack_neutral() {
        // simulate the documented stack effects over the entry region only
        let code = compile_src(
            "local x = 1; x = x + 2; print(x); if (x > 1) { x += 1; } while (x < 0) { x++; }",
        )
        .unwrap();
        let mut depth: i32 = 0;
        for ins in &code[1..] {
            if ins.op == Opcode::Function {
                break;
            }
            depth += ins.op.stack_effect(ins.a);
            assert!(depth >= 0, "stack underflow at {:?}", ins);
        }
        // every statement is neutral; the implicit return consumed LoadNull
        assert_eq!(depth, 0);
    }

    #[test]
    fn vararg_flag_lands_on_function_marker() {
        let code = compile_src("function f(a, ...rest) { return rest; }").unwrap();
        let marker = code
            .iter()
            .find(|i| i.op == Opcode::Function && i.text.as_deref() != Some(ENTRY_POINT))
            .expect("nested marker");
        assert_eq!(marker.a, 2); // a + rest
        assert_eq!(marker.n, 1.0);
    }
}
