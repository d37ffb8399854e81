//! AST-to-bytecode emission. Every node compiles through a single
//! `compile(&mut CompilerContext)` entry point; all output is emission
//! side-effect. Expressions leave exactly one value on the stack,
//! statements leave none.

use super::{CompileError, CompilerContext, Storage};
use crate::ast::*;
use crate::bytecode::{Instruction, Opcode};

impl Block {
    pub fn compile(&self, cx: &mut CompilerContext) -> Result<(), CompileError> {
        cx.push_scope();
        for stmt in &self.stmts {
            stmt.compile(cx)?;
        }
        cx.pop_scope();
        Ok(())
    }
}

impl Stmt {
    pub fn compile(&self, cx: &mut CompilerContext) -> Result<(), CompileError> {
        match self {
            Stmt::Expr { expr, line } => {
                cx.set_line(*line);
                expr.compile(cx)?;
                cx.emit(Instruction::new(Opcode::Pop));
                Ok(())
            }

            Stmt::Local { names, values, line } => {
                cx.set_line(*line);
                // right-hand sides evaluate before any name is bound, so
                // `local x = x;` reads the outer x
                for value in values {
                    value.compile(cx)?;
                }
                for _ in names.len()..values.len() {
                    cx.emit(Instruction::new(Opcode::Pop));
                }
                for _ in values.len()..names.len() {
                    cx.emit(Instruction::new(Opcode::LoadNull));
                }
                let mut slots = Vec::with_capacity(names.len());
                for name in names {
                    match cx.register_local(name)? {
                        Some(slot) => slots.push(slot),
                        None => {
                            return Err(cx.error(format!(
                                "variable '{}' is already declared in this scope",
                                name
                            )));
                        }
                    }
                }
                for slot in slots.iter().rev() {
                    cx.emit(Instruction::int(Opcode::StoreLocal, *slot as i32));
                }
                Ok(())
            }

            Stmt::If { branches, otherwise, line } => {
                cx.set_line(*line);
                let end = cx.make_label("endif");
                for (cond, block) in branches {
                    let next = cx.make_label("else");
                    cond.compile(cx)?;
                    cx.jump_false(&next);
                    block.compile(cx)?;
                    cx.jump(&end);
                    cx.place_label(&next);
                }
                if let Some(block) = otherwise {
                    block.compile(cx)?;
                }
                cx.place_label(&end);
                Ok(())
            }

            Stmt::While { cond, body, line } => {
                cx.set_line(*line);
                let top = cx.make_label("while");
                let end = cx.make_label("endwhile");
                cx.place_label(&top);
                cond.compile(cx)?;
                cx.jump_false(&end);
                body.compile(cx)?;
                cx.jump(&top);
                cx.place_label(&end);
                Ok(())
            }

            Stmt::For { init, cond, step, body, line } => {
                cx.set_line(*line);
                cx.push_scope();
                init.compile(cx)?;
                let top = cx.make_label("for");
                let end = cx.make_label("endfor");
                cx.place_label(&top);
                cond.compile(cx)?;
                cx.jump_false(&end);
                body.compile(cx)?;
                step.compile(cx)?;
                cx.emit(Instruction::new(Opcode::Pop));
                cx.jump(&top);
                cx.place_label(&end);
                cx.pop_scope();
                Ok(())
            }

            Stmt::ForEach { name, container, body, line } => {
                cx.set_line(*line);
                compile_foreach(cx, name, container, body)
            }

            Stmt::Function(def) => {
                cx.set_line(def.line);
                compile_function(cx, def)?;
                // bind the closure to its name wherever that name resolves
                let name = def.name.as_deref().unwrap_or_default();
                compile_store(cx, name)
            }

            Stmt::Return { value, line } => {
                cx.set_line(*line);
                match value {
                    Some(expr) => expr.compile(cx)?,
                    None => cx.emit(Instruction::new(Opcode::LoadNull)),
                }
                cx.emit_return();
                Ok(())
            }

            Stmt::Block(block) => block.compile(cx),
        }
    }
}

impl Expr {
    pub fn compile(&self, cx: &mut CompilerContext) -> Result<(), CompileError> {
        match self {
            Expr::Number(n) => {
                cx.load_number(*n);
                Ok(())
            }
            Expr::Str(s) => {
                cx.load_string(s);
                Ok(())
            }
            // booleans are numeric at the instruction level
            Expr::Bool(b) => {
                cx.load_number(if *b { 1.0 } else { 0.0 });
                Ok(())
            }
            Expr::Null => {
                cx.emit(Instruction::new(Opcode::LoadNull));
                Ok(())
            }

            Expr::Name(name) => compile_load(cx, name),

            Expr::Array(items) => {
                for item in items {
                    item.compile(cx)?;
                }
                cx.emit(Instruction::int(Opcode::NewArray, items.len() as i32));
                Ok(())
            }

            Expr::Object(fields) => {
                for (key, value) in fields {
                    cx.load_string(key);
                    value.compile(cx)?;
                }
                cx.emit(Instruction::int(Opcode::NewObject, fields.len() as i32));
                Ok(())
            }

            Expr::Index { object, index } => {
                object.compile(cx)?;
                index.compile(cx)?;
                cx.emit(Instruction::new(Opcode::LoadAt));
                Ok(())
            }

            Expr::Call { callee, args } => {
                for arg in args {
                    arg.compile(cx)?;
                }
                callee.compile(cx)?;
                cx.emit(Instruction::int(Opcode::Call, args.len() as i32));
                Ok(())
            }

            Expr::Binary { op, lhs, rhs } => {
                lhs.compile(cx)?;
                rhs.compile(cx)?;
                cx.binary_operation(*op);
                Ok(())
            }

            Expr::Prefix { op, expr } => match op {
                UnOp::Negate | UnOp::BitNot => {
                    expr.compile(cx)?;
                    cx.unary_operation(*op);
                    Ok(())
                }
                // ++x: update in place, yield the new value
                UnOp::Incr | UnOp::Decr => {
                    if expr.is_storable() {
                        compile_target_load(cx, expr)?;
                        cx.unary_operation(*op);
                        cx.emit(Instruction::new(Opcode::Dup));
                        compile_target_store(cx, expr)
                    } else {
                        expr.compile(cx)?;
                        cx.unary_operation(*op);
                        Ok(())
                    }
                }
            },

            // x++: yield the value before the update
            Expr::Postfix { op, expr } => {
                compile_target_load(cx, expr)?;
                cx.emit(Instruction::new(Opcode::Dup));
                cx.unary_operation(*op);
                compile_target_store(cx, expr)
            }

            Expr::Assign { target, value } => {
                value.compile(cx)?;
                cx.emit(Instruction::new(Opcode::Dup));
                compile_target_store(cx, target)
            }

            Expr::OpAssign { op, target, value } => {
                compile_target_load(cx, target)?;
                value.compile(cx)?;
                cx.binary_operation(*op);
                cx.emit(Instruction::new(Opcode::Dup));
                compile_target_store(cx, target)
            }

            Expr::Lambda(def) => compile_function(cx, def),
        }
    }
}

/// Compile a function body into a fresh child context and leave the closure
/// value on the stack.
fn compile_function(cx: &mut CompilerContext, def: &FunctionDef) -> Result<(), CompileError> {
    let display = def.name.as_deref().unwrap_or("lambda");
    let arity = (def.params.len() + usize::from(def.vararg.is_some())) as u32;
    cx.add_function(display, arity, def.vararg.is_some());

    for param in &def.params {
        if cx.register_local(param)?.is_none() {
            return Err(cx.error(format!("duplicate parameter '{}'", param)));
        }
    }
    if let Some(rest) = &def.vararg {
        if cx.register_local(rest)?.is_none() {
            return Err(cx.error(format!("duplicate parameter '{}'", rest)));
        }
    }

    def.body.compile(cx)?;
    cx.emit(Instruction::new(Opcode::LoadNull));
    cx.emit_return();
    cx.finalize_function()
}

fn compile_load(cx: &mut CompilerContext, name: &str) -> Result<(), CompileError> {
    match cx.resolve(name)? {
        Storage::Local(slot) => cx.emit(Instruction::int(Opcode::LoadLocal, slot as i32)),
        Storage::Capture { slot, level } => {
            cx.emit(Instruction::int2(Opcode::LoadCapture, slot as i32, level as i32))
        }
        Storage::Global => cx.emit(Instruction::text(Opcode::LoadGlobal, name)),
    }
    Ok(())
}

fn compile_store(cx: &mut CompilerContext, name: &str) -> Result<(), CompileError> {
    match cx.resolve(name)? {
        Storage::Local(slot) => cx.emit(Instruction::int(Opcode::StoreLocal, slot as i32)),
        Storage::Capture { slot, level } => {
            cx.emit(Instruction::int2(Opcode::StoreCapture, slot as i32, level as i32))
        }
        Storage::Global => cx.emit(Instruction::text(Opcode::StoreGlobal, name)),
    }
    Ok(())
}

/// Push the current value of an assignable location.
fn compile_target_load(cx: &mut CompilerContext, target: &Expr) -> Result<(), CompileError> {
    match target {
        Expr::Name(name) => compile_load(cx, name),
        Expr::Index { object, index } => {
            object.compile(cx)?;
            index.compile(cx)?;
            cx.emit(Instruction::new(Opcode::LoadAt));
            Ok(())
        }
        other => Err(cx.error(format!("cannot load from {:?}", other))),
    }
}

/// Store the top of the stack into an assignable location, consuming it.
/// Index targets re-evaluate their object and index expressions.
fn compile_target_store(cx: &mut CompilerContext, target: &Expr) -> Result<(), CompileError> {
    match target {
        Expr::Name(name) => compile_store(cx, name),
        Expr::Index { object, index } => {
            object.compile(cx)?;
            index.compile(cx)?;
            cx.emit(Instruction::new(Opcode::StoreAt));
            Ok(())
        }
        other => Err(cx.error(format!("cannot assign to {:?}", other))),
    }
}

/// Lower `for (local k in container)` onto hidden locals and the `len`
/// builtin. The hidden names carry a `#` so no source identifier can ever
/// collide with them.
fn compile_foreach(
    cx: &mut CompilerContext,
    name: &str,
    container: &Expr,
    body: &Block,
) -> Result<(), CompileError> {
    cx.push_scope();

    let cont = cx.register_local("#container")?.ok_or_else(|| {
        cx.error("internal: hidden foreach local collided".into())
    })?;
    container.compile(cx)?;
    cx.emit(Instruction::int(Opcode::StoreLocal, cont as i32));

    let idx = cx
        .register_local("#index")?
        .ok_or_else(|| cx.error("internal: hidden foreach local collided".into()))?;
    cx.load_number(0.0);
    cx.emit(Instruction::int(Opcode::StoreLocal, idx as i32));

    let var = cx
        .register_local(name)?
        .ok_or_else(|| cx.error(format!("variable '{}' is already declared in this scope", name)))?;

    let top = cx.make_label("foreach");
    let end = cx.make_label("endforeach");

    cx.place_label(&top);
    cx.emit(Instruction::int(Opcode::LoadLocal, idx as i32));
    cx.emit(Instruction::int(Opcode::LoadLocal, cont as i32));
    cx.emit(Instruction::text(Opcode::LoadGlobal, "len"));
    cx.emit(Instruction::int(Opcode::Call, 1));
    cx.emit(Instruction::new(Opcode::Lt));
    cx.jump_false(&end);

    cx.emit(Instruction::int(Opcode::LoadLocal, cont as i32));
    cx.emit(Instruction::int(Opcode::LoadLocal, idx as i32));
    cx.emit(Instruction::new(Opcode::LoadAt));
    cx.emit(Instruction::int(Opcode::StoreLocal, var as i32));

    body.compile(cx)?;

    cx.emit(Instruction::int(Opcode::LoadLocal, idx as i32));
    cx.emit(Instruction::new(Opcode::Incr));
    cx.emit(Instruction::int(Opcode::StoreLocal, idx as i32));
    cx.jump(&top);
    cx.place_label(&end);

    cx.pop_scope();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ENTRY_POINT;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn compile_src(src: &str) -> Vec<Instruction> {
        let ast = parse(lex(src), "test").unwrap();
        CompilerContext::new().compile(&ast, "test").unwrap()
    }

    fn ops(code: &[Instruction]) -> Vec<Opcode> {
        code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn expression_statement_ends_with_pop() {
        let code = compile_src("1 + 2;");
        assert!(
            ops(&code).windows(2).any(|w| w == [Opcode::Add, Opcode::Pop]),
            "expected Add then Pop in {:?}",
            ops(&code)
        );
    }

    #[test]
    fn local_with_fewer_values_pads_with_null() {
        let code = compile_src("local a, b = 1;");
        let nulls = code.iter().filter(|i| i.op == Opcode::LoadNull).count();
        // one pad plus the implicit return value
        assert_eq!(nulls, 2);
        let stores = code.iter().filter(|i| i.op == Opcode::StoreLocal).count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn foreach_lowers_onto_len_builtin() {
        let code = compile_src("for (local v in [1, 2, 3]) { print(v); }");
        assert!(
            code.iter()
                .any(|i| i.op == Opcode::LoadGlobal && i.text.as_deref() == Some("len")),
            "foreach should call len"
        );
        assert!(code.iter().any(|i| i.op == Opcode::LoadAt));
    }

    #[test]
    fn named_function_stores_to_global() {
        let code = compile_src("function greet() { return 1; }");
        assert!(
            code.iter()
                .any(|i| i.op == Opcode::StoreGlobal && i.text.as_deref() == Some("greet"))
        );
    }

    #[test]
    fn function_assigned_to_local_stores_locally() {
        let code = compile_src("local f = function() { return 1; };");
        assert!(code.iter().any(|i| i.op == Opcode::StoreLocal));
    }

    #[test]
    fn jump_labels_resolve_within_one_function() {
        let code = compile_src("if (1) { 2; } else { 3; } while (0) { 1; }");
        for ins in &code {
            if matches!(ins.op, Opcode::Jump | Opcode::JumpTrue | Opcode::JumpFalse) {
                let label = ins.text.as_deref().expect("unresolved jumps carry labels");
                assert!(
                    code.iter()
                        .any(|l| l.op == Opcode::Label && l.text.as_deref() == Some(label)),
                    "label {} must be placed",
                    label
                );
            }
        }
    }

    #[test]
    fn every_function_region_ends_with_close_return() {
        let code = compile_src("function f() { return 2; } return f();");
        let entry_region: Vec<Opcode> = code
            .iter()
            .skip(1)
            .take_while(|i| i.op != Opcode::Function)
            .map(|i| i.op)
            .collect();
        assert_eq!(
            &entry_region[entry_region.len() - 2..],
            &[Opcode::Close, Opcode::Return]
        );
        assert_eq!(code.last().map(|i| i.op), Some(Opcode::Return));
    }

    #[test]
    fn debug_lines_carry_the_unit_name() {
        let code = compile_src("local a = 1;\nlocal b = 2;");
        let debug: Vec<&Instruction> =
            code.iter().filter(|i| i.op == Opcode::DebugLine).collect();
        assert!(debug.len() >= 2);
        assert!(debug.iter().all(|i| i.text.as_deref() == Some("test")));
        assert_eq!(debug[0].n, 1.0);
        assert_eq!(debug[1].n, 2.0);
    }

    #[test]
    fn entry_marker_first_everywhere() {
        let code = compile_src("return 1;");
        assert_eq!(code[0].op, Opcode::Function);
        assert_eq!(code[0].text.as_deref(), Some(ENTRY_POINT));
    }
}
