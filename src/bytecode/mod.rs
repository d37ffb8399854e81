use serde::{Deserialize, Serialize};

/// The instruction set shared between the compiler and the VM.
///
/// The last four opcodes (`Label`, `Comment`, `DebugLine`, `Function`) are
/// metadata: they are consumed by the assembler and the listing printer and
/// never reach the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftLeft,
    ShiftRight,

    Eq,
    NotEq,
    Lt,
    Gt,
    LtE,
    GtE,

    Negate,
    Incr,
    Decr,

    Dup,
    Pop,

    LoadNum,
    LoadNull,
    LoadStr,
    LoadFn,

    Jump,
    JumpTrue,
    JumpFalse,

    NewArray,
    NewObject,
    LoadAt,
    StoreAt,

    LoadGlobal,
    StoreGlobal,
    LoadLocal,
    StoreLocal,
    LoadCapture,
    StoreCapture,
    CaptureInit,

    Call,
    ECall,
    Return,
    Close,

    Label,
    Comment,
    DebugLine,
    Function,
}

/// Opcode names, indexable by discriminant. Process-wide immutable data.
pub static NAMES: &[&str] = &[
    "Add", "Sub", "Mul", "Div", "Mod", "BAnd", "BOr", "BXor", "BNot", "Shl", "Shr", "Eq", "NotEq",
    "Lt", "Gt", "LtE", "GtE", "Negate", "Incr", "Decr", "Dup", "Pop", "LdNum", "LdNull", "LdStr",
    "LdFn", "Jump", "JumpTrue", "JumpFalse", "NewArray", "NewObject", "LoadAt", "StoreAt", "GLoad",
    "GStore", "LLoad", "LStore", "CLoad", "CStore", "CInit", "Call", "ECall", "Return", "Close",
    "Label", "Comment", "DebugLine", "Function",
];

impl Opcode {
    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }

    /// Assembler-only opcodes that never execute.
    pub fn is_metadata(self) -> bool {
        matches!(
            self,
            Opcode::Label | Opcode::Comment | Opcode::DebugLine | Opcode::Function
        )
    }

    /// Net change in value-stack depth when this opcode executes, given its
    /// integer operand. `Call`/`ECall` account for the callee value and the
    /// eventual result; `Return` accounts for the value it hands back.
    pub fn stack_effect(self, a: i32) -> i32 {
        use Opcode::*;
        match self {
            Add | Sub | Mul | Div | Mod => -1,
            BitAnd | BitOr | BitXor | ShiftLeft | ShiftRight => -1,
            Eq | NotEq | Lt | Gt | LtE | GtE => -1,
            BitNot | Negate | Incr | Decr => 0,
            Dup => 1,
            Pop => -1,
            LoadNum | LoadNull | LoadStr | LoadFn => 1,
            Jump => 0,
            JumpTrue | JumpFalse => -1,
            NewArray => 1 - a,
            NewObject => 1 - 2 * a,
            LoadAt => -1,
            StoreAt => -3,
            LoadGlobal | LoadLocal | LoadCapture => 1,
            StoreGlobal | StoreLocal | StoreCapture => -1,
            CaptureInit => 0,
            // pops the callee and `a` arguments, pushes one result
            Call | ECall => -a,
            Return => -1,
            Close => 0,
            Label | Comment | DebugLine | Function => 0,
        }
    }
}

/// One emitted instruction: opcode, integer operands, a numeric operand and
/// an optional string operand.
///
/// Operand meaning varies by opcode: `LoadNum` carries its literal in `n`,
/// local/capture accesses carry slots in `a`/`b`, jumps carry a label name in
/// `text` until the assembler rewrites it into an absolute index in `a`, and
/// `Function` markers carry arity/locals/captures in `a`/`b`/`c` with the
/// vararg flag in `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub n: f64,
    pub text: Option<String>,
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Instruction { op, a: 0, b: 0, c: 0, n: 0.0, text: None }
    }

    pub fn int(op: Opcode, a: i32) -> Self {
        Instruction { a, ..Instruction::new(op) }
    }

    pub fn int2(op: Opcode, a: i32, b: i32) -> Self {
        Instruction { a, b, ..Instruction::new(op) }
    }

    pub fn num(op: Opcode, n: f64) -> Self {
        Instruction { n, ..Instruction::new(op) }
    }

    pub fn text(op: Opcode, text: impl Into<String>) -> Self {
        Instruction { text: Some(text.into()), ..Instruction::new(op) }
    }

    /// A function-boundary marker: name, arity, local count, capture count,
    /// vararg flag.
    pub fn function(name: impl Into<String>, args: u32, locals: u32, captures: u32, vararg: bool) -> Self {
        Instruction {
            op: Opcode::Function,
            a: args as i32,
            b: locals as i32,
            c: captures as i32,
            n: if vararg { 1.0 } else { 0.0 },
            text: Some(name.into()),
        }
    }

    pub fn debug_line(file: impl Into<String>, line: u32) -> Self {
        Instruction {
            op: Opcode::DebugLine,
            n: line as f64,
            text: Some(file.into()),
            ..Instruction::new(Opcode::DebugLine)
        }
    }
}

/// Human-readable listing of an instruction sequence, one function region at
/// a time. Used by `--emit asm`.
pub fn listing(code: &[Instruction]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let mut index = 0usize;
    for ins in code {
        match ins.op {
            Opcode::Function => {
                let name = ins.text.as_deref().unwrap_or("?");
                let vararg = if ins.n != 0.0 { ", vararg" } else { "" };
                let _ = writeln!(
                    out,
                    "\nfunction {} ({} args, {} locals, {} captures{})",
                    name, ins.a, ins.b, ins.c, vararg
                );
                index = 0;
            }
            Opcode::DebugLine => {
                let _ = writeln!(
                    out,
                    "        ; {} line {}",
                    ins.text.as_deref().unwrap_or("?"),
                    ins.n as u32
                );
            }
            Opcode::Comment => {
                let _ = writeln!(out, "        ; {}", ins.text.as_deref().unwrap_or(""));
            }
            Opcode::Label => {
                let _ = writeln!(out, "    {}:", ins.text.as_deref().unwrap_or("?"));
            }
            _ => {
                match &ins.text {
                    Some(s) => {
                        let _ = writeln!(out, "[{:>4}]  {:<10} {:<6} {}", index, ins.op.name(), ins.a, s);
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "[{:>4}]  {:<10} {:<6} {:<6} {}",
                            index,
                            ins.op.name(),
                            ins.a,
                            ins.b,
                            ins.n
                        );
                    }
                }
                index += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_table_covers_every_opcode() {
        assert_eq!(NAMES.len(), Opcode::Function as usize + 1);
        assert_eq!(Opcode::Add.name(), "Add");
        assert_eq!(Opcode::Function.name(), "Function");
        assert_eq!(Opcode::CaptureInit.name(), "CInit");
    }

    #[test]
    fn metadata_opcodes_have_no_stack_effect() {
        for op in [Opcode::Label, Opcode::Comment, Opcode::DebugLine, Opcode::Function] {
            assert!(op.is_metadata());
            assert_eq!(op.stack_effect(0), 0);
        }
        assert!(!Opcode::Call.is_metadata());
    }

    #[test]
    fn call_effect_scales_with_argc() {
        // pops callee + 3 args, pushes one result
        assert_eq!(Opcode::Call.stack_effect(3), -3);
        assert_eq!(Opcode::Call.stack_effect(0), 0);
        assert_eq!(Opcode::NewArray.stack_effect(4), -3);
        assert_eq!(Opcode::NewObject.stack_effect(2), -3);
    }

    #[test]
    fn instruction_serde_round_trip() {
        let ins = Instruction::function("f#3", 2, 5, 1, true);
        let json = serde_json::to_string(&ins).unwrap();
        let back: Instruction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ins);
    }

    #[test]
    fn listing_shows_function_headers() {
        let code = vec![
            Instruction::function("__main", 0, 1, 0, false),
            Instruction::num(Opcode::LoadNum, 42.0),
            Instruction::new(Opcode::Return),
        ];
        let text = listing(&code);
        assert!(text.contains("function __main"));
        assert!(text.contains("LdNum"));
    }
}
