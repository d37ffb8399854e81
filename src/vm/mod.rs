//! The virtual machine: assembles flat instruction sequences into an
//! executable stream and runs them against a bounded value stack and call
//! stack, with closure capture through shared cells and an incremental GC
//! interleaved between instruction dispatches.

pub mod gc;
pub mod value;

pub use gc::GcConfig;
pub use value::{Handle, Value, format_number};

use std::any::Any;
use std::collections::HashMap;

use crate::bytecode::{Instruction, Opcode};
use crate::compiler::{CompileError, CompilerContext, ENTRY_POINT};
use crate::lexer;
use crate::parser;
use gc::Heap;
use value::{Closure, Env, HeapObject, Userdata};

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// Index into the executable stream where the error was raised.
    pub ip: Option<usize>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), ip: None }
    }
}

/// Host callbacks. A native receives the argument window and answers
/// through [`Engine::give`]; it never touches the value stack itself, so a
/// misbehaving callback cannot corrupt stack-depth accounting.
pub type NativeFn = fn(&mut Engine, &[Value]) -> Result<(), RuntimeError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Value-stack capacity; overflow is a reported error.
    pub stack_size: usize,
    /// Call-stack capacity; recursion past it is a reported, recoverable
    /// error.
    pub max_call_depth: usize,
    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { stack_size: 2048, max_call_depth: 400, gc: GcConfig::default() }
    }
}

/// An assembled function: where its region starts and what its frame needs.
#[derive(Debug, Clone)]
struct Function {
    name: String,
    offset: usize,
    args: u32,
    locals: u32,
    captures: u32,
    vararg: bool,
}

#[derive(Debug, Clone)]
struct DebugRecord {
    code: usize,
    file: String,
    line: u32,
}

struct CallFrame {
    return_ip: usize,
    closure: Handle,
    /// First stack slot belonging to this frame; locals live at base..base+N.
    base: usize,
    /// This invocation's capture-cell array, allocated on first use and
    /// detached again by `Close`.
    own_env: Option<Handle>,
}

/// Return address of a frame entered from the host rather than from
/// bytecode.
const HOST_BOUNDARY: usize = usize::MAX;

pub struct Engine {
    config: EngineConfig,
    compiler: CompilerContext,

    ins: Vec<Instruction>,
    functions: Vec<Function>,
    function_names: HashMap<String, u32>,
    debug: Vec<DebugRecord>,

    globals: Vec<Value>,
    global_names: HashMap<String, u32>,
    natives: Vec<NativeFn>,

    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,

    /// Result slot natives answer through.
    result: Option<Value>,
    /// Argument windows of natives currently executing, kept as GC roots
    /// while a callback re-enters the engine.
    native_args: Vec<Vec<Value>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Name of the implicit entry function of every compiled unit.
    pub const ENTRY: &'static str = ENTRY_POINT;

    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = Engine {
            heap: Heap::new(config.gc),
            config,
            compiler: CompilerContext::new(),
            ins: Vec::new(),
            functions: Vec::new(),
            function_names: HashMap::new(),
            debug: Vec::new(),
            globals: Vec::new(),
            global_names: HashMap::new(),
            natives: Vec::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            result: None,
            native_args: Vec::new(),
        };
        engine.register_native("print", native_print);
        engine.register_native("len", native_len);
        engine.register_native("gc", native_gc);
        engine
    }

    // ---- embedding surface ----

    /// Compile a unit to its instruction sequence without executing it.
    pub fn compile(&mut self, source: &str, unit: &str) -> Result<Vec<Instruction>, CompileError> {
        let tokens = lexer::lex(source);
        let ast = parser::parse(tokens, unit)?;
        self.compiler.compile(&ast, unit)
    }

    /// Compile and execute a unit, returning the entry point's value.
    pub fn run(&mut self, source: &str, unit: &str) -> Result<Value, crate::Error> {
        let code = self.compile(source, unit)?;
        Ok(self.assemble(&code)?)
    }

    /// Call a function by name: a global holding a callable wins, otherwise
    /// an assembled function region of that name (e.g. [`Engine::ENTRY`]).
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        if let Some(v) = self.get_global(name) {
            if !matches!(v, Value::Null) {
                return self.call_value(v, args);
            }
        }
        if let Some(&idx) = self.function_names.get(name) {
            return self.call_function(idx, args);
        }
        Err(RuntimeError::new(format!("unknown function '{}'", name)))
    }

    /// Call a callable value. On error the value and call stacks are
    /// restored to their pre-call depths and the error carries a symbolic
    /// trace, so the engine stays usable.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let sp = self.stack.len();
        let fp = self.frames.len();
        match self.call_value_inner(callee, args) {
            Ok(v) => Ok(v),
            Err(e) => {
                let decorated = self.decorate(e, fp);
                self.stack.truncate(sp);
                self.frames.truncate(fp);
                Err(decorated)
            }
        }
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.global_names.get(name).and_then(|&i| self.globals.get(i as usize)).copied()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let slot = self.global_slot(name);
        self.globals[slot as usize] = value;
    }

    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        let idx = self.natives.len() as u32;
        self.natives.push(f);
        self.set_global(name, Value::Native(idx));
    }

    /// Hand a result back from a native callback.
    pub fn give(&mut self, value: Value) {
        self.result = Some(value);
    }

    /// Synchronous full garbage collection.
    pub fn collect(&mut self) {
        let roots = self.roots();
        self.heap.collect_full(&roots);
    }

    // ---- value construction and inspection for hosts ----

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::Str(self.heap.alloc(HeapObject::Str(s.to_string())))
    }

    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        Value::Array(self.heap.alloc(HeapObject::Array(items)))
    }

    pub fn new_object(&mut self) -> Value {
        Value::Object(self.heap.alloc(HeapObject::Object(Default::default())))
    }

    pub fn new_userdata(&mut self, data: Box<dyn Any>, proto: Option<Value>) -> Value {
        let proto = proto.and_then(|v| match v {
            Value::Object(h) => Some(h),
            _ => None,
        });
        Value::Userdata(self.heap.alloc(HeapObject::Userdata(Userdata { data, proto })))
    }

    pub fn string_of(&self, v: Value) -> Option<&str> {
        match v {
            Value::Str(h) => self.heap.string(h),
            _ => None,
        }
    }

    pub fn array_of(&self, v: Value) -> Option<&Vec<Value>> {
        match v {
            Value::Array(h) => self.heap.array(h),
            _ => None,
        }
    }

    pub fn field_of(&self, v: Value, key: &str) -> Option<Value> {
        match v {
            Value::Object(h) => self.heap.object(h).and_then(|m| m.get(key)).copied(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, v: Value, key: &str, value: Value) -> bool {
        match v {
            Value::Object(h) => self.heap.object_set(h, key.to_string(), value),
            _ => false,
        }
    }

    /// Objects currently alive on the heap. Exposed for GC diagnostics.
    pub fn heap_size(&self) -> usize {
        self.heap.live_count()
    }

    /// Render a value the way `print` does.
    pub fn render(&self, v: Value) -> String {
        let mut seen = Vec::new();
        self.render_inner(v, &mut seen)
    }

    fn render_inner(&self, v: Value, seen: &mut Vec<Handle>) -> String {
        match v {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Str(h) => self.heap.string(h).unwrap_or_default().to_string(),
            Value::Array(h) => {
                if seen.contains(&h) {
                    return "[...]".to_string();
                }
                seen.push(h);
                let body = self
                    .heap
                    .array(h)
                    .map(|items| {
                        items
                            .iter()
                            .map(|&i| self.render_inner(i, seen))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                seen.pop();
                format!("[{}]", body)
            }
            Value::Object(h) => {
                if seen.contains(&h) {
                    return "{...}".to_string();
                }
                seen.push(h);
                let body = self
                    .heap
                    .object(h)
                    .map(|map| {
                        map.iter()
                            .map(|(k, &f)| format!("{} = {}", k, self.render_inner(f, seen)))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                seen.pop();
                format!("{{{}}}", body)
            }
            Value::Closure(h) => {
                let name = self
                    .heap
                    .closure(h)
                    .and_then(|c| self.functions.get(c.func as usize))
                    .map(|f| f.name.as_str())
                    .unwrap_or("?");
                format!("<function {}>", name)
            }
            Value::Native(_) => "<native function>".to_string(),
            Value::Userdata(_) => "<userdata>".to_string(),
        }
    }

    // ---- assembly ----

    /// Resolve labels, function references and global names in a compiled
    /// unit, append it to the executable stream, then execute the unit's
    /// entry point and return its value.
    pub fn assemble(&mut self, code: &[Instruction]) -> Result<Value, RuntimeError> {
        let base_func = self.functions.len() as u32;
        let mut new_funcs: Vec<Function> = Vec::new();
        let mut labels: Vec<HashMap<String, usize>> = vec![HashMap::new()];

        // first pass: function offsets and per-region label positions
        let mut pos = self.ins.len();
        for ins in code {
            match ins.op {
                Opcode::Function => {
                    let name = ins
                        .text
                        .clone()
                        .ok_or_else(|| RuntimeError::new("function marker without a name"))?;
                    new_funcs.push(Function {
                        name,
                        offset: pos,
                        args: ins.a as u32,
                        locals: ins.b as u32,
                        captures: ins.c as u32,
                        vararg: ins.n != 0.0,
                    });
                    labels.push(HashMap::new());
                }
                Opcode::Label => {
                    let name = ins
                        .text
                        .clone()
                        .ok_or_else(|| RuntimeError::new("label without a name"))?;
                    if let Some(map) = labels.last_mut() {
                        map.insert(name, pos);
                    }
                }
                Opcode::Comment | Opcode::DebugLine => {}
                _ => pos += 1,
            }
        }

        // second pass: emit the executable stream with everything resolved
        let mut out: Vec<Instruction> = Vec::with_capacity(code.len());
        let mut new_debug: Vec<DebugRecord> = Vec::new();
        let mut region = 0usize;
        let mut pos = self.ins.len();
        for ins in code {
            match ins.op {
                Opcode::Function => region += 1,
                Opcode::Label | Opcode::Comment => {}
                Opcode::DebugLine => new_debug.push(DebugRecord {
                    code: pos,
                    file: ins.text.clone().unwrap_or_default(),
                    line: ins.n as u32,
                }),
                Opcode::Jump | Opcode::JumpTrue | Opcode::JumpFalse => {
                    let label = ins
                        .text
                        .as_deref()
                        .ok_or_else(|| RuntimeError::new("jump without a target label"))?;
                    let target = labels
                        .get(region)
                        .and_then(|map| map.get(label))
                        .ok_or_else(|| RuntimeError::new(format!("unknown label '{}'", label)))?;
                    out.push(Instruction::int(ins.op, *target as i32));
                    pos += 1;
                }
                Opcode::LoadFn => {
                    let name = ins
                        .text
                        .as_deref()
                        .ok_or_else(|| RuntimeError::new("load-function without a name"))?;
                    let idx = new_funcs
                        .iter()
                        .position(|f| f.name == name)
                        .map(|i| base_func + i as u32)
                        .or_else(|| self.function_names.get(name).copied())
                        .ok_or_else(|| {
                            RuntimeError::new(format!("unknown function '{}'", name))
                        })?;
                    out.push(Instruction::int(Opcode::LoadFn, idx as i32));
                    pos += 1;
                }
                Opcode::LoadGlobal | Opcode::StoreGlobal => {
                    let name = ins
                        .text
                        .as_deref()
                        .ok_or_else(|| RuntimeError::new("global access without a name"))?;
                    let slot = self.global_slot(name);
                    out.push(Instruction::int(ins.op, slot as i32));
                    pos += 1;
                }
                _ => {
                    out.push(ins.clone());
                    pos += 1;
                }
            }
        }

        // commit
        self.ins.append(&mut out);
        let unit_entry = new_funcs
            .iter()
            .position(|f| f.name == ENTRY_POINT)
            .map(|i| base_func + i as u32);
        for (i, f) in new_funcs.into_iter().enumerate() {
            self.function_names.insert(f.name.clone(), base_func + i as u32);
            self.functions.push(f);
        }
        self.debug.append(&mut new_debug);

        // execute the unit's top-level code
        match unit_entry {
            Some(idx) => self.call_function(idx, &[]),
            None => Ok(Value::Null),
        }
    }

    // ---- call machinery ----

    fn call_function(&mut self, func: u32, args: &[Value]) -> Result<Value, RuntimeError> {
        let closure = self.heap.alloc(HeapObject::Closure(Closure { func, env: None }));
        self.call_value(Value::Closure(closure), args)
    }

    fn call_value_inner(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        match callee {
            Value::Closure(h) => {
                for &arg in args {
                    self.push(arg, None)?;
                }
                let start = self.push_frame(h, args.len(), HOST_BOUNDARY, None)?;
                self.execute(start)
            }
            Value::Native(idx) => self.invoke_native(idx, args.to_vec(), None),
            other => Err(RuntimeError::new(format!("cannot call a {}", other.type_name()))),
        }
    }

    /// Enter a closure whose `argc` arguments sit on top of the stack.
    /// Returns the instruction offset to continue at.
    fn push_frame(
        &mut self,
        closure_h: Handle,
        argc: usize,
        return_ip: usize,
        ip: Option<usize>,
    ) -> Result<usize, RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError {
                message: format!("call depth limit of {} exceeded", self.config.max_call_depth),
                ip,
            });
        }
        let closure = self
            .heap
            .closure(closure_h)
            .ok_or_else(|| RuntimeError { message: "callee is not a closure".into(), ip })?;
        let func = self
            .functions
            .get(closure.func as usize)
            .ok_or_else(|| RuntimeError { message: "closure references an unknown function".into(), ip })?;
        let (declared, locals, vararg, offset) =
            (func.args as usize, func.locals as usize, func.vararg, func.offset);

        if self.stack.len() < argc {
            return Err(RuntimeError { message: "argument window underflows the stack".into(), ip });
        }
        let base = self.stack.len() - argc;

        if vararg {
            // surplus arguments pack into an array bound to the last
            // declared parameter
            let fixed = declared.saturating_sub(1);
            if argc > fixed {
                let rest: Vec<Value> = self.stack.drain(base + fixed..).collect();
                let arr = self.heap.alloc(HeapObject::Array(rest));
                self.push(Value::Array(arr), ip)?;
            } else {
                for _ in argc..fixed {
                    self.push(Value::Null, ip)?;
                }
                let arr = self.heap.alloc(HeapObject::Array(Vec::new()));
                self.push(Value::Array(arr), ip)?;
            }
        } else {
            // extra arguments are dropped, missing ones become null
            if argc > declared {
                self.stack.truncate(base + declared);
            }
            for _ in argc..declared {
                self.push(Value::Null, ip)?;
            }
        }

        while self.stack.len() < base + locals {
            self.push(Value::Null, ip)?;
        }

        self.frames.push(CallFrame { return_ip, closure: closure_h, base, own_env: None });
        Ok(offset)
    }

    fn invoke_native(
        &mut self,
        idx: u32,
        args: Vec<Value>,
        ip: Option<usize>,
    ) -> Result<Value, RuntimeError> {
        let f = *self
            .natives
            .get(idx as usize)
            .ok_or_else(|| RuntimeError { message: "unknown native function".into(), ip })?;
        // keep the argument window rooted while the callback runs; it may
        // allocate or re-enter the engine
        self.native_args.push(args.clone());
        self.result = None;
        let outcome = f(self, &args);
        self.native_args.pop();
        outcome?;
        Ok(self.result.take().unwrap_or(Value::Null))
    }

    // ---- the dispatch loop ----

    fn execute(&mut self, start: usize) -> Result<Value, RuntimeError> {
        let entry_depth = self.frames.len() - 1;
        let mut ip = start;

        loop {
            // collection runs only between complete dispatches
            if self.heap.wants_step() {
                let roots = self.roots();
                self.heap.step(&roots);
            }

            let (op, a, b, n) = {
                let ins = self
                    .ins
                    .get(ip)
                    .ok_or_else(|| self.rt(ip, "instruction pointer out of range".into()))?;
                (ins.op, ins.a, ins.b, ins.n)
            };

            match op {
                Opcode::Add => {
                    let rhs = self.pop(ip)?;
                    let lhs = self.pop(ip)?;
                    let v = match (lhs, rhs) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        _ if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) => {
                            let s = format!("{}{}", self.render(lhs), self.render(rhs));
                            Value::Str(self.heap.alloc(HeapObject::Str(s)))
                        }
                        _ => {
                            return Err(self.rt(
                                ip,
                                format!(
                                    "cannot add {} and {}",
                                    lhs.type_name(),
                                    rhs.type_name()
                                ),
                            ));
                        }
                    };
                    self.push(v, Some(ip))?;
                }
                Opcode::Sub => self.arith(ip, "subtract", |x, y| Ok(x - y))?,
                Opcode::Mul => self.arith(ip, "multiply", |x, y| Ok(x * y))?,
                Opcode::Div => self.arith(ip, "divide", |x, y| {
                    if y == 0.0 { Err("division by zero") } else { Ok(x / y) }
                })?,
                Opcode::Mod => self.arith(ip, "take the modulus of", |x, y| {
                    if y == 0.0 { Err("modulus by zero") } else { Ok(x % y) }
                })?,

                Opcode::BitAnd => self.bitwise(ip, |x, y| x & y)?,
                Opcode::BitOr => self.bitwise(ip, |x, y| x | y)?,
                Opcode::BitXor => self.bitwise(ip, |x, y| x ^ y)?,
                Opcode::ShiftLeft => self.bitwise(ip, |x, y| x << (y & 63))?,
                Opcode::ShiftRight => self.bitwise(ip, |x, y| x >> (y & 63))?,
                Opcode::BitNot => {
                    let v = self.pop(ip)?;
                    match int_bits(v) {
                        Some(x) => self.push(Value::Number(!x as f64), Some(ip))?,
                        None => {
                            return Err(self.rt(
                                ip,
                                format!("cannot bitwise-negate a {}", v.type_name()),
                            ));
                        }
                    }
                }

                Opcode::Eq => {
                    let rhs = self.pop(ip)?;
                    let lhs = self.pop(ip)?;
                    let eq = self.values_equal(lhs, rhs);
                    self.push(Value::Bool(eq), Some(ip))?;
                }
                Opcode::NotEq => {
                    let rhs = self.pop(ip)?;
                    let lhs = self.pop(ip)?;
                    let eq = self.values_equal(lhs, rhs);
                    self.push(Value::Bool(!eq), Some(ip))?;
                }
                Opcode::Lt => self.compare(ip, |x, y| x < y)?,
                Opcode::Gt => self.compare(ip, |x, y| x > y)?,
                Opcode::LtE => self.compare(ip, |x, y| x <= y)?,
                Opcode::GtE => self.compare(ip, |x, y| x >= y)?,

                Opcode::Negate => {
                    let v = self.pop(ip)?;
                    match v {
                        Value::Number(x) => self.push(Value::Number(-x), Some(ip))?,
                        other => {
                            return Err(
                                self.rt(ip, format!("cannot negate a {}", other.type_name()))
                            );
                        }
                    }
                }
                Opcode::Incr => {
                    let v = self.pop(ip)?;
                    match v {
                        Value::Number(x) => self.push(Value::Number(x + 1.0), Some(ip))?,
                        other => {
                            return Err(
                                self.rt(ip, format!("cannot increment a {}", other.type_name()))
                            );
                        }
                    }
                }
                Opcode::Decr => {
                    let v = self.pop(ip)?;
                    match v {
                        Value::Number(x) => self.push(Value::Number(x - 1.0), Some(ip))?,
                        other => {
                            return Err(
                                self.rt(ip, format!("cannot decrement a {}", other.type_name()))
                            );
                        }
                    }
                }

                Opcode::Dup => {
                    let v = *self
                        .stack
                        .last()
                        .ok_or_else(|| self.rt(ip, "popped an empty stack".into()))?;
                    self.push(v, Some(ip))?;
                }
                Opcode::Pop => {
                    self.pop(ip)?;
                }

                Opcode::LoadNum => self.push(Value::Number(n), Some(ip))?,
                Opcode::LoadNull => self.push(Value::Null, Some(ip))?,
                Opcode::LoadStr => {
                    let text = self.ins[ip].text.clone().unwrap_or_default();
                    let h = self.heap.alloc(HeapObject::Str(text));
                    self.push(Value::Str(h), Some(ip))?;
                }
                Opcode::LoadFn => {
                    let env = self.ensure_env(ip)?;
                    let h = self
                        .heap
                        .alloc(HeapObject::Closure(Closure { func: a as u32, env: Some(env) }));
                    self.push(Value::Closure(h), Some(ip))?;
                }

                Opcode::Jump => {
                    ip = a as usize;
                    continue;
                }
                Opcode::JumpTrue => {
                    let cond = self.pop(ip)?;
                    if cond.is_truthy() {
                        ip = a as usize;
                        continue;
                    }
                }
                Opcode::JumpFalse => {
                    let cond = self.pop(ip)?;
                    if !cond.is_truthy() {
                        ip = a as usize;
                        continue;
                    }
                }

                Opcode::NewArray => {
                    let count = a as usize;
                    if self.stack.len() < count {
                        return Err(self.rt(ip, "popped an empty stack".into()));
                    }
                    let items: Vec<Value> = self.stack.drain(self.stack.len() - count..).collect();
                    let h = self.heap.alloc(HeapObject::Array(items));
                    self.push(Value::Array(h), Some(ip))?;
                }
                Opcode::NewObject => {
                    let count = a as usize;
                    if self.stack.len() < count * 2 {
                        return Err(self.rt(ip, "popped an empty stack".into()));
                    }
                    let flat: Vec<Value> =
                        self.stack.drain(self.stack.len() - count * 2..).collect();
                    let mut map = std::collections::BTreeMap::new();
                    for pair in flat.chunks_exact(2) {
                        let key = match pair[0] {
                            Value::Str(h) => self
                                .heap
                                .string(h)
                                .ok_or_else(|| self.rt(ip, "object key is missing".into()))?
                                .to_string(),
                            other => {
                                return Err(self.rt(
                                    ip,
                                    format!("object keys must be strings, got {}", other.type_name()),
                                ));
                            }
                        };
                        map.insert(key, pair[1]);
                    }
                    let h = self.heap.alloc(HeapObject::Object(map));
                    self.push(Value::Object(h), Some(ip))?;
                }
                Opcode::LoadAt => {
                    let index = self.pop(ip)?;
                    let object = self.pop(ip)?;
                    let v = self.index_get(object, index, ip)?;
                    self.push(v, Some(ip))?;
                }
                Opcode::StoreAt => {
                    let index = self.pop(ip)?;
                    let object = self.pop(ip)?;
                    let value = self.pop(ip)?;
                    self.index_set(object, index, value, ip)?;
                }

                Opcode::LoadGlobal => {
                    let v = *self
                        .globals
                        .get(a as usize)
                        .ok_or_else(|| self.rt(ip, "global slot out of range".into()))?;
                    self.push(v, Some(ip))?;
                }
                Opcode::StoreGlobal => {
                    let v = self.pop(ip)?;
                    let slot = match self.globals.get_mut(a as usize) {
                        Some(slot) => slot,
                        None => return Err(self.rt(ip, "global slot out of range".into())),
                    };
                    *slot = v;
                }
                Opcode::LoadLocal => {
                    let base = self.frame(ip)?.base;
                    let v = *self
                        .stack
                        .get(base + a as usize)
                        .ok_or_else(|| self.rt(ip, "local slot out of range".into()))?;
                    self.push(v, Some(ip))?;
                }
                Opcode::StoreLocal => {
                    let v = self.pop(ip)?;
                    let base = self.frame(ip)?.base;
                    let slot = match self.stack.get_mut(base + a as usize) {
                        Some(slot) => slot,
                        None => return Err(self.rt(ip, "local slot out of range".into())),
                    };
                    *slot = v;
                }
                Opcode::LoadCapture => {
                    let cell = self.capture_cell(a as usize, b as u32, ip)?;
                    let v = self
                        .heap
                        .cell(cell)
                        .ok_or_else(|| self.rt(ip, "capture cell is gone".into()))?;
                    self.push(v, Some(ip))?;
                }
                Opcode::StoreCapture => {
                    let v = self.pop(ip)?;
                    let cell = self.capture_cell(a as usize, b as u32, ip)?;
                    if !self.heap.cell_set(cell, v) {
                        return Err(self.rt(ip, "capture cell is gone".into()));
                    }
                }
                Opcode::CaptureInit => {
                    let env = self.ensure_env(ip)?;
                    let base = self.frame(ip)?.base;
                    let value = *self
                        .stack
                        .get(base + a as usize)
                        .ok_or_else(|| self.rt(ip, "local slot out of range".into()))?;
                    let cell = self.heap.alloc(HeapObject::Cell(value));
                    if !self.heap.env_set_cell(env, b as usize, cell) {
                        return Err(self.rt(ip, "capture slot out of range".into()));
                    }
                }

                Opcode::Call => {
                    let argc = a as usize;
                    let callee = self.pop(ip)?;
                    match callee {
                        Value::Closure(h) => {
                            ip = self.push_frame(h, argc, ip + 1, Some(ip))?;
                            continue;
                        }
                        Value::Native(idx) => {
                            if self.stack.len() < argc {
                                return Err(self.rt(ip, "popped an empty stack".into()));
                            }
                            let args: Vec<Value> =
                                self.stack.drain(self.stack.len() - argc..).collect();
                            let r = self.invoke_native(idx, args, Some(ip))?;
                            self.push(r, Some(ip))?;
                        }
                        other => {
                            return Err(
                                self.rt(ip, format!("cannot call a {}", other.type_name()))
                            );
                        }
                    }
                }
                Opcode::ECall => {
                    let argc = a as usize;
                    let callee = self.pop(ip)?;
                    match callee {
                        Value::Native(idx) => {
                            if self.stack.len() < argc {
                                return Err(self.rt(ip, "popped an empty stack".into()));
                            }
                            let args: Vec<Value> =
                                self.stack.drain(self.stack.len() - argc..).collect();
                            let r = self.invoke_native(idx, args, Some(ip))?;
                            self.push(r, Some(ip))?;
                        }
                        other => {
                            return Err(self.rt(
                                ip,
                                format!(
                                    "external call expects a native function, got {}",
                                    other.type_name()
                                ),
                            ));
                        }
                    }
                }
                Opcode::Return => {
                    let value = self.pop(ip)?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| self.rt(ip, "return with no active frame".into()))?;
                    self.stack.truncate(frame.base);
                    if self.frames.len() == entry_depth {
                        return Ok(value);
                    }
                    self.push(value, Some(ip))?;
                    ip = frame.return_ip;
                    continue;
                }
                Opcode::Close => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.own_env = None;
                    }
                }

                Opcode::Label | Opcode::Comment | Opcode::DebugLine | Opcode::Function => {
                    return Err(self.rt(ip, "metadata opcode in the executable stream".into()));
                }
            }

            ip += 1;
        }
    }

    // ---- dispatch helpers ----

    fn rt(&self, ip: usize, message: String) -> RuntimeError {
        RuntimeError { message, ip: Some(ip) }
    }

    fn push(&mut self, v: Value, ip: Option<usize>) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.config.stack_size {
            return Err(RuntimeError { message: "stack overflow".into(), ip });
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self, ip: usize) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| self.rt(ip, "popped an empty stack".into()))
    }

    fn frame(&self, ip: usize) -> Result<&CallFrame, RuntimeError> {
        self.frames.last().ok_or_else(|| self.rt(ip, "no active frame".into()))
    }

    fn arith(
        &mut self,
        ip: usize,
        verb: &str,
        f: impl Fn(f64, f64) -> Result<f64, &'static str>,
    ) -> Result<(), RuntimeError> {
        let rhs = self.pop(ip)?;
        let lhs = self.pop(ip)?;
        match (lhs, rhs) {
            (Value::Number(x), Value::Number(y)) => match f(x, y) {
                Ok(v) => self.push(Value::Number(v), Some(ip)),
                Err(msg) => Err(self.rt(ip, msg.to_string())),
            },
            _ => Err(self.rt(
                ip,
                format!("cannot {} {} and {}", verb, lhs.type_name(), rhs.type_name()),
            )),
        }
    }

    fn bitwise(&mut self, ip: usize, f: impl Fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let rhs = self.pop(ip)?;
        let lhs = self.pop(ip)?;
        match (int_bits(lhs), int_bits(rhs)) {
            (Some(x), Some(y)) => self.push(Value::Number(f(x, y) as f64), Some(ip)),
            _ => Err(self.rt(
                ip,
                format!(
                    "bitwise operators need numbers, got {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ),
            )),
        }
    }

    fn compare(&mut self, ip: usize, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let rhs = self.pop(ip)?;
        let lhs = self.pop(ip)?;
        match (lhs, rhs) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Bool(f(x, y)), Some(ip)),
            _ => Err(self.rt(
                ip,
                format!("cannot order {} and {}", lhs.type_name(), rhs.type_name()),
            )),
        }
    }

    fn values_equal(&self, lhs: Value, rhs: Value) -> bool {
        match (lhs, rhs) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => {
                x == y || self.heap.string(x) == self.heap.string(y)
            }
            (Value::Array(x), Value::Array(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => x == y,
            (Value::Closure(x), Value::Closure(y)) => x == y,
            (Value::Native(x), Value::Native(y)) => x == y,
            (Value::Userdata(x), Value::Userdata(y)) => x == y,
            _ => false,
        }
    }

    /// The current frame's capture-cell array, allocated on first use with
    /// its parent link pointing at the executing closure's environment.
    fn ensure_env(&mut self, ip: usize) -> Result<Handle, RuntimeError> {
        let frame = self.frame(ip)?;
        if let Some(env) = frame.own_env {
            return Ok(env);
        }
        let closure = self
            .heap
            .closure(frame.closure)
            .ok_or_else(|| self.rt(ip, "frame closure is gone".into()))?;
        let parent = closure.env;
        let captures = self
            .functions
            .get(closure.func as usize)
            .map(|f| f.captures as usize)
            .unwrap_or(0);
        let env = self.heap.alloc(HeapObject::Env(Env { cells: vec![None; captures], parent }));
        if let Some(frame) = self.frames.last_mut() {
            frame.own_env = Some(env);
        }
        Ok(env)
    }

    /// Walk the environment chain: one hop per function boundary between
    /// the reference and the owning frame.
    fn capture_cell(&self, slot: usize, level: u32, ip: usize) -> Result<Handle, RuntimeError> {
        let frame = self.frame(ip)?;
        let closure = self
            .heap
            .closure(frame.closure)
            .ok_or_else(|| self.rt(ip, "frame closure is gone".into()))?;
        let mut env = closure
            .env
            .ok_or_else(|| self.rt(ip, "captured variable used outside any environment".into()))?;
        for _ in 1..level {
            env = self
                .heap
                .env(env)
                .and_then(|e| e.parent)
                .ok_or_else(|| self.rt(ip, "capture level out of range".into()))?;
        }
        self.heap
            .env(env)
            .and_then(|e| e.cells.get(slot).copied().flatten())
            .ok_or_else(|| self.rt(ip, "capture cell not initialized".into()))
    }

    fn index_get(&mut self, object: Value, index: Value, ip: usize) -> Result<Value, RuntimeError> {
        match object {
            Value::Array(h) => {
                let items = self
                    .heap
                    .array(h)
                    .ok_or_else(|| self.rt(ip, "array is gone".into()))?;
                let idx = match index {
                    Value::Number(n) => n as i64,
                    other => {
                        return Err(self.rt(
                            ip,
                            format!("array index must be a number, got {}", other.type_name()),
                        ));
                    }
                };
                if idx < 0 || idx as usize >= items.len() {
                    return Err(self.rt(
                        ip,
                        format!("array index {} out of range (len {})", idx, items.len()),
                    ));
                }
                Ok(items[idx as usize])
            }
            Value::Str(h) => {
                let s = self.heap.string(h).ok_or_else(|| self.rt(ip, "string is gone".into()))?;
                let idx = match index {
                    Value::Number(n) => n as i64,
                    other => {
                        return Err(self.rt(
                            ip,
                            format!("string index must be a number, got {}", other.type_name()),
                        ));
                    }
                };
                let ch = if idx >= 0 { s.chars().nth(idx as usize) } else { None };
                match ch {
                    Some(c) => {
                        let h = self.heap.alloc(HeapObject::Str(c.to_string()));
                        Ok(Value::Str(h))
                    }
                    None => Err(self.rt(ip, format!("string index {} out of range", idx))),
                }
            }
            Value::Object(h) => {
                let key = self.index_key(index, ip)?;
                let map = self
                    .heap
                    .object(h)
                    .ok_or_else(|| self.rt(ip, "object is gone".into()))?;
                Ok(map.get(&key).copied().unwrap_or(Value::Null))
            }
            Value::Userdata(h) => {
                let handler = self.userdata_handler(h, "_index", ip)?;
                self.invoke_native(handler, vec![object, index], Some(ip))
            }
            other => Err(self.rt(ip, format!("cannot index a {}", other.type_name()))),
        }
    }

    fn index_set(
        &mut self,
        object: Value,
        index: Value,
        value: Value,
        ip: usize,
    ) -> Result<(), RuntimeError> {
        match object {
            Value::Array(h) => {
                let idx = match index {
                    Value::Number(n) => n as i64,
                    other => {
                        return Err(self.rt(
                            ip,
                            format!("array index must be a number, got {}", other.type_name()),
                        ));
                    }
                };
                let len = self.heap.array(h).map(|a| a.len()).unwrap_or(0);
                if idx < 0 || idx as usize >= len {
                    return Err(self.rt(
                        ip,
                        format!("array index {} out of range (len {})", idx, len),
                    ));
                }
                self.heap.array_set(h, idx as usize, value);
                Ok(())
            }
            Value::Object(h) => {
                let key = self.index_key(index, ip)?;
                self.heap.object_set(h, key, value);
                Ok(())
            }
            Value::Userdata(h) => {
                let handler = self.userdata_handler(h, "_newindex", ip)?;
                self.invoke_native(handler, vec![object, index, value], Some(ip))?;
                Ok(())
            }
            other => Err(self.rt(ip, format!("cannot index a {}", other.type_name()))),
        }
    }

    fn index_key(&self, index: Value, ip: usize) -> Result<String, RuntimeError> {
        match index {
            Value::Str(h) => self
                .heap
                .string(h)
                .map(str::to_string)
                .ok_or_else(|| self.rt(ip, "object key is missing".into())),
            Value::Number(n) => Ok(format_number(n)),
            other => Err(self.rt(
                ip,
                format!("object index must be a string or number, got {}", other.type_name()),
            )),
        }
    }

    /// Look up a userdata's prototype handler for external-call dispatch.
    fn userdata_handler(&self, h: Handle, name: &str, ip: usize) -> Result<u32, RuntimeError> {
        let proto = self
            .heap
            .userdata(h)
            .and_then(|u| u.proto)
            .ok_or_else(|| self.rt(ip, "userdata has no prototype".into()))?;
        match self.heap.object(proto).and_then(|m| m.get(name)).copied() {
            Some(Value::Native(idx)) => Ok(idx),
            Some(other) => Err(self.rt(
                ip,
                format!("prototype field '{}' must be a native function, got {}", name, other.type_name()),
            )),
            None => Err(self.rt(ip, format!("userdata prototype has no '{}' handler", name))),
        }
    }

    // ---- GC roots ----

    fn roots(&self) -> Vec<Handle> {
        let mut roots: Vec<Handle> = self.stack.iter().filter_map(|v| v.handle()).collect();
        for frame in &self.frames {
            roots.push(frame.closure);
            if let Some(env) = frame.own_env {
                roots.push(env);
            }
        }
        roots.extend(self.globals.iter().filter_map(|v| v.handle()));
        if let Some(r) = self.result {
            roots.extend(r.handle());
        }
        for window in &self.native_args {
            roots.extend(window.iter().filter_map(|v| v.handle()));
        }
        roots
    }

    fn global_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.global_names.get(name) {
            return slot;
        }
        let slot = self.globals.len() as u32;
        self.globals.push(Value::Null);
        self.global_names.insert(name.to_string(), slot);
        slot
    }

    // ---- error decoration ----

    /// Reconstruct a symbolic trace for an error raised during execution.
    /// Runs before the stacks are truncated back to the call boundary.
    fn decorate(&self, e: RuntimeError, boundary: usize) -> RuntimeError {
        let Some(top_ip) = e.ip else { return e };
        let mut sites = vec![top_ip];
        for frame in self.frames[boundary.min(self.frames.len())..].iter().rev() {
            if frame.return_ip != HOST_BOUNDARY && frame.return_ip > 0 {
                sites.push(frame.return_ip - 1);
            }
        }
        let mut message = e.message;
        for site in sites {
            message.push('\n');
            message.push_str(&self.symbolize(site));
        }
        RuntimeError { message, ip: e.ip }
    }

    fn symbolize(&self, ip: usize) -> String {
        let func = self
            .functions
            .iter()
            .rev()
            .find(|f| f.offset <= ip)
            .map(|f| f.name.as_str())
            .unwrap_or("?");
        match self.debug.iter().rev().find(|d| d.code <= ip) {
            Some(d) => format!("  at {} ({}:{})", func, d.file, d.line),
            None => format!("  at {} (ip {})", func, ip),
        }
    }
}

/// Bitwise operands: numbers use their integer part, booleans count as 0/1
/// so comparison results compose with `&` and `|`.
fn int_bits(v: Value) -> Option<i64> {
    match v {
        Value::Number(n) => Some(n as i64),
        Value::Bool(b) => Some(b as i64),
        _ => None,
    }
}

// ---- built-in natives ----

fn native_print(vm: &mut Engine, args: &[Value]) -> Result<(), RuntimeError> {
    let rendered: Vec<String> = args.iter().map(|&v| vm.render(v)).collect();
    println!("{}", rendered.join(" "));
    Ok(())
}

fn native_len(vm: &mut Engine, args: &[Value]) -> Result<(), RuntimeError> {
    let v = args.first().copied().unwrap_or(Value::Null);
    let n = match v {
        Value::Str(h) => vm.heap.string(h).map(|s| s.chars().count()),
        Value::Array(h) => vm.heap.array(h).map(|a| a.len()),
        Value::Object(h) => vm.heap.object(h).map(|m| m.len()),
        _ => None,
    };
    match n {
        Some(n) => {
            vm.give(Value::Number(n as f64));
            Ok(())
        }
        None => Err(RuntimeError::new(format!(
            "len expects a string, array or object, got {}",
            v.type_name()
        ))),
    }
}

fn native_gc(vm: &mut Engine, _args: &[Value]) -> Result<(), RuntimeError> {
    vm.collect();
    Ok(())
}
