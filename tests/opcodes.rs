//! Hand-assembled units driving every executable opcode, verifying results
//! and the documented per-opcode stack effects.

use skiff::bytecode::{Instruction, Opcode, listing};
use skiff::{Engine, RuntimeError, Value};

fn entry(locals: u32, captures: u32, body: Vec<Instruction>) -> Vec<Instruction> {
    let mut code = vec![Instruction::function(Engine::ENTRY, 0, locals, captures, false)];
    code.extend(body);
    code
}

fn finish(mut body: Vec<Instruction>) -> Vec<Instruction> {
    body.push(Instruction::new(Opcode::Close));
    body.push(Instruction::new(Opcode::Return));
    body
}

fn run_unit(code: Vec<Instruction>) -> Result<Value, RuntimeError> {
    Engine::new().assemble(&code)
}

fn num(op: Opcode, n: f64) -> Instruction {
    Instruction::num(op, n)
}

/// Straight-line cases: body instructions, expected rendering of the
/// returned value. Each is also simulated against the documented
/// stack-effect table.
fn straight_line_cases() -> Vec<(&'static str, Vec<Instruction>, &'static str)> {
    use Opcode::*;
    vec![
        ("add", vec![num(LoadNum, 2.0), num(LoadNum, 3.0), Instruction::new(Add)], "5"),
        ("sub", vec![num(LoadNum, 5.0), num(LoadNum, 2.0), Instruction::new(Sub)], "3"),
        ("mul", vec![num(LoadNum, 4.0), num(LoadNum, 3.0), Instruction::new(Mul)], "12"),
        ("div", vec![num(LoadNum, 10.0), num(LoadNum, 4.0), Instruction::new(Div)], "2.5"),
        ("mod", vec![num(LoadNum, 10.0), num(LoadNum, 4.0), Instruction::new(Mod)], "2"),
        ("band", vec![num(LoadNum, 6.0), num(LoadNum, 3.0), Instruction::new(BitAnd)], "2"),
        ("bor", vec![num(LoadNum, 6.0), num(LoadNum, 3.0), Instruction::new(BitOr)], "7"),
        ("bxor", vec![num(LoadNum, 6.0), num(LoadNum, 3.0), Instruction::new(BitXor)], "5"),
        ("bnot", vec![num(LoadNum, 0.0), Instruction::new(BitNot)], "-1"),
        ("shl", vec![num(LoadNum, 1.0), num(LoadNum, 3.0), Instruction::new(ShiftLeft)], "8"),
        ("shr", vec![num(LoadNum, 8.0), num(LoadNum, 2.0), Instruction::new(ShiftRight)], "2"),
        ("eq", vec![num(LoadNum, 1.0), num(LoadNum, 1.0), Instruction::new(Eq)], "true"),
        ("neq", vec![num(LoadNum, 1.0), num(LoadNum, 2.0), Instruction::new(NotEq)], "true"),
        ("lt", vec![num(LoadNum, 1.0), num(LoadNum, 2.0), Instruction::new(Lt)], "true"),
        ("gt", vec![num(LoadNum, 1.0), num(LoadNum, 2.0), Instruction::new(Gt)], "false"),
        ("lte", vec![num(LoadNum, 2.0), num(LoadNum, 2.0), Instruction::new(LtE)], "true"),
        ("gte", vec![num(LoadNum, 1.0), num(LoadNum, 2.0), Instruction::new(GtE)], "false"),
        ("negate", vec![num(LoadNum, 5.0), Instruction::new(Negate)], "-5"),
        ("incr", vec![num(LoadNum, 4.0), Instruction::new(Incr)], "5"),
        ("decr", vec![num(LoadNum, 4.0), Instruction::new(Decr)], "3"),
        ("dup", vec![num(LoadNum, 7.0), Instruction::new(Dup), Instruction::new(Add)], "14"),
        ("pop", vec![num(LoadNum, 1.0), num(LoadNum, 9.0), Instruction::new(Pop)], "1"),
        ("loadnull", vec![Instruction::new(LoadNull)], "null"),
        ("loadstr", vec![Instruction::text(LoadStr, "hi")], "hi"),
        (
            "newarray-loadat",
            vec![
                num(LoadNum, 1.0),
                num(LoadNum, 2.0),
                Instruction::int(NewArray, 2),
                num(LoadNum, 1.0),
                Instruction::new(LoadAt),
            ],
            "2",
        ),
        (
            "newobject-loadat",
            vec![
                Instruction::text(LoadStr, "k"),
                num(LoadNum, 9.0),
                Instruction::int(NewObject, 1),
                Instruction::text(LoadStr, "k"),
                Instruction::new(LoadAt),
            ],
            "9",
        ),
        (
            "globals",
            vec![
                num(LoadNum, 11.0),
                Instruction::text(StoreGlobal, "g"),
                Instruction::text(LoadGlobal, "g"),
            ],
            "11",
        ),
    ]
}

#[test]
fn straight_line_opcodes_produce_documented_results() {
    for (name, body, expected) in straight_line_cases() {
        let mut engine = Engine::new();
        let value = engine
            .assemble(&entry(0, 0, finish(body)))
            .unwrap_or_else(|e| panic!("case {} failed: {}", name, e));
        assert_eq!(engine.render(value), expected, "case {}", name);
    }
}

#[test]
fn straight_line_opcodes_match_the_stack_effect_table() {
    for (name, body, _) in straight_line_cases() {
        let mut depth: i32 = 0;
        for ins in finish(body) {
            depth += ins.op.stack_effect(ins.a);
            assert!(depth >= 0, "case {} underflows at {:?}", name, ins.op);
        }
        // Return consumed the produced value
        assert_eq!(depth, 0, "case {} is not balanced", name);
    }
}

#[test]
fn jump_is_absolute_and_unconditional() {
    use Opcode::*;
    let body = vec![
        num(LoadNum, 1.0),
        Instruction::text(Jump, "over"),
        num(LoadNum, 99.0),
        Instruction::text(Label, "over"),
        Instruction::new(Close),
        Instruction::new(Return),
    ];
    assert_eq!(run_unit(entry(0, 0, body)).unwrap(), Value::Number(1.0));
}

#[test]
fn conditional_jumps_pop_their_condition() {
    use Opcode::*;
    let body = vec![
        num(LoadNum, 1.0),
        Instruction::text(JumpTrue, "yes"),
        num(LoadNum, 0.0),
        Instruction::new(Close),
        Instruction::new(Return),
        Instruction::text(Label, "yes"),
        num(LoadNum, 5.0),
        Instruction::new(Close),
        Instruction::new(Return),
    ];
    assert_eq!(run_unit(entry(0, 0, body)).unwrap(), Value::Number(5.0));

    let body = vec![
        num(LoadNum, 0.0),
        Instruction::text(JumpFalse, "no"),
        num(LoadNum, 1.0),
        Instruction::new(Close),
        Instruction::new(Return),
        Instruction::text(Label, "no"),
        num(LoadNum, 6.0),
        Instruction::new(Close),
        Instruction::new(Return),
    ];
    assert_eq!(run_unit(entry(0, 0, body)).unwrap(), Value::Number(6.0));
}

#[test]
fn store_at_consumes_value_object_index() {
    use Opcode::*;
    let body = vec![
        num(LoadNum, 1.0),
        num(LoadNum, 2.0),
        Instruction::int(NewArray, 2),
        Instruction::int(StoreLocal, 0),
        num(LoadNum, 7.0),
        Instruction::int(LoadLocal, 0),
        num(LoadNum, 0.0),
        Instruction::new(StoreAt),
        Instruction::int(LoadLocal, 0),
        num(LoadNum, 0.0),
        Instruction::new(LoadAt),
        Instruction::new(Close),
        Instruction::new(Return),
    ];
    assert_eq!(run_unit(entry(1, 0, body)).unwrap(), Value::Number(7.0));
}

#[test]
fn call_pushes_a_frame_and_copies_arguments_into_locals() {
    use Opcode::*;
    let mut code = entry(
        0,
        0,
        vec![
            num(LoadNum, 3.0),
            num(LoadNum, 4.0),
            Instruction::text(LoadFn, "adder"),
            Instruction::int(Call, 2),
            Instruction::new(Close),
            Instruction::new(Return),
        ],
    );
    code.push(Instruction::function("adder", 2, 2, 0, false));
    code.extend(vec![
        Instruction::int(LoadLocal, 0),
        Instruction::int(LoadLocal, 1),
        Instruction::new(Add),
        Instruction::new(Close),
        Instruction::new(Return),
    ]);
    assert_eq!(run_unit(code).unwrap(), Value::Number(7.0));
}

#[test]
fn capture_cells_flow_through_init_load_and_store() {
    use Opcode::*;
    // local slot 0 starts at 5; `set` writes 9 through the shared cell,
    // `get` reads it back one level up
    let mut code = entry(
        1,
        1,
        vec![
            num(LoadNum, 5.0),
            Instruction::int(StoreLocal, 0),
            Instruction::text(LoadFn, "set"),
            Instruction::text(LoadFn, "get"),
            Instruction::int2(Opcode::CaptureInit, 0, 0),
            Instruction::int(StoreLocal, 0), // reuse slot to hold `get`
            Instruction::int(Call, 0),       // run `set`
            Instruction::new(Pop),
            Instruction::int(LoadLocal, 0),
            Instruction::int(Call, 0), // run `get`
            Instruction::new(Close),
            Instruction::new(Return),
        ],
    );
    code.push(Instruction::function("set", 0, 0, 0, false));
    code.extend(vec![
        num(LoadNum, 9.0),
        Instruction::int2(Opcode::StoreCapture, 0, 1),
        Instruction::new(LoadNull),
        Instruction::new(Close),
        Instruction::new(Return),
    ]);
    code.push(Instruction::function("get", 0, 0, 0, false));
    code.extend(vec![
        Instruction::int2(Opcode::LoadCapture, 0, 1),
        Instruction::new(Close),
        Instruction::new(Return),
    ]);
    assert_eq!(run_unit(code).unwrap(), Value::Number(9.0));
}

#[test]
fn ecall_invokes_a_native_with_the_same_protocol() {
    fn triple(vm: &mut Engine, args: &[Value]) -> Result<(), RuntimeError> {
        match args.first() {
            Some(Value::Number(n)) => {
                vm.give(Value::Number(n * 3.0));
                Ok(())
            }
            _ => Err(RuntimeError::new("triple expects a number")),
        }
    }
    let mut engine = Engine::new();
    engine.register_native("triple", triple);
    let body = vec![
        num(Opcode::LoadNum, 7.0),
        Instruction::text(Opcode::LoadGlobal, "triple"),
        Instruction::int(Opcode::ECall, 1),
        Instruction::new(Opcode::Close),
        Instruction::new(Opcode::Return),
    ];
    assert_eq!(engine.assemble(&entry(0, 0, body)).unwrap(), Value::Number(21.0));
}

#[test]
fn ecall_rejects_script_closures() {
    use Opcode::*;
    let mut code = entry(
        0,
        0,
        vec![
            Instruction::text(LoadFn, "noop"),
            Instruction::int(ECall, 0),
            Instruction::new(Close),
            Instruction::new(Return),
        ],
    );
    code.push(Instruction::function("noop", 0, 0, 0, false));
    code.extend(vec![
        Instruction::new(LoadNull),
        Instruction::new(Close),
        Instruction::new(Return),
    ]);
    let err = run_unit(code).unwrap_err();
    assert!(err.message.contains("external call"), "got: {}", err.message);
}

#[test]
fn pop_on_empty_stack_is_the_deliberate_error_case() {
    let body = vec![
        Instruction::new(Opcode::Pop),
        Instruction::new(Opcode::LoadNull),
        Instruction::new(Opcode::Close),
        Instruction::new(Opcode::Return),
    ];
    let err = run_unit(entry(0, 0, body)).unwrap_err();
    assert!(err.message.contains("empty stack"), "got: {}", err.message);
    assert!(err.ip.is_some());
}

#[test]
fn metadata_opcodes_never_execute() {
    let body = vec![
        Instruction::text(Opcode::Comment, "just a note"),
        Instruction::debug_line("unit", 1),
        num(Opcode::LoadNum, 3.0),
        Instruction::new(Opcode::Close),
        Instruction::new(Opcode::Return),
    ];
    assert_eq!(run_unit(entry(0, 0, body)).unwrap(), Value::Number(3.0));
}

#[test]
fn unknown_labels_are_an_assembly_error() {
    let body = vec![
        Instruction::text(Opcode::Jump, "nowhere"),
        Instruction::new(Opcode::LoadNull),
        Instruction::new(Opcode::Close),
        Instruction::new(Opcode::Return),
    ];
    let err = run_unit(entry(0, 0, body)).unwrap_err();
    assert!(err.message.contains("unknown label"), "got: {}", err.message);
}

#[test]
fn listing_round_trips_every_case_without_panicking() {
    for (name, body, _) in straight_line_cases() {
        let text = listing(&entry(0, 0, finish(body)));
        assert!(text.contains("__main"), "case {} listing: {}", name, text);
    }
}
