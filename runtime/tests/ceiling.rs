//! Process-wide call stack ceiling.
//!
//! Lives in its own test binary: the ceiling is global, so changing it
//! must not race with the unit tests.

use kpio_interp::module::{Export, ExportKind, FunctionBody, FunctionType, Module, ValueType};
use kpio_interp::opcodes::{BlockType, Instruction::*};
use kpio_interp::{
    call_stack_ceiling, reset_call_stack_ceiling, set_call_stack_ceiling, Store, TrapError,
    WasmValue, DEFAULT_CALL_STACK_CEILING,
};

/// count(n) = if n == 0 then 0 else count(n - 1); uses n + 1 frames.
fn countdown() -> Module {
    Module {
        name: String::from("m"),
        types: vec![FunctionType::new(&[ValueType::I32], &[ValueType::I32])],
        functions: vec![0],
        code: vec![FunctionBody::new(
            vec![],
            vec![
                LocalGet(0),
                I32Eqz,
                If(BlockType::Value(ValueType::I32)),
                I32Const(0),
                Else,
                LocalGet(0),
                I32Const(1),
                I32Sub,
                Call(0),
                End,
                End,
            ],
        )],
        exports: vec![Export {
            name: String::from("count"),
            kind: ExportKind::Function,
            index: 0,
        }],
        ..Module::default()
    }
}

#[test]
fn test_process_wide_ceiling() {
    assert_eq!(call_stack_ceiling(), DEFAULT_CALL_STACK_CEILING);

    let mut store = Store::new();
    let m = store.instantiate(&countdown()).unwrap();
    let mut it = store.interpreter();

    // Well under the default.
    assert_eq!(
        it.call_export(&m, "count", &[WasmValue::I32(500)]),
        Ok(vec![WasmValue::I32(0)])
    );

    set_call_stack_ceiling(3);
    assert_eq!(call_stack_ceiling(), 3);
    // Existing interpreters pick the new value up on their next push.
    assert!(it.call_export(&m, "count", &[WasmValue::I32(2)]).is_ok());
    assert_eq!(
        it.call_export(&m, "count", &[WasmValue::I32(3)]),
        Err(TrapError::CallStackExhausted)
    );
    assert!(it.call_stack().is_empty());

    set_call_stack_ceiling(0);
    assert_eq!(call_stack_ceiling(), 3);

    reset_call_stack_ceiling();
    assert_eq!(call_stack_ceiling(), DEFAULT_CALL_STACK_CEILING);
    assert!(it.call_export(&m, "count", &[WasmValue::I32(3)]).is_ok());

    // Unbounded recursion still ends in a trap at the default.
    let mut store = Store::new();
    let mut looping = countdown();
    looping.name = String::from("loop");
    looping.code[0] = FunctionBody::new(vec![], vec![LocalGet(0), Call(0), End]);
    let l = store.instantiate(&looping).unwrap();
    let mut it = store.interpreter();
    assert_eq!(
        it.call_export(&l, "count", &[WasmValue::I32(1)]),
        Err(TrapError::CallStackExhausted)
    );
    assert_eq!(it.call_stack().depth(), 0);
}
