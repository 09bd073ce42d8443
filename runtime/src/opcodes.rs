//! WASM instruction definitions understood by the interpreter loop.
//!
//! Only control flow, calls, locals/globals, a handful of memory accesses
//! and the integer arithmetic needed to drive them are represented.
//! Everything else belongs to the numeric instruction handlers.

use crate::module::ValueType;

/// Block type for structured control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// No value (void).
    Empty,
    /// Single value type.
    Value(ValueType),
}

impl BlockType {
    /// Number of values the block leaves on the stack.
    pub fn arity(&self) -> usize {
        match self {
            BlockType::Empty => 0,
            BlockType::Value(_) => 1,
        }
    }
}

/// Memory immediate: (align, offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

/// A single WASM instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    // ========================================================================
    // Control Flow Instructions
    // ========================================================================
    /// Trap immediately.
    Unreachable,
    /// No operation.
    Nop,
    /// Begin a block. Params: block type.
    Block(BlockType),
    /// Begin a loop. Params: block type.
    Loop(BlockType),
    /// Conditional block. Params: block type.
    If(BlockType),
    /// Else branch of an if block.
    Else,
    /// End of block/loop/if/function.
    End,
    /// Branch to label. Params: label index (depth).
    Br(u32),
    /// Conditional branch. Params: label index.
    BrIf(u32),
    /// Return from current function.
    Return,
    /// Call function by index.
    Call(u32),
    /// Indirect call via table 0. Params: type index.
    CallIndirect(u32),

    // ========================================================================
    // Parametric Instructions
    // ========================================================================
    Drop,
    Select,

    // ========================================================================
    // Variable Instructions
    // ========================================================================
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    // ========================================================================
    // Memory Instructions
    // ========================================================================
    I32Load(MemArg),
    I32Store(MemArg),
    MemorySize,
    MemoryGrow,

    // ========================================================================
    // Numeric Instructions
    // ========================================================================
    I32Const(i32),
    I64Const(i64),
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I32LeS,
    I32Add,
    I32Sub,
    I32Mul,
    I64Add,
}
