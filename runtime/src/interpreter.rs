//! Stack machine primitives.
//!
//! Values, the operand stack, tables, globals and the trap taxonomy shared
//! by the call stack, the registry and the executor loop.

use alloc::string::String;
use alloc::vec::Vec;

use crate::module::ValueType;
use crate::registry::FunctionAddress;

/// Maximum value stack depth (in values).
pub const MAX_VALUE_STACK_DEPTH: usize = 16384;

// ============================================================================
// WASM Values
// ============================================================================

/// A runtime WASM value.
#[derive(Debug, Clone, Copy)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    FuncRef(Option<FunctionAddress>),
    ExternRef(Option<u32>),
}

impl WasmValue {
    /// Get the value type.
    pub fn value_type(&self) -> ValueType {
        match self {
            WasmValue::I32(_) => ValueType::I32,
            WasmValue::I64(_) => ValueType::I64,
            WasmValue::F32(_) => ValueType::F32,
            WasmValue::F64(_) => ValueType::F64,
            WasmValue::FuncRef(_) => ValueType::FuncRef,
            WasmValue::ExternRef(_) => ValueType::ExternRef,
        }
    }

    /// Get as i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WasmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WasmValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Default value for a given type.
    pub fn default_for(vt: ValueType) -> Self {
        match vt {
            ValueType::I32 => WasmValue::I32(0),
            ValueType::I64 => WasmValue::I64(0),
            ValueType::F32 => WasmValue::F32(0.0),
            ValueType::F64 => WasmValue::F64(0.0),
            ValueType::FuncRef => WasmValue::FuncRef(None),
            ValueType::ExternRef => WasmValue::ExternRef(None),
        }
    }
}

impl PartialEq for WasmValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (WasmValue::I32(a), WasmValue::I32(b)) => a == b,
            (WasmValue::I64(a), WasmValue::I64(b)) => a == b,
            (WasmValue::F32(a), WasmValue::F32(b)) => a.to_bits() == b.to_bits(),
            (WasmValue::F64(a), WasmValue::F64(b)) => a.to_bits() == b.to_bits(),
            (WasmValue::FuncRef(a), WasmValue::FuncRef(b)) => a == b,
            (WasmValue::ExternRef(a), WasmValue::ExternRef(b)) => a == b,
            _ => false,
        }
    }
}

/// Check a value list against declared types (arity first, then each type).
pub fn check_values(expected: &[ValueType], values: &[WasmValue]) -> Result<(), TrapError> {
    if expected.len() != values.len() {
        return Err(TrapError::ArityMismatch {
            expected: expected.len(),
            got: values.len(),
        });
    }
    for (ty, value) in expected.iter().zip(values) {
        if value.value_type() != *ty {
            return Err(TrapError::TypeMismatch {
                expected: *ty,
                got: value.value_type(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Value Stack
// ============================================================================

/// The operand stack for the interpreter.
///
/// One stack serves the whole call chain; each frame remembers the height
/// it started at and never looks below it.
pub struct ValueStack {
    values: Vec<WasmValue>,
    max_depth: usize,
}

impl ValueStack {
    /// Create a new value stack.
    pub fn new() -> Self {
        Self::with_max_depth(MAX_VALUE_STACK_DEPTH)
    }

    /// Create a value stack with a custom depth limit.
    pub fn with_max_depth(max_depth: usize) -> Self {
        ValueStack {
            values: Vec::with_capacity(256),
            max_depth,
        }
    }

    /// Push a value onto the stack.
    pub fn push(&mut self, value: WasmValue) -> Result<(), TrapError> {
        if self.values.len() >= self.max_depth {
            return Err(TrapError::ValueStackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    /// Pop a value from the stack.
    pub fn pop(&mut self) -> Result<WasmValue, TrapError> {
        self.values.pop().ok_or(TrapError::StackUnderflow)
    }

    /// Pop an i32 from the stack.
    pub fn pop_i32(&mut self) -> Result<i32, TrapError> {
        match self.pop()? {
            WasmValue::I32(v) => Ok(v),
            other => Err(TrapError::TypeMismatch {
                expected: ValueType::I32,
                got: other.value_type(),
            }),
        }
    }

    /// Pop an i64 from the stack.
    pub fn pop_i64(&mut self) -> Result<i64, TrapError> {
        match self.pop()? {
            WasmValue::I64(v) => Ok(v),
            other => Err(TrapError::TypeMismatch {
                expected: ValueType::I64,
                got: other.value_type(),
            }),
        }
    }

    /// Pop the top `n` values, preserving their order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<WasmValue>, TrapError> {
        let len = self.values.len();
        if n > len {
            return Err(TrapError::StackUnderflow);
        }
        Ok(self.values.split_off(len - n))
    }

    /// Peek at the top value.
    pub fn peek(&self) -> Result<&WasmValue, TrapError> {
        self.values.last().ok_or(TrapError::StackUnderflow)
    }

    /// Get current stack depth.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if stack is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Truncate stack to given length.
    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Push every value, failing at the depth limit.
    pub fn extend(&mut self, values: impl IntoIterator<Item = WasmValue>) -> Result<(), TrapError> {
        for v in values {
            self.push(v)?;
        }
        Ok(())
    }
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Trap (Runtime Error)
// ============================================================================

/// Runtime trap errors during WASM execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapError {
    /// Pushing a frame would exceed the call-stack ceiling.
    CallStackExhausted,
    /// Memory access out of bounds.
    MemoryOutOfBounds {
        offset: usize,
        size: usize,
        memory_size: usize,
    },
    /// Value stack overflow.
    ValueStackOverflow,
    /// Value stack underflow.
    StackUnderflow,
    /// Unreachable instruction executed.
    Unreachable,
    /// Value of the wrong type at a call site or on the stack.
    TypeMismatch { expected: ValueType, got: ValueType },
    /// Wrong number of arguments or results.
    ArityMismatch { expected: usize, got: usize },
    /// Undefined element in table.
    UndefinedElement { index: u32 },
    /// Uninitialized table element.
    UninitializedElement { index: u32 },
    /// Indirect call signature mismatch.
    IndirectCallTypeMismatch { expected_type: u32 },
    /// Module has no memory to access.
    NoMemory,
    /// Global index out of range or immutable global written.
    InvalidGlobal(u32),
    /// Export not found.
    ExportNotFound(String),
    /// Fuel exhausted.
    FuelExhausted,
    /// Host function error.
    HostError(String),
    /// No registry entry at this address (linker defect).
    UnknownFunctionAddress(FunctionAddress),
    /// Function index outside the module's index space (validator defect).
    UnknownFunctionIndex(u32),
    /// Local index outside the frame (validator defect).
    InvalidLocal(u32),
    /// Frame popped from an empty call stack (dispatcher defect).
    PopOnEmptyStack,
}

impl TrapError {
    /// Whether this is an internal invariant violation rather than a guest trap.
    ///
    /// Internal errors mean the linker or the dispatcher is broken; embedders
    /// should not try to carry on after one.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            TrapError::UnknownFunctionAddress(_)
                | TrapError::UnknownFunctionIndex(_)
                | TrapError::InvalidLocal(_)
                | TrapError::PopOnEmptyStack
        )
    }
}

impl core::fmt::Display for TrapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TrapError::CallStackExhausted => write!(f, "call stack exhausted"),
            TrapError::MemoryOutOfBounds { offset, size, memory_size } => {
                write!(f, "out of bounds memory access: {} + {} > {}", offset, size, memory_size)
            }
            TrapError::ValueStackOverflow => write!(f, "value stack overflow"),
            TrapError::StackUnderflow => write!(f, "stack underflow"),
            TrapError::Unreachable => write!(f, "unreachable"),
            TrapError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {:?}, got {:?}", expected, got)
            }
            TrapError::ArityMismatch { expected, got } => {
                write!(f, "arity mismatch: expected {} values, got {}", expected, got)
            }
            TrapError::UndefinedElement { index } => {
                write!(f, "undefined element: table[{}]", index)
            }
            TrapError::UninitializedElement { index } => {
                write!(f, "uninitialized element: {}", index)
            }
            TrapError::IndirectCallTypeMismatch { expected_type } => {
                write!(f, "indirect call type mismatch: expected type {}", expected_type)
            }
            TrapError::NoMemory => write!(f, "module has no memory"),
            TrapError::InvalidGlobal(idx) => write!(f, "invalid global access: {}", idx),
            TrapError::ExportNotFound(name) => write!(f, "export not found: {}", name),
            TrapError::FuelExhausted => write!(f, "fuel exhausted"),
            TrapError::HostError(msg) => write!(f, "host error: {}", msg),
            TrapError::UnknownFunctionAddress(addr) => {
                write!(f, "unknown function address: {}", addr.0)
            }
            TrapError::UnknownFunctionIndex(idx) => write!(f, "unknown function index: {}", idx),
            TrapError::InvalidLocal(idx) => write!(f, "invalid local index: {}", idx),
            TrapError::PopOnEmptyStack => write!(f, "pop on empty call stack"),
        }
    }
}

// ============================================================================
// Tables and Globals
// ============================================================================

/// Table for indirect function calls, holding resolved function addresses.
#[derive(Debug, Clone)]
pub struct Table {
    /// Table elements (None = uninitialized).
    pub elements: Vec<Option<FunctionAddress>>,
    /// Maximum size.
    pub max: Option<u32>,
}

impl Table {
    /// Create a new table.
    pub fn new(min: u32, max: Option<u32>) -> Self {
        let mut elements = Vec::with_capacity(min as usize);
        elements.resize(min as usize, None);
        Table { elements, max }
    }

    /// Get a table element.
    pub fn get(&self, index: u32) -> Result<Option<FunctionAddress>, TrapError> {
        self.elements
            .get(index as usize)
            .copied()
            .ok_or(TrapError::UndefinedElement { index })
    }

    /// Set a table element.
    pub fn set(&mut self, index: u32, value: Option<FunctionAddress>) -> Result<(), TrapError> {
        let slot = self
            .elements
            .get_mut(index as usize)
            .ok_or(TrapError::UndefinedElement { index })?;
        *slot = value;
        Ok(())
    }

    /// Current size.
    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }
}

/// Global variable value (mutable or immutable).
#[derive(Debug, Clone)]
pub struct GlobalValue {
    pub value: WasmValue,
    pub mutable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_value_stack_depth_limit() {
        let mut stack = ValueStack::with_max_depth(2);
        stack.push(WasmValue::I32(1)).unwrap();
        stack.push(WasmValue::I32(2)).unwrap();
        assert_eq!(stack.push(WasmValue::I32(3)), Err(TrapError::ValueStackOverflow));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_pop_n_keeps_order() {
        let mut stack = ValueStack::new();
        stack
            .extend([WasmValue::I32(1), WasmValue::I32(2), WasmValue::I32(3)])
            .unwrap();
        let top = stack.pop_n(2).unwrap();
        assert_eq!(top, vec![WasmValue::I32(2), WasmValue::I32(3)]);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop_n(2), Err(TrapError::StackUnderflow));
    }

    #[test]
    fn test_check_values() {
        let types = [ValueType::I32, ValueType::I64];
        assert!(check_values(&types, &[WasmValue::I32(0), WasmValue::I64(0)]).is_ok());
        assert_eq!(
            check_values(&types, &[WasmValue::I32(0)]),
            Err(TrapError::ArityMismatch { expected: 2, got: 1 })
        );
        assert_eq!(
            check_values(&types, &[WasmValue::I32(0), WasmValue::I32(0)]),
            Err(TrapError::TypeMismatch {
                expected: ValueType::I64,
                got: ValueType::I32
            })
        );
    }

    #[test]
    fn test_internal_errors_are_flagged() {
        assert!(TrapError::PopOnEmptyStack.is_internal());
        assert!(TrapError::UnknownFunctionAddress(FunctionAddress(7)).is_internal());
        assert!(!TrapError::CallStackExhausted.is_internal());
        assert!(!TrapError::Unreachable.is_internal());
    }

    #[test]
    fn test_call_stack_exhausted_message() {
        assert_eq!(
            alloc::format!("{}", TrapError::CallStackExhausted),
            "call stack exhausted"
        );
    }
}
