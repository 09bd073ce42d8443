//! KPIO WASM Interpreter Core
//!
//! Execution core of the KPIO WebAssembly runtime: a registry of guest and
//! host functions addressed by `FunctionAddress`, a bounded call stack, and
//! a dispatcher that runs guest bytecode and invokes host callbacks with the
//! right module context.
//!
//! # Architecture
//!
//! - `module`: Validated module representation handed to the linker
//! - `opcodes`: Instruction set understood by the interpreter loop
//! - `interpreter`: Values, operand stack, tables and trap types
//! - `memory`: Linear memory with bounds-checked access
//! - `registry`: Append-only function address space
//! - `call_stack`: Frames and the configurable depth ceiling
//! - `instance`: Module instances, host modules and the `Store` linker
//! - `context`: Module view passed to host functions
//! - `executor`: Call dispatch and the guest interpretation loop
//!
//! Recursion depth is bounded by frames, never by the native stack: running
//! past the ceiling is a `TrapError::CallStackExhausted`, and the interpreter
//! is fully usable afterwards. Host callbacks re-entering guest code are the
//! one path that nests natively, so their nesting has its own cap.

#![no_std]

extern crate alloc;

pub mod call_stack;
pub mod context;
pub mod executor;
pub mod instance;
pub mod interpreter;
pub mod memory;
pub mod module;
pub mod opcodes;
pub mod registry;

use alloc::string::String;

pub use call_stack::{
    call_stack_ceiling, reset_call_stack_ceiling, set_call_stack_ceiling, CallStack, Frame,
    DEFAULT_CALL_STACK_CEILING,
};
pub use context::ModuleContext;
pub use executor::{Interpreter, DEFAULT_MAX_HOST_NESTING};
pub use instance::{ExternVal, HostModule, ModuleInstance, Store};
pub use interpreter::{TrapError, WasmValue, MAX_VALUE_STACK_DEPTH};
pub use registry::{FunctionAddress, FunctionEntry, FunctionKind, FunctionRegistry, HostFunc};

/// Runtime error types.
///
/// Raised while building instances. Failures during a call are
/// `TrapError`s instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Failed to instantiate module.
    InstantiationError(String),
    /// Memory limits could not be satisfied.
    MemoryError(String),
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RuntimeError::InstantiationError(msg) => write!(f, "Instantiation error: {}", msg),
            RuntimeError::MemoryError(msg) => write!(f, "Memory error: {}", msg),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-interpreter frame limit; `None` follows the process-wide ceiling.
    pub call_stack_ceiling: Option<usize>,
    /// Maximum operand stack depth.
    pub max_value_stack_depth: usize,
    /// Host calls that may be active at once; each one nests the native stack.
    pub max_host_nesting: usize,
    /// Instruction budget per interpreter (None = unlimited).
    pub fuel: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            call_stack_ceiling: None,
            max_value_stack_depth: MAX_VALUE_STACK_DEPTH,
            max_host_nesting: DEFAULT_MAX_HOST_NESTING,
            fuel: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.call_stack_ceiling, None);
        assert_eq!(config.max_value_stack_depth, MAX_VALUE_STACK_DEPTH);
        assert_eq!(config.max_host_nesting, DEFAULT_MAX_HOST_NESTING);
        assert_eq!(config.fuel, None);
    }

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::InstantiationError(String::from("unresolved import env.f"));
        assert_eq!(format!("{}", err), "Instantiation error: unresolved import env.f");
    }
}
