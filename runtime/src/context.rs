//! Capability view handed to host functions.
//!
//! A `ModuleContext` binds one host invocation to the module instance it
//! should act on and lends it the interpreter driving the call, so the host
//! can read/write that module's memory, globals and table or call back into
//! guest code. It is built fresh for every host call and borrows both,
//! so it cannot outlive the invocation.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::executor::Interpreter;
use crate::instance::ModuleInstance;
use crate::interpreter::{TrapError, WasmValue};
use crate::memory::LinearMemory;
use crate::registry::FunctionAddress;

/// Per-call module view for host functions.
pub struct ModuleContext<'a> {
    interpreter: &'a mut Interpreter,
    module: Arc<ModuleInstance>,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(interpreter: &'a mut Interpreter, module: Arc<ModuleInstance>) -> Self {
        ModuleContext {
            interpreter,
            module,
        }
    }

    /// The module this call is bound to.
    pub fn module(&self) -> &Arc<ModuleInstance> {
        &self.module
    }

    /// The bound module's memory, if it has one.
    pub fn memory(&self) -> Option<&Arc<Mutex<LinearMemory>>> {
        self.module.memory()
    }

    /// Copy bytes out of the bound module's memory.
    pub fn read_memory(&self, offset: usize, len: usize) -> Result<Vec<u8>, TrapError> {
        let memory = self.module.require_memory()?.lock();
        Ok(memory.read_bytes(offset, len)?.to_vec())
    }

    /// Write bytes into the bound module's memory.
    pub fn write_memory(&self, offset: usize, bytes: &[u8]) -> Result<(), TrapError> {
        self.module.require_memory()?.lock().write_bytes(offset, bytes)
    }

    /// Read a little-endian u32 from the bound module's memory.
    pub fn read_u32(&self, offset: usize) -> Result<u32, TrapError> {
        self.module.require_memory()?.lock().read_u32(offset)
    }

    /// Write a little-endian u32 into the bound module's memory.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), TrapError> {
        self.module.require_memory()?.lock().write_u32(offset, value)
    }

    /// Read a global of the bound module.
    pub fn global(&self, idx: u32) -> Result<WasmValue, TrapError> {
        self.module.global(idx)
    }

    /// Write a mutable global of the bound module.
    pub fn set_global(&self, idx: u32, value: WasmValue) -> Result<(), TrapError> {
        self.module.set_global(idx, value)
    }

    /// Read an element of the bound module's table.
    pub fn table_get(&self, index: u32) -> Result<Option<FunctionAddress>, TrapError> {
        self.module.table_get(index)
    }

    /// Call any function by address on the current call chain.
    ///
    /// Frames pushed here count toward the same ceiling as the guest code
    /// that called into the host.
    pub fn call(&mut self, address: FunctionAddress, args: &[WasmValue]) -> Result<Vec<WasmValue>, TrapError> {
        self.interpreter.call_function(address, args)
    }

    /// Call a function exported by the bound module.
    pub fn call_export(&mut self, name: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>, TrapError> {
        let address = self.module.exported_function(name)?;
        self.interpreter.call_function(address, args)
    }

    /// Current call stack depth (the host's own frame included).
    pub fn depth(&self) -> usize {
        self.interpreter.call_stack().depth()
    }
}
