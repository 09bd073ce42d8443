//! Process-wide function address space.
//!
//! Every function the linker instantiates, guest or host, gets a dense
//! `FunctionAddress` here. The registry is append-only: entries are never
//! replaced or removed, so an address stays valid for the registry's
//! lifetime and lookups may run concurrently from any number of call chains.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use crate::context::ModuleContext;
use crate::instance::ModuleInstance;
use crate::interpreter::{TrapError, WasmValue};
use crate::module::{FunctionBody, FunctionType, ValueType};
use crate::opcodes::Instruction;
use crate::RuntimeError;

/// Upper bound on registered functions; every address fits in a `u32`.
pub const MAX_FUNCTIONS: usize = u32::MAX as usize;

/// Address of a function in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionAddress(pub u32);

/// Host callback that does not look at the calling module.
pub type HostFnNoContext =
    Arc<dyn Fn(&[WasmValue]) -> Result<Vec<WasmValue>, TrapError> + Send + Sync>;

/// Host callback receiving the resolved module context.
pub type HostFnWithContext = Arc<
    dyn Fn(&mut ModuleContext<'_>, &[WasmValue]) -> Result<Vec<WasmValue>, TrapError>
        + Send
        + Sync,
>;

/// Native calling convention of a host function.
#[derive(Clone)]
pub enum HostFunc {
    /// Called with the arguments only.
    NoContext(HostFnNoContext),
    /// Called with a `ModuleContext` ahead of the arguments.
    ModuleContext(HostFnWithContext),
}

impl HostFunc {
    /// Wrap a context-free closure.
    pub fn no_context<F>(f: F) -> Self
    where
        F: Fn(&[WasmValue]) -> Result<Vec<WasmValue>, TrapError> + Send + Sync + 'static,
    {
        HostFunc::NoContext(Arc::new(f))
    }

    /// Wrap a closure that wants the module context.
    pub fn with_context<F>(f: F) -> Self
    where
        F: Fn(&mut ModuleContext<'_>, &[WasmValue]) -> Result<Vec<WasmValue>, TrapError>
            + Send
            + Sync
            + 'static,
    {
        HostFunc::ModuleContext(Arc::new(f))
    }
}

impl core::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HostFunc::NoContext(_) => write!(f, "HostFunc::NoContext"),
            HostFunc::ModuleContext(_) => write!(f, "HostFunc::ModuleContext"),
        }
    }
}

/// Jump targets of a structured instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTarget {
    /// Position of the matching `Else` (for `If`).
    pub else_pc: Option<usize>,
    /// Position of the matching `End`.
    pub end_pc: usize,
}

/// A guest function body prepared for interpretation.
#[derive(Debug)]
pub struct GuestBody {
    /// Declared locals (parameters excluded), one entry per local.
    pub locals: Vec<ValueType>,
    /// Instructions, terminated by the function's `End`.
    pub instructions: Vec<Instruction>,
    /// Block targets, indexed by the position of `Block`/`Loop`/`If`/`Else`.
    targets: Vec<BlockTarget>,
}

impl GuestBody {
    /// Prepare a validated body: expand locals and pair up block delimiters.
    pub fn new(body: &FunctionBody) -> Self {
        let mut locals = Vec::with_capacity(body.local_count() as usize);
        for &(count, vtype) in &body.locals {
            for _ in 0..count {
                locals.push(vtype);
            }
        }

        let instructions = body.instructions.clone();
        let mut targets = alloc::vec![BlockTarget::default(); instructions.len()];
        let mut open: Vec<usize> = Vec::new();
        for (pc, instr) in instructions.iter().enumerate() {
            match instr {
                Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => open.push(pc),
                Instruction::Else => {
                    if let Some(&start) = open.last() {
                        targets[start].else_pc = Some(pc);
                    }
                }
                Instruction::End => {
                    // The function's own End has no opener.
                    if let Some(start) = open.pop() {
                        targets[start].end_pc = pc;
                        if let Some(else_pc) = targets[start].else_pc {
                            targets[else_pc].end_pc = pc;
                        }
                    }
                }
                _ => {}
            }
        }

        GuestBody {
            locals,
            instructions,
            targets,
        }
    }

    /// Jump targets for the structured instruction at `pc`.
    pub fn target(&self, pc: usize) -> BlockTarget {
        self.targets.get(pc).copied().unwrap_or_default()
    }
}

/// Guest bytecode or native callback.
#[derive(Debug, Clone)]
pub enum FunctionKind {
    Guest(Arc<GuestBody>),
    Host(HostFunc),
}

/// A registered function.
#[derive(Debug)]
pub struct FunctionEntry {
    /// Unique, stable address.
    pub address: FunctionAddress,
    /// Declared signature.
    pub signature: FunctionType,
    /// Body or callback.
    pub kind: FunctionKind,
    /// Module the function was defined in.
    pub module: Arc<ModuleInstance>,
    /// Debug name (`module.export` or `module[index]`).
    pub name: String,
}

impl FunctionEntry {
    /// Check if this is a host function.
    pub fn is_host(&self) -> bool {
        matches!(self.kind, FunctionKind::Host(_))
    }
}

/// Append-only function registry.
pub struct FunctionRegistry {
    entries: RwLock<Vec<Arc<FunctionEntry>>>,
    max_functions: usize,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_max_functions(MAX_FUNCTIONS)
    }

    /// Create an empty registry holding at most `max_functions` entries
    /// (clamped to `MAX_FUNCTIONS`).
    pub fn with_max_functions(max_functions: usize) -> Self {
        FunctionRegistry {
            entries: RwLock::new(Vec::new()),
            max_functions: max_functions.min(MAX_FUNCTIONS),
        }
    }

    /// Register a function and return its address.
    ///
    /// Fails once the registry is full; addresses are never reused.
    pub fn register(
        &self,
        signature: FunctionType,
        kind: FunctionKind,
        module: Arc<ModuleInstance>,
        name: String,
    ) -> Result<FunctionAddress, RuntimeError> {
        let mut entries = self.entries.write();
        let index = u32::try_from(entries.len())
            .ok()
            .filter(|_| entries.len() < self.max_functions)
            .ok_or_else(|| {
                RuntimeError::InstantiationError(alloc::format!(
                    "function address space exhausted registering {} ({} functions)",
                    name,
                    entries.len()
                ))
            })?;
        let address = FunctionAddress(index);
        entries.push(Arc::new(FunctionEntry {
            address,
            signature,
            kind,
            module,
            name,
        }));
        Ok(address)
    }

    /// Look up a function by address.
    pub fn lookup(&self, address: FunctionAddress) -> Result<Arc<FunctionEntry>, TrapError> {
        self.entries
            .read()
            .get(address.0 as usize)
            .cloned()
            .ok_or(TrapError::UnknownFunctionAddress(address))
    }

    /// Address the next registration will receive.
    ///
    /// Only meaningful while the caller is the sole writer (the linker
    /// reserves a module's addresses before building its instance).
    pub fn next_address(&self) -> FunctionAddress {
        FunctionAddress(self.entries.read().len() as u32)
    }

    /// How many more functions can be registered.
    pub fn remaining(&self) -> usize {
        self.max_functions.saturating_sub(self.len())
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
