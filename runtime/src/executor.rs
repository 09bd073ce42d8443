//! Call dispatch and the guest interpretation loop.
//!
//! `Interpreter` owns one call chain: a `CallStack`, the operand stack it
//! shares across frames, and a handle to the read-only `FunctionRegistry`.
//! Guest-to-guest calls push frames and stay inside one loop iteration
//! budget (no native recursion); host calls run inline with a
//! `ModuleContext`, and host callbacks re-entering `call_function` nest a
//! new loop on the same stacks under the same ceiling.
//!
//! Each active host call holds one native nesting level (the callback plus
//! the loop it may start), so their count is capped separately by
//! `max_host_nesting`. Hitting either limit is a `CallStackExhausted` trap.
//!
//! Every failing `call_function` returns the call stack and operand stack
//! to exactly the heights they had when it was entered.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::call_stack::{CallStack, Frame, Label};
use crate::context::ModuleContext;
use crate::instance::ModuleInstance;
use crate::interpreter::{check_values, TrapError, ValueStack, WasmValue};
use crate::memory::LinearMemory;
use crate::opcodes::{Instruction, MemArg};
use crate::registry::{
    BlockTarget, FunctionAddress, FunctionEntry, FunctionKind, FunctionRegistry, GuestBody, HostFunc,
};
use crate::RuntimeConfig;

/// Default cap on host calls active at once in one call chain.
///
/// Sized for a debug build on a 1 MiB stack; kernel threads with smaller
/// stacks should lower it through `RuntimeConfig::max_host_nesting`.
pub const DEFAULT_MAX_HOST_NESTING: usize = 100;

/// Control flow outcome from instruction execution.
enum ControlFlow {
    Continue,
    Return,
    Call(FunctionAddress),
}

/// Dispatcher for one call chain.
pub struct Interpreter {
    registry: Arc<FunctionRegistry>,
    call_stack: CallStack,
    stack: ValueStack,
    /// Fuel remaining (None = unlimited).
    fuel: Option<u64>,
    /// Host calls currently on the native stack.
    host_nesting: usize,
    max_host_nesting: usize,
}

impl Interpreter {
    /// Create an interpreter with the default configuration.
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self::with_config(registry, &RuntimeConfig::default())
    }

    /// Create an interpreter from a configuration.
    pub fn with_config(registry: Arc<FunctionRegistry>, config: &RuntimeConfig) -> Self {
        let call_stack = match config.call_stack_ceiling {
            Some(ceiling) => CallStack::with_ceiling(ceiling),
            None => CallStack::new(),
        };
        Interpreter {
            registry,
            call_stack,
            stack: ValueStack::with_max_depth(config.max_value_stack_depth),
            fuel: config.fuel,
            host_nesting: 0,
            max_host_nesting: config.max_host_nesting.max(1),
        }
    }

    /// The registry calls are resolved against.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// The call stack of this chain.
    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    /// Number of values on the operand stack.
    pub fn operand_depth(&self) -> usize {
        self.stack.len()
    }

    /// Number of host calls in progress.
    pub fn host_nesting(&self) -> usize {
        self.host_nesting
    }

    /// Get remaining fuel.
    pub fn fuel(&self) -> Option<u64> {
        self.fuel
    }

    /// Set fuel for execution (None = unlimited).
    pub fn set_fuel(&mut self, fuel: Option<u64>) {
        self.fuel = fuel;
    }

    /// Run a function to completion.
    pub fn call_function(
        &mut self,
        address: FunctionAddress,
        args: &[WasmValue],
    ) -> Result<Vec<WasmValue>, TrapError> {
        let entry = self.registry.lookup(address)?;
        check_values(&entry.signature.params, args)?;

        let depth = self.call_stack.depth();
        let height = self.stack.len();
        log::trace!("[KPIO Interp] call {} at depth {}", entry.name, depth);

        let result = match guest_body(&entry) {
            Some(body) => self.invoke_guest(entry, body, args),
            None => {
                let module = entry.module.clone();
                self.call_host_func(module, entry, args)
            }
        };

        if let Err(ref trap) = result {
            log::debug!(
                "[KPIO Interp] call to {:?} trapped at depth {}: {}",
                address,
                self.call_stack.depth(),
                trap
            );
            self.call_stack.unwind_to(depth);
            self.stack.truncate(height);
        }
        result
    }

    /// Call an exported function of `module`.
    pub fn call_export(
        &mut self,
        module: &ModuleInstance,
        name: &str,
        args: &[WasmValue],
    ) -> Result<Vec<WasmValue>, TrapError> {
        let address = module.exported_function(name)?;
        self.call_function(address, args)
    }

    /// Invoke a host function.
    ///
    /// The context binds to the top frame's module when a call is in
    /// progress (the caller's memory, as imports expect). With an empty call
    /// stack there is no caller, so it binds to `default_module`; top-level
    /// calls pass the function's own defining module.
    pub fn call_host_func(
        &mut self,
        default_module: Arc<ModuleInstance>,
        entry: Arc<FunctionEntry>,
        args: &[WasmValue],
    ) -> Result<Vec<WasmValue>, TrapError> {
        let func = match &entry.kind {
            FunctionKind::Host(func) => func.clone(),
            FunctionKind::Guest(_) => {
                return Err(TrapError::HostError(alloc::format!(
                    "{} is not a host function",
                    entry.name
                )))
            }
        };

        let module = match self.call_stack.top() {
            Some(frame) => frame.module.clone(),
            None => default_module,
        };

        if self.host_nesting >= self.max_host_nesting {
            log::debug!(
                "[KPIO Interp] host nesting limit {} reached calling {}",
                self.max_host_nesting,
                entry.name
            );
            return Err(TrapError::CallStackExhausted);
        }

        let depth = self.call_stack.depth();
        self.call_stack
            .push_frame(Frame::host(entry.clone(), module.clone(), self.stack.len()))?;

        self.host_nesting += 1;
        let result = match &func {
            HostFunc::NoContext(f) => f(args),
            HostFunc::ModuleContext(f) => {
                let mut ctx = ModuleContext::new(self, module);
                f(&mut ctx, args)
            }
        }
        .and_then(|results| {
            check_values(&entry.signature.results, &results)?;
            Ok(results)
        });
        self.host_nesting -= 1;

        match result {
            Ok(results) => {
                self.call_stack.pop_frame()?;
                Ok(results)
            }
            Err(trap) => {
                self.call_stack.unwind_to(depth);
                Err(trap)
            }
        }
    }

    /// Push a guest frame and run it until it returns.
    fn invoke_guest(
        &mut self,
        entry: Arc<FunctionEntry>,
        body: Arc<GuestBody>,
        args: &[WasmValue],
    ) -> Result<Vec<WasmValue>, TrapError> {
        let arity = entry.signature.results.len();
        let floor = self.call_stack.depth();
        let base = self.stack.len();
        self.call_stack.push_frame(Frame::guest(entry, body, args, base))?;
        self.run(floor)?;
        self.stack.pop_n(arity)
    }

    /// Execute until the call stack drops back to `floor` frames.
    fn run(&mut self, floor: usize) -> Result<(), TrapError> {
        while self.call_stack.depth() > floor {
            if let Some(fuel) = self.fuel.as_mut() {
                if *fuel == 0 {
                    return Err(TrapError::FuelExhausted);
                }
                *fuel -= 1;
            }

            match self.step()? {
                ControlFlow::Continue => {}
                ControlFlow::Return => self.return_from_frame()?,
                ControlFlow::Call(address) => self.call_from_guest(address)?,
            }
        }
        Ok(())
    }

    /// Pop the current frame and hand its results to the caller.
    fn return_from_frame(&mut self) -> Result<(), TrapError> {
        let frame = self.call_stack.pop_frame()?;
        let results = self.stack.pop_n(frame.return_arity())?;
        self.stack.truncate(frame.stack_base);
        self.stack.extend(results)
    }

    /// Perform a `call`/`call_indirect` issued by the top guest frame.
    fn call_from_guest(&mut self, address: FunctionAddress) -> Result<(), TrapError> {
        let entry = self.registry.lookup(address)?;
        let args = self.stack.pop_n(entry.signature.params.len())?;
        match guest_body(&entry) {
            Some(body) => {
                let base = self.stack.len();
                self.call_stack.push_frame(Frame::guest(entry, body, &args, base))
            }
            None => {
                let module = entry.module.clone();
                let results = self.call_host_func(module, entry, &args)?;
                self.stack.extend(results)
            }
        }
    }

    /// Execute a single instruction of the top frame.
    fn step(&mut self) -> Result<ControlFlow, TrapError> {
        let Interpreter {
            registry,
            call_stack,
            stack,
            ..
        } = self;
        let frame = call_stack.top_mut().ok_or(TrapError::PopOnEmptyStack)?;

        let pc = frame.pc;
        let instr = match frame.body.as_ref() {
            Some(body) => match body.instructions.get(pc) {
                Some(instr) => *instr,
                None => return Ok(ControlFlow::Return),
            },
            None => {
                return Err(TrapError::HostError(String::from(
                    "host frame reached the interpreter loop",
                )))
            }
        };
        frame.pc += 1;

        match instr {
            // ================================================================
            // Control Flow
            // ================================================================
            Instruction::Unreachable => return Err(TrapError::Unreachable),
            Instruction::Nop => {}

            Instruction::Block(bt) => {
                let end_pc = block_target(frame, pc).end_pc;
                frame.labels.push(Label {
                    arity: bt.arity(),
                    stack_height: stack.len(),
                    start_pc: pc,
                    end_pc,
                    is_loop: false,
                });
            }
            Instruction::Loop(_) => {
                let end_pc = block_target(frame, pc).end_pc;
                frame.labels.push(Label {
                    arity: 0,
                    stack_height: stack.len(),
                    start_pc: pc,
                    end_pc,
                    is_loop: true,
                });
            }
            Instruction::If(bt) => {
                let cond = stack.pop_i32()?;
                let target = block_target(frame, pc);
                frame.labels.push(Label {
                    arity: bt.arity(),
                    stack_height: stack.len(),
                    start_pc: pc,
                    end_pc: target.end_pc,
                    is_loop: false,
                });
                if cond == 0 {
                    // Without an else arm, land on End so the label is popped.
                    frame.pc = match target.else_pc {
                        Some(else_pc) => else_pc + 1,
                        None => target.end_pc,
                    };
                }
            }
            Instruction::Else => {
                // Then-arm finished: skip the else arm.
                frame.pc = block_target(frame, pc).end_pc;
            }
            Instruction::End => {
                if frame.labels.pop().is_none() {
                    return Ok(ControlFlow::Return);
                }
            }
            Instruction::Br(depth) => return branch(frame, stack, depth),
            Instruction::BrIf(depth) => {
                if stack.pop_i32()? != 0 {
                    return branch(frame, stack, depth);
                }
            }
            Instruction::Return => return Ok(ControlFlow::Return),

            Instruction::Call(func_idx) => {
                let address = frame
                    .module
                    .function_address(func_idx)
                    .ok_or(TrapError::UnknownFunctionIndex(func_idx))?;
                return Ok(ControlFlow::Call(address));
            }
            Instruction::CallIndirect(type_idx) => {
                let elem_idx = stack.pop_i32()? as u32;
                let address = frame
                    .module
                    .table_get(elem_idx)?
                    .ok_or(TrapError::UninitializedElement { index: elem_idx })?;
                let expected = frame
                    .module
                    .func_type(type_idx)
                    .ok_or(TrapError::IndirectCallTypeMismatch {
                        expected_type: type_idx,
                    })?;
                if registry.lookup(address)?.signature != *expected {
                    return Err(TrapError::IndirectCallTypeMismatch {
                        expected_type: type_idx,
                    });
                }
                return Ok(ControlFlow::Call(address));
            }

            // ================================================================
            // Parametric
            // ================================================================
            Instruction::Drop => {
                stack.pop()?;
            }
            Instruction::Select => {
                let cond = stack.pop_i32()?;
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(if cond != 0 { a } else { b })?;
            }

            // ================================================================
            // Variables
            // ================================================================
            Instruction::LocalGet(idx) => {
                let value = *frame
                    .locals
                    .get(idx as usize)
                    .ok_or(TrapError::InvalidLocal(idx))?;
                stack.push(value)?;
            }
            Instruction::LocalSet(idx) => {
                let value = stack.pop()?;
                *frame
                    .locals
                    .get_mut(idx as usize)
                    .ok_or(TrapError::InvalidLocal(idx))? = value;
            }
            Instruction::LocalTee(idx) => {
                let value = *stack.peek()?;
                *frame
                    .locals
                    .get_mut(idx as usize)
                    .ok_or(TrapError::InvalidLocal(idx))? = value;
            }
            Instruction::GlobalGet(idx) => {
                stack.push(frame.module.global(idx)?)?;
            }
            Instruction::GlobalSet(idx) => {
                let value = stack.pop()?;
                frame.module.set_global(idx, value)?;
            }

            // ================================================================
            // Memory
            // ================================================================
            Instruction::I32Load(memarg) => {
                let base = stack.pop_i32()? as u32;
                let value = {
                    let memory = frame.module.require_memory()?.lock();
                    memory.read_u32(effective_address(&memory, base, memarg, 4)?)?
                };
                stack.push(WasmValue::I32(value as i32))?;
            }
            Instruction::I32Store(memarg) => {
                let value = stack.pop_i32()?;
                let base = stack.pop_i32()? as u32;
                let mut memory = frame.module.require_memory()?.lock();
                let addr = effective_address(&memory, base, memarg, 4)?;
                memory.write_u32(addr, value as u32)?;
            }
            Instruction::MemorySize => {
                let pages = frame.module.require_memory()?.lock().pages();
                stack.push(WasmValue::I32(pages as i32))?;
            }
            Instruction::MemoryGrow => {
                let delta = stack.pop_i32()? as u32;
                let old = frame.module.require_memory()?.lock().grow(delta);
                stack.push(WasmValue::I32(old.map_or(-1, |p| p as i32)))?;
            }

            // ================================================================
            // Numeric
            // ================================================================
            Instruction::I32Const(v) => stack.push(WasmValue::I32(v))?,
            Instruction::I64Const(v) => stack.push(WasmValue::I64(v))?,
            Instruction::I32Eqz => {
                let a = stack.pop_i32()?;
                stack.push(WasmValue::I32((a == 0) as i32))?;
            }
            Instruction::I32Eq => i32_binop(stack, |a, b| (a == b) as i32)?,
            Instruction::I32Ne => i32_binop(stack, |a, b| (a != b) as i32)?,
            Instruction::I32LtS => i32_binop(stack, |a, b| (a < b) as i32)?,
            Instruction::I32GtS => i32_binop(stack, |a, b| (a > b) as i32)?,
            Instruction::I32LeS => i32_binop(stack, |a, b| (a <= b) as i32)?,
            Instruction::I32Add => i32_binop(stack, i32::wrapping_add)?,
            Instruction::I32Sub => i32_binop(stack, i32::wrapping_sub)?,
            Instruction::I32Mul => i32_binop(stack, i32::wrapping_mul)?,
            Instruction::I64Add => {
                let b = stack.pop_i64()?;
                let a = stack.pop_i64()?;
                stack.push(WasmValue::I64(a.wrapping_add(b)))?;
            }
        }

        Ok(ControlFlow::Continue)
    }
}

/// Guest body of an entry, if it has one.
fn guest_body(entry: &FunctionEntry) -> Option<Arc<GuestBody>> {
    match &entry.kind {
        FunctionKind::Guest(body) => Some(body.clone()),
        FunctionKind::Host(_) => None,
    }
}

fn block_target(frame: &Frame, pc: usize) -> BlockTarget {
    frame
        .body
        .as_ref()
        .map(|body| body.target(pc))
        .unwrap_or_default()
}

/// Branch to the label `depth` levels out; past the outermost label this
/// returns from the function.
fn branch(frame: &mut Frame, stack: &mut ValueStack, depth: u32) -> Result<ControlFlow, TrapError> {
    let depth = depth as usize;
    let open = frame.labels.len();
    if depth >= open {
        return Ok(ControlFlow::Return);
    }

    let label = frame.labels[open - 1 - depth];
    let carried = stack.pop_n(label.arity)?;
    stack.truncate(label.stack_height);
    stack.extend(carried)?;

    if label.is_loop {
        frame.labels.truncate(open - depth);
        frame.pc = label.start_pc + 1;
    } else {
        frame.labels.truncate(open - 1 - depth);
        frame.pc = label.end_pc + 1;
    }
    Ok(ControlFlow::Continue)
}

/// `base + offset` as a memory index; overflow is an out-of-bounds access.
fn effective_address(
    memory: &LinearMemory,
    base: u32,
    memarg: MemArg,
    size: usize,
) -> Result<usize, TrapError> {
    (base as usize)
        .checked_add(memarg.offset as usize)
        .ok_or(TrapError::MemoryOutOfBounds {
            offset: base as usize,
            size,
            memory_size: memory.size(),
        })
}

fn i32_binop(stack: &mut ValueStack, op: impl Fn(i32, i32) -> i32) -> Result<(), TrapError> {
    let b = stack.pop_i32()?;
    let a = stack.pop_i32()?;
    stack.push(WasmValue::I32(op(a, b)))
}
