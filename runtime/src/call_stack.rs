//! Call frames and the bounded call stack.
//!
//! Guest recursion is bounded by a frame count rather than by the native
//! stack: each call chain owns a `CallStack`, and pushing past the ceiling
//! is a `CallStackExhausted` trap that the embedder can recover from.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::instance::ModuleInstance;
use crate::interpreter::{TrapError, WasmValue};
use crate::registry::{FunctionEntry, GuestBody};

/// Default maximum number of frames per call chain.
pub const DEFAULT_CALL_STACK_CEILING: usize = 2000;

/// Process-wide ceiling, read on every push by stacks without an override.
static CALL_STACK_CEILING: AtomicUsize = AtomicUsize::new(DEFAULT_CALL_STACK_CEILING);

/// Current process-wide call stack ceiling.
pub fn call_stack_ceiling() -> usize {
    CALL_STACK_CEILING.load(Ordering::Relaxed)
}

/// Set the process-wide call stack ceiling. Zero is ignored.
pub fn set_call_stack_ceiling(ceiling: usize) {
    if ceiling == 0 {
        log::debug!("[KPIO Interp] ignoring zero call stack ceiling");
        return;
    }
    CALL_STACK_CEILING.store(ceiling, Ordering::Relaxed);
}

/// Restore the default process-wide ceiling.
pub fn reset_call_stack_ceiling() {
    CALL_STACK_CEILING.store(DEFAULT_CALL_STACK_CEILING, Ordering::Relaxed);
}

// ============================================================================
// Frames
// ============================================================================

/// A structured control flow label.
#[derive(Debug, Clone, Copy)]
pub struct Label {
    /// Values carried by a branch to this label.
    pub arity: usize,
    /// Operand stack height when the block was entered.
    pub stack_height: usize,
    /// Position of the opening `Block`/`Loop`/`If`.
    pub start_pc: usize,
    /// Position of the matching `End`.
    pub end_pc: usize,
    /// Branches to a loop jump back to its start.
    pub is_loop: bool,
}

/// One in-flight call.
#[derive(Debug)]
pub struct Frame {
    /// Registry entry being executed.
    pub function: Arc<FunctionEntry>,
    /// Module instance the call executes against.
    pub module: Arc<ModuleInstance>,
    /// Guest body; `None` while a host function runs.
    pub body: Option<Arc<GuestBody>>,
    /// Next instruction to execute.
    pub pc: usize,
    /// Parameters followed by declared locals.
    pub locals: Vec<WasmValue>,
    /// Operand stack height at entry.
    pub stack_base: usize,
    /// Open blocks, innermost last.
    pub labels: Vec<Label>,
}

impl Frame {
    /// Frame for a guest function, bound to its defining module.
    pub fn guest(
        function: Arc<FunctionEntry>,
        body: Arc<GuestBody>,
        args: &[WasmValue],
        stack_base: usize,
    ) -> Self {
        let mut locals = Vec::with_capacity(args.len() + body.locals.len());
        locals.extend_from_slice(args);
        locals.extend(body.locals.iter().map(|vt| WasmValue::default_for(*vt)));
        Frame {
            module: function.module.clone(),
            function,
            body: Some(body),
            pc: 0,
            locals,
            stack_base,
            labels: Vec::new(),
        }
    }

    /// Frame for a host function, bound to the module its context resolved to.
    pub fn host(function: Arc<FunctionEntry>, module: Arc<ModuleInstance>, stack_base: usize) -> Self {
        Frame {
            function,
            module,
            body: None,
            pc: 0,
            locals: Vec::new(),
            stack_base,
            labels: Vec::new(),
        }
    }

    /// Number of results this call returns.
    pub fn return_arity(&self) -> usize {
        self.function.signature.results.len()
    }
}

// ============================================================================
// Call Stack
// ============================================================================

/// LIFO sequence of frames for one call chain.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
    ceiling: Option<usize>,
}

impl CallStack {
    /// Create a stack that follows the process-wide ceiling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stack with its own ceiling.
    pub fn with_ceiling(ceiling: usize) -> Self {
        CallStack {
            frames: Vec::new(),
            ceiling: Some(ceiling.max(1)),
        }
    }

    /// Ceiling in effect for the next push.
    pub fn ceiling(&self) -> usize {
        self.ceiling.unwrap_or_else(call_stack_ceiling)
    }

    /// Append a frame; fails without touching the stack at the ceiling.
    pub fn push_frame(&mut self, frame: Frame) -> Result<(), TrapError> {
        if self.frames.len() >= self.ceiling() {
            log::debug!(
                "[KPIO Interp] call stack exhausted at depth {} calling {}",
                self.frames.len(),
                frame.function.name
            );
            return Err(TrapError::CallStackExhausted);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Remove and return the top frame.
    pub fn pop_frame(&mut self) -> Result<Frame, TrapError> {
        self.frames.pop().ok_or(TrapError::PopOnEmptyStack)
    }

    /// Current number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Check if no call is in progress.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Top frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Top frame, mutably.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Drop every frame above `depth`.
    pub fn unwind_to(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    /// Frames from bottom to top.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FunctionType;
    use crate::registry::{FunctionAddress, FunctionKind, HostFunc};
    use alloc::string::String;
    use alloc::vec;

    fn frame(n: u32) -> Frame {
        let module = Arc::new(ModuleInstance::empty("m"));
        let entry = Arc::new(FunctionEntry {
            address: FunctionAddress(n),
            signature: FunctionType::default(),
            kind: FunctionKind::Host(HostFunc::no_context(|_| Ok(vec![]))),
            module: module.clone(),
            name: alloc::format!("m[{}]", n),
        });
        Frame::host(entry, module, 0)
    }

    fn addresses(stack: &CallStack) -> Vec<u32> {
        stack.frames().iter().map(|f| f.function.address.0).collect()
    }

    #[test]
    fn test_push_frame_keeps_order() {
        let mut stack = CallStack::with_ceiling(8);
        assert!(stack.is_empty());

        stack.push_frame(frame(1)).unwrap();
        assert_eq!(addresses(&stack), vec![1]);

        stack.push_frame(frame(2)).unwrap();
        assert_eq!(addresses(&stack), vec![1, 2]);
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.top().map(|f| f.function.address), Some(FunctionAddress(2)));
    }

    #[test]
    fn test_push_frame_stack_overflow() {
        let mut stack = CallStack::with_ceiling(3);
        stack.push_frame(frame(1)).unwrap();
        stack.push_frame(frame(2)).unwrap();
        stack.push_frame(frame(3)).unwrap();
        assert_eq!(stack.push_frame(frame(4)), Err(TrapError::CallStackExhausted));
        assert_eq!(stack.depth(), 3);
        assert_eq!(addresses(&stack), vec![1, 2, 3]);
    }

    #[test]
    fn test_fill_to_ceiling() {
        for ceiling in [1usize, 2, 5, 17] {
            let mut stack = CallStack::with_ceiling(ceiling);
            for n in 0..ceiling as u32 {
                stack.push_frame(frame(n)).unwrap();
            }
            assert_eq!(addresses(&stack), (0..ceiling as u32).collect::<Vec<_>>());
            assert!(stack.push_frame(frame(99)).is_err());
            assert_eq!(stack.depth(), ceiling);
        }
    }

    #[test]
    fn test_pop_frame_lifo_and_empty() {
        let mut stack = CallStack::with_ceiling(4);
        stack.push_frame(frame(1)).unwrap();
        stack.push_frame(frame(2)).unwrap();
        assert_eq!(stack.pop_frame().unwrap().function.address, FunctionAddress(2));
        assert_eq!(stack.pop_frame().unwrap().function.address, FunctionAddress(1));
        let err = stack.pop_frame().unwrap_err();
        assert_eq!(err, TrapError::PopOnEmptyStack);
        assert!(err.is_internal());
    }

    #[test]
    fn test_unwind_to() {
        let mut stack = CallStack::with_ceiling(4);
        for n in 0..4 {
            stack.push_frame(frame(n)).unwrap();
        }
        stack.unwind_to(1);
        assert_eq!(addresses(&stack), vec![0]);
        stack.unwind_to(3);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_with_ceiling_overrides_process_value() {
        let stack = CallStack::with_ceiling(3);
        assert_eq!(stack.ceiling(), 3);
        assert_eq!(CallStack::with_ceiling(0).ceiling(), 1);
    }

    #[test]
    fn test_guest_frame_locals() {
        use crate::module::{FunctionBody, ValueType};
        use crate::opcodes::Instruction;

        let module = Arc::new(ModuleInstance::empty("m"));
        let body = Arc::new(GuestBody::new(&FunctionBody::new(
            vec![(2, ValueType::I64)],
            vec![Instruction::End],
        )));
        let entry = Arc::new(FunctionEntry {
            address: FunctionAddress(0),
            signature: FunctionType::new(&[ValueType::I32], &[]),
            kind: FunctionKind::Guest(body.clone()),
            module: module.clone(),
            name: String::from("m.f"),
        });
        let frame = Frame::guest(entry, body, &[WasmValue::I32(9)], 4);
        assert_eq!(
            frame.locals,
            vec![WasmValue::I32(9), WasmValue::I64(0), WasmValue::I64(0)]
        );
        assert_eq!(frame.stack_base, 4);
        assert!(Arc::ptr_eq(&frame.module, &module));
        assert_eq!(frame.return_arity(), 0);
    }
}
