// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The execution engine.
//!
//! Dispatch is a trampoline loop over one handler arm per opcode; each
//! iteration reads `(frame, ip)` state, executes the instruction against the
//! value stack and the process, and continues until control returns past the
//! segment's trampoline frame. A top-level execute and a nested
//! [`runtime_call`] use the same machinery.
//!
//! The VM keeps a fixed cushion of [`VSTACK_CUSHION`] slots beyond the usable
//! value-stack region so a builtin can always push its declared outputs
//! without a check.

use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::builtin::{BuiltinContext, PanicMessage};
use crate::layout::{Layout, align_up};
use crate::memory::{Allocation, AllocationStatus, Backing};
use crate::module::Signature;
use crate::opcode::Opcode;
use crate::process::{FRAME_OVERHEAD, Frame, Process, ReturnTo, Stacktrace};
use crate::program::{Definition, Program};
use crate::value::{Address, Value};

/// Slots reserved beyond the usable value-stack region.
///
/// A builtin's output arity is bounded by `u8::MAX`, so this cushion
/// guarantees any builtin can push its declared outputs.
pub const VSTACK_CUSHION: usize = 255;

/// The downward-growing value stack.
///
/// Stored top-at-the-end; depth indices count from the top, so `peek(0)` is
/// the top of the stack.
#[derive(Debug, Default)]
pub struct ValueStack {
    values: Vec<Value>,
    limit: usize,
}

impl ValueStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            values: Vec::with_capacity(limit + VSTACK_CUSHION),
            limit,
        }
    }

    /// A small scratch stack for build-time constant folding.
    #[must_use]
    pub(crate) fn for_folding() -> Self {
        Self::new(VSTACK_CUSHION)
    }

    /// Current number of values.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.values.len()
    }

    /// The usable element limit (excluding the builtin cushion).
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Pushes a value.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Pops the top value.
    pub fn pop(&mut self) -> Value {
        let value = self.values[self.values.len() - 1];
        self.values.truncate(self.values.len() - 1);
        value
    }

    /// Reads the value at depth `idx` (0 is the top).
    #[must_use]
    pub fn peek(&self, idx: u16) -> Value {
        self.values[self.values.len() - 1 - usize::from(idx)]
    }

    /// The top value.
    #[must_use]
    pub fn top(&self) -> Value {
        self.peek(0)
    }

    /// Mutable access to the top value.
    pub fn top_mut(&mut self) -> &mut Value {
        let i = self.values.len() - 1;
        &mut self.values[i]
    }

    /// Removes the value at depth `idx`, preserving the order of the rest.
    pub fn remove(&mut self, idx: u16) {
        let i = self.values.len() - 1 - usize::from(idx);
        self.values.remove(i);
    }

    /// Rotates the value at depth `idx` to the top.
    pub fn roll(&mut self, idx: u16) {
        let i = self.values.len() - 1 - usize::from(idx);
        let value = self.values.remove(i);
        self.values.push(value);
    }

    /// Swaps the two topmost values.
    pub fn swap(&mut self) {
        let len = self.values.len();
        self.values.swap(len - 1, len - 2);
    }

    /// Iterates the values bottom-first.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }
}

/// A pluggable source of heap memory for the `heap` builtin library.
///
/// Implementations return owned zeroed buffers; alignment beyond byte
/// granularity is modeled by the allocation table's offset checks.
pub trait HeapAllocator {
    /// Allocates `size` zeroed bytes, or `None` if the request is refused.
    fn allocate(&mut self, size: usize, align: u32) -> Option<Box<[u8]>>;
}

/// Allocates from the global allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemAllocator;

impl HeapAllocator for SystemAllocator {
    fn allocate(&mut self, size: usize, _align: u32) -> Option<Box<[u8]>> {
        Some(vec![0u8; size].into_boxed_slice())
    }
}

/// Refuses every allocation.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullAllocator;

impl HeapAllocator for NullAllocator {
    fn allocate(&mut self, _size: usize, _align: u32) -> Option<Box<[u8]>> {
        None
    }
}

/// Information handed to a [`PanicHandler`].
#[derive(Debug)]
pub struct PanicInfo<'a> {
    /// The panic message.
    pub message: &'a str,
    /// The call stack at the panic site, leaf first.
    pub stacktrace: &'a Stacktrace,
}

/// Called when a process panics, before the failure is returned.
pub type PanicHandler = fn(&PanicInfo<'_>);

/// Receives diagnostic lines from the `debug` builtin library.
pub type LogHandler = fn(&str);

fn default_panic_handler(_: &PanicInfo<'_>) {}

fn default_log_handler(_: &str) {}

/// VM configuration.
#[derive(Copy, Clone, Debug)]
pub struct VmOptions {
    /// Fixed size of the call stack in bytes.
    pub cstack_bytes: usize,
    /// Fixed size of the usable value stack in elements.
    pub vstack_elements: usize,
    /// Initial step limit; zero means unlimited.
    pub step_limit: u64,
    /// Invoked when a process panics.
    pub panic_handler: PanicHandler,
    /// Receives `debug` library output.
    pub log_handler: LogHandler,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            cstack_bytes: 512 * 1024,
            vstack_elements: 16 * 1024,
            step_limit: 0,
            panic_handler: default_panic_handler,
            log_handler: default_log_handler,
        }
    }
}

/// A failed execution: the panic message plus the captured stack trace.
#[derive(Clone, Debug)]
pub struct Panic {
    message: String,
    stacktrace: Stacktrace,
}

impl Panic {
    /// The panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The call stack at the panic site, leaf first.
    #[must_use]
    pub fn stacktrace(&self) -> &Stacktrace {
        &self.stacktrace
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl core::error::Error for Panic {}

/// A virtual machine: configuration plus the heap allocator plug-in.
///
/// Modules and programs are built elsewhere; the VM only executes. Processes
/// are created per [`Vm::execute`] and destroyed on completion.
#[derive(Debug)]
pub struct Vm<A: HeapAllocator = SystemAllocator> {
    options: VmOptions,
    allocator: A,
}

impl Default for Vm<SystemAllocator> {
    fn default() -> Self {
        Self::new(SystemAllocator, VmOptions::default())
    }
}

impl<A: HeapAllocator> Vm<A> {
    /// Creates a VM with `allocator` and `options`.
    #[must_use]
    pub fn new(allocator: A, options: VmOptions) -> Self {
        Self { options, allocator }
    }

    /// Executes `program` with `input` as the entry function's arguments.
    ///
    /// `input[0]` is the bottommost argument. On success the returned vector
    /// holds the entry function's outputs, bottom first. On failure the panic
    /// handler has been invoked and the output is untouched.
    pub fn execute(&mut self, program: &Program<'_>, input: &[Value]) -> Result<Vec<Value>, Panic> {
        let sig = program.entry_signature();
        if input.len() != usize::from(sig.input_count) {
            return Err(Panic {
                message: String::from("entry function input arity mismatch"),
                stacktrace: Stacktrace::default(),
            });
        }

        let mut process = Process::new(
            program,
            &mut self.allocator,
            self.options.cstack_bytes,
            self.options.step_limit,
            self.options.panic_handler,
            self.options.log_handler,
        );
        let mut stack = ValueStack::new(self.options.vstack_elements);
        for value in input {
            stack.push(*value);
        }

        call_function(&mut process, &mut stack, program.entry())?;

        Ok(stack.iter().collect())
    }

    /// Executes `program` and destroys it afterwards.
    pub fn execute_oneshot(
        &mut self,
        program: Program<'_>,
        input: &[Value],
    ) -> Result<Vec<Value>, Panic> {
        self.execute(&program, input)
    }
}

//=== dispatch ===//

/// Builds the panic object, routing it through the armed trap or the panic
/// handler.
fn raise(process: &mut Process<'_, '_>, message: PanicMessage) -> Panic {
    let stacktrace = process.stacktrace();
    let message = message.into_owned();
    match process.panic_trap.as_mut() {
        Some(slot) => *slot = Some(message.clone()),
        None => (process.panic_handler)(&PanicInfo {
            message: &message,
            stacktrace: &stacktrace,
        }),
    }
    Panic {
        message,
        stacktrace,
    }
}

/// Calls `function` as a new execution segment on top of the current state.
///
/// This is the re-entry point for builtins that need nested calls: the inputs
/// must already be on `stack`, and on success the outputs replace them. On
/// panic, the segment's frames and local allocations have been released.
pub fn runtime_call(
    process: &mut Process<'_, '_>,
    stack: &mut ValueStack,
    function: u16,
) -> Result<(), Panic> {
    call_function(process, stack, function)
}

pub(crate) fn call_function(
    process: &mut Process<'_, '_>,
    stack: &mut ValueStack,
    target: u16,
) -> Result<(), Panic> {
    let base = process.frames.len();
    let result = run_segment(process, stack, target, base);
    if result.is_err() {
        process.unwind_to(base);
    }
    result
}

/// Creates a frame for `target` (or runs its native definition to completion)
/// after the stack-overflow checks.
fn enter_function(
    process: &mut Process<'_, '_>,
    stack: &mut ValueStack,
    target: u16,
    return_to: ReturnTo,
) -> Result<(), PanicMessage> {
    match process.program.definition(target) {
        Definition::Undefined => Err(Cow::Borrowed("undefined function")),
        Definition::Native(native) => {
            let mut ctx = BuiltinContext {
                stack: &mut *stack,
                process: Some(&mut *process),
            };
            native(&mut ctx)
        }
        Definition::Insts {
            module,
            function,
            insts: _,
            max_vstack_size,
            max_cstack_size,
        } => {
            if stack.depth() + usize::from(max_vstack_size) > stack.limit() {
                return Err(Cow::Borrowed("vstack overflow"));
            }
            let cstack_base = process.cstack.top();
            let needed = u64::from(cstack_base) + u64::from(FRAME_OVERHEAD) + u64::from(max_cstack_size);
            if needed > u64::from(process.cstack.limit()) {
                return Err(Cow::Borrowed("cstack overflow"));
            }
            process.cstack.grow_to(cstack_base + FRAME_OVERHEAD);
            let frame = Frame {
                function,
                module,
                ip: 0,
                return_to,
                first_local_alloc: process.memory.len() as u32,
                local_generation: process.memory.generation(),
                cstack_base,
                next_offset: FRAME_OVERHEAD,
            };
            process.frames.push(frame);
            Ok(())
        }
    }
}

fn run_segment(
    process: &mut Process<'_, '_>,
    stack: &mut ValueStack,
    target: u16,
    base: usize,
) -> Result<(), Panic> {
    if let Err(message) = enter_function(process, stack, target, ReturnTo::Exit) {
        return Err(raise(process, message));
    }
    if process.frames.len() == base {
        // The entry resolved to a native definition and ran to completion.
        return Ok(());
    }

    loop {
        let frame = {
            let i = process.frames.len() - 1;
            process.frames[i]
        };
        let ip = frame.ip;

        // Panic sites assign the call-stack leaf snapshot themselves, so
        // traces point at the faulting instruction.
        macro_rules! fail {
            ($msg:expr) => {{
                process.leaf = Some((frame.function, ip));
                return Err(raise(process, $msg.into()));
            }};
        }

        if !process.charge_step() {
            fail!("step limit exceeded");
        }

        let program: &Program<'_> = process.program;
        let Some(insts) = program.function(frame.function).and_then(|f| f.insts()) else {
            fail!("undefined function");
        };
        let Some(&inst) = insts.get(ip as usize) else {
            fail!("invalid instruction pointer");
        };
        let Some(op) = inst.op() else {
            fail!("invalid instruction");
        };

        let mut next_ip = ip + 1;
        match op {
            Opcode::Nop | Opcode::CallBuiltinSig => {}

            //=== control flow ===//
            Opcode::Return | Opcode::ReturnFree => {
                if op == Opcode::ReturnFree {
                    let count = inst.payload_value();
                    for i in 0..count {
                        let index = frame.first_local_alloc + i;
                        if let Some(alloc) = process.memory.get_mut(index) {
                            alloc.status = AllocationStatus::Freed;
                            alloc.backing = Backing::None;
                        }
                    }
                    process.memory.trim();
                }
                process.frames.truncate(process.frames.len() - 1);
                process.cstack.truncate_to(frame.cstack_base);
                match frame.return_to {
                    ReturnTo::Exit => return Ok(()),
                    ReturnTo::Code { .. } => continue,
                }
            }
            Opcode::Jump => {
                next_ip = (i64::from(ip) + i64::from(inst.payload_offset())) as u32;
            }
            Opcode::BranchFalse => {
                let condition = stack.pop().as_uint();
                if condition == 0 {
                    next_ip = (i64::from(ip) + i64::from(inst.payload_offset())) as u32;
                }
            }
            Opcode::BranchEq => {
                if stack.top().as_sint() == 0 {
                    stack.pop();
                    next_ip = (i64::from(ip) + i64::from(inst.payload_offset())) as u32;
                }
            }
            Opcode::BranchGt => {
                let condition = stack.pop().as_sint();
                if condition > 0 {
                    next_ip = (i64::from(ip) + i64::from(inst.payload_offset())) as u32;
                }
            }
            Opcode::Panic => {
                let addr = stack.pop().as_address();
                let message: PanicMessage = match process.get_cstr(addr) {
                    Some(m) => Cow::Owned(String::from(m)),
                    None => Cow::Borrowed("invalid panic message"),
                };
                fail!(message);
            }
            Opcode::Exit => return Ok(()),

            //=== calls ===//
            Opcode::Call => {
                let Some(target) = relative_function(program, frame.function, inst.payload_offset())
                else {
                    fail!("undefined function");
                };
                sync_ip(process, next_ip);
                if let Err(message) = enter_function(
                    process,
                    stack,
                    target,
                    ReturnTo::Code {
                        function: frame.function,
                        ip: next_ip,
                    },
                ) {
                    fail!(message);
                }
                continue;
            }
            Opcode::CallIndirect => {
                let addr = stack.pop().as_function_address();
                let (input_count, output_count, _) = inst.payload_signature();
                let Some(target) =
                    process.resolve_function(addr, Signature::new(input_count, output_count))
                else {
                    fail!("invalid function address");
                };
                sync_ip(process, next_ip);
                if let Err(message) = enter_function(
                    process,
                    stack,
                    target,
                    ReturnTo::Code {
                        function: frame.function,
                        ip: next_ip,
                    },
                ) {
                    fail!(message);
                }
                continue;
            }
            Opcode::CallBuiltin | Opcode::CallBuiltinNoProcess => {
                // The builtin occupies two words with its signature trailer.
                next_ip = ip + 2;
                sync_ip(process, next_ip);
                // The no-process variant skips the leaf snapshot; its callee
                // may only touch the process to panic.
                if op == Opcode::CallBuiltin {
                    process.leaf = Some((frame.function, ip));
                }
                let index = inst.payload_value() as usize;
                let Some(builtin) = program
                    .modules()
                    .get(usize::from(frame.module))
                    .and_then(|m| m.builtins.get(index))
                else {
                    fail!("invalid builtin");
                };
                let run = builtin.run;
                let result = {
                    let mut ctx = BuiltinContext {
                        stack: &mut *stack,
                        process: Some(&mut *process),
                    };
                    run(&mut ctx)
                };
                if let Err(message) = result {
                    fail!(message);
                }
            }

            //=== literals ===//
            Opcode::Push => stack.push(Value::from_uint(u64::from(inst.payload_value()))),
            Opcode::Pushn => stack.push(Value::from_uint(!u64::from(inst.payload_value()))),
            Opcode::Push2 => {
                let top = stack.top_mut();
                *top = Value::from_uint(top.as_uint() | (u64::from(inst.payload_value()) << 24));
            }
            Opcode::Push3 => {
                let top = stack.top_mut();
                *top = Value::from_uint(top.as_uint() | (u64::from(inst.payload_value()) << 48));
            }

            //=== addresses ===//
            Opcode::GlobalAddr => {
                let allocation = program.global_base(frame.module) + inst.payload_value();
                // Generation 0 always holds for globals.
                stack.push(Value::from_address(Address::new(allocation, 0)));
            }
            Opcode::FunctionAddr => {
                let Some(target) = relative_function(program, frame.function, inst.payload_offset())
                else {
                    fail!("undefined function");
                };
                let Some(addr) = program.function_address(target) else {
                    fail!("undefined function");
                };
                stack.push(Value::from_function_address(addr));
            }
            Opcode::LocalAddr => {
                let (slot, offset) = inst.payload_local_addr();
                stack.push(Value::from_address(Address {
                    allocation: frame.first_local_alloc + u32::from(slot),
                    generation: frame.local_generation,
                    offset: u32::from(offset),
                }));
            }

            //=== stack manipulation ===//
            Opcode::Pop => stack.remove(inst.payload_stack_idx()),
            Opcode::PopTop => {
                stack.pop();
            }
            Opcode::Pick => stack.push(stack.peek(inst.payload_stack_idx())),
            Opcode::Dup => stack.push(stack.top()),
            Opcode::Roll => stack.roll(inst.payload_stack_idx()),
            Opcode::Swap => stack.swap(),

            //=== locals ===//
            Opcode::LocalAlloc | Opcode::LocalAllocAligned => {
                let layout = inst.payload_layout();
                let i = process.frames.len() - 1;
                let fr = &mut process.frames[i];
                if op == Opcode::LocalAllocAligned {
                    let abs = fr.cstack_base + fr.next_offset;
                    fr.next_offset += align_up(abs, layout.align()) - abs;
                }
                let local_base = fr.cstack_base + fr.next_offset;
                fr.next_offset += u32::from(layout.size);
                let top = fr.cstack_base + fr.next_offset;
                let generation = fr.local_generation;
                process.cstack.grow_to(top);
                process
                    .memory
                    .push(Allocation::local(local_base, u32::from(layout.size), generation));
            }
            Opcode::LocalFree => {
                let count = inst.payload_value();
                for i in 0..count {
                    let index = frame.first_local_alloc + i;
                    if let Some(alloc) = process.memory.get_mut(index) {
                        alloc.status = AllocationStatus::Freed;
                        alloc.backing = Backing::None;
                    }
                }
                process.memory.trim();
            }

            //=== memory ===//
            Opcode::DerefConst => {
                let addr = stack.top().as_address();
                if process.get_const_bytes(addr, inst.payload_layout()).is_none() {
                    fail!("invalid address");
                }
                // The validated address stays on the stack as the pointer.
            }
            Opcode::DerefMut => {
                let addr = stack.top().as_address();
                if process.get_mut_bytes(addr, inst.payload_layout()).is_none() {
                    fail!("invalid address");
                }
            }
            Opcode::LoadValue => {
                let addr = stack.pop().as_address();
                match read_value(process, addr) {
                    Some(value) => stack.push(value),
                    None => fail!("invalid address"),
                }
            }
            Opcode::StoreValue => {
                let addr = stack.pop().as_address();
                let value = stack.pop();
                if !write_value(process, addr, value) {
                    fail!("invalid address");
                }
            }
            Opcode::LoadLocalValue => {
                let (slot, offset) = inst.payload_local_addr();
                let addr = Address {
                    allocation: frame.first_local_alloc + u32::from(slot),
                    generation: frame.local_generation,
                    offset: u32::from(offset),
                };
                match read_value(process, addr) {
                    Some(value) => stack.push(value),
                    None => fail!("invalid address"),
                }
            }
            Opcode::StoreLocalValue => {
                let (slot, offset) = inst.payload_local_addr();
                let addr = Address {
                    allocation: frame.first_local_alloc + u32::from(slot),
                    generation: frame.local_generation,
                    offset: u32::from(offset),
                };
                let value = stack.pop();
                if !write_value(process, addr, value) {
                    fail!("invalid address");
                }
            }
            Opcode::LoadGlobalValue => {
                let allocation = program.global_base(frame.module) + inst.payload_value();
                match read_value(process, Address::new(allocation, 0)) {
                    Some(value) => stack.push(value),
                    None => fail!("invalid address"),
                }
            }
            Opcode::StoreGlobalValue => {
                let allocation = program.global_base(frame.module) + inst.payload_value();
                let value = stack.pop();
                if !write_value(process, Address::new(allocation, 0), value) {
                    fail!("invalid address");
                }
            }
            Opcode::ArrayElement => {
                let index = stack.pop().as_sint();
                let stride = i64::from(inst.payload_value());
                let addr = stack.top().as_address();
                let delta = index.wrapping_mul(stride) as u32;
                *stack.top_mut() = Value::from_address(addr.wrapping_add_offset(delta));
            }
            Opcode::AggregateMember => {
                let addr = stack.top().as_address();
                *stack.top_mut() =
                    Value::from_address(addr.wrapping_add_offset(inst.payload_value()));
            }
        }

        sync_ip(process, next_ip);
    }
}

fn sync_ip(process: &mut Process<'_, '_>, ip: u32) {
    let i = process.frames.len() - 1;
    process.frames[i].ip = ip;
}

/// Resolves a function-relative target to a flat index.
fn relative_function(program: &Program<'_>, current: u16, offset: i32) -> Option<u16> {
    let target = i32::from(current) + offset;
    u16::try_from(target)
        .ok()
        .filter(|t| *t < program.function_count())
}

fn read_value(process: &Process<'_, '_>, addr: Address) -> Option<Value> {
    let bytes = process.get_const_bytes(addr, Layout::VALUE)?;
    let bits = u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);
    Some(Value::from_uint(bits))
}

fn write_value(process: &mut Process<'_, '_>, addr: Address, value: Value) -> bool {
    match process.get_mut_bytes(addr, Layout::VALUE) {
        Some(bytes) => {
            bytes.copy_from_slice(&value.as_uint().to_le_bytes());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_stack_indexing_is_depth_based() {
        let mut stack = ValueStack::new(16);
        stack.push(Value::from_uint(1));
        stack.push(Value::from_uint(2));
        stack.push(Value::from_uint(3));
        assert_eq!(stack.peek(0).as_uint(), 3);
        assert_eq!(stack.peek(2).as_uint(), 1);

        stack.roll(2); // 2 3 1
        assert_eq!(stack.top().as_uint(), 1);
        assert_eq!(stack.peek(2).as_uint(), 2);

        stack.swap(); // 2 1 3
        assert_eq!(stack.top().as_uint(), 3);

        stack.remove(1); // 2 3
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.pop().as_uint(), 3);
        assert_eq!(stack.pop().as_uint(), 2);
    }

    #[test]
    fn null_allocator_refuses() {
        assert!(NullAllocator.allocate(8, 8).is_none());
        assert_eq!(SystemAllocator.allocate(8, 8).unwrap().len(), 8);
    }
}
