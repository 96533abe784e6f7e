// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-execution process: call frames, local storage, step accounting,
//! and the builtin-facing runtime surface.
//!
//! A process is created for one top-level execute and destroyed afterwards.
//! It owns the allocation table, the call-stack byte arena, and the step
//! counter; the value stack is threaded through dispatch separately, mirroring
//! the handler signature of the execution engine.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::memory::{
    AllocationSource, AllocationStatus, Backing, GcTracking, Memory, backing_bytes,
};
use crate::layout::Layout;
use crate::module::{DebugLocation, Signature};
use crate::program::Program;
use crate::value::{Address, FunctionAddress};
use crate::vm::{HeapAllocator, LogHandler, PanicHandler, ValueStack};

/// Call-stack bytes charged per frame for bookkeeping, before any local
/// allocation storage.
pub(crate) const FRAME_OVERHEAD: u32 = 48;

/// Where control continues when a frame returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReturnTo {
    /// Segment-bottom (trampoline) frame: returning leaves the driver loop.
    Exit,
    /// Resume at `ip` of `function`.
    Code {
        /// Flat index of the function to resume.
        function: u16,
        /// Instruction index to resume at.
        ip: u32,
    },
}

/// One activation record.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Frame {
    /// Flat index of the executing function.
    pub function: u16,
    /// Module owning the executing function.
    pub module: u16,
    /// Current instruction index; synced on calls and panics.
    pub ip: u32,
    /// Continuation on return.
    pub return_to: ReturnTo,
    /// Allocation-table index of the frame's first local allocation.
    pub first_local_alloc: u32,
    /// Generation stamped into local addresses.
    pub local_generation: u8,
    /// Byte offset of this frame within the call stack.
    pub cstack_base: u32,
    /// Bytes used by this frame (overhead plus locals so far).
    pub next_offset: u32,
}

impl Frame {
    /// A frame that exits the driver loop on return (the trampoline frame).
    pub(crate) fn is_trampoline(&self) -> bool {
        self.return_to == ReturnTo::Exit
    }
}

/// The upward-growing call-stack byte arena.
#[derive(Debug)]
pub(crate) struct Cstack {
    bytes: Vec<u8>,
    limit: u32,
}

impl Cstack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit: limit.min(u32::MAX as usize) as u32,
        }
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit
    }

    pub(crate) fn top(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Zero-extends the stack up to the absolute offset `to`.
    pub(crate) fn grow_to(&mut self, to: u32) {
        if to as usize > self.bytes.len() {
            self.bytes.resize(to as usize, 0);
        }
    }

    pub(crate) fn truncate_to(&mut self, to: u32) {
        self.bytes.truncate(to as usize);
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// One entry of a captured stack trace, leaf first.
#[derive(Clone, Debug)]
pub struct StacktraceEntry {
    /// Name of the function.
    pub function: String,
    /// Instruction index within the function.
    pub ip: u32,
    /// Source location, if debug locations were recorded.
    pub location: Option<DebugLocation>,
}

/// A captured call-stack snapshot, leaf first.
#[derive(Clone, Debug, Default)]
pub struct Stacktrace {
    entries: Vec<StacktraceEntry>,
}

impl Stacktrace {
    /// The captured entries, leaf first.
    #[must_use]
    pub fn entries(&self) -> &[StacktraceEntry] {
        &self.entries
    }
}

impl fmt::Display for Stacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            write!(f, " #{i} {} <{}>", entry.function, entry.ip)?;
            if let Some(location) = entry.location
                && location.line != 0
            {
                write!(f, " at {}:{}", location.line, location.column)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The state of one top-level execution.
pub struct Process<'p, 'm> {
    pub(crate) program: &'p Program<'m>,
    pub(crate) memory: Memory,
    pub(crate) frames: Vec<Frame>,
    pub(crate) cstack: Cstack,
    pub(crate) allocator: &'p mut dyn HeapAllocator,
    pub(crate) panic_handler: PanicHandler,
    pub(crate) log_handler: LogHandler,
    /// Armed by `assert_panic`-style builtins: a panic stores its message here
    /// instead of reaching the panic handler.
    pub(crate) panic_trap: Option<Option<String>>,
    pub(crate) step_limit_active: bool,
    pub(crate) remaining_steps: u64,
    /// Leaf position (function, ip) kept valid for stack traces from builtins
    /// and panics.
    pub(crate) leaf: Option<(u16, u32)>,
}

impl fmt::Debug for Process<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("frames", &self.frames.len())
            .field("allocations", &self.memory.len())
            .field("remaining_steps", &self.remaining_steps)
            .finish_non_exhaustive()
    }
}

impl<'p, 'm> Process<'p, 'm> {
    pub(crate) fn new(
        program: &'p Program<'m>,
        allocator: &'p mut dyn HeapAllocator,
        cstack_bytes: usize,
        step_limit: u64,
        panic_handler: PanicHandler,
        log_handler: LogHandler,
    ) -> Self {
        let mut memory = Memory::new();
        for allocation in program.materialize_globals() {
            memory.push(allocation);
        }
        Self {
            program,
            memory,
            frames: Vec::new(),
            cstack: Cstack::new(cstack_bytes),
            allocator,
            panic_handler,
            log_handler,
            panic_trap: None,
            step_limit_active: step_limit != 0,
            remaining_steps: step_limit,
            leaf: None,
        }
    }

    /// The program being executed.
    #[must_use]
    pub fn program(&self) -> &'p Program<'m> {
        self.program
    }

    /// The process's allocation table.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    //=== checked access for builtins ===//

    /// Returns the bytes of a read access at `addr`, validating the address.
    #[must_use]
    pub fn get_const_bytes(&self, addr: Address, layout: Layout) -> Option<&[u8]> {
        self.memory.const_bytes(self.cstack.bytes(), addr, layout)
    }

    /// Returns the bytes of a write access at `addr`, validating the address
    /// and requiring a mutable source.
    #[must_use]
    pub fn get_mut_bytes(&mut self, addr: Address, layout: Layout) -> Option<&mut [u8]> {
        self.memory.mut_bytes(self.cstack.bytes_mut(), addr, layout)
    }

    /// Reads a null-terminated UTF-8 string starting at `addr`.
    #[must_use]
    pub fn get_cstr(&self, addr: Address) -> Option<&str> {
        let bytes = self.memory.cstr_bytes(self.cstack.bytes(), addr)?;
        core::str::from_utf8(bytes).ok()
    }

    /// Resolves a function address whose packed arity matches `sig`.
    #[must_use]
    pub fn resolve_function(&self, addr: FunctionAddress, sig: Signature) -> Option<u16> {
        if addr.input_count != sig.input_count || addr.output_count != sig.output_count {
            return None;
        }
        self.resolve_function_any(addr)
    }

    /// Resolves a function address regardless of arity.
    #[must_use]
    pub fn resolve_function_any(&self, addr: FunctionAddress) -> Option<u16> {
        if addr.is_null() || addr.index >= self.program.function_count() {
            return None;
        }
        let f = self.program.function(addr.index)?;
        (f.sig.input_count == addr.input_count && f.sig.output_count == addr.output_count)
            .then_some(addr.index)
    }

    //=== step limit ===//

    /// Charges one execution step. Returns `false` when the limit is
    /// exhausted.
    pub fn charge_step(&mut self) -> bool {
        if !self.step_limit_active {
            return true;
        }
        if self.remaining_steps == 0 {
            return false;
        }
        self.remaining_steps -= 1;
        true
    }

    /// Raises the step limit to `new_limit`.
    ///
    /// Removing the limit (zero) is not allowed, and neither is any value that
    /// does not exceed the current remainder.
    pub fn set_step_limit(&mut self, new_limit: u64) -> bool {
        if new_limit == 0 {
            return false;
        }
        if self.step_limit_active && new_limit <= self.remaining_steps {
            return false;
        }
        self.step_limit_active = true;
        self.remaining_steps = new_limit;
        true
    }

    //=== heap ===//

    /// Allocates `size` bytes through the VM's heap allocator.
    #[must_use]
    pub fn heap_alloc(&mut self, size: u64, align: u64) -> Option<Address> {
        let size = usize::try_from(size).ok()?;
        let align = u32::try_from(align).ok().filter(|a| a.is_power_of_two())?;
        let bytes = self.allocator.allocate(size, align)?;
        Some(self.memory.new_heap_allocation(bytes))
    }

    /// Frees a heap allocation.
    pub fn heap_free(&mut self, addr: Address) -> bool {
        let Some(alloc) = self.memory.lookup(addr) else {
            return false;
        };
        if alloc.source != AllocationSource::Heap || alloc.status == AllocationStatus::Freed {
            return false;
        }
        self.memory.mark_freed(addr.allocation);
        self.memory.trim();
        true
    }

    /// Marks a heap allocation as leaked: it becomes unusable but is exempt
    /// from automatic cleanup.
    pub fn heap_leak(&mut self, addr: Address) -> bool {
        let Some(alloc) = self.memory.lookup_mut(addr) else {
            return false;
        };
        if alloc.source != AllocationSource::Heap || alloc.status == AllocationStatus::Freed {
            return false;
        }
        alloc.status = AllocationStatus::Freed;
        true
    }

    /// Poisons an allocation, refusing further access until unpoisoned.
    pub fn poison(&mut self, addr: Address) -> bool {
        match self.memory.lookup_mut(addr) {
            Some(alloc) if alloc.is_usable() => {
                alloc.status = AllocationStatus::Poisoned;
                true
            }
            _ => false,
        }
    }

    /// Reverts a poisoned allocation to usable.
    pub fn unpoison(&mut self, addr: Address) -> bool {
        match self.memory.lookup_mut(addr) {
            Some(alloc) if alloc.status == AllocationStatus::Poisoned => {
                alloc.status = AllocationStatus::Allocated;
                true
            }
            _ => false,
        }
    }

    /// Declares a heap allocation as explicitly reachable for the collector.
    pub fn declare_reachable(&mut self, addr: Address, reachable: bool) -> bool {
        match self.memory.lookup_mut(addr) {
            Some(alloc) if alloc.source == AllocationSource::Heap => {
                alloc.gc = if reachable {
                    GcTracking::ReachableExplicit
                } else {
                    GcTracking::Unreachable
                };
                true
            }
            _ => false,
        }
    }

    /// Sets whether an allocation's contents are excluded from the GC trace.
    pub fn declare_weak(&mut self, addr: Address, weak: bool) -> bool {
        match self.memory.lookup_mut(addr) {
            Some(alloc) => {
                alloc.is_gc_weak = weak;
                true
            }
            None => false,
        }
    }

    //=== garbage collection ===//

    /// Runs a conservative collection and returns the freed byte count.
    ///
    /// Roots are every value-stack slot, the local-allocation storage of every
    /// live frame, and the contents of explicitly-reachable allocations. Any
    /// 64-bit word that resolves to a live heap allocation is treated as an
    /// address. Weak allocations are not traced through.
    pub fn gc(&mut self, stack: &ValueStack) -> u64 {
        let mut pending: Vec<u32> = Vec::new();

        for value in stack.iter() {
            self.mark_candidate(value.as_uint(), &mut pending);
        }

        for i in 0..self.frames.len() {
            let frame = self.frames[i];
            let start = frame.cstack_base + FRAME_OVERHEAD;
            let end = frame.cstack_base + frame.next_offset;
            let words = read_words(self.cstack.bytes(), start, end);
            for word in words {
                self.mark_candidate(word, &mut pending);
            }
        }

        let explicit: Vec<u32> = self
            .memory
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.gc == GcTracking::ReachableExplicit && a.status != AllocationStatus::Freed
            })
            .map(|(i, _)| i as u32)
            .collect();
        for index in explicit {
            self.scan_allocation(index, &mut pending);
        }

        while let Some(index) = pending.pop() {
            self.scan_allocation(index, &mut pending);
        }

        // Sweep unreachable heap allocations, resetting trace state.
        let mut freed = 0u64;
        for alloc in self.memory.iter_mut() {
            if alloc.source == AllocationSource::Heap
                && alloc.status != AllocationStatus::Freed
                && alloc.gc == GcTracking::Unreachable
            {
                freed += u64::from(alloc.size);
                alloc.status = AllocationStatus::Freed;
                alloc.backing = Backing::None;
            }
            if alloc.gc != GcTracking::ReachableExplicit {
                alloc.gc = GcTracking::Unreachable;
            }
        }
        self.memory.trim();
        freed
    }

    /// Marks the allocation a candidate word resolves to, queueing it for
    /// tracing if it was not yet known reachable.
    fn mark_candidate(&mut self, bits: u64, pending: &mut Vec<u32>) {
        let addr = Address::unpack(bits);
        if addr.is_null() {
            return;
        }
        let Some(alloc) = self.memory.lookup(addr) else {
            return;
        };
        if addr.offset > alloc.size {
            return;
        }
        let index = addr.allocation;
        if let Some(alloc) = self.memory.get_mut(index)
            && alloc.status != AllocationStatus::Freed
            && alloc.gc == GcTracking::Unreachable
        {
            alloc.gc = GcTracking::Reachable;
            pending.push(index);
        }
    }

    fn scan_allocation(&mut self, index: u32, pending: &mut Vec<u32>) {
        let words = {
            let Some(alloc) = self.memory.get(index) else {
                return;
            };
            if alloc.is_gc_weak || alloc.size < 8 {
                return;
            }
            match backing_bytes(alloc, self.cstack.bytes()) {
                Some(bytes) => read_words(bytes, 0, alloc.size),
                None => return,
            }
        };
        for word in words {
            self.mark_candidate(word, pending);
        }
    }

    //=== unwinding ===//

    /// Marks the local allocations of the frame at `index` and every deeper
    /// frame as freed and pops them, releasing their call-stack storage.
    pub(crate) fn unwind_to(&mut self, index: usize) {
        let Some(frame) = self.frames.get(index).copied() else {
            return;
        };
        for i in frame.first_local_alloc..self.memory.len() as u32 {
            if let Some(alloc) = self.memory.get_mut(i)
                && alloc.source == AllocationSource::Local
            {
                alloc.status = AllocationStatus::Freed;
                alloc.backing = Backing::None;
            }
        }
        self.memory.trim();
        self.frames.truncate(index);
        self.cstack.truncate_to(frame.cstack_base);
    }

    //=== stack traces ===//

    /// Captures the current call stack, leaf first.
    #[must_use]
    pub fn stacktrace(&self) -> Stacktrace {
        let mut entries = Vec::new();
        let mut leaf = self.leaf;
        for frame in self.frames.iter().rev() {
            let (function, ip) = leaf.unwrap_or((frame.function, frame.ip));
            entries.push(self.trace_entry(function, ip));
            leaf = match frame.return_to {
                ReturnTo::Exit => None,
                ReturnTo::Code { function, ip } => Some((function, ip.saturating_sub(1))),
            };
        }
        Stacktrace { entries }
    }

    fn trace_entry(&self, function: u16, ip: u32) -> StacktraceEntry {
        let name = self
            .program
            .function(function)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let location = self
            .program
            .function_module(function)
            .and_then(|m| self.program.modules().get(usize::from(m)))
            .and_then(|module| {
                let local = function - module_start(self.program, function);
                module.location_of(crate::module::FunctionId(local), ip as u16)
            });
        StacktraceEntry {
            function: name,
            ip,
            location,
        }
    }
}

fn module_start(program: &Program<'_>, flat: u16) -> u16 {
    // Walk back to the first function of the same module.
    let Some(module) = program.function_module(flat) else {
        return 0;
    };
    let mut start = flat;
    while start > 0 && program.function_module(start - 1) == Some(module) {
        start -= 1;
    }
    start
}

/// Reads the aligned 64-bit words of `bytes[start..end]`.
fn read_words(bytes: &[u8], start: u32, end: u32) -> Vec<u64> {
    let Some(slice) = bytes.get(start as usize..(end as usize).min(bytes.len())) else {
        return Vec::new();
    };
    slice
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstack_grows_and_truncates() {
        let mut cstack = Cstack::new(1024);
        cstack.grow_to(64);
        assert_eq!(cstack.top(), 64);
        assert!(cstack.bytes().iter().all(|&b| b == 0));
        cstack.grow_to(32);
        assert_eq!(cstack.top(), 64);
        cstack.truncate_to(16);
        assert_eq!(cstack.top(), 16);
    }

    #[test]
    fn read_words_ignores_trailing_partial_words() {
        let bytes = [1u8, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0];
        assert_eq!(read_words(&bytes, 0, 11), alloc::vec![1]);
        assert_eq!(read_words(&bytes, 16, 24), Vec::<u64>::new());
    }
}
