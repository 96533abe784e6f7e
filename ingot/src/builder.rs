// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The function-body builder and verifier.
//!
//! A [`Builder`] targets one declared function of one module. Code is emitted
//! into declared basic blocks; every block carries an `(input, output)`
//! signature and the builder tracks a virtual value stack per block, so every
//! instruction's stack discipline is checked as it is emitted. Jumping
//! instructions record symbolic block references that are resolved to relative
//! stride offsets at [`Builder::finish`].
//!
//! Emitters do not return errors; the first violation poisons the builder and
//! is reported by `finish`, mirroring the deferred-error style of the module
//! assembly layer.

use alloc::vec::Vec;
use core::fmt;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags};
use crate::inst::{Inst, MAX_VALUE24};
use crate::layout::{Layout, align_up};
use crate::module::{DebugLocation, FunctionId, GlobalId, Module, Signature};
use crate::opcode::Opcode;
use crate::value::Value;
use crate::vm::ValueStack;

/// Build configuration.
#[derive(Copy, Clone, Debug)]
pub struct BuildOptions {
    /// Evaluate `CONSTANT_FOLD` builtins over literal inputs at build time.
    pub fold_constants: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            fold_constants: true,
        }
    }
}

/// A build error.
///
/// The builder is poisoned by the first error; later emitter calls are
/// ignored and [`Builder::finish`] reports the first recorded error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// The targeted function already has a body.
    FunctionAlreadyDefined,
    /// The targeted function id does not exist in the module.
    UnknownFunction,
    /// A global id does not exist in the module.
    UnknownGlobal,
    /// A local handle from a different builder was referenced.
    UnknownLocal,
    /// A block id from a different builder (or out of range) was referenced.
    UnknownBlock,
    /// `build_block` targeted a block that has already been terminated.
    BlockAlreadyTerminated,
    /// An emitter was called with no block under construction.
    NoCurrentBlock,
    /// The entry block's input count differs from the function signature.
    EntryArityMismatch,
    /// A block was declared but never terminated.
    UnterminatedBlock {
        /// Index of the offending block.
        block: u16,
    },
    /// An instruction's inputs were not available on the virtual stack.
    StackUnderflow {
        /// The emitter that failed.
        context: &'static str,
    },
    /// A block's stack depth at its terminator does not match its output
    /// count.
    BlockOutputMismatch {
        /// Index of the offending block.
        block: u16,
    },
    /// A jump/branch successor's input count does not match the block's
    /// output count.
    SuccessorArityMismatch {
        /// Index of the offending block.
        block: u16,
    },
    /// An exit block's output count differs from the function signature.
    ExitArityMismatch,
    /// A resolved branch displacement does not fit the 24-bit payload.
    OffsetOutOfRange,
    /// The function body exceeds the instruction-count limit.
    TooManyInstructions,
    /// More local variables were declared than slots exist.
    TooManyLocals,
    /// A function had no blocks at finish.
    EmptyFunction,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionAlreadyDefined => write!(f, "function already defined"),
            Self::UnknownFunction => write!(f, "unknown function"),
            Self::UnknownGlobal => write!(f, "unknown global"),
            Self::UnknownLocal => write!(f, "unknown local variable"),
            Self::UnknownBlock => write!(f, "unknown block"),
            Self::BlockAlreadyTerminated => {
                write!(f, "cannot continue building a terminated block")
            }
            Self::NoCurrentBlock => write!(f, "no current block to build"),
            Self::EntryArityMismatch => {
                write!(f, "entry block input count differs from function signature")
            }
            Self::UnterminatedBlock { block } => write!(f, "unterminated block {block}"),
            Self::StackUnderflow { context } => {
                write!(f, "missing value on the virtual stack in {context}")
            }
            Self::BlockOutputMismatch { block } => {
                write!(f, "block {block} output count does not match stack depth on exit")
            }
            Self::SuccessorArityMismatch { block } => {
                write!(f, "successor input count incompatible with block {block} outputs")
            }
            Self::ExitArityMismatch => {
                write!(f, "exit block output count differs from function signature")
            }
            Self::OffsetOutOfRange => write!(f, "branch offset too big"),
            Self::TooManyInstructions => write!(f, "too many instructions in function body"),
            Self::TooManyLocals => write!(f, "too many local variables"),
            Self::EmptyFunction => write!(f, "function body has no blocks"),
        }
    }
}

impl core::error::Error for BuildError {}

/// A basic block handle; only valid for the builder that declared it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block(u16);

/// A local variable handle; only valid for the builder that declared it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Local(u8);

/// Tracks the virtual value-stack depth of one block.
#[derive(Copy, Clone, Debug)]
struct VstackChecker {
    cur: u32,
    max: u32,
}

impl VstackChecker {
    fn new(input_count: u8) -> Self {
        Self {
            cur: u32::from(input_count),
            max: u32::from(input_count),
        }
    }

    fn size(&self) -> u32 {
        self.cur
    }

    fn push(&mut self, n: u32) {
        self.cur += n;
        if self.cur > self.max {
            self.max = self.cur;
        }
    }

    fn pop(&mut self, n: u32) -> bool {
        if self.cur < n {
            self.cur = 0;
            false
        } else {
            self.cur -= n;
            true
        }
    }

    fn finish(&self, output_count: u8) -> bool {
        self.cur == u32::from(output_count)
    }
}

#[derive(Copy, Clone, Debug)]
enum Terminator {
    Unterminated,
    Return,
    Jump(Block),
    Branch2 {
        if_true: Block,
        if_false: Block,
    },
    Branch3 {
        if_lt: Block,
        if_eq: Block,
        if_gt: Block,
    },
    Panic,
    /// An `ALWAYS_PANIC` builtin call already emitted into the block body.
    PanicBuiltin,
}

impl Terminator {
    fn encoded_len(&self) -> u32 {
        match self {
            Self::Unterminated => 0,
            Self::Return | Self::Jump(_) | Self::Panic => 1,
            Self::Branch2 { .. } => 2,
            Self::Branch3 { .. } => 3,
            Self::PanicBuiltin => 0,
        }
    }
}

#[derive(Clone, Debug)]
struct BlockData {
    sig: Signature,
    insts: Vec<Inst>,
    vstack: VstackChecker,
    terminator: Terminator,
    offset: u32,
}

#[derive(Copy, Clone, Debug)]
struct LocalSlot {
    /// Size padded to value granularity.
    padded_size: u16,
    /// Alignment beyond value alignment, if any.
    extra_align: Option<u32>,
}

#[derive(Copy, Clone, Debug)]
struct PendingLocation {
    block: u16,
    inst: u32,
    location: DebugLocation,
}

/// Builds the body of one declared function.
pub struct Builder<'m> {
    options: BuildOptions,
    module: &'m mut Module,
    function: FunctionId,
    sig: Signature,
    blocks: Vec<BlockData>,
    cur: Option<u16>,
    locals: Vec<LocalSlot>,
    locations: Vec<PendingLocation>,
    pending_location: Option<DebugLocation>,
    error: Option<BuildError>,
}

impl<'m> Builder<'m> {
    /// Starts building the body of `function`.
    ///
    /// Fails if the function does not exist or is already defined.
    pub fn new(
        module: &'m mut Module,
        function: FunctionId,
        options: BuildOptions,
    ) -> Result<Self, BuildError> {
        let sig = match module.function(function) {
            Some(f) if f.is_defined() => return Err(BuildError::FunctionAlreadyDefined),
            Some(f) => f.sig,
            None => return Err(BuildError::UnknownFunction),
        };
        Ok(Self {
            options,
            module,
            function,
            sig,
            blocks: Vec::new(),
            cur: None,
            locals: Vec::new(),
            locations: Vec::new(),
            pending_location: None,
            error: None,
        })
    }

    fn fail(&mut self, e: BuildError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
        self.cur = None;
    }

    fn cur_block(&mut self) -> Option<u16> {
        if self.error.is_some() {
            return None;
        }
        let Some(cur) = self.cur else {
            self.fail(BuildError::NoCurrentBlock);
            return None;
        };
        Some(cur)
    }

    fn emit(&mut self, block: u16, inst: Inst) {
        if let Some(location) = self.pending_location.take() {
            self.locations.push(PendingLocation {
                block,
                inst: self.blocks[block as usize].insts.len() as u32,
                location,
            });
        }
        self.blocks[block as usize].insts.push(inst);
    }

    //=== blocks ===//

    /// Declares a basic block with the given signature.
    ///
    /// The first declared block is the entry block; its input count must match
    /// the function signature.
    pub fn declare_block(&mut self, sig: Signature) -> Block {
        if self.blocks.is_empty() && sig.input_count != self.sig.input_count {
            self.fail(BuildError::EntryArityMismatch);
        }
        let id = Block(u16::try_from(self.blocks.len()).unwrap_or(u16::MAX));
        self.blocks.push(BlockData {
            sig,
            insts: Vec::new(),
            vstack: VstackChecker::new(sig.input_count),
            terminator: Terminator::Unterminated,
            offset: 0,
        });
        id
    }

    /// Sets the insertion point to append to the end of `block`.
    ///
    /// Blocks do not need to be built in one go; the builder may switch
    /// between unterminated blocks at will.
    pub fn build_block(&mut self, block: Block) {
        if self.error.is_some() {
            return;
        }
        match self.blocks.get(block.0 as usize) {
            None => self.fail(BuildError::UnknownBlock),
            Some(b) if !matches!(b.terminator, Terminator::Unterminated) => {
                self.fail(BuildError::BlockAlreadyTerminated);
            }
            Some(_) => self.cur = Some(block.0),
        }
    }

    /// Returns the virtual value-stack depth of the active block.
    #[must_use]
    pub fn vstack_depth(&self) -> u32 {
        match self.cur {
            Some(cur) => self.blocks[cur as usize].vstack.size(),
            None => 0,
        }
    }

    /// Attaches a source location to subsequently emitted instructions.
    pub fn build_debug_location(&mut self, location: DebugLocation) {
        self.pending_location = Some(location);
    }

    //=== locals ===//

    /// Declares a local variable.
    ///
    /// Locals are allocated when the function is entered and freed when it
    /// returns.
    pub fn build_local(&mut self, layout: Layout) -> Local {
        if self.locals.len() >= usize::from(u8::MAX) {
            self.fail(BuildError::TooManyLocals);
            return Local(u8::MAX);
        }
        let slot = Local(self.locals.len() as u8);
        let padded_size = align_up(u32::from(layout.size), 8).min(u32::from(u16::MAX)) as u16;
        let extra_align = (layout.align() > 8).then(|| layout.align());
        self.locals.push(LocalSlot {
            padded_size,
            extra_align,
        });
        slot
    }

    //=== terminators ===//

    /// Terminator: returns from the function.
    pub fn inst_return(&mut self) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &self.blocks[cur as usize];
        if !block.vstack.finish(block.sig.output_count) {
            return self.fail(BuildError::BlockOutputMismatch { block: cur });
        }
        if block.sig.output_count != self.sig.output_count {
            return self.fail(BuildError::ExitArityMismatch);
        }
        self.blocks[cur as usize].terminator = Terminator::Return;
        self.cur = None;
    }

    /// Terminator: unconditional jump to `dest`.
    pub fn inst_jump(&mut self, dest: Block) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let Some(dest_in) = self.block_input(dest) else {
            return self.fail(BuildError::UnknownBlock);
        };
        let block = &self.blocks[cur as usize];
        if !block.vstack.finish(block.sig.output_count) {
            return self.fail(BuildError::BlockOutputMismatch { block: cur });
        }
        if block.sig.output_count != dest_in {
            return self.fail(BuildError::SuccessorArityMismatch { block: cur });
        }
        self.blocks[cur as usize].terminator = Terminator::Jump(dest);
        self.cur = None;
    }

    /// Terminator: pops the condition and branches to `if_true` when it is
    /// non-zero, to `if_false` otherwise.
    ///
    /// If the condition is a literal, the untaken edge is dropped and the
    /// statically taken block is returned so callers can skip generating dead
    /// code.
    pub fn inst_branch2(&mut self, if_true: Block, if_false: Block) -> Option<Block> {
        let Some(cur) = self.cur_block() else {
            return None;
        };
        let (Some(true_in), Some(false_in)) = (self.block_input(if_true), self.block_input(if_false))
        else {
            self.fail(BuildError::UnknownBlock);
            return None;
        };

        let folded = self.take_literals(cur, 1).map(|v| v[0]);

        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(1) {
            self.fail(BuildError::StackUnderflow { context: "branch2" });
            return None;
        }
        let block = &self.blocks[cur as usize];
        if !block.vstack.finish(block.sig.output_count) {
            self.fail(BuildError::BlockOutputMismatch { block: cur });
            return None;
        }
        if block.sig.output_count != true_in || block.sig.output_count != false_in {
            self.fail(BuildError::SuccessorArityMismatch { block: cur });
            return None;
        }

        if let Some(condition) = folded {
            let taken = if condition != 0 { if_true } else { if_false };
            self.blocks[cur as usize].terminator = Terminator::Jump(taken);
            self.cur = None;
            return Some(taken);
        }

        self.blocks[cur as usize].terminator = Terminator::Branch2 { if_true, if_false };
        self.cur = None;
        None
    }

    /// Terminator: pops the condition as a signed integer and branches to
    /// `if_lt`/`if_eq`/`if_gt` on its sign.
    pub fn inst_branch3(&mut self, if_lt: Block, if_eq: Block, if_gt: Block) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let (Some(lt_in), Some(eq_in), Some(gt_in)) = (
            self.block_input(if_lt),
            self.block_input(if_eq),
            self.block_input(if_gt),
        ) else {
            return self.fail(BuildError::UnknownBlock);
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(1) {
            return self.fail(BuildError::StackUnderflow { context: "branch3" });
        }
        let block = &self.blocks[cur as usize];
        if !block.vstack.finish(block.sig.output_count) {
            return self.fail(BuildError::BlockOutputMismatch { block: cur });
        }
        if block.sig.output_count != lt_in
            || block.sig.output_count != eq_in
            || block.sig.output_count != gt_in
        {
            return self.fail(BuildError::SuccessorArityMismatch { block: cur });
        }
        self.blocks[cur as usize].terminator = Terminator::Branch3 {
            if_lt,
            if_eq,
            if_gt,
        };
        self.cur = None;
    }

    /// Terminator: pops a message address and panics.
    pub fn inst_panic(&mut self) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        if !self.blocks[cur as usize].vstack.pop(1) {
            return self.fail(BuildError::StackUnderflow { context: "panic" });
        }
        self.blocks[cur as usize].terminator = Terminator::Panic;
        self.cur = None;
    }

    fn block_input(&self, block: Block) -> Option<u8> {
        self.blocks.get(block.0 as usize).map(|b| b.sig.input_count)
    }

    //=== literals ===//

    /// Pushes an unsigned integer.
    pub fn inst_uint(&mut self, value: u64) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        self.emit_literal(cur, value);
        self.blocks[cur as usize].vstack.push(1);
    }

    /// Pushes a signed integer.
    pub fn inst_sint(&mut self, value: i64) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let bits = value as u64;
        if value >= 0 {
            self.emit_literal(cur, bits);
        } else if !bits <= u64::from(MAX_VALUE24) {
            // Small negated value: a single bit-flipped push.
            let inst = Inst::value(Opcode::Pushn, (!bits) as u32).unwrap_or(Inst::none(Opcode::Nop));
            self.emit(cur, inst);
        } else {
            self.emit_literal(cur, bits);
        }
        self.blocks[cur as usize].vstack.push(1);
    }

    /// Pushes the null address.
    pub fn inst_null(&mut self) {
        self.inst_sint(-1);
    }

    /// Pushes the alignment and size of `layout` as two unsigned values.
    pub fn inst_layout(&mut self, layout: Layout) {
        self.inst_uint(u64::from(layout.align()));
        self.inst_uint(u64::from(layout.size));
    }

    /// Emits `value` as a `push` plus the `push2`/`push3` slices it needs.
    fn emit_literal(&mut self, cur: u16, value: u64) {
        let low = (value & u64::from(MAX_VALUE24)) as u32;
        let mid = ((value >> 24) & u64::from(MAX_VALUE24)) as u32;
        let high = ((value >> 48) & 0xffff) as u32;
        let inst = Inst::value(Opcode::Push, low).unwrap_or(Inst::none(Opcode::Nop));
        self.emit(cur, inst);
        if mid != 0 {
            let inst = Inst::value(Opcode::Push2, mid).unwrap_or(Inst::none(Opcode::Nop));
            self.emit(cur, inst);
        }
        if high != 0 {
            let inst = Inst::value(Opcode::Push3, high).unwrap_or(Inst::none(Opcode::Nop));
            self.emit(cur, inst);
        }
    }

    //=== addresses ===//

    /// Pushes the address of a global.
    pub fn inst_global_addr(&mut self, global: GlobalId) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        if self.module.global(global).is_none() {
            return self.fail(BuildError::UnknownGlobal);
        }
        match Inst::value(Opcode::GlobalAddr, global.0) {
            Some(inst) => self.emit(cur, inst),
            None => return self.fail(BuildError::OffsetOutOfRange),
        }
        self.blocks[cur as usize].vstack.push(1);
    }

    /// Pushes the address of a function declared in the same module.
    pub fn inst_function_addr(&mut self, function: FunctionId) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        if self.module.function(function).is_none() {
            return self.fail(BuildError::UnknownFunction);
        }
        let offset = i32::from(function.0) - i32::from(self.function.0);
        match Inst::offset(Opcode::FunctionAddr, offset) {
            Some(inst) => self.emit(cur, inst),
            None => return self.fail(BuildError::OffsetOutOfRange),
        }
        self.blocks[cur as usize].vstack.push(1);
    }

    /// Pushes the address of a local variable.
    pub fn inst_local_addr(&mut self, local: Local) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        if usize::from(local.0) >= self.locals.len() {
            return self.fail(BuildError::UnknownLocal);
        }
        self.emit(cur, Inst::local_addr(Opcode::LocalAddr, local.0, 0));
        self.blocks[cur as usize].vstack.push(1);
    }

    //=== stack manipulation ===//

    /// Removes the value at depth `idx` (0 is the top).
    pub fn inst_pop(&mut self, idx: u16) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if block.vstack.size() <= u32::from(idx) {
            return self.fail(BuildError::StackUnderflow { context: "pop" });
        }
        block.vstack.pop(1);
        let inst = if idx == 0 {
            Inst::stack_idx(Opcode::PopTop, 0)
        } else {
            Inst::stack_idx(Opcode::Pop, idx)
        };
        self.emit(cur, inst);
    }

    /// Duplicates the value at depth `idx` to the top.
    pub fn inst_pick(&mut self, idx: u16) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if block.vstack.size() <= u32::from(idx) {
            return self.fail(BuildError::StackUnderflow { context: "pick" });
        }
        block.vstack.push(1);
        let inst = if idx == 0 {
            Inst::stack_idx(Opcode::Dup, 0)
        } else {
            Inst::stack_idx(Opcode::Pick, idx)
        };
        self.emit(cur, inst);
    }

    /// Rotates the value at depth `idx` to the top.
    pub fn inst_roll(&mut self, idx: u16) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &self.blocks[cur as usize];
        if block.vstack.size() <= u32::from(idx) {
            return self.fail(BuildError::StackUnderflow { context: "roll" });
        }
        match idx {
            0 => {}
            1 => self.emit(cur, Inst::stack_idx(Opcode::Swap, 1)),
            _ => self.emit(cur, Inst::stack_idx(Opcode::Roll, idx)),
        }
    }

    //=== calls ===//

    /// Calls a function declared in the same module.
    pub fn inst_call(&mut self, callee: FunctionId) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let Some(callee_fn) = self.module.function(callee) else {
            return self.fail(BuildError::UnknownFunction);
        };
        let sig = callee_fn.sig;
        if !self.blocks[cur as usize].vstack.pop(u32::from(sig.input_count)) {
            return self.fail(BuildError::StackUnderflow { context: "call" });
        }
        let offset = i32::from(callee.0) - i32::from(self.function.0);
        match Inst::offset(Opcode::Call, offset) {
            Some(inst) => self.emit(cur, inst),
            None => return self.fail(BuildError::OffsetOutOfRange),
        }
        self.blocks[cur as usize].vstack.push(u32::from(sig.output_count));
    }

    /// Calls the function whose address is on top of the stack, checking the
    /// packed arity against `sig` at run time.
    pub fn inst_call_indirect(&mut self, sig: Signature) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let needed = u32::from(sig.input_count) + 1;
        if !self.blocks[cur as usize].vstack.pop(needed) {
            return self.fail(BuildError::StackUnderflow {
                context: "call_indirect",
            });
        }
        self.emit(
            cur,
            Inst::signature(Opcode::CallIndirect, sig.input_count, sig.output_count, 0),
        );
        self.blocks[cur as usize].vstack.push(u32::from(sig.output_count));
    }

    /// Calls a builtin function.
    ///
    /// `CONSTANT_FOLD` builtins whose inputs are all literals are evaluated
    /// now and replaced by pushes of their results; `ALWAYS_PANIC` builtins
    /// terminate the block.
    pub fn inst_call_builtin(&mut self, builtin: &Builtin) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let sig = builtin.signature;
        let always_panics = builtin.flags.contains(BuiltinFlags::ALWAYS_PANIC);

        if !always_panics
            && builtin.flags.contains(BuiltinFlags::CONSTANT_FOLD)
            && self.options.fold_constants
            && self.try_fold(cur, builtin)
        {
            return;
        }

        if !self.blocks[cur as usize].vstack.pop(u32::from(sig.input_count)) {
            return self.fail(BuildError::StackUnderflow {
                context: "call_builtin",
            });
        }

        let index = self.module.intern_builtin(builtin);
        let op = if builtin.flags.contains(BuiltinFlags::NO_PROCESS) {
            Opcode::CallBuiltinNoProcess
        } else {
            Opcode::CallBuiltin
        };
        let Some(call) = Inst::value(op, index) else {
            return self.fail(BuildError::OffsetOutOfRange);
        };
        self.emit(cur, call);
        self.emit(
            cur,
            Inst::signature(
                Opcode::CallBuiltinSig,
                sig.input_count,
                sig.output_count,
                builtin_flag_bits(builtin.flags),
            ),
        );

        if always_panics {
            self.blocks[cur as usize].terminator = Terminator::PanicBuiltin;
            self.cur = None;
        } else {
            self.blocks[cur as usize].vstack.push(u32::from(sig.output_count));
        }
    }

    /// Attempts to evaluate `builtin` over a literal input run; returns `true`
    /// if the call was replaced by pushes of its results.
    fn try_fold(&mut self, cur: u16, builtin: &Builtin) -> bool {
        let sig = builtin.signature;
        let Some(inputs) = self.take_literals(cur, usize::from(sig.input_count)) else {
            return false;
        };

        let mut stack = ValueStack::for_folding();
        for v in &inputs {
            stack.push(Value::from_uint(*v));
        }
        let mut ctx = BuiltinContext {
            stack: &mut stack,
            process: None,
        };
        let folded =
            (builtin.run)(&mut ctx).is_ok() && stack.depth() == usize::from(sig.output_count);

        if !folded {
            // Re-emit the consumed literals; the call is emitted normally.
            for v in &inputs {
                self.emit_literal(cur, *v);
            }
            return false;
        }

        let block = &mut self.blocks[cur as usize];
        block.vstack.pop(u32::from(sig.input_count));
        let outputs: Vec<u64> = stack.iter().map(Value::as_uint).collect();
        for v in outputs {
            self.emit_literal(cur, v);
        }
        self.blocks[cur as usize].vstack.push(u32::from(sig.output_count));
        true
    }

    /// Removes a trailing run of exactly `count` literal push groups from the
    /// block and returns their values bottom-first.
    fn take_literals(&mut self, cur: u16, count: usize) -> Option<Vec<u64>> {
        let insts = &self.blocks[cur as usize].insts;
        let mut end = insts.len();
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let (start, value) = literal_group_before(insts, end)?;
            values.push(value);
            end = start;
        }
        values.reverse();
        self.blocks[cur as usize].insts.truncate(end);
        Some(values)
    }

    //=== memory ===//

    /// Validates the address on top for a read of `layout`.
    pub fn inst_deref_const(&mut self, layout: Layout) {
        self.deref(layout, Opcode::DerefConst);
    }

    /// Validates the address on top for a write of `layout`.
    pub fn inst_deref_mut(&mut self, layout: Layout) {
        self.deref(layout, Opcode::DerefMut);
    }

    fn deref(&mut self, layout: Layout, op: Opcode) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(1) {
            return self.fail(BuildError::StackUnderflow { context: "deref" });
        }
        block.vstack.push(1);
        self.emit(cur, Inst::layout(op, layout));
    }

    /// Pops an address and pushes the value stored there.
    ///
    /// Loads through a just-emitted `local_addr`/`global_addr` are fused into
    /// their specialized forms.
    pub fn inst_load_value(&mut self) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(1) {
            return self.fail(BuildError::StackUnderflow { context: "load_value" });
        }
        block.vstack.push(1);
        match specialize_access(&mut self.blocks[cur as usize].insts) {
            Some(AddressSource::Local { slot, offset }) => self.emit(
                cur,
                Inst::local_addr(Opcode::LoadLocalValue, slot, offset),
            ),
            Some(AddressSource::Global { index }) => {
                let inst = Inst::value(Opcode::LoadGlobalValue, index)
                    .unwrap_or(Inst::none(Opcode::LoadValue));
                self.emit(cur, inst);
            }
            None => self.emit(cur, Inst::none(Opcode::LoadValue)),
        }
    }

    /// Pops an address, pops a value, and stores the value there.
    pub fn inst_store_value(&mut self) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(2) {
            return self.fail(BuildError::StackUnderflow {
                context: "store_value",
            });
        }
        match specialize_access(&mut self.blocks[cur as usize].insts) {
            Some(AddressSource::Local { slot, offset }) => self.emit(
                cur,
                Inst::local_addr(Opcode::StoreLocalValue, slot, offset),
            ),
            Some(AddressSource::Global { index }) => {
                let inst = Inst::value(Opcode::StoreGlobalValue, index)
                    .unwrap_or(Inst::none(Opcode::StoreValue));
                self.emit(cur, inst);
            }
            None => self.emit(cur, Inst::none(Opcode::StoreValue)),
        }
    }

    /// Pops an index and offsets the address on top by `index * stride(layout)`.
    pub fn inst_array_element(&mut self, element_layout: Layout) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(2) {
            return self.fail(BuildError::StackUnderflow {
                context: "array_element",
            });
        }
        block.vstack.push(1);
        let stride = align_up(u32::from(element_layout.size), element_layout.align());
        match Inst::value(Opcode::ArrayElement, stride) {
            Some(inst) => self.emit(cur, inst),
            None => self.fail(BuildError::OffsetOutOfRange),
        }
    }

    /// Offsets the address on top to the member at `member_index` of an
    /// aggregate with the given member layouts.
    pub fn inst_aggregate_member(&mut self, member_index: usize, member_layouts: &[Layout]) {
        let Some(cur) = self.cur_block() else {
            return;
        };
        let block = &mut self.blocks[cur as usize];
        if !block.vstack.pop(1) {
            return self.fail(BuildError::StackUnderflow {
                context: "aggregate_member",
            });
        }
        block.vstack.push(1);

        let mut offset = 0u32;
        for layout in member_layouts.iter().take(member_index) {
            offset = align_up(offset, layout.align()) + u32::from(layout.size);
        }
        if let Some(layout) = member_layouts.get(member_index) {
            offset = align_up(offset, layout.align());
        }
        if offset == 0 {
            return;
        }
        match Inst::value(Opcode::AggregateMember, offset) {
            Some(inst) => self.emit(cur, inst),
            None => self.fail(BuildError::OffsetOutOfRange),
        }
    }

    //=== finish ===//

    /// Finishes the body: resolves block references, computes the stack
    /// limits, and commits the instruction stream to the function.
    pub fn finish(mut self) -> Result<(), BuildError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.blocks.is_empty() {
            return Err(BuildError::EmptyFunction);
        }

        // Entry prologue: materialize the declared locals.
        let mut prologue = Vec::with_capacity(self.locals.len());
        for local in &self.locals {
            let layout = Layout {
                size: local.padded_size,
                align_log2: local
                    .extra_align
                    .map_or(3, |a| a.trailing_zeros() as u8),
            };
            let op = if local.extra_align.is_some() {
                Opcode::LocalAllocAligned
            } else {
                Opcode::LocalAlloc
            };
            prologue.push(Inst::layout(op, layout));
        }

        // Pass 1: verify termination and assign block offsets.
        let mut total = prologue.len() as u32;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if matches!(block.terminator, Terminator::Unterminated) {
                return Err(BuildError::UnterminatedBlock { block: i as u16 });
            }
            block.offset = total;
            total += block.insts.len() as u32 + block.terminator.encoded_len();
        }
        if total > u32::from(u16::MAX) {
            return Err(BuildError::TooManyInstructions);
        }

        // Pass 2: emit, rewriting symbolic block references into strides.
        let free_count = self.locals.len() as u32;
        let mut insts: Vec<Inst> = Vec::with_capacity(total as usize);
        insts.extend_from_slice(&prologue);
        let blocks = &self.blocks;
        for block in blocks {
            insts.extend_from_slice(&block.insts);
            let mut at = insts.len() as u32;
            match block.terminator {
                Terminator::Unterminated => {}
                Terminator::Return => {
                    let inst = if free_count == 0 {
                        Inst::none(Opcode::Return)
                    } else {
                        Inst::value(Opcode::ReturnFree, free_count)
                            .ok_or(BuildError::TooManyLocals)?
                    };
                    insts.push(inst);
                }
                Terminator::Jump(dest) => {
                    insts.push(jump_to(blocks, dest, at)?);
                }
                Terminator::Branch2 { if_true, if_false } => {
                    insts.push(branch_to(blocks, Opcode::BranchFalse, if_false, at)?);
                    at += 1;
                    insts.push(jump_to(blocks, if_true, at)?);
                }
                Terminator::Branch3 {
                    if_lt,
                    if_eq,
                    if_gt,
                } => {
                    insts.push(branch_to(blocks, Opcode::BranchEq, if_eq, at)?);
                    at += 1;
                    insts.push(branch_to(blocks, Opcode::BranchGt, if_gt, at)?);
                    at += 1;
                    insts.push(jump_to(blocks, if_lt, at)?);
                }
                Terminator::Panic => insts.push(Inst::none(Opcode::Panic)),
                Terminator::PanicBuiltin => {}
            }
        }

        // Pass 3: stack limits.
        let max_vstack = self
            .blocks
            .iter()
            .map(|b| b.vstack.max)
            .max()
            .unwrap_or(0);
        let max_vstack = u16::try_from(max_vstack).map_err(|_| BuildError::TooManyInstructions)?;
        let max_cstack: u32 = self
            .locals
            .iter()
            .map(|l| u32::from(l.padded_size) + l.extra_align.map_or(0, |a| a - 8))
            .sum();

        // Commit.
        let locations: Vec<(u16, DebugLocation)> = self
            .locations
            .iter()
            .map(|p| {
                let ip = self.blocks[p.block as usize].offset + p.inst;
                (ip as u16, p.location)
            })
            .collect();
        for (ip, location) in locations {
            self.module.push_location(self.function, ip, location);
        }

        let function = self.function;
        let Some(f) = self.module.function_mut(function) else {
            return Err(BuildError::UnknownFunction);
        };
        f.insts = Some(insts);
        f.max_vstack_size = max_vstack;
        f.max_cstack_size = max_cstack;
        Ok(())
    }
}

impl fmt::Debug for Builder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("function", &self.function)
            .field("blocks", &self.blocks.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

fn jump_to(blocks: &[BlockData], dest: Block, at: u32) -> Result<Inst, BuildError> {
    let target = blocks
        .get(dest.0 as usize)
        .ok_or(BuildError::UnknownBlock)?
        .offset;
    let offset = target as i64 - at as i64;
    if offset == 1 {
        return Ok(Inst::none(Opcode::Nop));
    }
    i32::try_from(offset)
        .ok()
        .and_then(|o| Inst::offset(Opcode::Jump, o))
        .ok_or(BuildError::OffsetOutOfRange)
}

fn branch_to(blocks: &[BlockData], op: Opcode, dest: Block, at: u32) -> Result<Inst, BuildError> {
    let target = blocks
        .get(dest.0 as usize)
        .ok_or(BuildError::UnknownBlock)?
        .offset;
    let offset = target as i64 - at as i64;
    i32::try_from(offset)
        .ok()
        .and_then(|o| Inst::offset(op, o))
        .ok_or(BuildError::OffsetOutOfRange)
}

fn builtin_flag_bits(flags: BuiltinFlags) -> u8 {
    let mut bits = 0;
    for (flag, bit) in [
        (BuiltinFlags::NO_PANIC, 1 << 0),
        (BuiltinFlags::NO_PROCESS, 1 << 1),
        (BuiltinFlags::VM_DIRECTIVE, 1 << 2),
        (BuiltinFlags::CONSTANT_FOLD, 1 << 3),
        (BuiltinFlags::ALWAYS_PANIC, 1 << 4),
    ] {
        if flags.contains(flag) {
            bits |= bit;
        }
    }
    bits
}

/// The origin of the address on top of the stack, if it was produced by the
/// immediately preceding instruction.
enum AddressSource {
    Local { slot: u8, offset: u16 },
    Global { index: u32 },
}

/// Pops a trailing `local_addr`/`global_addr` so a load/store can fuse with
/// it.
fn specialize_access(insts: &mut Vec<Inst>) -> Option<AddressSource> {
    let last = *insts.last()?;
    let source = match last.op()? {
        Opcode::LocalAddr => {
            let (slot, offset) = last.payload_local_addr();
            AddressSource::Local { slot, offset }
        }
        Opcode::GlobalAddr => AddressSource::Global {
            index: last.payload_value(),
        },
        _ => return None,
    };
    insts.pop();
    Some(source)
}

/// Parses the literal push group ending at `end`, returning its start index
/// and value.
fn literal_group_before(insts: &[Inst], end: usize) -> Option<(usize, u64)> {
    let mut i = end;
    let mut high: u64 = 0;
    let mut mid: Option<u64> = None;

    let mut inst = *insts.get(i.checked_sub(1)?)?;
    if inst.op() == Some(Opcode::Push3) {
        high = u64::from(inst.payload_value()) << 48;
        i -= 1;
        inst = *insts.get(i.checked_sub(1)?)?;
    }
    if inst.op() == Some(Opcode::Push2) {
        mid = Some(u64::from(inst.payload_value()) << 24);
        i -= 1;
        inst = *insts.get(i.checked_sub(1)?)?;
    }
    let base = match inst.op()? {
        Opcode::Push => u64::from(inst.payload_value()),
        Opcode::Pushn if mid.is_none() && high == 0 => !u64::from(inst.payload_value()),
        _ => return None,
    };
    Some((i - 1, base | mid.unwrap_or(0) | high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn entry_builder(module: &mut Module, sig: Signature) -> (Builder<'_>, Block) {
        let f = module.add_function("f", sig);
        let mut b = Builder::new(module, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(sig);
        b.build_block(entry);
        (b, entry)
    }

    #[test]
    fn straight_line_body_builds() {
        let mut m = Module::new("m");
        let (mut b, _) = entry_builder(&mut m, Signature::new(0, 1));
        b.inst_uint(42);
        b.inst_return();
        b.finish().unwrap();

        let f = m.function(FunctionId(0)).unwrap();
        let insts = f.insts().unwrap();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].op(), Some(Opcode::Push));
        assert_eq!(insts[0].payload_value(), 42);
        assert_eq!(insts[1].op(), Some(Opcode::Return));
        assert_eq!(f.max_vstack_size, 1);
    }

    #[test]
    fn large_literals_are_sliced() {
        let mut m = Module::new("m");
        let (mut b, _) = entry_builder(&mut m, Signature::new(0, 1));
        b.inst_uint(0x1234_5678_9abc_def0);
        b.inst_return();
        b.finish().unwrap();

        let insts = m.function(FunctionId(0)).unwrap().insts().unwrap();
        assert_eq!(insts[0].op(), Some(Opcode::Push));
        assert_eq!(insts[1].op(), Some(Opcode::Push2));
        assert_eq!(insts[2].op(), Some(Opcode::Push3));
        let (_, value) = literal_group_before(&insts[..3], 3).unwrap();
        assert_eq!(value, 0x1234_5678_9abc_def0);
    }

    #[test]
    fn small_negative_uses_pushn() {
        let mut m = Module::new("m");
        let (mut b, _) = entry_builder(&mut m, Signature::new(0, 1));
        b.inst_sint(-5);
        b.inst_return();
        b.finish().unwrap();

        let insts = m.function(FunctionId(0)).unwrap().insts().unwrap();
        assert_eq!(insts[0].op(), Some(Opcode::Pushn));
        assert_eq!(insts[0].payload_value(), 4);
        let (_, value) = literal_group_before(&insts[..1], 1).unwrap();
        assert_eq!(value as i64, -5);
    }

    #[test]
    fn branch_lowers_to_branch_false_plus_jump() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(1, 1));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(Signature::new(1, 0));
        let then = b.declare_block(Signature::new(0, 1));
        let other = b.declare_block(Signature::new(0, 1));
        b.build_block(entry);
        assert_eq!(b.inst_branch2(then, other), None);
        b.build_block(then);
        b.inst_uint(1);
        b.inst_return();
        b.build_block(other);
        b.inst_uint(0);
        b.inst_return();
        b.finish().unwrap();

        let insts = m.function(f).unwrap().insts().unwrap();
        // branch_false <other>, nop (fallthrough to then), then-body, other-body
        assert_eq!(insts[0].op(), Some(Opcode::BranchFalse));
        assert_eq!(insts[0].payload_offset(), 4);
        assert_eq!(insts[1].op(), Some(Opcode::Nop));
    }

    #[test]
    fn constant_condition_folds_the_branch() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 1));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(Signature::new(0, 0));
        let then = b.declare_block(Signature::new(0, 1));
        let other = b.declare_block(Signature::new(0, 1));
        b.build_block(entry);
        b.inst_uint(1);
        assert_eq!(b.inst_branch2(then, other), Some(then));
        b.build_block(then);
        b.inst_uint(7);
        b.inst_return();
        b.build_block(other);
        b.inst_uint(8);
        b.inst_return();
        b.finish().unwrap();

        let insts = m.function(f).unwrap().insts().unwrap();
        // The literal and the branch are gone; the entry jumps (or falls
        // through) to `then` directly.
        assert_eq!(insts[0].op(), Some(Opcode::Nop));
    }

    #[test]
    fn unbalanced_block_poisons_the_builder() {
        let mut m = Module::new("m");
        let (mut b, _) = entry_builder(&mut m, Signature::new(0, 0));
        b.inst_pop(0);
        // Poisoned: this would otherwise be fine.
        b.inst_uint(1);
        b.inst_return();
        assert_eq!(
            b.finish(),
            Err(BuildError::StackUnderflow { context: "pop" })
        );
        assert!(!m.function(FunctionId(0)).unwrap().is_defined());
    }

    #[test]
    fn unterminated_block_is_reported() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 0));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(Signature::new(0, 0));
        let dangling = b.declare_block(Signature::new(0, 0));
        b.build_block(entry);
        b.inst_jump(dangling);
        assert_eq!(
            b.finish(),
            Err(BuildError::UnterminatedBlock { block: 1 })
        );
    }

    #[test]
    fn locals_produce_a_prologue_and_return_free() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 0));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let local = b.build_local(Layout::from_size_align(4, 4).unwrap());
        let entry = b.declare_block(Signature::new(0, 0));
        b.build_block(entry);
        b.inst_local_addr(local);
        b.inst_pop(0);
        b.inst_return();
        b.finish().unwrap();

        let f = m.function(f).unwrap();
        let insts = f.insts().unwrap();
        assert_eq!(insts[0].op(), Some(Opcode::LocalAlloc));
        assert_eq!(insts[0].payload_layout().size, 8);
        assert_eq!(insts.last().unwrap().op(), Some(Opcode::ReturnFree));
        assert_eq!(insts.last().unwrap().payload_value(), 1);
        assert_eq!(f.max_cstack_size, 8);
    }

    #[test]
    fn load_through_local_addr_is_fused() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 1));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let local = b.build_local(Layout::VALUE);
        let entry = b.declare_block(Signature::new(0, 1));
        b.build_block(entry);
        b.inst_local_addr(local);
        b.inst_load_value();
        b.inst_return();
        b.finish().unwrap();

        let insts = m.function(f).unwrap().insts().unwrap();
        assert_eq!(insts[1].op(), Some(Opcode::LoadLocalValue));
    }

    #[test]
    fn double_definition_is_rejected() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 0));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(Signature::new(0, 0));
        b.build_block(entry);
        b.inst_return();
        b.finish().unwrap();

        assert!(matches!(
            Builder::new(&mut m, f, BuildOptions::default()),
            Err(BuildError::FunctionAlreadyDefined)
        ));
    }

    #[test]
    fn terminated_block_cannot_be_rebuilt() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 0));
        let mut b = Builder::new(&mut m, f, BuildOptions::default()).unwrap();
        let entry = b.declare_block(Signature::new(0, 0));
        b.build_block(entry);
        b.inst_return();
        b.build_block(entry);
        assert_eq!(b.finish(), Err(BuildError::BlockAlreadyTerminated));
    }
}
