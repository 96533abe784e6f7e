// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Heap memory builtins (`ingot.heap`).
//!
//! Allocations go through the VM's configured allocator and join the
//! allocation table with a `Heap` source; the collector in
//! [`Process::gc`](crate::process::Process::gc) reclaims whatever the
//! conservative trace cannot reach.

use alloc::borrow::Cow;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;
use crate::value::Value;

fn alloc_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let size = ctx.stack.pop().as_uint();
    let align = ctx.stack.pop().as_uint();
    let stack = &mut *ctx.stack;
    let Some(process) = ctx.process.as_deref_mut() else {
        return Err(Cow::Borrowed("builtin requires a process"));
    };
    match process.heap_alloc(size, align) {
        Some(addr) => {
            stack.push(Value::from_address(addr));
            Ok(())
        }
        None => Err(Cow::Borrowed("out of memory")),
    }
}

fn free_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.heap_free(addr) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid heap address"))
    }
}

fn leak_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.heap_leak(addr) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid heap address"))
    }
}

fn gc_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let stack = &mut *ctx.stack;
    let Some(process) = ctx.process.as_deref_mut() else {
        return Err(Cow::Borrowed("builtin requires a process"));
    };
    let freed = process.gc(stack);
    stack.push(Value::from_uint(freed));
    Ok(())
}

fn declare_reachable_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.declare_reachable(addr, true) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid heap address"))
    }
}

fn undeclare_reachable_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.declare_reachable(addr, false) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid heap address"))
    }
}

fn declare_weak_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.declare_weak(addr, true) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid address"))
    }
}

fn undeclare_weak_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.declare_weak(addr, false) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid address"))
    }
}

fn poison_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.poison(addr) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid address"))
    }
}

fn unpoison_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let addr = ctx.stack.pop().as_address();
    let process = ctx.process()?;
    if process.unpoison(addr) {
        Ok(())
    } else {
        Err(Cow::Borrowed("invalid address"))
    }
}

/// `align size => addr`: allocates zeroed heap memory.
pub const ALLOC: Builtin = Builtin {
    name: "alloc",
    signature: Signature::new(2, 1),
    flags: BuiltinFlags::DEFAULT,
    run: alloc_impl,
};

/// `addr => _`: frees a heap allocation.
pub const FREE: Builtin = Builtin {
    name: "free",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: free_impl,
};

/// `addr => _`: marks a heap allocation leaked (unusable, never reclaimed).
pub const LEAK: Builtin = Builtin {
    name: "leak",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: leak_impl,
};

/// `_ => bytes_freed`: runs the conservative collector.
pub const GC: Builtin = Builtin {
    name: "gc",
    signature: Signature::new(0, 1),
    flags: BuiltinFlags::DEFAULT,
    run: gc_impl,
};

/// `addr => _`: declares a heap allocation an explicit GC root.
pub const DECLARE_REACHABLE: Builtin = Builtin {
    name: "declare_reachable",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: declare_reachable_impl,
};

/// `addr => _`: removes an explicit GC root declaration.
pub const UNDECLARE_REACHABLE: Builtin = Builtin {
    name: "undeclare_reachable",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: undeclare_reachable_impl,
};

/// `addr => _`: excludes an allocation's contents from the GC trace.
pub const DECLARE_WEAK: Builtin = Builtin {
    name: "declare_weak",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: declare_weak_impl,
};

/// `addr => _`: re-includes an allocation's contents in the GC trace.
pub const UNDECLARE_WEAK: Builtin = Builtin {
    name: "undeclare_weak",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: undeclare_weak_impl,
};

/// `addr => _`: poisons an allocation, refusing access until unpoisoned.
pub const POISON: Builtin = Builtin {
    name: "poison",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: poison_impl,
};

/// `addr => _`: reverts a poisoned allocation to usable.
pub const UNPOISON: Builtin = Builtin {
    name: "unpoison",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: unpoison_impl,
};

/// The `ingot.heap` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.heap",
    functions: &[
        ALLOC,
        FREE,
        LEAK,
        GC,
        DECLARE_REACHABLE,
        UNDECLARE_REACHABLE,
        DECLARE_WEAK,
        UNDECLARE_WEAK,
        POISON,
        UNPOISON,
    ],
};
