// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Step-limit builtins (`ingot.limits`).
//!
//! Both members are VM directives: other backends may drop them entirely.

use alloc::borrow::Cow;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;

fn set_step_limit_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let new_limit = ctx.stack.pop().as_uint();
    let process = ctx.process()?;
    if new_limit == 0 {
        return Err(Cow::Borrowed("cannot remove step limit"));
    }
    if !process.set_step_limit(new_limit) {
        return Err(Cow::Borrowed("cannot lower step limit"));
    }
    Ok(())
}

fn step_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let process = ctx.process()?;
    // If the panic recovers (via `ingot.test.assert_panic`), the remaining
    // step budget stays exhausted.
    if !process.charge_step() {
        return Err(Cow::Borrowed("step limit exceeded"));
    }
    Ok(())
}

/// `new_limit => _`: raises the step limit; removing or lowering it panics.
pub const SET_STEP_LIMIT: Builtin = Builtin {
    name: "set_step_limit",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::VM_DIRECTIVE,
    run: set_step_limit_impl,
};

/// Charges one extra step; panics when the limit is exhausted.
pub const STEP: Builtin = Builtin {
    name: "step",
    signature: Signature::new(0, 0),
    flags: BuiltinFlags::VM_DIRECTIVE,
    run: step_impl,
};

/// The `ingot.limits` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.limits",
    functions: &[SET_STEP_LIMIT, STEP],
};
