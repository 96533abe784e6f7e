// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Assertion builtins (`ingot.test`).

use alloc::borrow::Cow;
use alloc::string::String;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;
use crate::vm::runtime_call;

fn unreachable_impl(_ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    Err(Cow::Borrowed("unreachable code reached"))
}

fn assert_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let value = ctx.stack.pop().as_uint();
    if value == 0 {
        Ok(())
    } else {
        Err(Cow::Borrowed("assert failed"))
    }
}

fn assert_eq_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_uint();
    let lhs = ctx.stack.pop().as_uint();
    if lhs == rhs {
        Ok(())
    } else {
        Err(Cow::Borrowed("assert_eq failed"))
    }
}

fn assert_panic_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let msg_addr = ctx.stack.pop().as_address();
    let fn_addr = ctx.stack.pop().as_function_address();

    let stack = &mut *ctx.stack;
    let Some(process) = ctx.process.as_deref_mut() else {
        return Err(Cow::Borrowed("builtin requires a process"));
    };

    let expected: Option<String> = if msg_addr.is_null() {
        None
    } else {
        process.get_cstr(msg_addr).map(String::from)
    };
    let Some(target) = process.resolve_function(fn_addr, Signature::new(0, 0)) else {
        return Err(Cow::Borrowed("invalid function"));
    };

    // Arm the panic trap for the duration of the nested call; a panic then
    // stores its message here instead of reaching the panic handler.
    let previous_trap = process.panic_trap.take();
    process.panic_trap = Some(None);
    let result = runtime_call(process, stack, target);
    let captured = process.panic_trap.take().flatten();
    process.panic_trap = previous_trap;

    match (result, expected) {
        (Ok(()), _) => Err(Cow::Borrowed("assert_panic failed: no panic")),
        (Err(_), None) => Ok(()),
        (Err(_), Some(expected)) if captured.as_deref() == Some(expected.as_str()) => Ok(()),
        (Err(_), Some(_)) => Err(Cow::Borrowed("assert_panic failed: different message")),
    }
}

/// Panics unconditionally; the builder treats the call as a terminator.
pub const UNREACHABLE: Builtin = Builtin {
    name: "unreachable",
    signature: Signature::new(0, 0),
    flags: BuiltinFlags::ALWAYS_PANIC,
    run: unreachable_impl,
};

/// `value => _`: panics unless `value` is zero.
pub const ASSERT: Builtin = Builtin {
    name: "assert",
    signature: Signature::new(1, 0),
    flags: BuiltinFlags::DEFAULT,
    run: assert_impl,
};

/// `lhs rhs => _`: panics unless the values are equal.
pub const ASSERT_EQ: Builtin = Builtin {
    name: "assert_eq",
    signature: Signature::new(2, 0),
    flags: BuiltinFlags::DEFAULT,
    run: assert_eq_impl,
};

/// `fn msg => _`: calls `fn` (a `(0 => 0)` function address) and panics
/// unless the call panics with the expected message.
///
/// A null `msg` accepts any panic message.
pub const ASSERT_PANIC: Builtin = Builtin {
    name: "assert_panic",
    signature: Signature::new(2, 0),
    flags: BuiltinFlags::DEFAULT,
    run: assert_panic_impl,
};

/// The `ingot.test` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.test",
    functions: &[UNREACHABLE, ASSERT, ASSERT_EQ, ASSERT_PANIC],
};
