// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bit manipulation builtins (`ingot.bits`).

use alloc::borrow::Cow;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;
use crate::value::Value;

const NO_PANIC_FLAGS: BuiltinFlags = BuiltinFlags::NO_PANIC
    .union(BuiltinFlags::NO_PROCESS)
    .union(BuiltinFlags::CONSTANT_FOLD);
const PANIC_FLAGS: BuiltinFlags = BuiltinFlags::NO_PROCESS.union(BuiltinFlags::CONSTANT_FOLD);

fn and_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_uint();
    let lhs = ctx.stack.pop().as_uint();
    ctx.stack.push(Value::from_uint(lhs & rhs));
    Ok(())
}

fn or_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_uint();
    let lhs = ctx.stack.pop().as_uint();
    ctx.stack.push(Value::from_uint(lhs | rhs));
    Ok(())
}

fn xor_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_uint();
    let lhs = ctx.stack.pop().as_uint();
    ctx.stack.push(Value::from_uint(lhs ^ rhs));
    Ok(())
}

fn shl_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let n = ctx.stack.pop().as_uint();
    let x = ctx.stack.pop().as_uint();
    if n >= 64 {
        return Err(Cow::Borrowed("shift amount too big"));
    }
    ctx.stack.push(Value::from_uint(x << n));
    Ok(())
}

fn ushr_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let n = ctx.stack.pop().as_uint();
    let x = ctx.stack.pop().as_uint();
    if n >= 64 {
        return Err(Cow::Borrowed("shift amount too big"));
    }
    ctx.stack.push(Value::from_uint(x >> n));
    Ok(())
}

fn sshr_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let n = ctx.stack.pop().as_uint();
    let x = ctx.stack.pop().as_sint();
    if n >= 64 {
        return Err(Cow::Borrowed("shift amount too big"));
    }
    ctx.stack.push(Value::from_sint(x >> n));
    Ok(())
}

/// `lhs rhs => lhs & rhs`.
pub const AND: Builtin = Builtin {
    name: "and",
    signature: Signature::new(2, 1),
    flags: NO_PANIC_FLAGS,
    run: and_impl,
};

/// `lhs rhs => lhs | rhs`.
pub const OR: Builtin = Builtin {
    name: "or",
    signature: Signature::new(2, 1),
    flags: NO_PANIC_FLAGS,
    run: or_impl,
};

/// `lhs rhs => lhs ^ rhs`.
pub const XOR: Builtin = Builtin {
    name: "xor",
    signature: Signature::new(2, 1),
    flags: NO_PANIC_FLAGS,
    run: xor_impl,
};

/// `x n => x << n` (panics if `n >= 64`).
pub const SHL: Builtin = Builtin {
    name: "shl",
    signature: Signature::new(2, 1),
    flags: PANIC_FLAGS,
    run: shl_impl,
};

/// `x n => x >> n` (logical; panics if `n >= 64`).
pub const USHR: Builtin = Builtin {
    name: "ushr",
    signature: Signature::new(2, 1),
    flags: PANIC_FLAGS,
    run: ushr_impl,
};

/// `x n => x >> n` (arithmetic; panics if `n >= 64`).
pub const SSHR: Builtin = Builtin {
    name: "sshr",
    signature: Signature::new(2, 1),
    flags: PANIC_FLAGS,
    run: sshr_impl,
};

/// The `ingot.bits` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.bits",
    functions: &[AND, OR, XOR, SHL, USHR, SSHR],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ValueStack;

    #[test]
    fn shift_amount_is_checked() {
        let mut stack = ValueStack::for_folding();
        stack.push(Value::from_uint(1));
        stack.push(Value::from_uint(64));
        let mut ctx = BuiltinContext {
            stack: &mut stack,
            process: None,
        };
        assert_eq!((SHL.run)(&mut ctx), Err("shift amount too big".into()));
    }

    #[test]
    fn sshr_is_arithmetic() {
        let mut stack = ValueStack::for_folding();
        stack.push(Value::from_sint(-8));
        stack.push(Value::from_uint(2));
        let mut ctx = BuiltinContext {
            stack: &mut stack,
            process: None,
        };
        (SSHR.run)(&mut ctx).unwrap();
        assert_eq!(stack.pop().as_sint(), -2);
    }
}
