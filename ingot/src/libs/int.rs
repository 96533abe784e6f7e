// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Integer arithmetic builtins (`ingot.int`).
//!
//! All operations are checked: overflow and division by zero panic the
//! process. Every member folds at build time over literal inputs.

use alloc::borrow::Cow;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;
use crate::value::Value;

const FLAGS: BuiltinFlags = BuiltinFlags::NO_PROCESS.union(BuiltinFlags::CONSTANT_FOLD);

fn binary_sint(
    ctx: &mut BuiltinContext<'_, '_, '_>,
    op: fn(i64, i64) -> Option<i64>,
    msg: &'static str,
) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_sint();
    let lhs = ctx.stack.pop().as_sint();
    match op(lhs, rhs) {
        Some(result) => {
            ctx.stack.push(Value::from_sint(result));
            Ok(())
        }
        None => Err(Cow::Borrowed(msg)),
    }
}

fn binary_uint(
    ctx: &mut BuiltinContext<'_, '_, '_>,
    op: fn(u64, u64) -> Option<u64>,
    msg: &'static str,
) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_uint();
    let lhs = ctx.stack.pop().as_uint();
    match op(lhs, rhs) {
        Some(result) => {
            ctx.stack.push(Value::from_uint(result));
            Ok(())
        }
        None => Err(Cow::Borrowed(msg)),
    }
}

fn sadd_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_sint(ctx, i64::checked_add, "integer overflow")
}

fn ssub_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_sint(ctx, i64::checked_sub, "integer overflow")
}

fn smul_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_sint(ctx, i64::checked_mul, "integer overflow")
}

fn sdiv_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let rhs = ctx.stack.pop().as_sint();
    let lhs = ctx.stack.pop().as_sint();
    if rhs == 0 {
        return Err(Cow::Borrowed("division by zero"));
    }
    match lhs.checked_div(rhs) {
        Some(result) => {
            ctx.stack.push(Value::from_sint(result));
            Ok(())
        }
        None => Err(Cow::Borrowed("integer overflow")),
    }
}

fn uadd_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_uint(ctx, u64::checked_add, "integer overflow")
}

fn usub_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_uint(ctx, u64::checked_sub, "integer overflow")
}

fn umul_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_uint(ctx, u64::checked_mul, "integer overflow")
}

fn udiv_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    binary_uint(ctx, u64::checked_div, "division by zero")
}

/// `lhs rhs => lhs + rhs` (signed, panics on overflow).
pub const SADD: Builtin = Builtin {
    name: "sadd",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: sadd_impl,
};

/// `lhs rhs => lhs - rhs` (signed, panics on overflow).
pub const SSUB: Builtin = Builtin {
    name: "ssub",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: ssub_impl,
};

/// `lhs rhs => lhs * rhs` (signed, panics on overflow).
pub const SMUL: Builtin = Builtin {
    name: "smul",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: smul_impl,
};

/// `lhs rhs => lhs / rhs` (signed, panics on zero and `MIN / -1`).
pub const SDIV: Builtin = Builtin {
    name: "sdiv",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: sdiv_impl,
};

/// `lhs rhs => lhs + rhs` (unsigned, panics on overflow).
pub const UADD: Builtin = Builtin {
    name: "uadd",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: uadd_impl,
};

/// `lhs rhs => lhs - rhs` (unsigned, panics on underflow).
pub const USUB: Builtin = Builtin {
    name: "usub",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: usub_impl,
};

/// `lhs rhs => lhs * rhs` (unsigned, panics on overflow).
pub const UMUL: Builtin = Builtin {
    name: "umul",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: umul_impl,
};

/// `lhs rhs => lhs / rhs` (unsigned, panics on zero).
pub const UDIV: Builtin = Builtin {
    name: "udiv",
    signature: Signature::new(2, 1),
    flags: FLAGS,
    run: udiv_impl,
};

/// The `ingot.int` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.int",
    functions: &[SADD, SSUB, SMUL, SDIV, UADD, USUB, UMUL, UDIV],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ValueStack;

    fn run(builtin: &Builtin, inputs: &[u64]) -> Result<u64, alloc::string::String> {
        let mut stack = ValueStack::for_folding();
        for v in inputs {
            stack.push(Value::from_uint(*v));
        }
        let mut ctx = BuiltinContext {
            stack: &mut stack,
            process: None,
        };
        match (builtin.run)(&mut ctx) {
            Ok(()) => Ok(stack.pop().as_uint()),
            Err(m) => Err(m.into_owned()),
        }
    }

    #[test]
    fn checked_arithmetic() {
        assert_eq!(run(&SADD, &[2, 3]).unwrap(), 5);
        assert_eq!(run(&SSUB, &[2, 3]).unwrap() as i64, -1);
        assert_eq!(run(&UDIV, &[7, 2]).unwrap(), 3);
        assert_eq!(run(&SADD, &[i64::MAX as u64, 1]), Err("integer overflow".into()));
        assert_eq!(run(&UDIV, &[1, 0]), Err("division by zero".into()));
        assert_eq!(
            run(&SDIV, &[i64::MIN as u64, (-1i64) as u64]),
            Err("integer overflow".into())
        );
    }
}
