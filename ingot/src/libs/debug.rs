// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Debugging builtins (`ingot.debug`).
//!
//! Output goes through the VM's `log_handler` option; the default handler
//! discards it.

use alloc::format;

use crate::builtin::{Builtin, BuiltinContext, BuiltinFlags, BuiltinLibrary, BuiltinResult};
use crate::module::Signature;

fn print_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let value = ctx.stack.top();
    let process = ctx.process()?;
    let line = format!(
        "debug: {:#018x} ({})",
        value.as_uint(),
        value.as_sint()
    );
    (process.log_handler)(&line);
    Ok(())
}

fn print_vstack_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let depth = ctx.stack.depth();
    let lines: alloc::vec::Vec<alloc::string::String> = ctx
        .stack
        .iter()
        .enumerate()
        .map(|(i, v)| format!("debug: vstack[{}] = {:#018x}", depth - 1 - i, v.as_uint()))
        .collect();
    let process = ctx.process()?;
    (process.log_handler)(&format!("debug: vstack depth {depth}"));
    for line in &lines {
        (process.log_handler)(line);
    }
    Ok(())
}

fn print_cstack_impl(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
    let process = ctx.process()?;
    let trace = process.stacktrace();
    (process.log_handler)(&format!("{trace}"));
    Ok(())
}

/// `value => value`: logs the top of the stack without consuming it.
pub const PRINT: Builtin = Builtin {
    name: "print",
    signature: Signature::new(1, 1),
    flags: BuiltinFlags::DEFAULT,
    run: print_impl,
};

/// Logs the whole value stack.
pub const PRINT_VSTACK: Builtin = Builtin {
    name: "print_vstack",
    signature: Signature::new(0, 0),
    flags: BuiltinFlags::VM_DIRECTIVE,
    run: print_vstack_impl,
};

/// Logs the current stack trace.
pub const PRINT_CSTACK: Builtin = Builtin {
    name: "print_cstack",
    signature: Signature::new(0, 0),
    flags: BuiltinFlags::VM_DIRECTIVE,
    run: print_cstack_impl,
};

/// The `ingot.debug` library.
pub const LIB: BuiltinLibrary = BuiltinLibrary {
    prefix: "ingot.debug",
    functions: &[PRINT, PRINT_VSTACK, PRINT_CSTACK],
};
