// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The builtin function contract.
//!
//! Builtins are host-provided functions that participate in dispatch: they
//! receive the value stack and (usually) the running process, transfer their
//! declared inputs into outputs, and either succeed or panic the process by
//! returning an error message.
//!
//! Libraries group builtins under a dotted prefix, e.g. `ingot.test.assert`.

use alloc::borrow::Cow;

use crate::module::Signature;
use crate::process::Process;
use crate::vm::ValueStack;

/// Behavioral flags of a [`Builtin`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuiltinFlags(u8);

impl core::ops::BitOr for BuiltinFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BuiltinFlags {
    /// No special behavior.
    pub const DEFAULT: Self = Self(0);
    /// The builtin never panics.
    pub const NO_PANIC: Self = Self(1 << 0);
    /// The builtin does not need the process (except to panic).
    pub const NO_PROCESS: Self = Self(1 << 1);
    /// The builtin is a VM directive: it consumes its inputs, produces no
    /// outputs, and has no effect outside the VM.
    pub const VM_DIRECTIVE: Self = Self(1 << 2);
    /// The builtin may be evaluated at build time over literal inputs.
    pub const CONSTANT_FOLD: Self = Self(1 << 3);
    /// The builtin always panics; the builder treats the call as a block
    /// terminator.
    pub const ALWAYS_PANIC: Self = Self(1 << 4);

    /// Returns `true` if this set includes all bits in `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Const form of `|` for building flag sets in constants.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// The message of a builtin-initiated panic.
pub type PanicMessage = Cow<'static, str>;

/// Outcome of a builtin call: success, or a panic message.
pub type BuiltinResult = Result<(), PanicMessage>;

/// Execution context handed to a builtin implementation.
///
/// `process` is always present during normal execution; it is `None` only
/// while the builder constant-folds a [`BuiltinFlags::CONSTANT_FOLD`] builtin,
/// which may then only touch the stack.
pub struct BuiltinContext<'a, 'p, 'm> {
    /// The value stack; inputs are on top, outputs replace them.
    pub stack: &'a mut ValueStack,
    /// The running process, if any.
    pub process: Option<&'a mut Process<'p, 'm>>,
}

impl<'p, 'm> BuiltinContext<'_, 'p, 'm> {
    /// Returns the process or the panic every process-requiring builtin
    /// reports when folded without one.
    pub fn process(&mut self) -> Result<&mut Process<'p, 'm>, PanicMessage> {
        match self.process.as_deref_mut() {
            Some(p) => Ok(p),
            None => Err(Cow::Borrowed("builtin requires a process")),
        }
    }
}

/// The implementation signature of a builtin.
pub type BuiltinFn = for<'a, 'p, 'm> fn(&mut BuiltinContext<'a, 'p, 'm>) -> BuiltinResult;

/// A builtin function.
#[derive(Copy, Clone)]
pub struct Builtin {
    /// The unqualified name, used by the dumper and frontends.
    pub name: &'static str,
    /// Input/output arity.
    pub signature: Signature,
    /// Behavioral flags.
    pub flags: BuiltinFlags,
    /// The implementation.
    pub run: BuiltinFn,
}

impl core::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Builtin {
    /// Returns `true` if both refer to the same implementation.
    #[must_use]
    pub fn same_impl(&self, other: &Self) -> bool {
        core::ptr::fn_addr_eq(self.run, other.run) && self.name == other.name
    }
}

/// A named collection of builtins.
///
/// The prefix qualifies the members' names, separated by `.`.
#[derive(Copy, Clone, Debug)]
pub struct BuiltinLibrary {
    /// Library prefix, e.g. `"ingot.test"`.
    pub prefix: &'static str,
    /// The library members.
    pub functions: &'static [Builtin],
}

impl BuiltinLibrary {
    /// Looks up a member by unqualified name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&'static Builtin> {
        self.functions.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = BuiltinFlags::NO_PANIC | BuiltinFlags::CONSTANT_FOLD;
        assert!(flags.contains(BuiltinFlags::NO_PANIC));
        assert!(flags.contains(BuiltinFlags::CONSTANT_FOLD));
        assert!(!flags.contains(BuiltinFlags::VM_DIRECTIVE));
        assert!(flags.contains(BuiltinFlags::DEFAULT));
    }
}
