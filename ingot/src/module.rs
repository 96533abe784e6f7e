// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The module model: functions, globals, and debug metadata.
//!
//! A module is created mutable, populated through [`Module`] methods and the
//! [`Builder`](crate::builder::Builder), and effectively frozen once a
//! [`Program`](crate::program::Program) borrows it.

use alloc::borrow::ToOwned;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arena::{ByteArena, ByteRange};
use crate::builtin::Builtin;
use crate::inst::Inst;

/// Input/output arity of a function, block, or builtin.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    /// Number of values consumed from the stack.
    pub input_count: u8,
    /// Number of values left on the stack.
    pub output_count: u8,
}

impl Signature {
    /// Creates a signature.
    #[must_use]
    pub const fn new(input_count: u8, output_count: u8) -> Self {
        Self {
            input_count,
            output_count,
        }
    }
}

/// Identifies a function within its module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u16);

/// Identifies a global within its module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u32);

/// Access permissions of a global memory object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlobalPermissions {
    /// The global may only be read.
    ReadOnly,
    /// The global may be read and written.
    ReadWrite,
}

/// A global memory object.
#[derive(Clone, Debug)]
pub struct Global {
    /// Name, used for dumping and linking diagnostics.
    pub name: String,
    /// Initial contents (a range into the module arena), or `None` for
    /// zero-initialized memory.
    pub data: Option<ByteRange>,
    /// Size in bytes. If bigger than 32 bits, only the lower part is
    /// addressable.
    pub size: u64,
    /// Alignment as a power of two.
    pub align_log2: u8,
    /// Access permissions.
    pub perms: GlobalPermissions,
    /// Module-local allocation index, assigned monotonically.
    pub allocation_index: u32,
}

/// A function: a declaration plus, once built, its instruction stream.
#[derive(Clone, Debug)]
pub struct Function {
    /// Name, used for linking and dumping.
    pub name: String,
    /// Input/output arity.
    pub sig: Signature,
    /// Whether linked programs may resolve against this function.
    pub exported: bool,
    /// The built instruction stream; `None` means declared but undefined
    /// (a linker symbol).
    pub(crate) insts: Option<Vec<Inst>>,
    /// Maximum value-stack depth of any execution path, computed at build
    /// finish.
    pub(crate) max_vstack_size: u16,
    /// Worst-case call-stack bytes for local allocations, computed at build
    /// finish.
    pub(crate) max_cstack_size: u32,
    /// Index within the module.
    pub(crate) index: u16,
}

impl Function {
    /// Returns the built instruction stream, if the function is defined.
    #[must_use]
    pub fn insts(&self) -> Option<&[Inst]> {
        self.insts.as_deref()
    }

    /// Returns `true` if the function has a body.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.insts.is_some()
    }
}

/// A source location attached to instructions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugLocation {
    /// 1-based line number; 0 if unknown.
    pub line: u16,
    /// 1-based column number; 0 if unknown.
    pub column: u16,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct InstLocation {
    pub(crate) function: FunctionId,
    pub(crate) ip: u16,
    pub(crate) location: DebugLocation,
}

/// A compilation unit owning globals, functions and their bytes.
#[derive(Clone, Debug, Default)]
pub struct Module {
    name: String,
    globals: Vec<Global>,
    functions: Vec<Function>,
    data: ByteArena,
    debug_path: Option<String>,
    locations: Vec<InstLocation>,
    pub(crate) builtins: Vec<Builtin>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Returns the module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the module's globals in allocation-index order.
    #[must_use]
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Returns the module's functions in declaration order.
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Returns a function by id.
    #[must_use]
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    /// Returns a global by id.
    #[must_use]
    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id.0 as usize)
    }

    /// Returns the bytes of a stored range.
    #[must_use]
    pub fn data(&self, range: ByteRange) -> &[u8] {
        self.data.get(range)
    }

    /// Sets the source path reported in stack traces and dumps.
    pub fn set_debug_path(&mut self, path: &str) {
        self.debug_path = Some(path.to_owned());
    }

    /// Returns the source path, if set.
    #[must_use]
    pub fn debug_path(&self) -> Option<&str> {
        self.debug_path.as_deref()
    }

    //=== globals ===//

    /// Adds a read-only global initialized with `bytes`.
    pub fn add_global_const_data(&mut self, name: &str, bytes: &[u8], align_log2: u8) -> GlobalId {
        let data = self.data.push(bytes);
        self.push_global(Global {
            name: name.to_owned(),
            data: Some(data),
            size: bytes.len() as u64,
            align_log2,
            perms: GlobalPermissions::ReadOnly,
            allocation_index: 0,
        })
    }

    /// Adds a mutable global initialized with `bytes`.
    pub fn add_global_mut_data(&mut self, name: &str, bytes: &[u8], align_log2: u8) -> GlobalId {
        let data = self.data.push(bytes);
        self.push_global(Global {
            name: name.to_owned(),
            data: Some(data),
            size: bytes.len() as u64,
            align_log2,
            perms: GlobalPermissions::ReadWrite,
            allocation_index: 0,
        })
    }

    /// Adds a mutable, zero-initialized global of `size` bytes.
    pub fn add_global_zero_data(&mut self, name: &str, size: u64, align_log2: u8) -> GlobalId {
        self.push_global(Global {
            name: name.to_owned(),
            data: None,
            size,
            align_log2,
            perms: GlobalPermissions::ReadWrite,
            allocation_index: 0,
        })
    }

    /// Adds a read-only global containing `s` as a null-terminated string,
    /// reusing an existing constant global with the same contents if present.
    pub fn add_string_literal(&mut self, s: &str) -> GlobalId {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);

        for global in &self.globals {
            if let (GlobalPermissions::ReadOnly, Some(range)) = (global.perms, global.data)
                && self.data.get(range) == bytes.as_slice()
            {
                return GlobalId(global.allocation_index);
            }
        }

        let name = format!("string_{}", self.globals.len());
        self.add_global_const_data(&name, &bytes, 0)
    }

    fn push_global(&mut self, mut global: Global) -> GlobalId {
        let id = GlobalId(u32::try_from(self.globals.len()).unwrap_or(u32::MAX));
        global.allocation_index = id.0;
        self.globals.push(global);
        id
    }

    //=== functions ===//

    /// Declares a function; its body is supplied later through a builder.
    pub fn add_function(&mut self, name: &str, sig: Signature) -> FunctionId {
        let index = u16::try_from(self.functions.len()).unwrap_or(u16::MAX);
        self.functions.push(Function {
            name: name.to_owned(),
            sig,
            exported: false,
            insts: None,
            max_vstack_size: 0,
            max_cstack_size: 0,
            index,
        });
        FunctionId(index)
    }

    /// Marks a function as resolvable from other programs at link time.
    pub fn export_function(&mut self, id: FunctionId) {
        if let Some(f) = self.functions.get_mut(id.0 as usize) {
            f.exported = true;
        }
    }

    pub(crate) fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    //=== builtins ===//

    /// Interns `builtin` into the module's builtin table, returning its index.
    pub(crate) fn intern_builtin(&mut self, builtin: &Builtin) -> u32 {
        if let Some(i) = self.builtins.iter().position(|b| b.same_impl(builtin)) {
            return u32::try_from(i).unwrap_or(u32::MAX);
        }
        let id = u32::try_from(self.builtins.len()).unwrap_or(u32::MAX);
        self.builtins.push(*builtin);
        id
    }

    //=== debug locations ===//

    pub(crate) fn push_location(&mut self, function: FunctionId, ip: u16, location: DebugLocation) {
        self.locations.push(InstLocation {
            function,
            ip,
            location,
        });
    }

    /// Returns the debug location active at `ip` of `function`, if any.
    ///
    /// A location remains active for all later instructions until overridden.
    #[must_use]
    pub fn location_of(&self, function: FunctionId, ip: u16) -> Option<DebugLocation> {
        self.locations
            .iter()
            .filter(|l| l.function == function && l.ip <= ip)
            .next_back()
            .map(|l| l.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_get_monotonic_allocation_indices() {
        let mut m = Module::new("m");
        let a = m.add_global_const_data("a", b"x", 0);
        let b = m.add_global_zero_data("b", 16, 3);
        let c = m.add_global_mut_data("c", b"yz", 0);
        assert_eq!((a.0, b.0, c.0), (0, 1, 2));
        assert_eq!(m.global(b).unwrap().size, 16);
        assert!(m.global(b).unwrap().data.is_none());
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let mut m = Module::new("m");
        let a = m.add_string_literal("boom");
        let b = m.add_string_literal("boom");
        let c = m.add_string_literal("bang");
        assert_eq!(a, b);
        assert_ne!(a, c);
        let range = m.global(a).unwrap().data.unwrap();
        assert_eq!(m.data(range), b"boom\0");
    }

    #[test]
    fn declared_function_is_undefined() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(1, 1));
        assert!(!m.function(f).unwrap().is_defined());
    }

    #[test]
    fn latest_location_wins() {
        let mut m = Module::new("m");
        let f = m.add_function("f", Signature::new(0, 0));
        m.push_location(f, 0, DebugLocation { line: 1, column: 1 });
        m.push_location(f, 2, DebugLocation { line: 5, column: 1 });
        assert_eq!(m.location_of(f, 1).unwrap().line, 1);
        assert_eq!(m.location_of(f, 3).unwrap().line, 5);
        assert_eq!(m.location_of(FunctionId(9), 0), None);
    }
}
