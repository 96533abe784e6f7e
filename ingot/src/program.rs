// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Programs: a module bound to an entry function, plus linked modules and
//! native definitions.
//!
//! A program borrows its modules, which freezes them for its lifetime. Linking
//! appends further modules and resolves the base module's undefined functions
//! against exported functions of linked modules by name; native definitions
//! bind host implementations and take precedence over linked resolutions.
//! Whatever is still unresolved panics when called, at execution time.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::builtin::{BuiltinContext, BuiltinResult};
use crate::inst::Inst;
use crate::memory::Allocation;
use crate::module::{Function, FunctionId, GlobalId, GlobalPermissions, Module, Signature};
use crate::value::FunctionAddress;

/// The implementation signature of a native function definition.
pub type NativeFunction = for<'a, 'p, 'm> fn(&mut BuiltinContext<'a, 'p, 'm>) -> BuiltinResult;

/// A program assembly error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgramError {
    /// The referenced function does not exist in the base module.
    UnknownFunction,
    /// The referenced global does not exist in the base module.
    UnknownGlobal,
    /// Linking would exceed the program-wide function index space.
    TooManyFunctions,
}

impl core::fmt::Display for ProgramError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownFunction => write!(f, "unknown function"),
            Self::UnknownGlobal => write!(f, "unknown global"),
            Self::TooManyFunctions => write!(f, "too many functions in program"),
        }
    }
}

impl core::error::Error for ProgramError {}

#[derive(Debug)]
struct ProgramFunction<'m> {
    module: u16,
    function: &'m Function,
    native: Option<NativeFunction>,
    linked: Option<u16>,
}

/// How a program function call is carried out.
#[derive(Copy, Clone)]
pub(crate) enum Definition<'m> {
    /// Execute the function's instruction stream.
    Insts {
        /// Module index owning the instructions.
        module: u16,
        /// Flat index of the executed function.
        function: u16,
        /// The instruction stream.
        insts: &'m [Inst],
        /// Value-stack head room required.
        max_vstack_size: u16,
        /// Call-stack byte room required beyond the frame overhead.
        max_cstack_size: u32,
    },
    /// Invoke a native definition.
    Native(NativeFunction),
    /// Unresolved; calling panics.
    Undefined,
}

/// An executable binding of modules to an entry function.
#[derive(Debug)]
pub struct Program<'m> {
    modules: Vec<&'m Module>,
    entry: u16,
    functions: Vec<ProgramFunction<'m>>,
    module_starts: Vec<u16>,
    global_bases: Vec<u32>,
    native_globals: HashMap<u32, Vec<u8>>,
}

impl<'m> Program<'m> {
    /// Creates a program executing `entry` of `module`.
    pub fn new(module: &'m Module, entry: FunctionId) -> Result<Self, ProgramError> {
        if module.function(entry).is_none() {
            return Err(ProgramError::UnknownFunction);
        }
        let mut program = Self {
            modules: Vec::new(),
            entry: entry.0,
            functions: Vec::new(),
            module_starts: Vec::new(),
            global_bases: Vec::new(),
            native_globals: HashMap::new(),
        };
        program.append_module(module)?;
        Ok(program)
    }

    /// Attaches `module` and re-resolves undefined base-module functions
    /// against the exported functions of all linked modules.
    pub fn link_module(&mut self, module: &'m Module) -> Result<(), ProgramError> {
        self.append_module(module)?;
        self.resolve_links();
        Ok(())
    }

    fn append_module(&mut self, module: &'m Module) -> Result<(), ProgramError> {
        let start = self.functions.len();
        if start + module.functions().len() > usize::from(u16::MAX) {
            return Err(ProgramError::TooManyFunctions);
        }
        let module_index = self.modules.len() as u16;
        self.module_starts.push(start as u16);
        let next_base = self.global_bases.last().copied().unwrap_or(0) + prev_globals(self);
        self.global_bases.push(next_base);
        self.modules.push(module);
        for function in module.functions() {
            self.functions.push(ProgramFunction {
                module: module_index,
                function,
                native: None,
                linked: None,
            });
        }
        Ok(())
    }

    fn resolve_links(&mut self) {
        // Exported, defined functions of linked modules, first match winning.
        let mut exports: HashMap<&'m str, u16> = HashMap::new();
        for (i, pf) in self.functions.iter().enumerate() {
            if pf.module != 0 && pf.function.exported && pf.function.is_defined() {
                exports.entry(pf.function.name.as_str()).or_insert(i as u16);
            }
        }
        let base_count = usize::from(self.module_starts.get(1).copied().unwrap_or_else(|| {
            self.functions.len() as u16
        }));
        for pf in &mut self.functions[..base_count] {
            if !pf.function.is_defined() && pf.linked.is_none() {
                pf.linked = exports.get(pf.function.name.as_str()).copied();
            }
        }
    }

    /// Binds a host implementation to a declared base-module function.
    ///
    /// Native definitions take precedence over linked resolutions.
    pub fn define_native_function(
        &mut self,
        function: FunctionId,
        native: NativeFunction,
    ) -> Result<(), ProgramError> {
        let base = self
            .functions
            .get_mut(usize::from(function.0))
            .filter(|pf| pf.module == 0)
            .ok_or(ProgramError::UnknownFunction)?;
        base.native = Some(native);
        Ok(())
    }

    /// Binds initial contents to a declared base-module global.
    pub fn define_native_global(
        &mut self,
        global: GlobalId,
        bytes: &[u8],
    ) -> Result<(), ProgramError> {
        if self.modules[0].global(global).is_none() {
            return Err(ProgramError::UnknownGlobal);
        }
        self.native_globals.insert(global.0, bytes.to_vec());
        Ok(())
    }

    //=== queries ===//

    /// The flat index of the entry function.
    #[must_use]
    pub(crate) fn entry(&self) -> u16 {
        self.entry
    }

    /// The entry function's signature.
    #[must_use]
    pub fn entry_signature(&self) -> Signature {
        self.functions[usize::from(self.entry)].function.sig
    }

    /// The modules of this program, base first.
    #[must_use]
    pub fn modules(&self) -> &[&'m Module] {
        &self.modules
    }

    pub(crate) fn function(&self, flat: u16) -> Option<&'m Function> {
        self.functions.get(usize::from(flat)).map(|pf| pf.function)
    }

    pub(crate) fn function_module(&self, flat: u16) -> Option<u16> {
        self.functions.get(usize::from(flat)).map(|pf| pf.module)
    }

    pub(crate) fn function_count(&self) -> u16 {
        self.functions.len() as u16
    }

    /// The packed address of a program function.
    pub(crate) fn function_address(&self, flat: u16) -> Option<FunctionAddress> {
        let f = self.function(flat)?;
        Some(FunctionAddress {
            index: flat,
            input_count: f.sig.input_count,
            output_count: f.sig.output_count,
        })
    }

    /// Resolves how a call to `flat` executes, applying the native-over-link
    /// precedence.
    pub(crate) fn definition(&self, flat: u16) -> Definition<'m> {
        let Some(pf) = self.functions.get(usize::from(flat)) else {
            return Definition::Undefined;
        };
        if let Some(insts) = pf.function.insts() {
            return Definition::Insts {
                module: pf.module,
                function: flat,
                insts,
                max_vstack_size: pf.function.max_vstack_size,
                max_cstack_size: pf.function.max_cstack_size,
            };
        }
        if let Some(native) = pf.native {
            return Definition::Native(native);
        }
        if let Some(linked) = pf.linked {
            return self.definition(linked);
        }
        Definition::Undefined
    }

    /// The allocation-index base of a module's globals.
    pub(crate) fn global_base(&self, module: u16) -> u32 {
        self.global_bases.get(usize::from(module)).copied().unwrap_or(0)
    }

    /// Materializes every module's globals into allocation records, in module
    /// order.
    pub(crate) fn materialize_globals(&self) -> Vec<Allocation> {
        let mut allocations = Vec::new();
        for (module_index, module) in self.modules.iter().enumerate() {
            for global in module.globals() {
                let native = (module_index == 0)
                    .then(|| self.native_globals.get(&global.allocation_index))
                    .flatten();
                let bytes: Vec<u8> = match (native, global.data) {
                    (Some(bytes), _) => bytes.clone(),
                    (None, Some(range)) => module.data(range).to_vec(),
                    (None, None) => alloc::vec![0; global.size.min(u32::MAX as u64) as usize],
                };
                let mutable = global.perms == GlobalPermissions::ReadWrite;
                allocations.push(Allocation::global(bytes.into_boxed_slice(), mutable));
            }
        }
        allocations
    }
}

fn prev_globals(program: &Program<'_>) -> u32 {
    match program.modules.last() {
        Some(module) => module.globals().len() as u32,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildOptions, Builder};
    use crate::module::Signature;

    fn define_constant_fn(module: &mut Module, f: FunctionId, value: u64) {
        let mut b = Builder::new(module, f, BuildOptions::default()).unwrap();
        let sig = Signature::new(0, 1);
        let entry = b.declare_block(sig);
        b.build_block(entry);
        b.inst_uint(value);
        b.inst_return();
        b.finish().unwrap();
    }

    #[test]
    fn undefined_functions_resolve_against_linked_exports() {
        let mut base = Module::new("base");
        let decl = base.add_function("answer", Signature::new(0, 1));

        let mut library = Module::new("library");
        let def = library.add_function("answer", Signature::new(0, 1));
        define_constant_fn(&mut library, def, 42);
        library.export_function(def);

        let mut program = Program::new(&base, decl).unwrap();
        assert!(matches!(program.definition(0), Definition::Undefined));
        program.link_module(&library).unwrap();
        assert!(matches!(program.definition(0), Definition::Insts { .. }));
    }

    #[test]
    fn unexported_functions_do_not_link() {
        let mut base = Module::new("base");
        let decl = base.add_function("answer", Signature::new(0, 1));

        let mut library = Module::new("library");
        let def = library.add_function("answer", Signature::new(0, 1));
        define_constant_fn(&mut library, def, 42);

        let mut program = Program::new(&base, decl).unwrap();
        program.link_module(&library).unwrap();
        assert!(matches!(program.definition(0), Definition::Undefined));
    }

    #[test]
    fn native_definitions_win_over_links() {
        fn native(ctx: &mut BuiltinContext<'_, '_, '_>) -> BuiltinResult {
            ctx.stack.push(crate::value::Value::from_uint(7));
            Ok(())
        }

        let mut base = Module::new("base");
        let decl = base.add_function("answer", Signature::new(0, 1));

        let mut library = Module::new("library");
        let def = library.add_function("answer", Signature::new(0, 1));
        define_constant_fn(&mut library, def, 42);
        library.export_function(def);

        let mut program = Program::new(&base, decl).unwrap();
        program.link_module(&library).unwrap();
        program.define_native_function(decl, native).unwrap();
        assert!(matches!(program.definition(0), Definition::Native(_)));
    }

    #[test]
    fn linked_module_globals_are_biased_past_base_globals() {
        let mut base = Module::new("base");
        base.add_global_zero_data("a", 8, 3);
        base.add_global_zero_data("b", 8, 3);
        let f = base.add_function("f", Signature::new(0, 0));

        let mut other = Module::new("other");
        other.add_global_zero_data("c", 8, 3);

        let mut program = Program::new(&base, f).unwrap();
        program.link_module(&other).unwrap();
        assert_eq!(program.global_base(0), 0);
        assert_eq!(program.global_base(1), 2);
        assert_eq!(program.materialize_globals().len(), 3);
    }
}
