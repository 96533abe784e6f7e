// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Textual module dumper.
//!
//! A read-only walker that prints a module's globals and, for each defined
//! function, an index-prefixed listing of its instructions. Call targets and
//! function addresses are resolved to names; builtin calls are resolved to
//! qualified names through the supplied libraries. Purely informational, no
//! mutation.

use core::fmt;

use crate::builtin::BuiltinLibrary;
use crate::inst::Inst;
use crate::module::{Function, GlobalPermissions, Module};
use crate::opcode::Opcode;

/// Writes a textual listing of `module` to `out`.
///
/// `libraries` is consulted to qualify builtin names; unknown builtins fall
/// back to their unqualified name.
pub fn dump_module(
    out: &mut dyn fmt::Write,
    module: &Module,
    libraries: &[&BuiltinLibrary],
) -> fmt::Result {
    writeln!(out, "module @'{}';", module.name())?;
    if let Some(path) = module.debug_path() {
        writeln!(out, "// path: {path}")?;
    }

    for global in module.globals() {
        let perms = match global.perms {
            GlobalPermissions::ReadOnly => "const",
            GlobalPermissions::ReadWrite => "mut",
        };
        write!(
            out,
            "\nglobal {perms} @{} : [{} x u8]",
            global.name, global.size
        )?;
        match global.data {
            Some(range) => {
                write!(out, " = \"")?;
                write_escaped(out, module.data(range))?;
                writeln!(out, "\";")?;
            }
            None => writeln!(out, " = zero;")?,
        }
    }

    for function in module.functions() {
        writeln!(out)?;
        dump_function(out, module, function, libraries)?;
    }
    Ok(())
}

fn dump_function(
    out: &mut dyn fmt::Write,
    module: &Module,
    function: &Function,
    libraries: &[&BuiltinLibrary],
) -> fmt::Result {
    write!(
        out,
        "function @{}({} => {})",
        function.name, function.sig.input_count, function.sig.output_count
    )?;
    let Some(insts) = function.insts() else {
        return writeln!(out, ";");
    };
    writeln!(out, " {{")?;

    let mut ip = 0usize;
    while ip < insts.len() {
        let inst = insts[ip];
        write!(out, "  <{ip:03}>: ")?;
        let width = dump_inst(out, module, function, insts, ip, inst, libraries)?;
        writeln!(out, ";")?;
        ip += width;
    }
    writeln!(out, "}}")
}

/// Prints one instruction and returns how many words it occupied.
fn dump_inst(
    out: &mut dyn fmt::Write,
    module: &Module,
    function: &Function,
    insts: &[Inst],
    ip: usize,
    inst: Inst,
    libraries: &[&BuiltinLibrary],
) -> Result<usize, fmt::Error> {
    let Some(op) = inst.op() else {
        write!(out, "<invalid {:#010x}>", u32::from_le_bytes(inst.encode()))?;
        return Ok(1);
    };
    write!(out, "{}", op.mnemonic())?;

    match op {
        Opcode::Nop
        | Opcode::Return
        | Opcode::Panic
        | Opcode::Exit
        | Opcode::PopTop
        | Opcode::Dup
        | Opcode::Swap
        | Opcode::LoadValue
        | Opcode::StoreValue => {}

        Opcode::ReturnFree | Opcode::LocalFree => {
            write!(out, " {}", inst.payload_value())?;
        }

        Opcode::Jump | Opcode::BranchFalse | Opcode::BranchEq | Opcode::BranchGt => {
            let target = ip as i64 + i64::from(inst.payload_offset());
            write!(out, " <{target:03}>")?;
        }

        Opcode::Call | Opcode::FunctionAddr => {
            let target = i64::from(function.index) + i64::from(inst.payload_offset());
            match u16::try_from(target)
                .ok()
                .and_then(|t| module.functions().get(usize::from(t)))
            {
                Some(callee) => write!(out, " @{}", callee.name)?,
                None => write!(out, " <extern {target}>")?,
            }
        }
        Opcode::CallIndirect => {
            let (input, output, _) = inst.payload_signature();
            write!(out, " ({input} => {output})")?;
        }
        Opcode::CallBuiltin | Opcode::CallBuiltinNoProcess => {
            let index = inst.payload_value() as usize;
            match module.builtins.get(index) {
                Some(builtin) => {
                    match libraries
                        .iter()
                        .find(|lib| lib.functions.iter().any(|b| b.same_impl(builtin)))
                    {
                        Some(lib) => write!(out, " ${}.{}", lib.prefix, builtin.name)?,
                        None => write!(out, " ${}", builtin.name)?,
                    }
                }
                None => write!(out, " <invalid builtin {index}>")?,
            }
            // The signature trailer is part of the call.
            if insts
                .get(ip + 1)
                .and_then(|i| i.op())
                .is_some_and(|op| op == Opcode::CallBuiltinSig)
            {
                return Ok(2);
            }
        }
        Opcode::CallBuiltinSig => {
            let (input, output, flags) = inst.payload_signature();
            write!(out, " ({input} => {output}, flags {flags:#04x})")?;
        }

        Opcode::Push | Opcode::Pushn | Opcode::Push2 | Opcode::Push3 => {
            write!(out, " {:#x}", inst.payload_value())?;
        }

        Opcode::GlobalAddr | Opcode::LoadGlobalValue | Opcode::StoreGlobalValue => {
            let index = inst.payload_value();
            match module.globals().get(index as usize) {
                Some(global) => write!(out, " @{}", global.name)?,
                None => write!(out, " <invalid global {index}>")?,
            }
        }
        Opcode::LocalAddr | Opcode::LoadLocalValue | Opcode::StoreLocalValue => {
            let (slot, offset) = inst.payload_local_addr();
            write!(out, " {slot}.{offset}")?;
        }

        Opcode::Pop | Opcode::Pick | Opcode::Roll => {
            write!(out, " {}", inst.payload_stack_idx())?;
        }

        Opcode::LocalAlloc | Opcode::LocalAllocAligned | Opcode::DerefConst | Opcode::DerefMut => {
            let layout = inst.payload_layout();
            write!(out, " ({}, align {})", layout.size, layout.align())?;
        }

        Opcode::ArrayElement | Opcode::AggregateMember => {
            write!(out, " {}", inst.payload_value())?;
        }
    }
    Ok(1)
}

fn write_escaped(out: &mut dyn fmt::Write, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        match b {
            b'"' => write!(out, "\\\"")?,
            b'\\' => write!(out, "\\\\")?,
            0x20..=0x7e => write!(out, "{}", b as char)?,
            _ => write!(out, "\\{b:02X}")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::builder::{BuildOptions, Builder};
    use crate::libs;
    use crate::module::Signature;

    #[test]
    fn dump_resolves_names() {
        let mut module = Module::new("demo");
        let msg = module.add_string_literal("boom");
        let f = module.add_function("main", Signature::new(0, 1));

        let options = BuildOptions {
            fold_constants: false,
        };
        let mut b = Builder::new(&mut module, f, options).unwrap();
        let entry = b.declare_block(Signature::new(0, 1));
        b.build_block(entry);
        b.inst_global_addr(msg);
        b.inst_pop(0);
        b.inst_uint(2);
        b.inst_uint(3);
        b.inst_call_builtin(&libs::int::UADD);
        b.inst_return();
        b.finish().unwrap();

        let mut out = String::new();
        dump_module(&mut out, &module, &[&libs::int::LIB]).unwrap();

        assert!(out.contains("module @'demo';"));
        assert!(out.contains("global const @string_0"));
        assert!(out.contains("boom\\00"));
        assert!(out.contains("function @main(0 => 1)"));
        assert!(out.contains("global_addr @string_0"));
        assert!(out.contains("$ingot.int.uadd"));
        assert!(out.contains("return"));
    }

    #[test]
    fn declared_functions_dump_as_prototypes() {
        let mut module = Module::new("demo");
        module.add_function("extern_fn", Signature::new(2, 1));
        let mut out = String::new();
        dump_module(&mut out, &module, &[]).unwrap();
        assert!(out.contains("function @extern_fn(2 => 1);"));
    }
}
