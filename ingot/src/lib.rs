// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `ingot`: a register-less, stack-based bytecode VM for a low-level
//! intermediate assembly language.
//!
//! Programs consist of modules of functions built from typed basic blocks plus
//! global memory objects. The VM executes the packed 32-bit instruction stream
//! against a value stack and a call-stack byte arena while a generationally
//! versioned allocation table validates every address dereference.
//!
//! ## Example
//!
//! ```no_run
//! use ingot::builder::{BuildOptions, Builder};
//! use ingot::libs;
//! use ingot::module::{Module, Signature};
//! use ingot::program::Program;
//! use ingot::vm::Vm;
//!
//! let mut module = Module::new("demo");
//! let main = module.add_function("main", Signature::new(0, 1));
//!
//! let mut b = Builder::new(&mut module, main, BuildOptions::default())?;
//! let entry = b.declare_block(Signature::new(0, 1));
//! b.build_block(entry);
//! b.inst_uint(2);
//! b.inst_uint(3);
//! b.inst_call_builtin(&libs::int::SADD);
//! b.inst_return();
//! b.finish()?;
//!
//! let program = Program::new(&module, main).unwrap();
//! let mut vm = Vm::default();
//! let output = vm.execute(&program, &[]).unwrap();
//! assert_eq!(output[0].as_uint(), 5);
//! # Ok::<(), ingot::builder::BuildError>(())
//! ```

#![no_std]

extern crate alloc;

pub mod arena;
pub mod builder;
pub mod builtin;
pub mod dump;
pub mod inst;
pub mod layout;
pub mod libs;
pub mod memory;
pub mod module;
pub mod opcode;
pub mod process;
pub mod program;
pub mod value;
pub mod vm;
