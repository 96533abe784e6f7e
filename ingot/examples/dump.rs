// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Module dumper example.
//!
//! Run with:
//! `cargo run -p ingot --example dump`

use ingot::builder::{BuildOptions, Builder};
use ingot::dump::dump_module;
use ingot::layout::Layout;
use ingot::libs;
use ingot::module::{Module, Signature};

fn main() {
    let mut module = Module::new("dump_demo");
    module.set_debug_path("examples/dump.rs");
    let sentinel = module.add_string_literal("sentinel value");
    let main_fn = module.add_function("main", Signature::new(1, 1));

    let options = BuildOptions {
        fold_constants: false,
    };
    let mut b = Builder::new(&mut module, main_fn, options).unwrap();
    let local = b.build_local(Layout::VALUE);

    // if x == 100 { panic } else { x * 2 }
    let entry = b.declare_block(Signature::new(1, 0));
    let ok = b.declare_block(Signature::new(0, 1));
    let reserved = b.declare_block(Signature::new(0, 0));
    b.build_block(entry);
    b.inst_local_addr(local);
    b.inst_store_value();
    b.inst_local_addr(local);
    b.inst_load_value();
    b.inst_uint(100);
    b.inst_call_builtin(&libs::int::SSUB);
    b.inst_branch2(ok, reserved);
    b.build_block(ok);
    b.inst_local_addr(local);
    b.inst_load_value();
    b.inst_uint(2);
    b.inst_call_builtin(&libs::int::UMUL);
    b.inst_return();
    b.build_block(reserved);
    b.inst_global_addr(sentinel);
    b.inst_panic();
    b.finish().unwrap();

    let mut out = String::new();
    dump_module(
        &mut out,
        &module,
        &[&libs::int::LIB, &libs::bits::LIB, &libs::test::LIB],
    )
    .unwrap();
    println!("{out}");
}
