// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use ingot::builder::{BuildOptions, Builder};
use ingot::libs;
use ingot::module::{Module, Signature};
use ingot::program::Program;
use ingot::value::Value;
use ingot::vm::{Vm, VmOptions};

fn bench_vm(c: &mut Criterion) {
    bench_add_chain(c);
    bench_branch_hot_loop(c);
    bench_call_overhead(c);
    bench_builtin_dispatch(c);
}

/// A chain of dependent additions; folding is disabled so every link runs
/// through dispatch.
fn build_add_chain(chain_len: u32) -> Module {
    let mut module = Module::new("add_chain");
    let main = module.add_function("main", Signature::new(1, 1));
    let options = BuildOptions {
        fold_constants: false,
    };
    let mut b = Builder::new(&mut module, main, options).unwrap();
    let entry = b.declare_block(Signature::new(1, 1));
    b.build_block(entry);
    for i in 0..chain_len {
        b.inst_uint(u64::from(i));
        b.inst_call_builtin(&libs::int::UADD);
    }
    b.inst_return();
    b.finish().unwrap();
    module
}

fn bench_add_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_chain");
    for &chain_len in &[10u32, 50, 200, 1000] {
        let module = build_add_chain(chain_len);
        let main = ingot::module::FunctionId(0);
        let program = Program::new(&module, main).unwrap();
        let mut vm = Vm::default();
        group.bench_with_input(BenchmarkId::from_parameter(chain_len), &program, |b, p| {
            b.iter(|| {
                let out = vm.execute(p, &[Value::from_uint(0)]).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

/// Counts down to zero through a two-block loop.
fn build_countdown() -> Module {
    let mut module = Module::new("countdown");
    let main = module.add_function("main", Signature::new(1, 1));
    let mut b = Builder::new(&mut module, main, BuildOptions::default()).unwrap();
    let entry = b.declare_block(Signature::new(1, 1));
    let body = b.declare_block(Signature::new(1, 1));
    let done = b.declare_block(Signature::new(1, 1));
    b.build_block(entry);
    b.inst_jump(body);
    b.build_block(body);
    b.inst_uint(1);
    b.inst_call_builtin(&libs::int::USUB);
    b.inst_pick(0);
    b.inst_branch2(body, done);
    b.build_block(done);
    b.inst_return();
    b.finish().unwrap();
    module
}

fn bench_branch_hot_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_hot_loop");
    for &iterations in &[100u64, 10_000] {
        let module = build_countdown();
        let main = ingot::module::FunctionId(0);
        let program = Program::new(&module, main).unwrap();
        let mut vm = Vm::default();
        group.bench_with_input(
            BenchmarkId::from_parameter(iterations),
            &program,
            |b, p| {
                b.iter(|| {
                    let out = vm.execute(p, &[Value::from_uint(iterations)]).unwrap();
                    black_box(out);
                });
            },
        );
    }
    group.finish();
}

/// Deep non-branching recursion to measure frame setup/teardown.
fn build_recurse() -> Module {
    let mut module = Module::new("recurse");
    let f = module.add_function("recurse", Signature::new(1, 1));
    let mut b = Builder::new(&mut module, f, BuildOptions::default()).unwrap();
    let entry = b.declare_block(Signature::new(1, 1));
    let base = b.declare_block(Signature::new(1, 1));
    let rec = b.declare_block(Signature::new(1, 1));
    b.build_block(entry);
    b.inst_pick(0);
    b.inst_branch2(rec, base);
    b.build_block(base);
    b.inst_return();
    b.build_block(rec);
    b.inst_uint(1);
    b.inst_call_builtin(&libs::int::USUB);
    b.inst_call(f);
    b.inst_return();
    b.finish().unwrap();
    module
}

fn bench_call_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_overhead");
    for &depth in &[10u64, 100] {
        let module = build_recurse();
        let f = ingot::module::FunctionId(0);
        let program = Program::new(&module, f).unwrap();
        let options = VmOptions {
            cstack_bytes: 4 * 1024 * 1024,
            ..VmOptions::default()
        };
        let mut vm = Vm::new(ingot::vm::SystemAllocator, options);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &program, |b, p| {
            b.iter(|| {
                let out = vm.execute(p, &[Value::from_uint(depth)]).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

fn bench_builtin_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("builtin_dispatch");
    let module = build_add_chain(100);
    let main = ingot::module::FunctionId(0);
    let program = Program::new(&module, main).unwrap();
    let mut vm = Vm::default();
    group.bench_function("uadd_x100", |b| {
        b.iter(|| {
            let out = vm.execute(&program, &[Value::from_uint(1)]).unwrap();
            black_box(out);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_vm);
criterion_main!(benches);
