// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use stepstack::cell::Cell;
use stepstack::format::Writer;
use stepstack::host::{BuiltinFn, Clock, HostCtx, NO_BUILTINS};
use stepstack::image::{Image, VM_VERSION};
use stepstack::opcode::enc;
use stepstack::vm::{Fault, Vm};

struct FixedClock;

impl Clock for FixedClock {
    fn now_ms(&mut self) -> u32 {
        0
    }
}

struct Func {
    address: u16,
    args: u8,
    vars: u8,
    rets: u8,
    built_in: bool,
}

fn build_image(main_vars: u8, funcs: &[Func], code: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(VM_VERSION);
    w.write_u16_le(0);
    w.write_u8(funcs.len() as u8);
    w.write_u8(0);
    w.write_u8(main_vars);
    for f in funcs {
        w.write_u16_le(f.address);
        w.write_u8(f.args);
        w.write_u8(f.vars);
        w.write_u8((f.rets & 0x3F) | (u8::from(f.built_in) << 7));
    }
    w.write_bytes(code);
    let mut bytes = w.into_vec();
    let size = (bytes.len() - 3) as u16;
    bytes[1..3].copy_from_slice(&size.to_le_bytes());
    bytes
}

fn run_to_end<C: Clock>(vm: &mut Vm<'_, C>) {
    loop {
        match vm.step() {
            Ok(()) => {}
            Err(Fault::MainReturn) => break,
            Err(fault) => panic!("unexpected fault: {fault}"),
        }
    }
}

fn build_add_chain(len: u16) -> Vec<u8> {
    let mut code = vec![1u8];
    for _ in 1..len {
        code.push(1);
        code.push(enc::ADD);
    }
    code.push(enc::RET);
    build_image(0, &[], &code)
}

fn bench_add_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_chain");
    for &len in &[10_u16, 50, 200] {
        let bytes = build_add_chain(len);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, FixedClock);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                vm.reset();
                run_to_end(&mut vm);
                black_box(vm.stack());
            });
        });
    }
    group.finish();
}

fn bench_branch_loop(c: &mut Criterion) {
    // Counts a main local down to zero, one backward branch per lap.
    let code = [
        100,
        enc::STV,
        enc::LDV,
        enc::DEC,
        enc::STV,
        enc::LDV,
        6,
        enc::NEG,
        enc::BNZ,
        enc::RET,
    ];
    let bytes = build_image(1, &[], &code);
    let image = Image::parse(&bytes).unwrap();
    let mut vm = Vm::new(image, NO_BUILTINS, FixedClock);
    c.bench_function("branch_loop", |b| {
        b.iter(|| {
            vm.reset();
            run_to_end(&mut vm);
            black_box(vm.stack());
        });
    });
}

fn bench_call_ret(c: &mut Criterion) {
    const CALLS: usize = 20;
    let mut code = vec![enc::CAL; CALLS];
    code.push(enc::RET);
    let body_at = code.len() as u16;
    code.push(enc::RET);
    let bytes = build_image(0, &[Func { address: body_at, args: 0, vars: 0, rets: 0, built_in: false }], &code);
    let image = Image::parse(&bytes).unwrap();
    let mut vm = Vm::new(image, NO_BUILTINS, FixedClock);
    c.bench_function("call_ret", |b| {
        b.iter(|| {
            vm.reset();
            run_to_end(&mut vm);
        });
    });
}

fn nop_builtin(_ctx: &mut HostCtx<'_>, _window: &mut [Cell], _args: u8) {}

fn bench_builtin_call(c: &mut Criterion) {
    const CALLS: usize = 20;
    let mut code = vec![enc::CAL; CALLS];
    code.push(enc::RET);
    let bytes = build_image(0, &[Func { address: 0, args: 0, vars: 0, rets: 0, built_in: true }], &code);
    let image = Image::parse(&bytes).unwrap();
    let table: &[BuiltinFn] = &[nop_builtin];
    let mut vm = Vm::new(image, table, FixedClock);
    c.bench_function("builtin_call", |b| {
        b.iter(|| {
            vm.reset();
            run_to_end(&mut vm);
        });
    });
}

fn bench_vm(c: &mut Criterion) {
    bench_add_chain(c);
    bench_branch_loop(c);
    bench_call_ret(c);
    bench_builtin_call(c);
}

criterion_group!(benches, bench_vm);
criterion_main!(benches);
