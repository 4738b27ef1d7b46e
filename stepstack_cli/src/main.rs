// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![doc = "Image runner for `stepstack` executables.\n\n\
          This is a std-only harness crate. It binds an image file to a VM \
          with the reference builtin table and steps until a terminal code.\n"]

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use std::{env, fs};

use anyhow::{Context, Result, bail};

use stepstack::cell::{Cell, narrow, widen};
use stepstack::disasm::disassemble;
use stepstack::host::{BuiltinFn, Clock, HostCtx};
use stepstack::image::{Image, VM_VERSION};
use stepstack::trace::{StepRecord, TraceSink};
use stepstack::vm::{Fault, Vm};

/// Monotonic milliseconds since process start.
struct StdClock {
    start: Instant,
}

impl Clock for StdClock {
    fn now_ms(&mut self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

fn builtin_print(_ctx: &mut HostCtx<'_>, window: &mut [Cell], args: u8) {
    for cell in window.iter().take(usize::from(args)) {
        print!(" {}", widen(*cell));
    }
}

fn builtin_output(_ctx: &mut HostCtx<'_>, window: &mut [Cell], _args: u8) {
    if let Some(&value) = window.first() {
        print!("OUTPUT= {}", widen(value));
    }
}

fn builtin_get_tick(ctx: &mut HostCtx<'_>, window: &mut [Cell], _args: u8) {
    if let Some(slot) = window.first_mut() {
        *slot = narrow(ctx.clock.now_ms() as i32);
    }
}

fn builtin_get_time(ctx: &mut HostCtx<'_>, window: &mut [Cell], _args: u8) {
    if let Some(slot) = window.first_mut() {
        *slot = narrow((ctx.clock.now_ms() / 1000) as i32);
    }
}

/// The reference builtin table. Indices are part of the ABI of compiled
/// images; never reorder.
const BUILTINS: &[BuiltinFn] = &[
    builtin_print,    // 0
    builtin_output,   // 1
    builtin_get_tick, // 2
    builtin_get_time, // 3
];

struct StdoutTrace;

impl TraceSink for StdoutTrace {
    fn step(&mut self, record: &StepRecord<'_>) {
        println!("{record}");
    }
}

struct Options {
    path: PathBuf,
    trace: bool,
    disasm: bool,
    pace_us: u64,
}

fn parse_args() -> Result<Options> {
    let mut path = None;
    let mut trace = false;
    let mut disasm = false;
    let mut pace_us = 0;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--trace" => trace = true,
            "--disasm" => disasm = true,
            "--pace-us" => {
                let value = args.next().context("--pace-us needs a value")?;
                pace_us = value
                    .parse()
                    .with_context(|| format!("invalid --pace-us value '{value}'"))?;
            }
            other if path.is_none() && !other.starts_with('-') => {
                path = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument '{other}'"),
        }
    }

    let Some(path) = path else {
        bail!("usage: stepstack [--trace] [--disasm] [--pace-us N] <image>");
    };
    Ok(Options {
        path,
        trace,
        disasm,
        pace_us,
    })
}

fn main() -> Result<()> {
    let opts = parse_args()?;

    let bytes =
        fs::read(&opts.path).with_context(|| format!("read {}", opts.path.display()))?;
    let image = Image::parse(&bytes)
        .with_context(|| format!("invalid image {}", opts.path.display()))?;

    if opts.disasm {
        print!("{}", disassemble(image));
        return Ok(());
    }

    println!(
        "VM_VERSION: {VM_VERSION}\nFUNCTIONS: {}\nCONSTANTS: {}",
        image.functions_count(),
        image.constants_count()
    );

    let mut vm = Vm::new(
        image,
        BUILTINS,
        StdClock {
            start: Instant::now(),
        },
    );
    let mut trace = opts.trace.then_some(StdoutTrace);

    let fault = loop {
        let sink = trace.as_mut().map(|t| t as &mut dyn TraceSink);
        match vm.step_traced(sink) {
            Ok(()) => {
                if opts.pace_us != 0 {
                    thread::sleep(Duration::from_micros(opts.pace_us));
                }
            }
            Err(fault) => break fault,
        }
    };

    if fault == Fault::MainReturn {
        println!("\nEND");
        Ok(())
    } else {
        let at = vm.pc().wrapping_sub(1);
        vm.reset();
        bail!("{fault} (code {}) at pc {at}", fault.code());
    }
}
