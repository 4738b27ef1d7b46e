// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Disassembler example.
//!
//! Builds a small image by hand, prints its listing, then steps it with a
//! stdout trace. Run with:
//! `cargo run -p stepstack --example disasm`

use stepstack::disasm::disassemble;
use stepstack::format::Writer;
use stepstack::host::{Clock, NO_BUILTINS};
use stepstack::image::{Image, VM_VERSION};
use stepstack::opcode::enc;
use stepstack::trace::{StepRecord, TraceSink};
use stepstack::vm::{Fault, Vm};

struct FixedClock;

impl Clock for FixedClock {
    fn now_ms(&mut self) -> u32 {
        0
    }
}

struct Stdout;

impl TraceSink for Stdout {
    fn step(&mut self, record: &StepRecord<'_>) {
        println!("{record}");
    }
}

fn main() {
    // main has one local: x = 3 + 4; x = x - 1; then return.
    let mut w = Writer::new();
    w.write_u8(VM_VERSION);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_u8(0);
    w.write_u8(1);
    w.write_bytes(&[
        3,
        4,
        enc::ADD,
        enc::STV,
        enc::LDV,
        enc::DEC,
        enc::STV,
        enc::RET,
    ]);
    let mut bytes = w.into_vec();
    let size = (bytes.len() - 3) as u16;
    bytes[1..3].copy_from_slice(&size.to_le_bytes());

    let image = Image::parse(&bytes).expect("valid image");
    print!("{}", disassemble(image));

    let mut vm = Vm::new(image, NO_BUILTINS, FixedClock);
    let mut trace = Stdout;
    loop {
        match vm.step_traced(Some(&mut trace)) {
            Ok(()) => {}
            Err(Fault::MainReturn) => break,
            Err(fault) => {
                eprintln!("fault: {fault} at pc {}", vm.pc().wrapping_sub(1));
                break;
            }
        }
    }
    println!("final stack: {:?}", vm.stack());
}
