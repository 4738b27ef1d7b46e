// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Disassembler for executable images.
//!
//! This module provides:
//! - A structured view ([`Disassembly`], [`InstrView`]) for tooling/tests.
//! - A stable, human-readable listing via [`core::fmt::Display`]: the
//!   function table, the constant pool, then one instruction per line.
//!
//! Decoding is total (every byte classifies), so disassembly cannot fail;
//! reserved skip codes render under their reserved mnemonics.

use core::fmt;

use crate::image::Image;
use crate::opcode::{Instr, Param};

/// Disassembles `image` into a structured view.
#[must_use]
pub fn disassemble<'a>(image: Image<'a>) -> Disassembly<'a> {
    Disassembly { image }
}

/// A disassembled image.
#[derive(Clone, Copy, Debug)]
pub struct Disassembly<'a> {
    image: Image<'a>,
}

/// One decoded instruction with its location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstrView {
    /// Byte offset in the code section.
    pub pc: u16,
    /// The raw opcode byte.
    pub byte: u8,
    /// The decoded instruction.
    pub instr: Instr,
}

impl<'a> Disassembly<'a> {
    /// Returns the underlying image.
    #[must_use]
    pub fn image(&self) -> Image<'a> {
        self.image
    }

    /// Iterates the code section as decoded [`InstrView`]s.
    pub fn instrs(&self) -> impl Iterator<Item = InstrView> + use<'a> {
        self.image
            .code()
            .iter()
            .enumerate()
            .map(|(pc, &byte)| InstrView {
                pc: pc as u16,
                byte,
                instr: Instr::decode(byte),
            })
    }
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let image = self.image;
        writeln!(f, "functions: {}", image.functions_count())?;
        for index in 0..image.functions_count() {
            if let Some(d) = image.function(index) {
                write!(
                    f,
                    "  f{index}: addr={} args={} vars={} rets={}",
                    d.address, d.arguments_count, d.variables_count, d.returns_count
                )?;
                if d.is_variadic {
                    write!(f, " variadic")?;
                }
                if d.is_built_in {
                    write!(f, " builtin")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "constants: {}", image.constants_count())?;
        for index in 0..image.constants_count() {
            if let Some(c) = image.constant(index) {
                writeln!(f, "  c{index}: {c}")?;
            }
        }
        writeln!(f, "code: {} bytes", image.code().len())?;
        for view in self.instrs() {
            write!(f, "{:>5}  {:02X}  {}", view.pc, view.byte, view.instr.mnemonic())?;
            match view.instr {
                Instr::Psh { imm } => write!(f, " {imm}")?,
                Instr::Psc { low5 } => write!(f, " 0x{low5:02X}")?,
                Instr::Pop { count } => write!(f, " {count}")?,
                Instr::Jmp { param }
                | Instr::Cal { param }
                | Instr::Ldv { param }
                | Instr::Stv { param } => match param {
                    Param::Imm(v) => write!(f, " {v}")?,
                    Param::Stack => write!(f, " [sp]")?,
                },
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
