// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-step trace records.
//!
//! Tracing is optional and `no_std` friendly. [`crate::vm::Vm::step_traced`]
//! hands one [`StepRecord`] to the sink for every instruction that executes
//! to completion; steps swallowed by the sleep gate and faulting steps emit
//! nothing. Rendering is kept separate from collection: the record carries
//! structured data, and its [`core::fmt::Display`] impl produces the
//! one-line `PC:<pc> <mnemonic> [operands] {stack-top-down}` form.

use core::fmt;

use crate::cell::{Cell, widen};
use crate::opcode::Instr;

/// Execution-time operand detail for one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detail {
    /// No operands beyond the mnemonic.
    None,
    /// A single working-width value (literal pushed, result, sleep ms).
    Value(i32),
    /// A slot access: absolute stack slot for LDV/STV, pool index for LDC.
    Slot {
        /// Slot or pool index.
        index: u8,
        /// The value loaded or stored.
        value: i32,
    },
    /// A taken jump or branch.
    Taken {
        /// The program counter after the jump.
        target: u16,
    },
    /// A conditional branch that fell through.
    NotTaken,
    /// A call.
    Call {
        /// Code offset, or builtin index for built-in calls.
        address: u16,
        /// Whether the callee was a host builtin.
        built_in: bool,
        /// Effective argument count (variadic extras included).
        args: u8,
    },
    /// A return to the caller.
    Ret {
        /// The restored program counter.
        target: u16,
        /// Return cells moved down to the frame base.
        returns: u8,
    },
    /// A multi-pop.
    Pop {
        /// Cells removed.
        count: u8,
    },
}

/// One executed instruction, as seen by a [`TraceSink`].
#[derive(Debug)]
pub struct StepRecord<'a> {
    /// Program counter of the fetched opcode.
    pub pc: u16,
    /// The decoded instruction.
    pub instr: Instr,
    /// Execution-time operand detail.
    pub detail: Detail,
    /// The live data stack after the step, bottom-up.
    pub stack: &'a [Cell],
}

/// A sink receiving one record per executed instruction.
pub trait TraceSink {
    /// Receives a step record.
    fn step(&mut self, record: &StepRecord<'_>);
}

impl fmt::Display for StepRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PC:{} {}", self.pc, self.instr.mnemonic())?;
        match self.detail {
            Detail::None => {}
            Detail::Value(v) => write!(f, " {v}")?,
            Detail::Slot { index, value } => write!(f, " [{index}] {value}")?,
            Detail::Taken { target } => write!(f, " <{target}>")?,
            Detail::NotTaken => write!(f, " x")?,
            Detail::Call {
                address,
                built_in,
                args,
            } => {
                let star = if built_in { "*" } else { "" };
                write!(f, " <{star}{address}> ({args})")?;
            }
            Detail::Ret { target, returns } => write!(f, " <{target}> (+{returns})")?,
            Detail::Pop { count } => write!(f, " ({count})")?,
        }
        f.write_str(" {")?;
        for (i, &cell) in self.stack.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", widen(cell))?;
        }
        f.write_str("}")
    }
}
