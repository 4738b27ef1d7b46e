// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The interpreter: stacks, frames, the timer gate, and the dispatcher.
//!
//! [`Vm::step`] executes at most one instruction and returns to the embedder.
//! A pending sleep swallows steps without touching any state; everything else
//! reports a [`Fault`] by value with no rollback of partial effects (a pop
//! that preceded the failing check stays popped).
//!
//! The VM owns two fixed stacks and borrows the image and the builtin table;
//! it performs no allocation and holds no globals, so instances are freely
//! creatable and may run on separate threads.

use core::fmt;

use crate::cell::{Cell, narrow, widen};
use crate::host::{BuiltinFn, Clock, HostCtx};
use crate::image::{FunctionDesc, Image};
use crate::opcode::{Instr, Param};
use crate::trace::{Detail, StepRecord, TraceSink};

/// Data stack capacity in cells.
pub const DATA_STACK_SIZE: usize = 30;

/// Call stack capacity in frames.
pub const CALL_STACK_SIZE: usize = 10;

/// A step failure, reported by value.
///
/// Ordinals are stable and part of the embedder ABI; `Ok(())` from
/// [`Vm::step`] is ordinal 0. [`Fault::MainReturn`] doubles as the
/// call-stack-underflow code and is success-equivalent: it signals that RET
/// executed with no live user frame, i.e. normal end of program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Fault {
    /// The main frame returned; normal termination.
    MainReturn = 1,
    /// No room for another call frame.
    CallStackOverflow = 2,
    /// Pop from an empty data stack.
    DataStackUnderflow = 3,
    /// Push onto a full data stack.
    DataStackOverflow = 4,
    /// Fewer cells on the stack than the callee's arguments.
    ArgOutOfStack = 5,
    /// No room for the callee's locals, or a local slot beyond the stack.
    VarOutOfStack = 6,
    /// No room for the callee's return values.
    ReturnOutOfStack = 7,
    /// A callee left unbalanced scratch data at RET.
    DataStackSmashed = 8,
    /// The program counter ran past the code section.
    PcOverrun = 9,
    /// A function index outside the image's function table.
    ExeNoFunction = 10,
    /// A builtin address outside the host table.
    BuiltinNoFunction = 11,
    /// A variable index outside the current frame's locals.
    NoVariable = 12,
    /// A constant index outside the constant pool.
    NoConstant = 13,
    /// A variadic argument count below zero or above the 8-bit limit.
    VariadicSize = 14,
}

impl Fault {
    /// The stable ordinal of this fault.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MainReturn => write!(f, "main function returned"),
            Self::CallStackOverflow => write!(f, "call stack overflow"),
            Self::DataStackUnderflow => write!(f, "data stack underflow"),
            Self::DataStackOverflow => write!(f, "data stack overflow"),
            Self::ArgOutOfStack => write!(f, "argument out of stack"),
            Self::VarOutOfStack => write!(f, "variable out of stack"),
            Self::ReturnOutOfStack => write!(f, "return out of stack"),
            Self::DataStackSmashed => write!(f, "data stack smashed"),
            Self::PcOverrun => write!(f, "program counter overrun"),
            Self::ExeNoFunction => write!(f, "no such function in image"),
            Self::BuiltinNoFunction => write!(f, "no such builtin in host table"),
            Self::NoVariable => write!(f, "no variable"),
            Self::NoConstant => write!(f, "no constant"),
            Self::VariadicSize => write!(f, "variadic size out of range"),
        }
    }
}

impl core::error::Error for Fault {}

/// A call-stack frame for an in-progress user-function invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Frame {
    return_address: u16,
    variables_start: u8,
    arguments_count: u8,
    function_index: u8,
}

/// A stepped stack-machine VM bound to one executable image.
pub struct Vm<'e, C: Clock> {
    timer: u32,
    timeout: u32,
    data_stack: [Cell; DATA_STACK_SIZE],
    data_top: u8,
    call_stack: [Frame; CALL_STACK_SIZE],
    call_top: u8,
    pc: u16,
    // persists across reset
    binding: u8,
    image: Image<'e>,
    builtins: &'e [BuiltinFn],
    clock: C,
}

impl<C: Clock> fmt::Debug for Vm<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("pc", &self.pc)
            .field("data_top", &self.data_top)
            .field("call_top", &self.call_top)
            .field("sleeping", &(self.timer != 0))
            .finish_non_exhaustive()
    }
}

impl<'e, C: Clock> Vm<'e, C> {
    /// Binds `image` and `builtins` to a freshly reset VM.
    #[must_use]
    pub fn new(image: Image<'e>, builtins: &'e [BuiltinFn], clock: C) -> Self {
        let mut vm = Self {
            timer: 0,
            timeout: 0,
            data_stack: [0; DATA_STACK_SIZE],
            data_top: 0,
            call_stack: [Frame::default(); CALL_STACK_SIZE],
            call_top: 0,
            pc: 0,
            binding: 0,
            image,
            builtins,
            clock,
        };
        vm.reset();
        vm
    }

    /// Zeroes all transient state and reserves the main frame's locals.
    ///
    /// The image binding, builtin table, clock, and the [`Vm::binding`] byte
    /// survive. The seed is taken from the image without clamping; an image
    /// whose main frame exceeds the stack reports a fault on first touch.
    pub fn reset(&mut self) {
        self.timer = 0;
        self.timeout = 0;
        self.data_stack = [0; DATA_STACK_SIZE];
        self.data_top = self.image.main_variables_count();
        self.call_stack = [Frame::default(); CALL_STACK_SIZE];
        self.call_top = 0;
        self.pc = 0;
    }

    /// The byte offset of the next instruction. After a fault, the failing
    /// instruction is at `pc() - 1` (the fetch has already advanced).
    #[must_use]
    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// The live data stack, bottom-up.
    #[must_use]
    pub fn stack(&self) -> &[Cell] {
        &self.data_stack[..usize::from(self.data_top).min(DATA_STACK_SIZE)]
    }

    /// Live user frames on the call stack.
    #[must_use]
    pub fn call_depth(&self) -> usize {
        usize::from(self.call_top)
    }

    /// Whether a sleep gate is pending.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.timer != 0
    }

    /// The user-defined binding byte (persists across [`Vm::reset`]).
    #[must_use]
    pub fn binding(&self) -> u8 {
        self.binding
    }

    /// Sets the user-defined binding byte.
    pub fn set_binding(&mut self, binding: u8) {
        self.binding = binding;
    }

    /// The bound image.
    #[must_use]
    pub fn image(&self) -> Image<'e> {
        self.image
    }

    /// Mutable access to the embedder clock.
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Executes at most one instruction.
    ///
    /// Returns `Ok(())` both after executing an instruction and while a
    /// pending sleep swallows the step. Call repeatedly until a [`Fault`];
    /// [`Fault::MainReturn`] is the normal-termination signal.
    pub fn step(&mut self) -> Result<(), Fault> {
        self.step_traced(None)
    }

    /// Like [`Vm::step`], handing one [`StepRecord`] to `trace` for every
    /// instruction that executes to completion.
    pub fn step_traced(&mut self, trace: Option<&mut dyn TraceSink>) -> Result<(), Fault> {
        if self.timer != 0 {
            let elapsed = self.clock.now_ms().wrapping_sub(self.timer);
            if elapsed < self.timeout {
                return Ok(());
            }
            self.timer = 0;
        }

        let at = self.pc;
        let Some(&op) = self.image.code().get(usize::from(self.pc)) else {
            return Err(Fault::PcOverrun);
        };
        self.pc = self.pc.wrapping_add(1);

        let instr = Instr::decode(op);
        let detail = self.exec(instr)?;

        if let Some(sink) = trace {
            sink.step(&StepRecord {
                pc: at,
                instr,
                detail,
                stack: self.stack(),
            });
        }
        Ok(())
    }

    fn exec(&mut self, instr: Instr) -> Result<Detail, Fault> {
        match instr {
            Instr::Psh { imm } => {
                self.push(i32::from(imm))?;
                Ok(Detail::Value(i32::from(imm)))
            }
            Instr::Psc { low5 } => {
                let seed = self.pop()?;
                let value = seed.wrapping_shl(5) | i32::from(low5);
                self.push(value)?;
                Ok(Detail::Value(value))
            }
            Instr::Alu(op) => {
                let value = self.pop()?;
                let second = self.pop()?;
                let result = op.apply(value, second);
                self.push(result)?;
                Ok(Detail::Value(result))
            }
            Instr::Branch(cond) => {
                let displacement = self.pop()?;
                let mut operand = self.pop()?;
                if cond.takes_third() {
                    let third = self.pop()?;
                    operand = operand.wrapping_sub(third);
                }
                if cond.taken(operand) {
                    self.relative_jump(displacement);
                    Ok(Detail::Taken { target: self.pc })
                } else {
                    Ok(Detail::NotTaken)
                }
            }
            Instr::Unary(op) => {
                let value = self.pop()?;
                let result = op.apply(value);
                self.push(result)?;
                Ok(Detail::Value(result))
            }
            Instr::Pop { count } => {
                for _ in 0..count {
                    self.pop()?;
                }
                Ok(Detail::Pop { count })
            }
            Instr::Slp => {
                let ms = self.pop()?;
                // The timer field doubles as the armed flag; a clock reading
                // of zero leaves the gate unarmed.
                self.timer = self.clock.now_ms();
                self.timeout = ms as u32;
                Ok(Detail::Value(ms))
            }
            Instr::Ret => self.ret(),
            Instr::Ldc => {
                let index = self.pop()?;
                if index < 0 || index >= i32::from(self.image.constants_count()) {
                    return Err(Fault::NoConstant);
                }
                let raw = self
                    .image
                    .constant(index as u8)
                    .ok_or(Fault::NoConstant)?;
                let value = widen(raw);
                self.push(value)?;
                Ok(Detail::Slot {
                    index: index as u8,
                    value,
                })
            }
            Instr::Jmb => {
                let displacement = self.pop()?;
                self.relative_jump(displacement.wrapping_neg());
                Ok(Detail::Taken { target: self.pc })
            }
            Instr::Skip(_) => Ok(Detail::None),
            Instr::Jmp { param } => {
                let displacement = self.resolve(param)?;
                self.relative_jump(displacement);
                Ok(Detail::Taken { target: self.pc })
            }
            Instr::Cal { param } => {
                let index = self.resolve(param)?;
                self.call(index)
            }
            Instr::Ldv { param } => {
                let index = self.resolve(param)?;
                let slot = self.local_slot(index)?;
                let value = widen(self.data_stack[slot]);
                self.push(value)?;
                Ok(Detail::Slot {
                    index: slot as u8,
                    value,
                })
            }
            Instr::Stv { param } => {
                let index = self.resolve(param)?;
                let slot = self.local_slot(index)?;
                let value = self.pop()?;
                self.data_stack[slot] = narrow(value);
                Ok(Detail::Slot {
                    index: slot as u8,
                    value,
                })
            }
        }
    }

    /// Resolves a `11sspppp` parameter, popping the saturated form.
    fn resolve(&mut self, param: Param) -> Result<i32, Fault> {
        match param {
            Param::Imm(v) => Ok(i32::from(v)),
            Param::Stack => {
                let v = self.pop()?;
                // Positive popped parameters regain the range lost to the
                // 0x0F sentinel; zero and negatives pass through.
                Ok(if v > 0 { v.wrapping_add(0x0F) } else { v })
            }
        }
    }

    /// Maps a frame-local variable index to an absolute stack slot.
    fn local_slot(&self, index: i32) -> Result<usize, Fault> {
        let limit: u16 = match self.current_function() {
            None => u16::from(self.image.main_variables_count()),
            Some(function) => {
                let desc = self.function_desc(i32::from(function))?;
                u16::from(desc.arguments_count) + u16::from(desc.variables_count)
            }
        };
        if index < 0 || index >= i32::from(limit) {
            return Err(Fault::NoVariable);
        }
        let slot = i32::from(self.current_variables_start()) + index;
        if slot >= DATA_STACK_SIZE as i32 {
            return Err(Fault::VarOutOfStack);
        }
        Ok(slot as usize)
    }

    fn call(&mut self, index: i32) -> Result<Detail, Fault> {
        let desc = self.function_desc(index)?;
        if usize::from(self.call_top) >= CALL_STACK_SIZE {
            return Err(Fault::CallStackOverflow);
        }

        let mut args = u16::from(desc.arguments_count);
        if desc.is_variadic {
            let extra = self.pop()?;
            if extra < 0 || i64::from(args) + i64::from(extra) > 0xFF {
                return Err(Fault::VariadicSize);
            }
            args += extra as u16;
        }
        let args = args as u8;

        if self.data_top < args {
            return Err(Fault::ArgOutOfStack);
        }
        let rest = (DATA_STACK_SIZE as u8).saturating_sub(self.data_top);
        if rest < desc.variables_count {
            return Err(Fault::VarOutOfStack);
        }
        if rest < desc.returns_count {
            return Err(Fault::ReturnOutOfStack);
        }
        let start = self.data_top - args;

        if desc.is_built_in {
            let Some(&builtin) = self.builtins.get(usize::from(desc.address)) else {
                return Err(Fault::BuiltinNoFunction);
            };
            // Arguments and return values occupy common space; no frame is
            // pushed, so set the stack top as if the callee had returned.
            let window = self
                .data_stack
                .get_mut(usize::from(start)..)
                .ok_or(Fault::DataStackOverflow)?;
            let mut ctx = HostCtx {
                binding: &mut self.binding,
                clock: &mut self.clock,
            };
            builtin(&mut ctx, window, args);
            self.data_top = start + desc.returns_count;
        } else {
            self.call_stack[usize::from(self.call_top)] = Frame {
                return_address: self.pc,
                variables_start: start,
                arguments_count: args,
                function_index: index as u8,
            };
            self.call_top += 1;
            for _ in 0..desc.variables_count {
                self.push(0)?;
            }
            self.pc = desc.address;
        }
        Ok(Detail::Call {
            address: desc.address,
            built_in: desc.is_built_in,
            args,
        })
    }

    fn ret(&mut self) -> Result<Detail, Fault> {
        let Some(function) = self.current_function() else {
            return Err(Fault::MainReturn);
        };
        let Some(desc) = self.image.function(function) else {
            // A frame naming a vanished function terminates like main.
            return Err(Fault::MainReturn);
        };

        let stack_start = self.current_variables_start();
        let returns = desc.returns_count;
        let Some(returns_start) = self.data_top.checked_sub(returns) else {
            return Err(Fault::ReturnOutOfStack);
        };

        self.call_top -= 1;
        let frame = self.call_stack[usize::from(self.call_top)];
        let expected = u16::from(stack_start)
            + u16::from(frame.arguments_count)
            + u16::from(desc.variables_count);
        if expected != u16::from(returns_start) {
            return Err(Fault::DataStackSmashed);
        }

        for i in 0..usize::from(returns) {
            let v = *self
                .data_stack
                .get(usize::from(returns_start) + i)
                .ok_or(Fault::DataStackOverflow)?;
            self.data_stack[usize::from(stack_start) + i] = v;
        }
        self.data_top = stack_start + returns;
        self.pc = frame.return_address;
        Ok(Detail::Ret {
            target: frame.return_address,
            returns,
        })
    }

    /// Applies the shared displacement convention: negative displacements
    /// lose an extra 2, then `pc` advances by the displacement plus 1.
    fn relative_jump(&mut self, displacement: i32) {
        let mut d = displacement;
        if d < 0 {
            d = d.wrapping_sub(2);
        }
        self.pc = self.pc.wrapping_add(d.wrapping_add(1) as u16);
    }

    fn push(&mut self, value: i32) -> Result<(), Fault> {
        let slot = self
            .data_stack
            .get_mut(usize::from(self.data_top))
            .ok_or(Fault::DataStackOverflow)?;
        *slot = narrow(value);
        self.data_top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, Fault> {
        if self.data_top == 0 {
            return Err(Fault::DataStackUnderflow);
        }
        let raw = self
            .data_stack
            .get(usize::from(self.data_top - 1))
            .copied()
            .ok_or(Fault::DataStackOverflow)?;
        self.data_top -= 1;
        Ok(widen(raw))
    }

    /// The function index of the innermost frame, or `None` in main.
    fn current_function(&self) -> Option<u8> {
        if self.call_top == 0 {
            return None;
        }
        self.call_stack
            .get(usize::from(self.call_top - 1))
            .map(|f| f.function_index)
    }

    /// The variables base of the active frame; main locals start at 0.
    fn current_variables_start(&self) -> u8 {
        if self.call_top == 0 {
            return 0;
        }
        self.call_stack
            .get(usize::from(self.call_top - 1))
            .map_or(0, |f| f.variables_start)
    }

    fn function_desc(&self, index: i32) -> Result<FunctionDesc, Fault> {
        if index < 0 || index >= i32::from(self.image.functions_count()) {
            return Err(Fault::ExeNoFunction);
        }
        self.image
            .function(index as u8)
            .ok_or(Fault::ExeNoFunction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Writer;
    use crate::host::NO_BUILTINS;
    use crate::opcode::enc;
    use alloc::vec::Vec;

    struct TestClock(u32);

    impl Clock for TestClock {
        fn now_ms(&mut self) -> u32 {
            self.0
        }
    }

    fn image_bytes(main_vars: u8, code: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(crate::image::VM_VERSION);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u8(main_vars);
        w.write_bytes(code);
        let mut bytes = w.into_vec();
        let size = (bytes.len() - 3) as u16;
        bytes[1..3].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    #[test]
    fn push_then_pop_returns_the_same_value() {
        let bytes = image_bytes(0, &[]);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, TestClock(0));
        vm.push(-3).unwrap();
        assert_eq!(vm.pop(), Ok(-3));
        assert_eq!(vm.pop(), Err(Fault::DataStackUnderflow));
    }

    #[test]
    fn step_executes_one_instruction_and_advances_pc() {
        let bytes = image_bytes(0, &[7, 8]);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, TestClock(0));
        vm.step().unwrap();
        assert_eq!(vm.pc(), 1);
        assert_eq!(vm.stack(), [7]);
        vm.step().unwrap();
        assert_eq!(vm.stack(), [7, 8]);
        assert_eq!(vm.step(), Err(Fault::PcOverrun));
    }

    #[test]
    fn ret_without_frames_signals_main_return() {
        let bytes = image_bytes(0, &[enc::RET]);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, TestClock(0));
        assert_eq!(vm.step(), Err(Fault::MainReturn));
    }

    #[test]
    fn sleep_gate_swallows_steps_until_deadline() {
        let bytes = image_bytes(0, &[50, enc::SLP, 1, enc::RET]);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, TestClock(1000));
        vm.step().unwrap();
        vm.step().unwrap();
        assert!(vm.is_sleeping());

        vm.clock_mut().0 = 1049;
        vm.step().unwrap();
        assert_eq!(vm.pc(), 2);
        assert!(vm.stack().is_empty());

        vm.clock_mut().0 = 1050;
        vm.step().unwrap();
        assert!(!vm.is_sleeping());
        assert_eq!(vm.pc(), 3);
        assert_eq!(vm.stack(), [1]);
    }

    #[test]
    fn reset_preserves_binding_and_reseeds_main_locals() {
        let bytes = image_bytes(2, &[9]);
        let image = Image::parse(&bytes).unwrap();
        let mut vm = Vm::new(image, NO_BUILTINS, TestClock(0));
        assert_eq!(vm.stack(), [0, 0]);
        vm.set_binding(0x5A);
        vm.step().unwrap();
        vm.reset();
        assert_eq!(vm.binding(), 0x5A);
        assert_eq!(vm.pc(), 0);
        assert_eq!(vm.stack(), [0, 0]);
    }

    #[test]
    fn fault_ordinals_are_stable() {
        assert_eq!(Fault::MainReturn.code(), 1);
        assert_eq!(Fault::CallStackOverflow.code(), 2);
        assert_eq!(Fault::DataStackUnderflow.code(), 3);
        assert_eq!(Fault::DataStackOverflow.code(), 4);
        assert_eq!(Fault::ArgOutOfStack.code(), 5);
        assert_eq!(Fault::VarOutOfStack.code(), 6);
        assert_eq!(Fault::ReturnOutOfStack.code(), 7);
        assert_eq!(Fault::DataStackSmashed.code(), 8);
        assert_eq!(Fault::PcOverrun.code(), 9);
        assert_eq!(Fault::ExeNoFunction.code(), 10);
        assert_eq!(Fault::BuiltinNoFunction.code(), 11);
        assert_eq!(Fault::NoVariable.code(), 12);
        assert_eq!(Fault::NoConstant.code(), 13);
        assert_eq!(Fault::VariadicSize.code(), 14);
    }
}
