//! Single-step interpreter.
//!
//! The interpreter never blocks and never performs I/O of its own: output
//! bytes go to a [`Console`] sink, and an `in` instruction with no pending
//! input reports [`Hint::WaitForInput`] with the PC left in place so the
//! instruction re-executes once input arrives.

use crate::instr::{self, Instruction};
use crate::machine::CallFrame;
use crate::{Machine, VmError, Word, MODULUS};

/// What the controller should do after a step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Hint {
    /// Dispatch the next instruction immediately.
    Continue,
    /// Park until input arrives; the PC has not moved.
    WaitForInput,
    /// The machine has halted.
    Idle,
}

/// Byte sink for the `out` opcode.
pub trait Console {
    /// Receives one output byte, in program order.
    fn emit(&mut self, byte: u8);
}

impl Console for Vec<u8> {
    fn emit(&mut self, byte: u8) {
        self.push(byte);
    }
}

impl Machine {
    /// Fetches, decodes and executes the instruction at the PC.
    ///
    /// Decoding happens against live memory on every fetch, so
    /// self-modifying code behaves as written. Any error marks the
    /// machine halted, with the error attached to the state for later
    /// inspection, before it propagates.
    pub fn step<C: Console>(&mut self, console: &mut C) -> Result<Hint, VmError> {
        if self.halted {
            return Ok(Hint::Idle);
        }
        let result = match instr::decode(&self.memory, self.pc) {
            Ok((instr, width)) => {
                let next = self.pc.wrapping_add(width);
                self.execute(&instr, next, console)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.halted = true;
            self.last_error = Some(*e);
        }
        result
    }

    /// Executes one instruction with the PC pinned.
    ///
    /// State effects (registers, stack, memory, output) apply; control
    /// flow and the halt flag are untouched. Used for patching
    /// experiments, so neither a failed evaluation nor an evaluated
    /// `halt` (or `ret` on an empty stack) stops the live machine.
    pub fn evaluate<C: Console>(
        &mut self,
        instr: &Instruction,
        console: &mut C,
    ) -> Result<Hint, VmError> {
        let pc = self.pc;
        let halted = self.halted;
        let result = self.execute(instr, pc, console);
        self.pc = pc;
        self.halted = halted;
        result
    }

    fn execute<C: Console>(
        &mut self,
        instr: &Instruction,
        next_pc: Word,
        console: &mut C,
    ) -> Result<Hint, VmError> {
        let mut pc = next_pc;
        match *instr {
            Instruction::Halt => {
                self.halted = true;
                return Ok(Hint::Idle);
            }
            Instruction::Set { dst, src } => {
                let v = self.resolve(src);
                self.set_register(dst, v);
            }
            Instruction::Push { src } => {
                let v = self.resolve(src);
                self.stack.push(v);
            }
            Instruction::Pop { dst } => {
                let v = self.stack.pop().ok_or(VmError::StackUnderflow)?;
                self.set_register(dst, v);
            }
            Instruction::Eq { dst, lhs, rhs } => {
                let v = Word::from(self.resolve(lhs) == self.resolve(rhs));
                self.set_register(dst, v);
            }
            Instruction::Gt { dst, lhs, rhs } => {
                let v = Word::from(self.resolve(lhs) > self.resolve(rhs));
                self.set_register(dst, v);
            }
            Instruction::Jmp { target } => pc = self.resolve(target),
            Instruction::Jt { cond, target } => {
                if self.resolve(cond) != 0 {
                    pc = self.resolve(target);
                }
            }
            Instruction::Jf { cond, target } => {
                if self.resolve(cond) == 0 {
                    pc = self.resolve(target);
                }
            }
            Instruction::Add { dst, lhs, rhs } => {
                let v = (u32::from(self.resolve(lhs)) + u32::from(self.resolve(rhs))) % MODULUS;
                self.set_register(dst, v as Word);
            }
            Instruction::Mult { dst, lhs, rhs } => {
                let v = (u32::from(self.resolve(lhs)) * u32::from(self.resolve(rhs))) % MODULUS;
                self.set_register(dst, v as Word);
            }
            Instruction::Mod { dst, lhs, rhs } => {
                let divisor = self.resolve(rhs);
                if divisor == 0 {
                    return Err(VmError::DivisionByZero);
                }
                let v = self.resolve(lhs) % divisor;
                self.set_register(dst, v);
            }
            Instruction::And { dst, lhs, rhs } => {
                let v = self.resolve(lhs) & self.resolve(rhs);
                self.set_register(dst, v);
            }
            Instruction::Or { dst, lhs, rhs } => {
                let v = self.resolve(lhs) | self.resolve(rhs);
                self.set_register(dst, v);
            }
            Instruction::Not { dst, src } => {
                let v = !self.resolve(src) & 0x7FFF;
                self.set_register(dst, v);
            }
            Instruction::Rmem { dst, addr } => {
                let v = self.read_mem(self.resolve(addr))?;
                self.set_register(dst, v);
            }
            Instruction::Wmem { addr, src } => {
                let v = self.resolve(src);
                self.write_mem(self.resolve(addr), v)?;
            }
            Instruction::Call { target } => {
                self.stack.push(next_pc);
                let note = self.annotation(self.pc).map(str::to_owned);
                self.call_trace.push(CallFrame { site: self.pc, note });
                pc = self.resolve(target);
            }
            Instruction::Ret => match self.stack.pop() {
                Some(v) => {
                    self.call_trace.pop();
                    pc = v;
                }
                None => {
                    self.halted = true;
                    return Ok(Hint::Idle);
                }
            },
            Instruction::Out { src } => {
                console.emit((self.resolve(src) % 256) as u8);
            }
            Instruction::In { dst } => match self.pop_input() {
                Some(byte) => self.set_register(dst, Word::from(byte)),
                None => return Ok(Hint::WaitForInput),
            },
            Instruction::Noop => {}
        }
        self.pc = pc;
        Ok(Hint::Continue)
    }
}
