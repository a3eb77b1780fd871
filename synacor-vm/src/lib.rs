//! Synacor challenge virtual machine
//!
//! A 15-bit word machine with eight registers, an unbounded stack and
//! 32768 words of self-modifiable program memory, per the published
//! arch-spec. The crate provides the instruction codec ([`instr`]), the
//! machine state ([`machine`]), the single-step interpreter ([`exec`])
//! and an annotated disassembler ([`disasm`]); the interactive debugging
//! layer lives in the `synacor-dbg` crate.
#![warn(missing_docs)]

pub mod disasm;
mod error;
pub mod instr;
pub mod machine;

mod exec;

pub use error::VmError;
pub use exec::{Console, Hint};
pub use instr::{Instruction, Operand};
pub use machine::{CallFrame, Machine, Mode, Parts};

/// A machine word; stored values stay in `0..MODULUS` except for raw
/// instruction operands, which may use the register range.
pub type Word = u16;

/// All arithmetic is modulo 32768.
pub const MODULUS: u32 = 32768;

/// Size of program memory, in words.
pub const MEM_WORDS: usize = 32768;

/// Number of general-purpose registers.
pub const NUM_REGISTERS: usize = 8;

/// First raw word value that denotes a register operand.
pub const REGISTER_BASE: Word = 32768;
