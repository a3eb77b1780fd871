use crate::Word;
use thiserror::Error;

/// Everything that can go wrong while decoding or executing a program.
///
/// `in` on an empty input queue is not an error; the interpreter reports
/// it as a scheduling hint instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum VmError {
    /// An operand word at `addr` is outside both the literal and the
    /// register ranges, or a write destination is not a register.
    #[error("malformed operand at {addr}")]
    Malformed {
        /// Address of the offending word.
        addr: Word,
    },

    /// The opcode word at `addr` is not in the `0..=21` range.
    #[error("unknown opcode {word} at {addr}")]
    UnknownOpcode {
        /// Address of the opcode word.
        addr: Word,
        /// The raw word found there.
        word: Word,
    },

    /// `pop` or `ret` on an empty stack.
    #[error("pop from an empty stack")]
    StackUnderflow,

    /// A memory access past the last addressable word.
    #[error("address {addr} out of range")]
    AddressOutOfRange {
        /// The out-of-range address.
        addr: Word,
    },

    /// `mod` with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,
}
