//! Instruction codec: raw memory words to structured instructions and back,
//! plus the textual form used by the listing and the REPL.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

use crate::{VmError, Word, MEM_WORDS, NUM_REGISTERS, REGISTER_BASE};

/// Raw opcode words, as defined by the arch-spec.
#[allow(missing_docs)]
pub mod op {
    use crate::Word;

    pub const HALT: Word = 0;
    pub const SET: Word = 1;
    pub const PUSH: Word = 2;
    pub const POP: Word = 3;
    pub const EQ: Word = 4;
    pub const GT: Word = 5;
    pub const JMP: Word = 6;
    pub const JT: Word = 7;
    pub const JF: Word = 8;
    pub const ADD: Word = 9;
    pub const MULT: Word = 10;
    pub const MOD: Word = 11;
    pub const AND: Word = 12;
    pub const OR: Word = 13;
    pub const NOT: Word = 14;
    pub const RMEM: Word = 15;
    pub const WMEM: Word = 16;
    pub const CALL: Word = 17;
    pub const RET: Word = 18;
    pub const OUT: Word = 19;
    pub const IN: Word = 20;
    pub const NOOP: Word = 21;
}

/// A decoded operand word.
///
/// Words `0..=32767` are literal values; `32768..=32775` select one of the
/// eight registers. Anything higher is malformed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    /// A raw 15-bit value.
    Literal(Word),
    /// A register index in `0..=7`.
    Register(u8),
}

impl Operand {
    /// Classifies the raw word found at `addr`.
    pub fn from_word(word: Word, addr: Word) -> Result<Self, VmError> {
        if word < REGISTER_BASE {
            Ok(Operand::Literal(word))
        } else if usize::from(word - REGISTER_BASE) < NUM_REGISTERS {
            Ok(Operand::Register((word - REGISTER_BASE) as u8))
        } else {
            Err(VmError::Malformed { addr })
        }
    }

    /// The raw word this operand encodes to.
    #[must_use]
    pub fn to_word(self) -> Word {
        match self {
            Operand::Literal(v) => v,
            Operand::Register(r) => REGISTER_BASE + Word::from(r),
        }
    }
}

/// A decoded instruction.
///
/// Write destinations (`dst`) must be register-valued in the raw encoding;
/// the codec rejects anything else at decode time, so `dst` fields hold the
/// bare register index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Instruction {
    Halt,
    Set { dst: u8, src: Operand },
    Push { src: Operand },
    Pop { dst: u8 },
    Eq { dst: u8, lhs: Operand, rhs: Operand },
    Gt { dst: u8, lhs: Operand, rhs: Operand },
    Jmp { target: Operand },
    Jt { cond: Operand, target: Operand },
    Jf { cond: Operand, target: Operand },
    Add { dst: u8, lhs: Operand, rhs: Operand },
    Mult { dst: u8, lhs: Operand, rhs: Operand },
    Mod { dst: u8, lhs: Operand, rhs: Operand },
    And { dst: u8, lhs: Operand, rhs: Operand },
    Or { dst: u8, lhs: Operand, rhs: Operand },
    Not { dst: u8, src: Operand },
    Rmem { dst: u8, addr: Operand },
    Wmem { addr: Operand, src: Operand },
    Call { target: Operand },
    Ret,
    Out { src: Operand },
    In { dst: u8 },
    Noop,
}

impl Instruction {
    /// The mnemonic used in listings and by the parser.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Halt => "halt",
            Instruction::Set { .. } => "set",
            Instruction::Push { .. } => "push",
            Instruction::Pop { .. } => "pop",
            Instruction::Eq { .. } => "eq",
            Instruction::Gt { .. } => "gt",
            Instruction::Jmp { .. } => "jmp",
            Instruction::Jt { .. } => "jt",
            Instruction::Jf { .. } => "jf",
            Instruction::Add { .. } => "add",
            Instruction::Mult { .. } => "mult",
            Instruction::Mod { .. } => "mod",
            Instruction::And { .. } => "and",
            Instruction::Or { .. } => "or",
            Instruction::Not { .. } => "not",
            Instruction::Rmem { .. } => "rmem",
            Instruction::Wmem { .. } => "wmem",
            Instruction::Call { .. } => "call",
            Instruction::Ret => "ret",
            Instruction::Out { .. } => "out",
            Instruction::In { .. } => "in",
            Instruction::Noop => "noop",
        }
    }

    /// Total width in words: the opcode plus its operands.
    #[must_use]
    pub fn width(&self) -> Word {
        1 + match self {
            Instruction::Halt | Instruction::Ret | Instruction::Noop => 0,
            Instruction::Push { .. }
            | Instruction::Pop { .. }
            | Instruction::Jmp { .. }
            | Instruction::Call { .. }
            | Instruction::Out { .. }
            | Instruction::In { .. } => 1,
            Instruction::Set { .. }
            | Instruction::Jt { .. }
            | Instruction::Jf { .. }
            | Instruction::Not { .. }
            | Instruction::Rmem { .. }
            | Instruction::Wmem { .. } => 2,
            Instruction::Eq { .. }
            | Instruction::Gt { .. }
            | Instruction::Add { .. }
            | Instruction::Mult { .. }
            | Instruction::Mod { .. }
            | Instruction::And { .. }
            | Instruction::Or { .. } => 3,
        }
    }
}

/// Decodes the instruction at `addr`, returning it with its width in words.
pub fn decode(mem: &[Word; MEM_WORDS], addr: Word) -> Result<(Instruction, Word), VmError> {
    let word_at = |i: Word| -> Result<(Word, Word), VmError> {
        let at = addr
            .checked_add(i)
            .filter(|&a| usize::from(a) < MEM_WORDS)
            .ok_or(VmError::AddressOutOfRange { addr })?;
        Ok((mem[usize::from(at)], at))
    };
    let val = |i: Word| -> Result<Operand, VmError> {
        let (w, at) = word_at(i)?;
        Operand::from_word(w, at)
    };
    let reg = |i: Word| -> Result<u8, VmError> {
        let (w, at) = word_at(i)?;
        match Operand::from_word(w, at)? {
            Operand::Register(r) => Ok(r),
            Operand::Literal(_) => Err(VmError::Malformed { addr: at }),
        }
    };

    let (opcode, _) = word_at(0)?;
    let instr = match opcode {
        op::HALT => Instruction::Halt,
        op::SET => Instruction::Set { dst: reg(1)?, src: val(2)? },
        op::PUSH => Instruction::Push { src: val(1)? },
        op::POP => Instruction::Pop { dst: reg(1)? },
        op::EQ => Instruction::Eq { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::GT => Instruction::Gt { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::JMP => Instruction::Jmp { target: val(1)? },
        op::JT => Instruction::Jt { cond: val(1)?, target: val(2)? },
        op::JF => Instruction::Jf { cond: val(1)?, target: val(2)? },
        op::ADD => Instruction::Add { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::MULT => Instruction::Mult { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::MOD => Instruction::Mod { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::AND => Instruction::And { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::OR => Instruction::Or { dst: reg(1)?, lhs: val(2)?, rhs: val(3)? },
        op::NOT => Instruction::Not { dst: reg(1)?, src: val(2)? },
        op::RMEM => Instruction::Rmem { dst: reg(1)?, addr: val(2)? },
        op::WMEM => Instruction::Wmem { addr: val(1)?, src: val(2)? },
        op::CALL => Instruction::Call { target: val(1)? },
        op::RET => Instruction::Ret,
        op::OUT => Instruction::Out { src: val(1)? },
        op::IN => Instruction::In { dst: reg(1)? },
        op::NOOP => Instruction::Noop,
        word => return Err(VmError::UnknownOpcode { addr, word }),
    };
    let width = instr.width();
    Ok((instr, width))
}

/// Encodes an instruction back into raw words; the exact inverse of
/// [`decode`].
#[must_use]
pub fn encode(instr: &Instruction) -> Vec<Word> {
    let reg = |r: u8| REGISTER_BASE + Word::from(r);
    match *instr {
        Instruction::Halt => vec![op::HALT],
        Instruction::Set { dst, src } => vec![op::SET, reg(dst), src.to_word()],
        Instruction::Push { src } => vec![op::PUSH, src.to_word()],
        Instruction::Pop { dst } => vec![op::POP, reg(dst)],
        Instruction::Eq { dst, lhs, rhs } => {
            vec![op::EQ, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Gt { dst, lhs, rhs } => {
            vec![op::GT, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Jmp { target } => vec![op::JMP, target.to_word()],
        Instruction::Jt { cond, target } => vec![op::JT, cond.to_word(), target.to_word()],
        Instruction::Jf { cond, target } => vec![op::JF, cond.to_word(), target.to_word()],
        Instruction::Add { dst, lhs, rhs } => {
            vec![op::ADD, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Mult { dst, lhs, rhs } => {
            vec![op::MULT, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Mod { dst, lhs, rhs } => {
            vec![op::MOD, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::And { dst, lhs, rhs } => {
            vec![op::AND, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Or { dst, lhs, rhs } => {
            vec![op::OR, reg(dst), lhs.to_word(), rhs.to_word()]
        }
        Instruction::Not { dst, src } => vec![op::NOT, reg(dst), src.to_word()],
        Instruction::Rmem { dst, addr } => vec![op::RMEM, reg(dst), addr.to_word()],
        Instruction::Wmem { addr, src } => vec![op::WMEM, addr.to_word(), src.to_word()],
        Instruction::Call { target } => vec![op::CALL, target.to_word()],
        Instruction::Ret => vec![op::RET],
        Instruction::Out { src } => vec![op::OUT, src.to_word()],
        Instruction::In { dst } => vec![op::IN, reg(dst)],
        Instruction::Noop => vec![op::NOOP],
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{v}"),
            Operand::Register(r) => write!(f, "r{r}"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = Operand::Register;
        match *self {
            Instruction::Halt | Instruction::Ret | Instruction::Noop => {
                write!(f, "{}", self.name())
            }
            Instruction::Push { src }
            | Instruction::Jmp { target: src }
            | Instruction::Call { target: src }
            | Instruction::Out { src } => write!(f, "{} {}", self.name(), src),
            Instruction::Pop { dst } | Instruction::In { dst } => {
                write!(f, "{} {}", self.name(), r(dst))
            }
            Instruction::Set { dst, src }
            | Instruction::Not { dst, src }
            | Instruction::Rmem { dst, addr: src } => {
                write!(f, "{} {} {}", self.name(), r(dst), src)
            }
            Instruction::Jt { cond, target } | Instruction::Jf { cond, target } => {
                write!(f, "{} {} {}", self.name(), cond, target)
            }
            Instruction::Wmem { addr, src } => write!(f, "{} {} {}", self.name(), addr, src),
            Instruction::Eq { dst, lhs, rhs }
            | Instruction::Gt { dst, lhs, rhs }
            | Instruction::Add { dst, lhs, rhs }
            | Instruction::Mult { dst, lhs, rhs }
            | Instruction::Mod { dst, lhs, rhs }
            | Instruction::And { dst, lhs, rhs }
            | Instruction::Or { dst, lhs, rhs } => {
                write!(f, "{} {} {} {}", self.name(), r(dst), lhs, rhs)
            }
        }
    }
}

/// Failure to parse the textual instruction form.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ParseError {
    /// The line was empty.
    #[error("empty instruction")]
    Empty,
    /// The first token is not a known mnemonic.
    #[error("unknown mnemonic {0:?}")]
    UnknownMnemonic(String),
    /// Wrong number of operands for the mnemonic.
    #[error("{mnemonic} takes {expected} operand(s)")]
    WrongArity {
        /// The mnemonic being parsed.
        mnemonic: String,
        /// How many operands it needs.
        expected: usize,
    },
    /// An operand token is neither `rN` nor a value in `0..=32767`.
    #[error("bad operand {0:?}")]
    BadOperand(String),
    /// A write destination must be a register.
    #[error("expected a register, found {0:?}")]
    ExpectedRegister(String),
}

fn parse_operand(tok: &str) -> Result<Operand, ParseError> {
    if let Some(idx) = tok.strip_prefix('r') {
        if let Ok(r) = idx.parse::<u8>() {
            if usize::from(r) < NUM_REGISTERS {
                return Ok(Operand::Register(r));
            }
        }
        return Err(ParseError::BadOperand(tok.to_owned()));
    }
    match tok.parse::<Word>() {
        Ok(v) if v < REGISTER_BASE => Ok(Operand::Literal(v)),
        _ => Err(ParseError::BadOperand(tok.to_owned())),
    }
}

fn parse_register(tok: &str) -> Result<u8, ParseError> {
    match parse_operand(tok)? {
        Operand::Register(r) => Ok(r),
        Operand::Literal(_) => Err(ParseError::ExpectedRegister(tok.to_owned())),
    }
}

impl FromStr for Instruction {
    type Err = ParseError;

    /// Parses the same surface `Display` produces, e.g. `add r0 r1 4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let mnemonic = tokens.next().ok_or(ParseError::Empty)?;
        let args: Vec<&str> = tokens.collect();
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(ParseError::WrongArity { mnemonic: mnemonic.to_owned(), expected: n })
            }
        };
        let instr = match mnemonic {
            "halt" => {
                arity(0)?;
                Instruction::Halt
            }
            "set" => {
                arity(2)?;
                Instruction::Set { dst: parse_register(args[0])?, src: parse_operand(args[1])? }
            }
            "push" => {
                arity(1)?;
                Instruction::Push { src: parse_operand(args[0])? }
            }
            "pop" => {
                arity(1)?;
                Instruction::Pop { dst: parse_register(args[0])? }
            }
            "eq" | "gt" | "add" | "mult" | "mod" | "and" | "or" => {
                arity(3)?;
                let dst = parse_register(args[0])?;
                let lhs = parse_operand(args[1])?;
                let rhs = parse_operand(args[2])?;
                match mnemonic {
                    "eq" => Instruction::Eq { dst, lhs, rhs },
                    "gt" => Instruction::Gt { dst, lhs, rhs },
                    "add" => Instruction::Add { dst, lhs, rhs },
                    "mult" => Instruction::Mult { dst, lhs, rhs },
                    "mod" => Instruction::Mod { dst, lhs, rhs },
                    "and" => Instruction::And { dst, lhs, rhs },
                    _ => Instruction::Or { dst, lhs, rhs },
                }
            }
            "jmp" => {
                arity(1)?;
                Instruction::Jmp { target: parse_operand(args[0])? }
            }
            "jt" => {
                arity(2)?;
                Instruction::Jt { cond: parse_operand(args[0])?, target: parse_operand(args[1])? }
            }
            "jf" => {
                arity(2)?;
                Instruction::Jf { cond: parse_operand(args[0])?, target: parse_operand(args[1])? }
            }
            "not" => {
                arity(2)?;
                Instruction::Not { dst: parse_register(args[0])?, src: parse_operand(args[1])? }
            }
            "rmem" => {
                arity(2)?;
                Instruction::Rmem { dst: parse_register(args[0])?, addr: parse_operand(args[1])? }
            }
            "wmem" => {
                arity(2)?;
                Instruction::Wmem { addr: parse_operand(args[0])?, src: parse_operand(args[1])? }
            }
            "call" => {
                arity(1)?;
                Instruction::Call { target: parse_operand(args[0])? }
            }
            "ret" => {
                arity(0)?;
                Instruction::Ret
            }
            "out" => {
                arity(1)?;
                Instruction::Out { src: parse_operand(args[0])? }
            }
            "in" => {
                arity(1)?;
                Instruction::In { dst: parse_register(args[0])? }
            }
            "noop" => {
                arity(0)?;
                Instruction::Noop
            }
            other => return Err(ParseError::UnknownMnemonic(other.to_owned())),
        };
        Ok(instr)
    }
}
