//! Annotated disassembly of the whole memory image.
//!
//! The listing is a rendering convenience only: the canonical stream stays
//! one instruction per opcode. Consecutive `out`s of printable literal
//! bytes collapse into a single string entry so the embedded text reads as
//! text, and a literal newline gets its own line.

use core::fmt;
use std::collections::BTreeMap;

use crate::instr::{self, Instruction, Operand};
use crate::{Word, MEM_WORDS};

/// A full-memory disassembly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Listing {
    /// One entry per rendered line, in address order.
    pub lines: Vec<Line>,
}

/// A single listing line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Line {
    /// Address of the first word this line covers.
    pub addr: Word,
    /// What was decoded there.
    pub entry: Entry,
    /// Annotation attached to the address, if any.
    pub note: Option<String>,
}

/// The decoded payload of a listing line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    /// An ordinary instruction.
    Instr(Instruction),
    /// A run of consecutive `out`s with printable literal operands.
    Text(Vec<u8>),
    /// A single `out` of a literal newline.
    Newline,
    /// A word that does not decode; consumes one address.
    Unknown(Word),
}

/// Renders the instruction at `addr` for diagnostics, falling back to the
/// raw word when it does not decode.
#[must_use]
pub fn render_at(mem: &[Word; MEM_WORDS], addr: Word) -> String {
    match instr::decode(mem, addr) {
        Ok((instr, _)) => instr.to_string(),
        Err(_) => match mem.get(usize::from(addr)) {
            Some(word) => format!("unknown({word})"),
            None => format!("unknown(@{addr})"),
        },
    }
}

/// Disassembles all of memory, attaching `notes` to their addresses.
#[must_use]
pub fn disassemble(mem: &[Word; MEM_WORDS], notes: &BTreeMap<Word, String>) -> Listing {
    let mut lines: Vec<Line> = Vec::new();
    let mut run: Option<(Word, Vec<u8>)> = None;
    let mut flush = |run: &mut Option<(Word, Vec<u8>)>, lines: &mut Vec<Line>| {
        if let Some((start, bytes)) = run.take() {
            lines.push(Line {
                addr: start,
                entry: Entry::Text(bytes),
                note: notes.get(&start).cloned(),
            });
        }
    };

    let mut addr = 0usize;
    while addr < MEM_WORDS {
        let at = addr as Word;
        match instr::decode(mem, at) {
            Ok((instr, width)) => {
                if let Instruction::Out { src: Operand::Literal(v) } = instr {
                    if v == u16::from(b'\n') {
                        flush(&mut run, &mut lines);
                        lines.push(Line {
                            addr: at,
                            entry: Entry::Newline,
                            note: notes.get(&at).cloned(),
                        });
                        addr += usize::from(width);
                        continue;
                    }
                    if (0x20..=0x7e).contains(&v) {
                        // Keep annotated addresses on their own line.
                        if notes.contains_key(&at) {
                            flush(&mut run, &mut lines);
                        }
                        run.get_or_insert((at, Vec::new())).1.push(v as u8);
                        addr += usize::from(width);
                        continue;
                    }
                }
                flush(&mut run, &mut lines);
                lines.push(Line {
                    addr: at,
                    entry: Entry::Instr(instr),
                    note: notes.get(&at).cloned(),
                });
                addr += usize::from(width);
            }
            Err(_) => {
                flush(&mut run, &mut lines);
                lines.push(Line {
                    addr: at,
                    entry: Entry::Unknown(mem[addr]),
                    note: notes.get(&at).cloned(),
                });
                addr += 1;
            }
        }
    }
    flush(&mut run, &mut lines);
    Listing { lines }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Instr(instr) => write!(f, "{instr}"),
            Entry::Text(bytes) => {
                write!(f, "out \"")?;
                for &b in bytes {
                    if b == b'"' || b == b'\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", b as char)?;
                }
                write!(f, "\"")
            }
            Entry::Newline => write!(f, "out '\\n'"),
            Entry::Unknown(word) => write!(f, "unknown({word})"),
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:05}]  {}", self.addr, self.entry)?;
        if let Some(note) = &self.note {
            write!(f, "\t\t\t\t# {note}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
