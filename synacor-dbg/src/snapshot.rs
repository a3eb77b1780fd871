//! Whole-machine snapshots.
//!
//! A snapshot is a zip archive with two members: `snapshot.json`, the
//! self-describing metadata (registers, stack, PC, mode, breakpoints,
//! annotations, call trace, pending input), and `memory.bin`, the full
//! memory image as little-endian words. Loading verifies the magic and
//! version and always drops the restored machine into step mode.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::read::ZipArchive;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use std::collections::BTreeMap;

use synacor_vm::{CallFrame, Machine, Mode, Parts, VmError, Word, MEM_WORDS, NUM_REGISTERS};

/// Identifies a snapshot archive.
pub const SNAPSHOT_MAGIC: &str = "synacor.machine";

/// Bumped on any incompatible layout change.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Failure to write or restore a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying file I/O failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The archive container is damaged or missing a member.
    #[error("archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// The metadata does not parse.
    #[error("metadata: {0}")]
    Json(#[from] serde_json::Error),
    /// The contents are not a snapshot this build understands.
    #[error("invalid snapshot: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum ModeRepr {
    Run,
    Step,
    RunTo(Word),
    Ret,
}

impl From<Mode> for ModeRepr {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Run => ModeRepr::Run,
            Mode::Step => ModeRepr::Step,
            Mode::RunTo(target) => ModeRepr::RunTo(target),
            Mode::Ret => ModeRepr::Ret,
        }
    }
}

#[derive(Serialize, Deserialize)]
enum ErrorRepr {
    Malformed { addr: Word },
    UnknownOpcode { addr: Word, word: Word },
    StackUnderflow,
    AddressOutOfRange { addr: Word },
    DivisionByZero,
}

impl From<VmError> for ErrorRepr {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Malformed { addr } => ErrorRepr::Malformed { addr },
            VmError::UnknownOpcode { addr, word } => ErrorRepr::UnknownOpcode { addr, word },
            VmError::StackUnderflow => ErrorRepr::StackUnderflow,
            VmError::AddressOutOfRange { addr } => ErrorRepr::AddressOutOfRange { addr },
            VmError::DivisionByZero => ErrorRepr::DivisionByZero,
        }
    }
}

impl From<ErrorRepr> for VmError {
    fn from(e: ErrorRepr) -> Self {
        match e {
            ErrorRepr::Malformed { addr } => VmError::Malformed { addr },
            ErrorRepr::UnknownOpcode { addr, word } => VmError::UnknownOpcode { addr, word },
            ErrorRepr::StackUnderflow => VmError::StackUnderflow,
            ErrorRepr::AddressOutOfRange { addr } => VmError::AddressOutOfRange { addr },
            ErrorRepr::DivisionByZero => VmError::DivisionByZero,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FrameRepr {
    site: Word,
    note: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    magic: String,
    version: u32,
    registers: [Word; NUM_REGISTERS],
    stack: Vec<Word>,
    pc: Word,
    halted: bool,
    last_error: Option<ErrorRepr>,
    mode: ModeRepr,
    input: Vec<u8>,
    breakpoints: Vec<Word>,
    annotations: BTreeMap<Word, String>,
    call_trace: Vec<FrameRepr>,
}

/// Serialises the complete machine state to `path`.
pub fn save(path: &Path, machine: &Machine) -> Result<(), SnapshotError> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let meta = Metadata {
        magic: SNAPSHOT_MAGIC.to_owned(),
        version: SNAPSHOT_VERSION,
        registers: *machine.registers(),
        stack: machine.stack().to_vec(),
        pc: machine.pc(),
        halted: machine.halted(),
        last_error: machine.last_error().map(Into::into),
        mode: machine.mode().into(),
        input: machine.input().iter().copied().collect(),
        breakpoints: machine.breakpoints().iter().copied().collect(),
        annotations: machine.annotations().clone(),
        call_trace: machine
            .call_trace()
            .iter()
            .map(|f| FrameRepr { site: f.site, note: f.note.clone() })
            .collect(),
    };

    zip.start_file("snapshot.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&meta)?)?;

    zip.start_file("memory.bin", options)?;
    let mut image = Vec::with_capacity(MEM_WORDS * 2);
    for word in machine.memory().iter() {
        image.extend_from_slice(&word.to_le_bytes());
    }
    zip.write_all(&image)?;

    zip.finish()?;
    Ok(())
}

/// Restores a machine from `path`; the result is always in [`Mode::Step`].
pub fn load(path: &Path) -> Result<Machine, SnapshotError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    let meta: Metadata = {
        let mut buf = Vec::new();
        archive.by_name("snapshot.json")?.read_to_end(&mut buf)?;
        serde_json::from_slice(&buf)?
    };
    if meta.magic != SNAPSHOT_MAGIC || meta.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Invalid("magic/version mismatch".to_owned()));
    }
    debug!("snapshot was taken in mode {:?}", meta.mode);

    let image = {
        let mut buf = Vec::new();
        archive.by_name("memory.bin")?.read_to_end(&mut buf)?;
        buf
    };
    if image.len() != MEM_WORDS * 2 {
        return Err(SnapshotError::Invalid(format!(
            "memory.bin length mismatch (expected {}, got {})",
            MEM_WORDS * 2,
            image.len()
        )));
    }
    let mut memory: Box<[Word; MEM_WORDS]> =
        vec![0; MEM_WORDS].into_boxed_slice().try_into().expect("fixed length");
    for (slot, chunk) in memory.iter_mut().zip(image.chunks_exact(2)) {
        *slot = Word::from_le_bytes([chunk[0], chunk[1]]);
    }

    Ok(Machine::from_parts(Parts {
        memory,
        registers: meta.registers,
        stack: meta.stack,
        pc: meta.pc,
        halted: meta.halted,
        last_error: meta.last_error.map(Into::into),
        input: meta.input.into(),
        mode: Mode::Step,
        breakpoints: meta.breakpoints.into_iter().collect(),
        annotations: meta.annotations,
        call_trace: meta
            .call_trace
            .into_iter()
            .map(|f| CallFrame { site: f.site, note: f.note })
            .collect(),
    }))
}
