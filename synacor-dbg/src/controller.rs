//! The debugging controller.
//!
//! A single-threaded event loop that owns the live machine. Commands
//! arrive on an mpsc channel and are processed in order; between commands
//! the loop ticks the interpreter while the machine is free-running, and
//! parks on the channel while it is paused, halted or starved of input.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use synacor_vm::disasm;
use synacor_vm::instr;
use synacor_vm::{Hint, Instruction, Machine, Mode, Word};

use crate::snapshot;

/// Flush program output to the sink once this much has accumulated.
const FLUSH_BYTES: usize = 4096;

/// Width of a `call` instruction; used to compute return targets.
const CALL_WIDTH: Word = 2;

/// Everything the controller can be asked to do.
///
/// Commands carry plain values only; callers never hold references into
/// the machine.
pub enum Command {
    /// Appends a line (plus `\n`) to the program's input queue.
    Input(String),
    /// Executes exactly one instruction.
    Step,
    /// Like [`Command::Step`], but runs a `call` to completion.
    Next,
    /// Resumes free-running until a breakpoint, error or halt.
    Continue,
    /// Pauses a free-running machine.
    Break,
    /// Free-runs until the next `ret` instruction, without popping it.
    Ret,
    /// Free-runs until control returns past the innermost recorded call.
    Up,
    /// Arms a breakpoint.
    AddBreak(Word),
    /// Removes every breakpoint.
    ClearBreaks,
    /// Attaches a note to an address (the current PC when `addr` is
    /// `None`); an empty note removes it.
    Annotate {
        /// Address to annotate; defaults to the PC.
        addr: Option<Word>,
        /// The note text.
        note: String,
    },
    /// Prints the value and annotation at an address.
    Peek(Word),
    /// Overwrites one memory word.
    Poke(Word, Word),
    /// Writes a register.
    SetRegister(u8, Word),
    /// Executes one instruction with the PC pinned (patching experiments).
    Evaluate(Instruction),
    /// Sends a copy of the complete state back on the given channel.
    GetState(Sender<Box<Machine>>),
    /// Replaces the complete state.
    SetState(Box<Machine>),
    /// Writes a snapshot of the whole machine.
    Save(PathBuf),
    /// Restores a snapshot; the machine comes back paused.
    Load(PathBuf),
    /// Prints the call trace, innermost call first.
    Backtrace,
    /// Renders the annotated listing to a file, or to the terminal.
    Disassemble(Option<PathBuf>),
    /// Stops the controller.
    Shutdown,
}

/// Where program output and reports are delivered.
pub enum Sink {
    /// Write directly to the process's standard output.
    Stdout,
    /// Forward to a registered terminal handle.
    Channel(Sender<Vec<u8>>),
}

impl Sink {
    fn send(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        match self {
            Sink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(&bytes);
                let _ = stdout.flush();
            }
            Sink::Channel(tx) => {
                let _ = tx.send(bytes);
            }
        }
    }
}

/// Single owner of the live machine; see the module docs.
pub struct Controller {
    machine: Machine,
    rx: Receiver<Command>,
    sink: Sink,
    /// Program output accumulated since the last flush.
    out: Vec<u8>,
    /// Set while an `in` instruction is parked on an empty input queue.
    waiting: bool,
    /// Address whose breakpoint is skipped once after a resume command.
    resume_from: Option<Word>,
}

/// Spawns a controller on its own thread.
pub fn spawn(machine: Machine, sink: Sink) -> (Sender<Command>, JoinHandle<()>) {
    let (controller, tx) = Controller::new(machine, sink);
    let handle = std::thread::spawn(move || controller.run());
    (tx, handle)
}

impl Controller {
    /// Builds a controller around `machine`, returning the command handle.
    pub fn new(machine: Machine, sink: Sink) -> (Self, Sender<Command>) {
        let (tx, rx) = channel();
        let controller = Self {
            machine,
            rx,
            sink,
            out: Vec::new(),
            waiting: false,
            resume_from: None,
        };
        (controller, tx)
    }

    /// Runs until shutdown, or until the command channel closes while the
    /// machine has nothing left to do.
    pub fn run(mut self) {
        'outer: loop {
            if self.parked() {
                match self.rx.recv() {
                    Ok(cmd) => {
                        if self.handle(cmd) {
                            break 'outer;
                        }
                    }
                    Err(_) => break 'outer,
                }
            } else {
                loop {
                    match self.rx.try_recv() {
                        Ok(cmd) => {
                            if self.handle(cmd) {
                                break 'outer;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        // Keep running to natural completion with the
                        // command side gone; we park on halt or input.
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
                self.tick();
                if self.out.len() >= FLUSH_BYTES {
                    self.flush();
                }
            }
        }
        self.flush();
    }

    /// True when the loop should block on the command channel.
    fn parked(&self) -> bool {
        self.machine.halted() || self.machine.mode() == Mode::Step || self.waiting
    }

    /// One free-running iteration: pre-dispatch policy, then a step.
    fn tick(&mut self) {
        let pc = self.machine.pc();
        if self.machine.breakpoints().contains(&pc) && self.resume_from != Some(pc) {
            self.pause(&format!("breakpoint at {pc}"));
            return;
        }
        self.resume_from = None;
        match self.machine.mode() {
            Mode::RunTo(target) if pc == target => {
                self.pause(&format!("reached {target}"));
                return;
            }
            Mode::Ret => {
                if let Ok((Instruction::Ret, _)) = instr::decode(self.machine.memory(), pc) {
                    self.pause("at ret");
                    return;
                }
            }
            _ => (),
        }
        self.exec_one();
    }

    /// Executes exactly one instruction and honors the schedule hint.
    fn exec_one(&mut self) {
        match self.machine.step(&mut self.out) {
            Ok(Hint::Continue) => (),
            Ok(Hint::WaitForInput) => {
                if !self.waiting {
                    debug!("input starved at {}", self.machine.pc());
                }
                self.waiting = true;
                self.flush();
            }
            Ok(Hint::Idle) => {
                self.flush();
                self.report("machine halted");
            }
            Err(e) => {
                self.flush();
                let pc = self.machine.pc();
                let mut text = String::new();
                let _ = writeln!(text, "-- error: {e}");
                let _ = writeln!(
                    text,
                    "   [{:05}]  {}",
                    pc,
                    disasm::render_at(self.machine.memory(), pc)
                );
                self.sink.send(text.into_bytes());
            }
        }
    }

    /// Drops to step mode and reports why.
    fn pause(&mut self, reason: &str) {
        self.machine.set_mode(Mode::Step);
        self.flush();
        self.report(reason);
    }

    /// Switches into a free-running mode, running past the current
    /// address even if it carries a breakpoint.
    fn resume(&mut self, mode: Mode) {
        self.resume_from = Some(self.machine.pc());
        self.machine.set_mode(mode);
        debug!("mode -> {mode:?}");
    }

    /// Prints the paused-state summary: PC, instruction, registers, stack.
    fn report(&mut self, reason: &str) {
        let m = &self.machine;
        let pc = m.pc();
        let mut text = String::new();
        let _ = writeln!(text, "-- {reason}");
        let _ = writeln!(text, "   [{pc:05}]  {}", disasm::render_at(m.memory(), pc));
        if let Some(note) = m.annotation(pc) {
            let _ = writeln!(text, "   note: {note}");
        }
        if let Some(e) = m.last_error() {
            let _ = writeln!(text, "   error: {e}");
        }
        let _ = write!(text, "   regs:");
        for (i, v) in m.registers().iter().enumerate() {
            let _ = write!(text, " r{i}={v}");
        }
        let _ = writeln!(text);
        let depth = m.stack().len();
        let top: Vec<Word> = m.stack().iter().rev().take(8).copied().collect();
        let _ = writeln!(text, "   stack[{depth}]: {top:?}");
        self.sink.send(text.into_bytes());
    }

    fn backtrace(&mut self) {
        let mut text = String::new();
        if self.machine.call_trace().is_empty() {
            text.push_str("call trace is empty\n");
        }
        for (i, frame) in self.machine.call_trace().iter().rev().enumerate() {
            let _ = write!(
                text,
                "#{i} [{:05}]  {}",
                frame.site,
                disasm::render_at(self.machine.memory(), frame.site)
            );
            if let Some(note) = &frame.note {
                let _ = write!(text, "\t# {note}");
            }
            let _ = writeln!(text);
        }
        self.sink.send(text.into_bytes());
    }

    fn flush(&mut self) {
        if !self.out.is_empty() {
            let out = std::mem::take(&mut self.out);
            self.sink.send(out);
        }
    }

    fn say(&mut self, line: String) {
        self.sink.send(format!("{line}\n").into_bytes());
    }

    /// Applies one command; returns `true` on shutdown.
    fn handle(&mut self, cmd: Command) -> bool {
        self.flush();
        match cmd {
            Command::Input(line) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                self.machine.push_input(&bytes);
                self.waiting = false;
            }
            Command::Step => self.step_once(),
            Command::Next => {
                let pc = self.machine.pc();
                match instr::decode(self.machine.memory(), pc) {
                    Ok((Instruction::Call { .. }, width)) => {
                        self.resume(Mode::RunTo(pc.wrapping_add(width)));
                    }
                    _ => self.step_once(),
                }
            }
            Command::Continue => self.resume(Mode::Run),
            Command::Break => self.pause("paused"),
            Command::Ret => self.resume(Mode::Ret),
            Command::Up => match self.machine.call_trace().last() {
                Some(frame) => {
                    let target = frame.site.wrapping_add(CALL_WIDTH);
                    self.resume(Mode::RunTo(target));
                }
                None => self.say("no caller recorded".to_owned()),
            },
            Command::AddBreak(addr) => {
                self.machine.add_breakpoint(addr);
                debug!("breakpoint armed at {addr}");
            }
            Command::ClearBreaks => self.machine.clear_breakpoints(),
            Command::Annotate { addr, note } => {
                let addr = addr.unwrap_or_else(|| self.machine.pc());
                self.machine.annotate(addr, &note);
            }
            Command::Peek(addr) => match self.machine.read_mem(addr) {
                Ok(value) => {
                    let note = match self.machine.annotation(addr) {
                        Some(n) => format!("\t# {n}"),
                        None => String::new(),
                    };
                    self.say(format!("[{addr:05}]  {value}{note}"));
                }
                Err(e) => self.say(format!("peek: {e}")),
            },
            Command::Poke(addr, value) => {
                if let Err(e) = self.machine.write_mem(addr, value) {
                    self.say(format!("poke: {e}"));
                }
            }
            Command::SetRegister(r, value) => {
                if usize::from(r) < synacor_vm::NUM_REGISTERS {
                    self.machine.set_register(r, value);
                } else {
                    warn!("no such register r{r}");
                }
            }
            Command::Evaluate(instr) => {
                match self.machine.evaluate(&instr, &mut self.out) {
                    Ok(_) => self.flush(),
                    Err(e) => self.say(format!("eval: {e}")),
                }
            }
            Command::GetState(reply) => {
                let _ = reply.send(Box::new(self.machine.clone()));
            }
            Command::SetState(machine) => {
                self.machine.replace(*machine);
                self.waiting = false;
                self.resume_from = None;
            }
            Command::Save(path) => match snapshot::save(&path, &self.machine) {
                Ok(()) => info!("snapshot written to {}", path.display()),
                Err(e) => self.say(format!("save: {e}")),
            },
            Command::Load(path) => match snapshot::load(&path) {
                Ok(machine) => {
                    self.machine.replace(machine);
                    self.waiting = false;
                    self.resume_from = None;
                    info!("snapshot restored from {}", path.display());
                    self.report("state restored");
                }
                Err(e) => self.say(format!("load: {e}")),
            },
            Command::Backtrace => self.backtrace(),
            Command::Disassemble(path) => {
                let listing =
                    disasm::disassemble(self.machine.memory(), self.machine.annotations());
                match path {
                    Some(path) => {
                        if let Err(e) = std::fs::write(&path, listing.to_string()) {
                            self.say(format!("disassemble: {e}"));
                        } else {
                            info!("listing written to {}", path.display());
                        }
                    }
                    None => self.sink.send(listing.to_string().into_bytes()),
                }
            }
            Command::Shutdown => return true,
        }
        false
    }

    /// One explicit step from the paused state.
    fn step_once(&mut self) {
        if self.machine.halted() {
            self.say("machine is halted".to_owned());
            return;
        }
        self.exec_one();
        self.flush();
        if !self.machine.halted() && !self.waiting {
            let pc = self.machine.pc();
            self.say(format!(
                "[{pc:05}]  {}",
                disasm::render_at(self.machine.memory(), pc)
            ));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn channel_sink() -> (Sink, Receiver<Vec<u8>>) {
        let (tx, rx) = channel();
        (Sink::Channel(tx), rx)
    }

    fn drain(rx: &Receiver<Vec<u8>>) -> String {
        let mut bytes = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            bytes.extend(chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Queues commands, closes the channel and runs the controller to
    /// completion, returning everything it sent to the terminal.
    fn run_session(machine: Machine, commands: Vec<Command>) -> String {
        let (sink, out_rx) = channel_sink();
        let (controller, tx) = Controller::new(machine, sink);
        for cmd in commands {
            tx.send(cmd).unwrap();
        }
        drop(tx);
        controller.run();
        drain(&out_rx)
    }

    #[test]
    fn free_run_emits_program_output() {
        // out 'h'; out 'i'; halt
        let machine = Machine::from_words(&[19, 104, 19, 105, 0]);
        let output = run_session(machine, vec![]);
        assert!(output.starts_with("hi"));
        assert!(output.contains("machine halted"));
    }

    /// Ticks a detached controller until it would park on the channel.
    fn run_until_parked(c: &mut Controller) {
        while !c.parked() {
            c.tick();
        }
    }

    fn paused(machine: Machine) -> (Controller, Sender<Command>, Receiver<Vec<u8>>) {
        let (sink, rx) = channel_sink();
        let (c, tx) = Controller::new(machine, sink);
        (c, tx, rx)
    }

    #[test]
    fn step_executes_exactly_one_instruction() {
        let mut machine = Machine::from_words(&[21, 21, 21, 0]);
        machine.set_mode(Mode::Step);
        let (state_tx, state_rx) = channel();
        let output =
            run_session(machine, vec![Command::Step, Command::GetState(state_tx)]);
        let state = state_rx.recv().unwrap();
        assert_eq!(state.pc(), 1);
        assert_eq!(state.mode(), Mode::Step);
        assert!(!state.halted());
        assert!(output.contains("[00001]  noop"));
    }

    #[test]
    fn breakpoint_pauses_then_retriggers() {
        // 0: noop; 1: jmp 0 -- an endless lap through address 1.
        let mut machine = Machine::from_words(&[21, 6, 0]);
        machine.add_breakpoint(1);
        let (mut c, _tx, rx) = paused(machine);

        run_until_parked(&mut c);
        assert_eq!(c.machine.pc(), 1);
        assert_eq!(c.machine.mode(), Mode::Step);
        assert_eq!(drain(&rx).matches("breakpoint at 1").count(), 1);

        // Continue runs past the paused address and trips a lap later.
        c.handle(Command::Continue);
        run_until_parked(&mut c);
        assert_eq!(c.machine.pc(), 1);
        assert_eq!(drain(&rx).matches("breakpoint at 1").count(), 1);
    }

    #[test]
    fn next_runs_a_call_to_completion() {
        // 0: call 5; 2: halt; 5: noop; 6: ret
        let mut machine = Machine::from_words(&[17, 5, 0, 0, 0, 21, 18]);
        machine.set_mode(Mode::Step);
        let (mut c, _tx, rx) = paused(machine);
        c.handle(Command::Next);
        assert_eq!(c.machine.mode(), Mode::RunTo(2));
        run_until_parked(&mut c);
        assert_eq!(c.machine.pc(), 2);
        assert_eq!(c.machine.mode(), Mode::Step);
        assert!(drain(&rx).contains("reached 2"));
    }

    #[test]
    fn ret_mode_stops_on_the_ret_without_popping() {
        // 0: call 3; 2: halt; 3: noop; 4: ret
        let mut machine = Machine::from_words(&[17, 3, 0, 21, 18]);
        machine.set_mode(Mode::Step);
        let (mut c, _tx, _rx) = paused(machine);
        c.handle(Command::Step);
        assert_eq!(c.machine.pc(), 3);
        c.handle(Command::Ret);
        run_until_parked(&mut c);
        assert_eq!(c.machine.pc(), 4);
        assert_eq!(c.machine.stack(), &[2]);
        assert_eq!(c.machine.mode(), Mode::Step);
    }

    #[test]
    fn up_returns_past_the_innermost_call() {
        // 0: call 3; 2: halt; 3: noop; 4: noop; 5: ret
        let mut machine = Machine::from_words(&[17, 3, 0, 21, 21, 18]);
        machine.set_mode(Mode::Step);
        let (mut c, _tx, _rx) = paused(machine);
        c.handle(Command::Step);
        assert_eq!(c.machine.pc(), 3);
        c.handle(Command::Up);
        assert_eq!(c.machine.mode(), Mode::RunTo(2));
        run_until_parked(&mut c);
        assert_eq!(c.machine.pc(), 2);
        assert!(c.machine.call_trace().is_empty());
    }

    #[test]
    fn input_starvation_parks_until_fed() {
        // in r0; out r0; halt
        let machine = Machine::from_words(&[20, 32768, 19, 32768, 0]);
        let (mut c, _tx, rx) = paused(machine);
        run_until_parked(&mut c);
        assert!(c.waiting);
        assert_eq!(c.machine.pc(), 0);
        c.handle(Command::Input("A".to_owned()));
        assert!(!c.parked());
        run_until_parked(&mut c);
        assert!(c.machine.halted());
        assert!(drain(&rx).starts_with('A'));
    }

    #[test]
    fn errors_halt_with_a_diagnostic() {
        let machine = Machine::from_words(&[11, 32768, 1, 0]);
        let output = run_session(machine, vec![]);
        assert!(output.contains("division by zero"));
        assert!(output.contains("[00000]  mod r0 1 0"));
    }

    #[test]
    fn evaluate_applies_effects_without_moving() {
        let mut machine = Machine::from_words(&[21, 0]);
        machine.set_mode(Mode::Step);
        let (state_tx, state_rx) = channel();
        run_session(
            machine,
            vec![
                Command::Evaluate("set r3 77".parse().unwrap()),
                Command::GetState(state_tx),
            ],
        );
        let state = state_rx.recv().unwrap();
        assert_eq!(state.reg(3), 77);
        assert_eq!(state.pc(), 0);
    }

    #[test]
    fn evaluated_ret_on_an_empty_stack_leaves_the_session_alive() {
        let mut machine = Machine::from_words(&[21, 0]);
        machine.set_mode(Mode::Step);
        let (state_tx, state_rx) = channel();
        run_session(
            machine,
            vec![
                Command::Evaluate("ret".parse().unwrap()),
                Command::Evaluate("halt".parse().unwrap()),
                Command::Step,
                Command::GetState(state_tx),
            ],
        );
        let state = state_rx.recv().unwrap();
        assert!(!state.halted());
        assert_eq!(state.last_error(), None);
        assert_eq!(state.pc(), 1);
    }
}
