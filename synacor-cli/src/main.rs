use std::io::{BufRead, Read};
use std::path::PathBuf;

use synacor_dbg::{spawn, Command, Sink};
use synacor_vm::{disasm, Machine, Mode, Word};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

/// Synacor challenge workbench
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Program image to load and execute
    bin: PathBuf,

    /// Start paused in step mode
    #[clap(long)]
    step: bool,

    /// Restore a machine snapshot before starting
    #[clap(long)]
    load: Option<PathBuf>,

    /// Print the annotated disassembly listing and exit
    #[clap(long)]
    disassemble: bool,
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("SYNACOR_LOG", "info")
        .write_style_or("SYNACOR_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let mut f = std::fs::File::open(&args.bin)
        .with_context(|| format!("failed to open {:?}", args.bin))?;
    let mut image = vec![];
    f.read_to_end(&mut image).context("failed to read file")?;

    let mut machine = Machine::load_image(&image);
    if let Some(path) = &args.load {
        machine = synacor_dbg::snapshot::load(path)
            .with_context(|| format!("failed to restore {path:?}"))?;
        info!("restored snapshot from {}", path.display());
    }

    if args.disassemble {
        let listing = disasm::disassemble(machine.memory(), machine.annotations());
        print!("{listing}");
        return Ok(());
    }

    if args.step {
        machine.set_mode(Mode::Step);
    }

    let (tx, handle) = spawn(machine, Sink::Stdout);

    // Blocking loop over stdin; `.`-prefixed lines are debugger commands,
    // everything else is program input.
    let stdin = std::io::stdin().lock();
    for line in stdin.lines() {
        let line = line.context("failed to read stdin")?;
        let cmd = match line.strip_prefix('.') {
            Some(rest) => match parse_command(rest) {
                Ok(cmd) => cmd,
                Err(msg) => {
                    eprintln!("{msg}");
                    continue;
                }
            },
            None => Command::Input(line),
        };
        let quitting = matches!(cmd, Command::Shutdown);
        if tx.send(cmd).is_err() || quitting {
            break;
        }
    }

    drop(tx);
    let _ = handle.join();
    Ok(())
}

/// Parses one `.`-stripped command line.
fn parse_command(line: &str) -> Result<Command, String> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().unwrap_or("");
    let rest: Vec<&str> = tokens.collect();

    let word = |tok: &str| -> Result<Word, String> {
        tok.parse::<Word>().map_err(|_| format!("not an address: {tok:?}"))
    };

    let cmd = match name {
        "run" | "continue" | "c" => Command::Continue,
        "step" | "s" => Command::Step,
        "next" | "n" => Command::Next,
        "up" => Command::Up,
        "ret" => Command::Ret,
        "break" | "b" => match rest.first() {
            Some(tok) => Command::AddBreak(word(tok)?),
            None => Command::Break,
        },
        "clear" => Command::ClearBreaks,
        "bt" => Command::Backtrace,
        "peek" => match rest.first() {
            Some(tok) => Command::Peek(word(tok)?),
            None => return Err("usage: .peek <addr>".to_owned()),
        },
        "poke" => match rest.as_slice() {
            [addr, value] => Command::Poke(word(addr)?, word(value)?),
            _ => return Err("usage: .poke <addr> <value>".to_owned()),
        },
        "set" => match rest.as_slice() {
            [reg, value] => {
                let reg = reg.trim_start_matches('r');
                let r = reg.parse::<u8>().map_err(|_| format!("not a register: {reg:?}"))?;
                Command::SetRegister(r, word(value)?)
            }
            _ => return Err("usage: .set <reg> <value>".to_owned()),
        },
        "note" => match rest.as_slice() {
            [] => return Err("usage: .note [addr] <text>".to_owned()),
            [first, text @ ..] => match first.parse::<Word>() {
                Ok(addr) => Command::Annotate { addr: Some(addr), note: text.join(" ") },
                Err(_) => Command::Annotate { addr: None, note: rest.join(" ") },
            },
        },
        "eval" => {
            let text = rest.join(" ");
            let instr = text.parse().map_err(|e| format!("eval: {e}"))?;
            Command::Evaluate(instr)
        }
        "save" => match rest.first() {
            Some(path) => Command::Save(PathBuf::from(path)),
            None => return Err("usage: .save <path>".to_owned()),
        },
        "load" => match rest.first() {
            Some(path) => Command::Load(PathBuf::from(path)),
            None => return Err("usage: .load <path>".to_owned()),
        },
        "dis" => Command::Disassemble(rest.first().map(PathBuf::from)),
        "quit" | "q" => Command::Shutdown,
        other => {
            return Err(format!(
                "unknown command {other:?}; try .step .next .continue .break \
                 .clear .bt .up .ret .peek .poke .set .note .eval .save .load \
                 .dis .quit"
            ))
        }
    };
    Ok(cmd)
}
