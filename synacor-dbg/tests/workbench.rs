use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use synacor_dbg::{snapshot, spawn, Command, Sink};
use synacor_vm::{Machine, Mode, VmError, Word};

/// Receives sink chunks until `needle` has appeared `count` times.
fn wait_for(rx: &Receiver<Vec<u8>>, seen: &mut Vec<u8>, needle: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let text = String::from_utf8_lossy(seen);
        if text.matches(needle).count() >= count {
            return;
        }
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for controller output");
        let chunk = rx.recv_timeout(remaining).expect("controller hung up");
        seen.extend(chunk);
    }
}

#[test]
fn echoed_input_comes_back_in_program_order() {
    // in r0; out r0; jmp 0 -- echo everything fed to the machine.
    let machine = Machine::from_words(&[20, 32768, 19, 32768, 6, 0]);
    let (out_tx, out_rx) = channel();
    let (tx, handle) = spawn(machine, Sink::Channel(out_tx));

    tx.send(Command::Input("hello sailor".to_owned())).unwrap();
    let mut seen = Vec::new();
    wait_for(&out_rx, &mut seen, "hello sailor\n", 1);

    tx.send(Command::Shutdown).unwrap();
    handle.join().unwrap();
}

#[test]
fn a_live_session_can_be_paused_patched_and_resumed() {
    // 0: noop; 1: noop; 2: out 'x'; 4: jmp 2
    let mut machine = Machine::from_words(&[21, 21, 19, 120, 6, 2]);
    machine.add_breakpoint(2);
    let (out_tx, out_rx) = channel();
    let (tx, handle) = spawn(machine, Sink::Channel(out_tx));

    // First arrival pauses before anything is printed.
    let mut seen = Vec::new();
    wait_for(&out_rx, &mut seen, "breakpoint at 2", 1);
    assert!(!seen.contains(&b'x'));

    let (state_tx, state_rx) = channel();
    tx.send(Command::GetState(state_tx)).unwrap();
    let state = state_rx.recv().unwrap();
    assert_eq!(state.pc(), 2);
    assert_eq!(state.mode(), Mode::Step);

    // Patch the operand, resume, and watch the patched byte come out
    // before the breakpoint trips on the next lap.
    tx.send(Command::Poke(3, Word::from(b'y'))).unwrap();
    tx.send(Command::Continue).unwrap();
    wait_for(&out_rx, &mut seen, "breakpoint at 2", 2);
    let text = String::from_utf8_lossy(&seen);
    assert!(text.contains('y'));
    assert!(!text.contains('x'));

    tx.send(Command::Shutdown).unwrap();
    handle.join().unwrap();
}

#[test]
fn annotations_show_up_in_peek_and_backtrace() {
    // 0: call 3; 2: halt; 3: jmp 3
    let mut machine = Machine::from_words(&[17, 3, 0, 6, 3]);
    machine.annotate(0, "spin forever");
    machine.set_mode(Mode::Step);
    let (out_tx, out_rx) = channel();
    let (tx, handle) = spawn(machine, Sink::Channel(out_tx));

    tx.send(Command::Step).unwrap();
    tx.send(Command::Backtrace).unwrap();
    tx.send(Command::Peek(0)).unwrap();
    let mut seen = Vec::new();
    wait_for(&out_rx, &mut seen, "spin forever", 2);
    let text = String::from_utf8_lossy(&seen);
    assert!(text.contains("#0 [00000]  call 3"));
    assert!(text.contains("[00000]  17"));

    tx.send(Command::Shutdown).unwrap();
    handle.join().unwrap();
}

#[test]
fn snapshot_round_trip_preserves_everything_but_mode() {
    // 0: call 5; 2: halt; 5: push 123; 7: pop r0; 9: ret
    let mut machine = Machine::from_words(&[17, 5, 0, 0, 0, 2, 123, 3, 32768, 18]);
    machine.annotate(0, "entry call");
    let mut out = vec![];
    machine.step(&mut out).unwrap(); // call 5
    machine.step(&mut out).unwrap(); // push 123
    machine.set_register(7, 25734);
    machine.push_input(b"use teleporter\n");
    machine.add_breakpoint(2);
    machine.set_mode(Mode::Run);

    let path = Path::new(env!("CARGO_TARGET_TMPDIR")).join("roundtrip.snap");
    snapshot::save(&path, &machine).unwrap();
    let restored = snapshot::load(&path).unwrap();

    let mut expected = machine.clone();
    expected.set_mode(Mode::Step);
    assert_eq!(restored, expected);
}

#[test]
fn an_error_halt_survives_a_snapshot() {
    // mod r0 1 0 -- halts on a division by zero.
    let mut machine = Machine::from_words(&[11, 32768, 1, 0]);
    let mut out = vec![];
    assert!(machine.step(&mut out).is_err());
    assert!(machine.halted());

    let path = Path::new(env!("CARGO_TARGET_TMPDIR")).join("errored.snap");
    snapshot::save(&path, &machine).unwrap();
    let restored = snapshot::load(&path).unwrap();
    assert!(restored.halted());
    assert_eq!(restored.last_error(), Some(VmError::DivisionByZero));
}

#[test]
fn loading_garbage_is_rejected() {
    let path = Path::new(env!("CARGO_TARGET_TMPDIR")).join("garbage.snap");
    std::fs::write(&path, b"not a snapshot").unwrap();
    assert!(snapshot::load(&path).is_err());

    let missing = Path::new(env!("CARGO_TARGET_TMPDIR")).join("nope.snap");
    assert!(snapshot::load(&missing).is_err());
}

#[test]
fn a_saved_session_resumes_where_it_left_off() {
    // out 'a'; out 'b'; halt -- save between the two outs.
    let mut machine = Machine::from_words(&[19, 97, 19, 98, 0]);
    let mut out = vec![];
    machine.step(&mut out).unwrap();
    assert_eq!(out, b"a");

    let path = Path::new(env!("CARGO_TARGET_TMPDIR")).join("midway.snap");
    snapshot::save(&path, &machine).unwrap();

    let mut restored = snapshot::load(&path).unwrap();
    let mut out = vec![];
    while !restored.halted() {
        restored.step(&mut out).unwrap();
    }
    assert_eq!(out, b"b");
}
