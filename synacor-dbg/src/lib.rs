//! Interactive debugging workbench for the Synacor VM.
//!
//! The [`Controller`] is the single owner of a live [`synacor_vm::Machine`]:
//! it serialises commands from an mpsc channel, drives the interpreter,
//! services breakpoints and watch modes, and forwards program output to the
//! terminal collaborator. [`snapshot`] saves and restores the whole machine.
#![warn(missing_docs)]

pub mod controller;
pub mod snapshot;

pub use controller::{spawn, Command, Controller, Sink};
pub use snapshot::SnapshotError;
