//! Virtual machine execution
//!
//! [`Machine`] holds the registers, memory and native bindings of one
//! running plugin. The fetch-decode-execute loop lives in the interpreter
//! module; this module exposes the host-facing state and calling API.

mod interpreter;
mod machine;

pub use machine::{Machine, MachineState, Registers, SavedState, MAX_REENTRANCY};
