//! smx virtual machine core
//!
//! This crate provides the execution side of the plugin runtime:
//! - Register-based bytecode interpreter ([`Machine`])
//! - Flat memory model shared by data, heap and stack ([`Memory`])
//! - Native function boundary ([`NativeRegistry`], [`NativeContext`])
//! - Opaque handle table for host objects ([`HandleTable`])
//!
//! A [`Machine`] exclusively owns its memory and registers. The loaded
//! image is shared read-only through an `Arc`, so any number of machines
//! may execute the same plugin on different threads.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod memory;
pub mod native;
pub mod options;
pub mod vm;

pub use error::{Fault, NativeError, RuntimeError, StackFrame, StackTrace, VmError};
pub use memory::{DataAddr, HeapAddr, Memory};
pub use native::{
    HandleError, HandleTable, NativeArg, NativeContext, NativeEntry, NativeFn, NativeParams,
    NativeRegistry, NativeSignature, ParamKind, SignatureError,
};
pub use options::{ResourceLimits, VmOptions};
pub use vm::{Machine, MachineState, Registers, SavedState};

/// Result of executing bytecode
pub type VmResult<T> = Result<T, VmError>;
