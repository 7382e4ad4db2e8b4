//! Execution errors
//!
//! A [`Fault`] is the bare reason an instruction could not complete. The
//! interpreter wraps it into a [`RuntimeError`] carrying the code address,
//! the opcode and a [`StackTrace`]. Errors raised by host natives travel as
//! [`NativeError`] and surface as [`VmError::Native`] so that hosts can tell
//! "the plugin asked to fail" apart from "the bytecode is broken".

use crate::native::HandleError;
use smx_bytecode::{Cell, Opcode};
use std::fmt;
use thiserror::Error;

/// Reason an instruction failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Opcode number unknown or deliberately unimplemented
    #[error("Unsupported opcode {0}")]
    UnsupportedOpcode(u32),

    /// Opcode only produced by obsolete compilers
    #[error("Deprecated opcode {0}")]
    DeprecatedOpcode(Opcode),

    /// Opcode that must never be executed directly
    #[error("Invalid instruction {0}")]
    InvalidInstruction(Opcode),

    /// Memory access outside the data segment, the used heap or the stack
    #[error("Invalid memory address {0:#x}")]
    InvalidAddress(Cell),

    /// Jump target misaligned or outside the code segment
    #[error("Invalid jump target {0:#x}")]
    InvalidJump(Cell),

    /// Control register number not known to `lctrl`/`sctrl`
    #[error("Invalid control register {0}")]
    InvalidRegister(Cell),

    /// Integer division by zero
    #[error("Division by zero")]
    DivideByZero,

    /// Stack grew into the heap
    #[error("Stack overflow")]
    StackOverflow,

    /// Pop past the stack top
    #[error("Stack underflow")]
    StackUnderflow,

    /// Heap grew into the stack
    #[error("Heap overflow")]
    HeapOverflow,

    /// Heap released below its base
    #[error("Heap underflow")]
    HeapUnderflow,

    /// `bounds` check failed
    #[error("Array index {index} out of bounds (limit {limit})")]
    ArrayBounds {
        /// Index tested
        index: Cell,
        /// Inclusive upper bound
        limit: Cell,
    },

    /// Native index past the image's native table
    #[error("Invalid native index {0}")]
    InvalidNativeIndex(u32),

    /// Native present in the image but not registered by the host
    #[error("Native '{0}' is not implemented")]
    NativeNotImplemented(String),

    /// Instruction pointer left the code segment
    #[error("Execution ran off the end of the code at {0:#x}")]
    RanOffEnd(u32),

    /// Cooperative step budget used up
    #[error("Step budget of {0} instructions exceeded")]
    StepBudgetExceeded(u64),

    /// Too many nested `call` frames
    #[error("Call depth limit exceeded")]
    CallDepthExceeded,

    /// Too many nested host invocations
    #[error("Re-entrancy limit exceeded")]
    ReentrancyLimit,

    /// `genarray` with a non-positive or oversized dimension
    #[error("Invalid array size")]
    InvalidArraySize,

    /// String without a terminating NUL before the end of memory
    #[error("Unterminated string")]
    UnterminatedString,
}

/// One frame of a reconstructed call stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Code address executing in this frame
    pub cip: u32,
    /// Function name from debug or RTTI tables
    pub function: Option<String>,
    /// Source file, when debug info is present
    pub file: Option<String>,
    /// Source line, when debug info is present
    pub line: Option<u32>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} ", self.cip)?;
        match &self.function {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "<unknown>")?,
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " ({file}:{line})"),
            (Some(file), None) => write!(f, " ({file})"),
            _ => Ok(()),
        }
    }
}

/// Call stack at the point of a failure, innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// Frames, innermost first
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Innermost frame
    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Check if no frame could be reconstructed
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  [{depth}] {frame}")?;
        }
        Ok(())
    }
}

/// A fault with the context it happened in
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{fault} at {cip:#x}{}", .opcode.map(|op| format!(" ({op})")).unwrap_or_default())]
pub struct RuntimeError {
    /// What went wrong
    pub fault: Fault,
    /// Code address of the failing instruction
    pub cip: u32,
    /// Failing opcode, if it could be decoded
    pub opcode: Option<Opcode>,
    /// Call stack at the failure
    pub trace: StackTrace,
}

/// Error returned from executing bytecode
#[derive(Debug, Error)]
pub enum VmError {
    /// Interpreter fault
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A native returned an error
    #[error("Native '{native}' failed: {error}")]
    Native {
        /// Native name
        native: String,
        /// Error raised by the native
        #[source]
        error: NativeError,
        /// Call stack at the `sysreq`
        trace: StackTrace,
    },
}

impl VmError {
    /// Stack trace attached to the error
    pub fn trace(&self) -> &StackTrace {
        match self {
            VmError::Runtime(err) => &err.trace,
            VmError::Native { trace, .. } => trace,
        }
    }

    /// The interpreter fault, if this is one
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            VmError::Runtime(err) => Some(&err.fault),
            VmError::Native { .. } => None,
        }
    }
}

/// Error raised by a native implementation
#[derive(Debug, Error)]
pub enum NativeError {
    /// Explicit error raised by host library code
    #[error("{0}")]
    Raised(String),

    /// Argument missing or of the wrong shape
    #[error("Invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Zero-based argument index
        index: usize,
        /// Description of the problem
        reason: String,
    },

    /// Handle lookup failed
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// Memory access through a plugin address failed
    #[error("Memory access failed: {0}")]
    Memory(#[from] Fault),

    /// Nested call back into the plugin failed
    #[error("Nested call failed: {0}")]
    Call(Box<VmError>),
}

impl NativeError {
    /// Shorthand for [`NativeError::Raised`]
    pub fn raised(message: impl Into<String>) -> Self {
        NativeError::Raised(message.into())
    }

    /// Shorthand for [`NativeError::InvalidArgument`]
    pub fn invalid_argument(index: usize, reason: impl Into<String>) -> Self {
        NativeError::InvalidArgument {
            index,
            reason: reason.into(),
        }
    }
}

impl From<VmError> for NativeError {
    fn from(err: VmError) -> Self {
        NativeError::Call(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError {
            fault: Fault::DivideByZero,
            cip: 0x1c,
            opcode: Some(Opcode::Sdiv),
            trace: StackTrace::default(),
        };
        assert_eq!(err.to_string(), "Division by zero at 0x1c (sdiv)");
    }

    #[test]
    fn test_stack_frame_display() {
        let frame = StackFrame {
            cip: 0x20,
            function: Some("OnPluginStart".into()),
            file: Some("test.sp".into()),
            line: Some(7),
        };
        assert_eq!(frame.to_string(), "0x00000020 OnPluginStart (test.sp:7)");
    }

    #[test]
    fn test_native_error_wraps_vm_error() {
        let inner = VmError::Runtime(RuntimeError {
            fault: Fault::StackOverflow,
            cip: 0,
            opcode: None,
            trace: StackTrace::default(),
        });
        let err = NativeError::from(inner);
        assert!(matches!(err, NativeError::Call(_)));
        assert!(err.to_string().contains("Stack overflow"));
    }
}
