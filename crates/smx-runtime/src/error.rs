//! Runtime error types.

use smx_bytecode::{FormatError, RttiError};
use smx_core::VmError;
use thiserror::Error;

/// Errors detected before any bytecode runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No public function with this name
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// No public function with this id
    #[error("Unknown function id {0}")]
    UnknownFunctionId(u32),

    /// Argument count does not match the signature
    #[error("Function '{function}' expects {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Function name
        function: String,
        /// Declared parameter count (minimum for variadic functions)
        expected: usize,
        /// Supplied argument count
        actual: usize,
    },

    /// Argument value does not fit the declared parameter type
    #[error("Argument {index} of '{function}': expected {expected}, got {actual}")]
    ArgumentType {
        /// Function name
        function: String,
        /// Zero-based argument position
        index: usize,
        /// Declared type
        expected: String,
        /// Kind of the supplied value
        actual: &'static str,
    },

    /// Pushed parameters and typed arguments used in the same call
    #[error("Function '{0}' has pushed parameters; typed arguments cannot be added")]
    MixedArguments(String),

    /// Signature required but the image has no type data for the function
    #[error("Function '{0}' has no type information")]
    MissingSignature(String),
}

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum Error {
    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Image rejected by the loader
    #[error("Invalid plugin image: {0}")]
    Format(#[from] FormatError),

    /// Type information could not be decoded
    #[error("Type error: {0}")]
    Rtti(#[from] RttiError),

    /// Call rejected before execution
    #[error(transparent)]
    Call(#[from] CallError),

    /// Execution failed
    #[error("Runtime error: {0}")]
    Vm(#[from] VmError),
}

impl Error {
    /// Execution error, if this is one
    pub fn as_vm(&self) -> Option<&VmError> {
        match self {
            Error::Vm(err) => Some(err),
            _ => None,
        }
    }
}
