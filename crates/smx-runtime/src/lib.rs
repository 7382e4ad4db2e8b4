//! smx plugin runtime
//!
//! The embedding surface over [`smx_core`]:
//! - [`Plugin`]: loads an image, owns its Machine and calls its publics
//! - Typed calls: host [`Value`]s marshalled through the image's type
//!   information, with copy-back of references, strings and arrays
//! - Manual calls: parameters pushed onto a [`Function`] one by one
//! - Standard natives: console, errors, strings, floats and handles
//!   ([`natives::register_std_natives`])
//!
//! # Example
//!
//! ```ignore
//! use smx_runtime::{Plugin, Value};
//!
//! let mut plugin = Plugin::load_file("hello.smx")?;
//! plugin.run()?;
//! let result = plugin.call("Add", &[Value::Int(2), Value::Int(3)])?;
//! print!("{}", plugin.take_console_output());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
mod marshal;
pub mod natives;
pub mod options;
pub mod param;
pub mod plugin;

pub use error::{CallError, Error};
pub use natives::register_std_natives;
pub use options::RuntimeOptions;
pub use param::{Param, ParamData, ParamKind, ParamList};
pub use plugin::{
    CallResult, Function, FunctionSummary, NativeSummary, Plugin, PluginSummary, PLUGIN_START,
};
pub use smx_bytecode::Value;
