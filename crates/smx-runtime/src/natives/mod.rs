//! Standard native groups
//!
//! Registers the natives most plugins import, by their source-level names
//! (e.g. `PrintToServer`, `FloatMul`, `CreateArray`), into a
//! [`NativeRegistry`]. Each group has its own registration function;
//! [`register_std_natives`] registers all of them.

mod console;
mod errors;
mod floats;
pub mod format;
mod handles;
mod strings;

pub use format::{format_string, FormatSource, MAX_FIELD};
pub use handles::{ArrayList, ARRAY_LIST_TAG};

use smx_bytecode::Cell;
use smx_core::{NativeContext, NativeError, NativeParams, NativeRegistry};

/// Register every standard native group into `registry`
///
/// Natives registered earlier under the same names are replaced.
pub fn register_std_natives(registry: &mut NativeRegistry) {
    console::register(registry);
    errors::register(registry);
    strings::register(registry);
    floats::register(registry);
    handles::register(registry);
    log::trace!("registered standard natives ({} total)", registry.len());
}

/// Format the string at argument `index` with the arguments after it
fn format_from(
    ctx: &NativeContext<'_>,
    params: &NativeParams,
    index: usize,
) -> Result<String, NativeError> {
    let format = ctx.read_string(params.cell(index)?)?;
    let args = params.args().get(index + 1..).unwrap_or_default();
    format_string(ctx, &format, args)
}

/// Buffer length at argument `index`
fn buffer_len(params: &NativeParams, index: usize) -> Result<usize, NativeError> {
    let len = params.cell(index)?;
    usize::try_from(len)
        .map_err(|_| NativeError::invalid_argument(index, format!("invalid buffer length {len}")))
}

/// Optional argument with a default
fn cell_or(params: &NativeParams, index: usize, default: Cell) -> Cell {
    params.get(index).unwrap_or(default)
}
