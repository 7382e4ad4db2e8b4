//! Error natives

use super::format_from;
use smx_core::{NativeError, NativeRegistry};

pub(super) fn register(registry: &mut NativeRegistry) {
    registry.register("ThrowError", |ctx, params| {
        let message = format_from(ctx, params, 0)?;
        Err(NativeError::raised(message))
    });

    registry.register("SetFailState", |ctx, params| {
        let message = format_from(ctx, params, 0)?;
        log::error!("plugin failed: {message}");
        Err(NativeError::raised(format!("plugin failed: {message}")))
    });
}
