//! Console natives

use super::format_from;
use smx_core::NativeRegistry;

pub(super) fn register(registry: &mut NativeRegistry) {
    registry.register("PrintToServer", |ctx, params| {
        let text = format_from(ctx, params, 0)?;
        ctx.console_write(&text);
        ctx.console_write("\n");
        Ok(0)
    });

    // The client index is ignored; all output goes to the one console
    registry.register("PrintToConsole", |ctx, params| {
        let text = format_from(ctx, params, 1)?;
        ctx.console_write(&text);
        ctx.console_write("\n");
        Ok(0)
    });

    registry.register("LogMessage", |ctx, params| {
        let text = format_from(ctx, params, 0)?;
        log::info!("{text}");
        ctx.console_write(&text);
        ctx.console_write("\n");
        Ok(0)
    });

    registry.register("LogError", |ctx, params| {
        let text = format_from(ctx, params, 0)?;
        log::error!("{text}");
        ctx.console_write(&text);
        ctx.console_write("\n");
        Ok(0)
    });
}
