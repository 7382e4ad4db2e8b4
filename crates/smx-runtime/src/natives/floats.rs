//! Float natives
//!
//! Floats travel as binary32 bit patterns in cells.

use smx_bytecode::Cell;
use smx_core::NativeRegistry;

fn to_cell(value: f32) -> Cell {
    value.to_bits() as Cell
}

fn unary(registry: &mut NativeRegistry, name: &str, op: fn(f32) -> Cell) {
    registry.register(name, move |_ctx, params| Ok(op(params.float(0)?)));
}

fn binary(registry: &mut NativeRegistry, name: &str, op: fn(f32, f32) -> f32) {
    registry.register(name, move |_ctx, params| {
        Ok(to_cell(op(params.float(0)?, params.float(1)?)))
    });
}

pub(super) fn register(registry: &mut NativeRegistry) {
    registry.register("float", |_ctx, params| Ok(to_cell(params.cell(0)? as f32)));

    binary(registry, "FloatMul", |a, b| a * b);
    binary(registry, "FloatDiv", |a, b| a / b);
    binary(registry, "FloatAdd", |a, b| a + b);
    binary(registry, "FloatSub", |a, b| a - b);
    binary(registry, "Pow", f32::powf);

    unary(registry, "FloatFraction", |x| to_cell(x - x.floor()));
    unary(registry, "FloatAbs", |x| to_cell(x.abs()));
    unary(registry, "SquareRoot", |x| to_cell(x.sqrt()));
    unary(registry, "RoundToNearest", |x| (x + 0.5).floor() as Cell);
    unary(registry, "RoundToFloor", |x| x.floor() as Cell);
    unary(registry, "RoundToCeil", |x| x.ceil() as Cell);
    unary(registry, "RoundToZero", |x| x.trunc() as Cell);

    registry.register("FloatCompare", |_ctx, params| {
        let (a, b) = (params.float(0)?, params.float(1)?);
        let result = if a > b {
            1
        } else if a < b {
            -1
        } else {
            0
        };
        Ok(result)
    });
}
