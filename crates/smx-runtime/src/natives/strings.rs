//! String natives
//!
//! Buffers are plugin character arrays; every write is cut to the given
//! buffer length including the terminator, and returns the number of bytes
//! written.

use super::{buffer_len, cell_or, format_from};
use smx_bytecode::Cell;
use smx_core::{NativeError, NativeRegistry};
use std::cmp::Ordering;

pub(super) fn register(registry: &mut NativeRegistry) {
    registry.register("strlen", |ctx, params| {
        let bytes = ctx.machine().read_cstr(params.cell(0)?)?;
        Ok(bytes.len() as Cell)
    });

    registry.register("strcopy", |ctx, params| {
        let dest = params.cell(0)?;
        let maxlen = buffer_len(params, 1)?;
        let source = ctx.read_string(params.cell(2)?)?;
        Ok(ctx.write_string(dest, &source, maxlen)? as Cell)
    });

    registry.register("strcmp", |ctx, params| {
        let a = ctx.read_string(params.cell(0)?)?;
        let b = ctx.read_string(params.cell(1)?)?;
        let ordering = compare(&a, &b, cell_or(params, 2, 1) != 0);
        Ok(ordering as Cell)
    });

    registry.register("StrEqual", |ctx, params| {
        let a = ctx.read_string(params.cell(0)?)?;
        let b = ctx.read_string(params.cell(1)?)?;
        let equal = compare(&a, &b, cell_or(params, 2, 1) != 0) == Ordering::Equal;
        Ok(Cell::from(equal))
    });

    registry.register("Format", |ctx, params| {
        let dest = params.cell(0)?;
        let maxlen = buffer_len(params, 1)?;
        let text = format_from(ctx, params, 2)?;
        Ok(ctx.write_string(dest, &text, maxlen)? as Cell)
    });

    registry.register("IntToString", |ctx, params| {
        let value = params.cell(0)?;
        let dest = params.cell(1)?;
        let maxlen = buffer_len(params, 2)?;
        Ok(ctx.write_string(dest, &value.to_string(), maxlen)? as Cell)
    });

    registry.register("StringToInt", |ctx, params| {
        let text = ctx.read_string(params.cell(0)?)?;
        let base = cell_or(params, 1, 10);
        let radix = u32::try_from(base)
            .ok()
            .filter(|radix| (2..=36).contains(radix))
            .ok_or_else(|| NativeError::invalid_argument(1, format!("invalid base {base}")))?;
        Ok(parse_int(&text, radix))
    });

    registry.register("FloatToString", |ctx, params| {
        let value = params.float(0)?;
        let dest = params.cell(1)?;
        let maxlen = buffer_len(params, 2)?;
        Ok(ctx.write_string(dest, &format!("{value:.6}"), maxlen)? as Cell)
    });

    registry.register("StringToFloat", |ctx, params| {
        let text = ctx.read_string(params.cell(0)?)?;
        Ok(parse_float(&text).to_bits() as Cell)
    });
}

fn compare(a: &str, b: &str, case_sensitive: bool) -> Ordering {
    if case_sensitive {
        a.as_bytes().cmp(b.as_bytes())
    } else {
        let a = a.bytes().map(|c| c.to_ascii_lowercase());
        let b = b.bytes().map(|c| c.to_ascii_lowercase());
        a.cmp(b)
    }
}

/// Parse the leading integer of `text`; no digits yields 0
fn parse_int(text: &str, radix: u32) -> Cell {
    let text = text.trim_start();
    let (negative, rest) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let rest = match radix {
        16 => rest
            .strip_prefix("0x")
            .or_else(|| rest.strip_prefix("0X"))
            .unwrap_or(rest),
        _ => rest,
    };
    let mut value: Cell = 0;
    for digit in rest.chars().map_while(|c| c.to_digit(radix)) {
        value = value.wrapping_mul(radix as Cell).wrapping_add(digit as Cell);
    }
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Parse the longest leading float of `text`; no number yields 0.0
fn parse_float(text: &str) -> f32 {
    let text = text.trim_start();
    let candidate_len = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(text.len());
    let candidate = &text[..candidate_len];
    (1..=candidate.len())
        .rev()
        .find_map(|len| candidate[..len].parse::<f32>().ok())
        .unwrap_or(0.0)
}
