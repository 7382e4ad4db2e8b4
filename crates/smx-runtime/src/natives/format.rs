//! printf-style formatting for the format natives
//!
//! Supported conversions: `%d %i %u %x %X %b %c %s %f %%`, with the `-`
//! and `0` flags, a field width and a precision (`%.2f`, `%.3s`).
//! Arguments arrive by address, as variadic arguments do.

use smx_bytecode::Cell;
use smx_core::{NativeContext, NativeError};
use std::iter::Peekable;
use std::str::Chars;

/// Largest accepted field width or precision
pub const MAX_FIELD: usize = 4096;

/// Where formatted arguments are read from
pub trait FormatSource {
    /// Cell at `addr`
    fn cell(&self, addr: Cell) -> Result<Cell, NativeError>;
    /// NUL-terminated string at `addr`
    fn string(&self, addr: Cell) -> Result<String, NativeError>;
}

impl FormatSource for NativeContext<'_> {
    fn cell(&self, addr: Cell) -> Result<Cell, NativeError> {
        self.read_cell(addr)
    }

    fn string(&self, addr: Cell) -> Result<String, NativeError> {
        self.read_string(addr)
    }
}

#[derive(Default)]
struct Spec {
    left: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    fn pad(&self, out: &mut String, body: &str, numeric: bool) {
        let len = body.chars().count();
        if len >= self.width {
            out.push_str(body);
            return;
        }
        let fill = self.width - len;
        if self.left {
            out.push_str(body);
            out.extend(std::iter::repeat(' ').take(fill));
        } else if self.zero && numeric {
            let (sign, digits) = match body.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", body),
            };
            out.push_str(sign);
            out.extend(std::iter::repeat('0').take(fill));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat(' ').take(fill));
            out.push_str(body);
        }
    }
}

/// Format `format` with `args`, each the address of one argument
pub fn format_string(
    source: &dyn FormatSource,
    format: &str,
    args: &[Cell],
) -> Result<String, NativeError> {
    let mut out = String::with_capacity(format.len());
    let mut next_arg = 0usize;
    let mut chars = format.chars().peekable();

    let take_arg = |next_arg: &mut usize| -> Result<Cell, NativeError> {
        let addr = args.get(*next_arg).copied().ok_or_else(|| {
            NativeError::raised(format!(
                "String formatted incorrectly - parameter {} (total {})",
                *next_arg + 1,
                args.len()
            ))
        })?;
        *next_arg += 1;
        Ok(addr)
    };

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = field(&mut chars, "width")?;
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(field(&mut chars, "precision")?);
        }

        let Some(conversion) = chars.next() else {
            out.push('%');
            break;
        };
        match conversion {
            '%' => out.push('%'),
            'd' | 'i' => {
                let value = source.cell(take_arg(&mut next_arg)?)?;
                spec.pad(&mut out, &value.to_string(), true);
            }
            'u' => {
                let value = source.cell(take_arg(&mut next_arg)?)? as u32;
                spec.pad(&mut out, &value.to_string(), true);
            }
            'x' => {
                let value = source.cell(take_arg(&mut next_arg)?)? as u32;
                spec.pad(&mut out, &format!("{value:x}"), true);
            }
            'X' => {
                let value = source.cell(take_arg(&mut next_arg)?)? as u32;
                spec.pad(&mut out, &format!("{value:X}"), true);
            }
            'b' => {
                let value = source.cell(take_arg(&mut next_arg)?)? as u32;
                spec.pad(&mut out, &format!("{value:b}"), true);
            }
            'c' => {
                let value = source.cell(take_arg(&mut next_arg)?)? as u32;
                let ch = char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER);
                spec.pad(&mut out, ch.encode_utf8(&mut [0; 4]), false);
            }
            's' => {
                let text = source.string(take_arg(&mut next_arg)?)?;
                let text = match spec.precision {
                    Some(max) => text.chars().take(max).collect(),
                    None => text,
                };
                spec.pad(&mut out, &text, false);
            }
            'f' => {
                let cell = source.cell(take_arg(&mut next_arg)?)?;
                let value = f32::from_bits(cell as u32);
                let precision = spec.precision.unwrap_or(6);
                spec.pad(&mut out, &format!("{value:.precision$}"), true);
            }
            other => {
                // Unknown conversions are copied through
                out.push('%');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Parse the digits of a width or precision, at most [`MAX_FIELD`]
fn field(chars: &mut Peekable<Chars<'_>>, what: &str) -> Result<usize, NativeError> {
    let mut value = 0usize;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit as usize))
            .filter(|&v| v <= MAX_FIELD)
            .ok_or_else(|| NativeError::raised(format!("format {what} exceeds {MAX_FIELD}")))?;
        chars.next();
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Arguments stored by fake address
    #[derive(Default)]
    struct Args {
        cells: HashMap<Cell, Cell>,
        strings: HashMap<Cell, String>,
    }

    impl FormatSource for Args {
        fn cell(&self, addr: Cell) -> Result<Cell, NativeError> {
            self.cells
                .get(&addr)
                .copied()
                .ok_or_else(|| NativeError::raised("bad address"))
        }

        fn string(&self, addr: Cell) -> Result<String, NativeError> {
            self.strings
                .get(&addr)
                .cloned()
                .ok_or_else(|| NativeError::raised("bad address"))
        }
    }

    fn format_with(format: &str, cells: &[Cell]) -> String {
        let mut args = Args::default();
        let addrs: Vec<Cell> = (0..cells.len() as Cell).map(|i| 100 + i * 4).collect();
        for (addr, value) in addrs.iter().zip(cells) {
            args.cells.insert(*addr, *value);
        }
        format_string(&args, format, &addrs).unwrap()
    }

    #[test]
    fn test_integers() {
        assert_eq!(format_with("%d + %i", &[-3, 7]), "-3 + 7");
        assert_eq!(format_with("%u", &[-1]), "4294967295");
        assert_eq!(format_with("%x %X", &[255, 255]), "ff FF");
        assert_eq!(format_with("%b", &[5]), "101");
        assert_eq!(format_with("%c%c", &['h' as Cell, 'i' as Cell]), "hi");
    }

    #[test]
    fn test_width_and_flags() {
        assert_eq!(format_with("[%5d]", &[42]), "[   42]");
        assert_eq!(format_with("[%-5d]", &[42]), "[42   ]");
        assert_eq!(format_with("[%05d]", &[-42]), "[-0042]");
        assert_eq!(format_with("[%04x]", &[10]), "[000a]");
    }

    #[test]
    fn test_floats() {
        let bits = |f: f32| f.to_bits() as Cell;
        assert_eq!(format_with("%f", &[bits(1.5)]), "1.500000");
        assert_eq!(format_with("%.2f", &[bits(-0.125)]), "-0.12");
        assert_eq!(format_with("%.0f", &[bits(3.0)]), "3");
    }

    #[test]
    fn test_strings() {
        let mut args = Args::default();
        args.strings.insert(8, "world".into());
        assert_eq!(format_string(&args, "hello %s!", &[8]).unwrap(), "hello world!");
        assert_eq!(format_string(&args, "%.3s|%-7s|", &[8, 8]).unwrap(), "wor|world  |");
    }

    #[test]
    fn test_percent_and_unknown() {
        assert_eq!(format_with("100%%", &[]), "100%");
        assert_eq!(format_with("%q", &[]), "%q");
        assert_eq!(format_with("trailing %", &[]), "trailing %");
    }

    #[test]
    fn test_field_limits() {
        assert_eq!(format_with("%4096d", &[1]).len(), MAX_FIELD);
        let err = format_string(&Args::default(), "%200000000d", &[]).unwrap_err();
        assert_eq!(err.to_string(), "format width exceeds 4096");
        let err = format_string(&Args::default(), "%.99999999999999999999999f", &[]).unwrap_err();
        assert_eq!(err.to_string(), "format precision exceeds 4096");
    }

    #[test]
    fn test_missing_argument() {
        let err = format_string(&Args::default(), "%d %d", &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "String formatted incorrectly - parameter 1 (total 0)"
        );
    }
}
