//! `smx disasm` - print the decoded code section

use super::load_image;
use anyhow::Context;
use smx_bytecode::{decode_instructions, Opcode};
use std::path::Path;

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let instructions = decode_instructions(image.code()).context("failed to decode code section")?;

    for instruction in &instructions {
        if instruction.opcode == Opcode::Proc {
            if let Some(name) = image.lookup_function(instruction.offset) {
                println!();
                println!("{name}:");
            }
        }
        match native_name(&image, instruction.opcode, &instruction.operands) {
            Some(native) => println!("  {instruction}  ; {native}"),
            None => println!("  {instruction}"),
        }
    }
    Ok(())
}

/// Name of the native a `sysreq` instruction calls
fn native_name<'a>(
    image: &'a smx_bytecode::PluginImage,
    opcode: Opcode,
    operands: &[smx_bytecode::Cell],
) -> Option<&'a str> {
    match opcode {
        Opcode::SysreqC | Opcode::SysreqN => {
            let index = u32::try_from(*operands.first()?).ok()?;
            image.native(index)
        }
        _ => None,
    }
}
