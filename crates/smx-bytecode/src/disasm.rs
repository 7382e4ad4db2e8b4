//! Instruction stream decoding

use crate::format::{Cell, CELL_SIZE};
use crate::opcode::{Opcode, Operands};
use std::fmt;
use thiserror::Error;

/// Errors raised while walking an instruction stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisasmError {
    /// Cell does not hold a known opcode
    #[error("Invalid opcode {opcode:#x} at offset {offset:#x}")]
    InvalidOpcode {
        /// Raw opcode number
        opcode: u32,
        /// Code address
        offset: u32,
    },

    /// Operands run past the end of the code
    #[error("Truncated instruction {opcode} at offset {offset:#x}")]
    Truncated {
        /// The instruction
        opcode: Opcode,
        /// Code address
        offset: u32,
    },

    /// Legacy record with a self-described length
    #[error("Cannot decode variable-length {opcode} at offset {offset:#x}")]
    VariableLength {
        /// The instruction
        opcode: Opcode,
        /// Code address
        offset: u32,
    },
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Code address of the opcode cell
    pub offset: u32,
    /// Opcode
    pub opcode: Opcode,
    /// Operand cells
    pub operands: Vec<Cell>,
}

impl Instruction {
    /// Size of the instruction in bytes
    pub fn size(&self) -> u32 {
        (1 + self.operands.len() as u32) * CELL_SIZE
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}  {}", self.offset, self.opcode)?;
        for operand in &self.operands {
            write!(f, " {operand:#x}")?;
        }
        Ok(())
    }
}

/// Decode every instruction of `code`
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction>, DisasmError> {
    let cells: Vec<Cell> = code
        .chunks_exact(CELL_SIZE as usize)
        .map(|c| Cell::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut instructions = Vec::new();
    let mut index = 0usize;
    while index < cells.len() {
        let offset = index as u32 * CELL_SIZE;
        let raw = cells[index] as u32;
        let opcode = Opcode::from_cell(raw).ok_or(DisasmError::InvalidOpcode {
            opcode: raw,
            offset,
        })?;
        let count = match opcode.operands() {
            Operands::Fixed(count) => count as usize,
            Operands::CaseTable => {
                let cases = cells
                    .get(index + 1)
                    .ok_or(DisasmError::Truncated { opcode, offset })?;
                2 + 2 * usize::try_from(*cases)
                    .map_err(|_| DisasmError::Truncated { opcode, offset })?
            }
            Operands::Variable => return Err(DisasmError::VariableLength { opcode, offset }),
        };
        let operands = cells
            .get(index + 1..index + 1 + count)
            .ok_or(DisasmError::Truncated { opcode, offset })?
            .to_vec();
        instructions.push(Instruction {
            offset,
            opcode,
            operands,
        });
        index += 1 + count;
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CodeWriter;

    #[test]
    fn test_decode_simple_function() {
        let mut code = CodeWriter::new();
        code.begin_function();
        code.emit(Opcode::ConstPri, &[23]);
        code.emit(Opcode::Retn, &[]);
        let instructions = decode_instructions(&code.finish().unwrap()).unwrap();
        let opcodes: Vec<Opcode> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![Opcode::Halt, Opcode::Proc, Opcode::ConstPri, Opcode::Retn]
        );
        assert_eq!(instructions[2].operands, vec![23]);
        assert_eq!(instructions[2].to_string(), "0000000c  const.pri 0x17");
    }

    #[test]
    fn test_case_table_length() {
        let mut code = CodeWriter::new();
        let default = code.label();
        let one = code.label();
        code.emit_casetbl(default, &[(1, one), (2, one)]);
        code.bind(default).unwrap();
        code.bind(one).unwrap();
        code.emit(Opcode::Nop, &[]);
        let instructions = decode_instructions(&code.finish().unwrap()).unwrap();
        assert_eq!(instructions[1].operands.len(), 6);
        assert_eq!(instructions[2].opcode, Opcode::Nop);
    }

    #[test]
    fn test_invalid_opcode() {
        let code = 250i32.to_le_bytes();
        assert_eq!(
            decode_instructions(&code),
            Err(DisasmError::InvalidOpcode {
                opcode: 250,
                offset: 0
            })
        );
    }

    #[test]
    fn test_truncated_operands() {
        let code = Opcode::ConstPri.to_cell().to_le_bytes();
        assert!(matches!(
            decode_instructions(&code),
            Err(DisasmError::Truncated { .. })
        ));
    }
}
