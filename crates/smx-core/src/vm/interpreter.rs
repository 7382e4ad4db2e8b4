//! Fetch-decode-execute loop
//!
//! Each step reads the opcode cell at `CIP`, masks off packed immediates,
//! decodes it through the fixed opcode table and dispatches with a `match`.
//! Operands follow the opcode cell and are consumed with [`Machine::operand`].

use super::machine::{Machine, MachineState};
use crate::error::{Fault, NativeError, VmError};
use crate::memory::HeapAddr;
use crate::native::{NativeContext, NativeParams};
use crate::VmResult;
use smx_bytecode::opcode::{OpcodeStatus, OPCODE_MASK};
use smx_bytecode::{Cell, Opcode, CELL_SIZE};
use std::cmp::Ordering;

/// Why a step stopped
enum Trap {
    Fault(Fault),
    Native { native: String, error: NativeError },
}

impl From<Fault> for Trap {
    fn from(fault: Fault) -> Self {
        Trap::Fault(fault)
    }
}

/// Source of the values pushed by the batched `pushN` family
#[derive(Clone, Copy)]
enum PushSource {
    /// Operand itself
    Const,
    /// Cell at the operand address
    Addr,
    /// Cell at `FRM + operand`
    Frame,
    /// Address `FRM + operand`
    FrameAddr,
}

#[inline]
fn to_float(cell: Cell) -> f32 {
    f32::from_bits(cell as u32)
}

#[inline]
fn from_float(value: f32) -> Cell {
    value.to_bits() as Cell
}

/// Signed division rounding the quotient toward negative infinity
///
/// The remainder takes the sign of the divisor.
pub(crate) fn floor_divmod(dividend: Cell, divisor: Cell) -> Result<(Cell, Cell), Fault> {
    if divisor == 0 {
        return Err(Fault::DivideByZero);
    }
    let mut quotient = dividend.wrapping_div(divisor);
    let mut remainder = dividend.wrapping_rem(divisor);
    if remainder != 0 && (remainder < 0) != (divisor < 0) {
        quotient = quotient.wrapping_sub(1);
        remainder = remainder.wrapping_add(divisor);
    }
    Ok((quotient, remainder))
}

impl Machine {
    /// Step until the Machine leaves the running state
    pub(super) fn run(&mut self) -> VmResult<()> {
        while self.state == MachineState::Running {
            let cip = self.cip;
            let mut opcode = None;
            if let Err(trap) = self.step(&mut opcode) {
                self.state = MachineState::Halted;
                return Err(match trap {
                    Trap::Fault(fault) => self.runtime_error(fault, cip, opcode),
                    Trap::Native { native, error } => {
                        log::debug!("native '{native}' failed at {cip:#x}: {error}");
                        VmError::Native {
                            native,
                            error,
                            trace: self.stack_trace(cip),
                        }
                    }
                });
            }
        }
        Ok(())
    }

    #[inline]
    fn code_cell(&self, addr: u32) -> Result<Cell, Fault> {
        let start = addr as usize;
        self.image
            .code()
            .get(start..start + CELL_SIZE as usize)
            .map(|b| Cell::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(Fault::RanOffEnd(addr))
    }

    /// Read the next operand cell
    #[inline]
    fn operand(&mut self) -> Result<Cell, Fault> {
        let value = self.code_cell(self.cip)?;
        self.cip += CELL_SIZE;
        Ok(value)
    }

    #[inline]
    fn frame_addr(&self, offset: Cell) -> Cell {
        self.memory.heap_to_vm(self.frm).wrapping_add(offset)
    }

    #[inline]
    fn heap_vm(&self, addr: HeapAddr) -> Cell {
        self.memory.heap_to_vm(addr)
    }

    #[inline]
    fn jump(&mut self, target: Cell) -> Result<(), Fault> {
        self.check_jump(target)?;
        self.cip = target as u32;
        Ok(())
    }

    #[inline]
    fn jump_if(&mut self, condition: bool) -> Result<(), Fault> {
        let target = self.operand()?;
        if condition {
            self.jump(target)?;
        }
        Ok(())
    }

    fn step(&mut self, current: &mut Option<Opcode>) -> Result<(), Trap> {
        if let Some(budget) = self.options.limits.max_step_budget {
            if self.steps >= budget {
                return Err(Fault::StepBudgetExceeded(budget).into());
            }
        }
        self.steps += 1;

        let raw = self.code_cell(self.cip)? as u32;
        let opcode =
            Opcode::from_cell(raw).ok_or(Fault::UnsupportedOpcode(raw & OPCODE_MASK))?;
        *current = Some(opcode);
        match opcode.status() {
            OpcodeStatus::Live => {}
            OpcodeStatus::Deprecated if opcode == Opcode::Invalid => {
                return Err(Fault::InvalidInstruction(opcode).into())
            }
            OpcodeStatus::Deprecated => return Err(Fault::DeprecatedOpcode(opcode).into()),
            OpcodeStatus::Unsupported => {
                return Err(Fault::UnsupportedOpcode(opcode.to_u32()).into())
            }
        }
        self.cip += CELL_SIZE;

        match opcode {
            // Loads
            Opcode::LoadPri => {
                let addr = self.operand()?;
                self.pri = self.read(addr)?;
            }
            Opcode::LoadAlt => {
                let addr = self.operand()?;
                self.alt = self.read(addr)?;
            }
            Opcode::LoadSPri => {
                let offset = self.operand()?;
                self.pri = self.read(self.frame_addr(offset))?;
            }
            Opcode::LoadSAlt => {
                let offset = self.operand()?;
                self.alt = self.read(self.frame_addr(offset))?;
            }
            Opcode::LrefPri => {
                let addr = self.operand()?;
                let target = self.read(addr)?;
                self.pri = self.read(target)?;
            }
            Opcode::LrefAlt => {
                let addr = self.operand()?;
                let target = self.read(addr)?;
                self.alt = self.read(target)?;
            }
            Opcode::LrefSPri => {
                let offset = self.operand()?;
                let target = self.read(self.frame_addr(offset))?;
                self.pri = self.read(target)?;
            }
            Opcode::LrefSAlt => {
                let offset = self.operand()?;
                let target = self.read(self.frame_addr(offset))?;
                self.alt = self.read(target)?;
            }
            Opcode::LoadI => self.pri = self.read(self.pri)?,
            Opcode::LodbI => {
                let width = self.operand()?;
                self.pri = self.op_load_bytes(self.pri, width, opcode)?;
            }
            Opcode::LoadBoth => {
                let first = self.operand()?;
                let second = self.operand()?;
                self.pri = self.read(first)?;
                self.alt = self.read(second)?;
            }
            Opcode::LoadSBoth => {
                let first = self.operand()?;
                let second = self.operand()?;
                self.pri = self.read(self.frame_addr(first))?;
                self.alt = self.read(self.frame_addr(second))?;
            }

            // Constants and addresses
            Opcode::ConstPri => self.pri = self.operand()?,
            Opcode::ConstAlt => self.alt = self.operand()?,
            Opcode::AddrPri => {
                let offset = self.operand()?;
                self.pri = self.frame_addr(offset);
            }
            Opcode::AddrAlt => {
                let offset = self.operand()?;
                self.alt = self.frame_addr(offset);
            }
            Opcode::Const => {
                let addr = self.operand()?;
                let value = self.operand()?;
                self.write(addr, value)?;
            }
            Opcode::ConstS => {
                let offset = self.operand()?;
                let value = self.operand()?;
                self.write(self.frame_addr(offset), value)?;
            }

            // Stores
            Opcode::StorPri => {
                let addr = self.operand()?;
                self.write(addr, self.pri)?;
            }
            Opcode::StorAlt => {
                let addr = self.operand()?;
                self.write(addr, self.alt)?;
            }
            Opcode::StorSPri => {
                let offset = self.operand()?;
                self.write(self.frame_addr(offset), self.pri)?;
            }
            Opcode::StorSAlt => {
                let offset = self.operand()?;
                self.write(self.frame_addr(offset), self.alt)?;
            }
            Opcode::SrefPri => {
                let addr = self.operand()?;
                let target = self.read(addr)?;
                self.write(target, self.pri)?;
            }
            Opcode::SrefAlt => {
                let addr = self.operand()?;
                let target = self.read(addr)?;
                self.write(target, self.alt)?;
            }
            Opcode::SrefSPri => {
                let offset = self.operand()?;
                let target = self.read(self.frame_addr(offset))?;
                self.write(target, self.pri)?;
            }
            Opcode::SrefSAlt => {
                let offset = self.operand()?;
                let target = self.read(self.frame_addr(offset))?;
                self.write(target, self.alt)?;
            }
            Opcode::StorI => self.write(self.alt, self.pri)?,
            Opcode::StrbI => {
                let width = self.operand()?;
                self.op_store_bytes(self.alt, self.pri, width, opcode)?;
            }

            // Indexing
            Opcode::Lidx => {
                let addr = self.alt.wrapping_add(self.pri.wrapping_mul(CELL_SIZE as Cell));
                self.pri = self.read(addr)?;
            }
            Opcode::LidxB => {
                let shift = self.operand()?;
                let addr = self.alt.wrapping_add(self.pri.wrapping_shl(shift as u32));
                self.pri = self.read(addr)?;
            }
            Opcode::Idxaddr => {
                self.pri = self.alt.wrapping_add(self.pri.wrapping_mul(CELL_SIZE as Cell));
            }
            Opcode::IdxaddrB => {
                let shift = self.operand()?;
                self.pri = self.alt.wrapping_add(self.pri.wrapping_shl(shift as u32));
            }
            Opcode::AlignPri => {
                let width = self.operand()?;
                if (0..CELL_SIZE as Cell).contains(&width) {
                    self.pri ^= CELL_SIZE as Cell - width;
                }
            }
            Opcode::AlignAlt => {
                let width = self.operand()?;
                if (0..CELL_SIZE as Cell).contains(&width) {
                    self.alt ^= CELL_SIZE as Cell - width;
                }
            }

            // Control registers
            Opcode::Lctrl => {
                let index = self.operand()?;
                self.pri = self.op_lctrl(index)?;
            }
            Opcode::Sctrl => {
                let index = self.operand()?;
                self.op_sctrl(index)?;
            }

            // Register moves
            Opcode::MovePri => self.pri = self.alt,
            Opcode::MoveAlt => self.alt = self.pri,
            Opcode::Xchg => std::mem::swap(&mut self.pri, &mut self.alt),
            Opcode::ZeroPri => self.pri = 0,
            Opcode::ZeroAlt => self.alt = 0,
            Opcode::Zero => {
                let addr = self.operand()?;
                self.write(addr, 0)?;
            }
            Opcode::ZeroS => {
                let offset = self.operand()?;
                self.write(self.frame_addr(offset), 0)?;
            }
            Opcode::SignPri => self.pri = self.pri as i8 as Cell,
            Opcode::SignAlt => self.alt = self.alt as i8 as Cell,
            Opcode::SwapPri => {
                let top = self.op_peek()?;
                self.memory.write_heap(self.stk, self.pri)?;
                self.pri = top;
            }
            Opcode::SwapAlt => {
                let top = self.op_peek()?;
                self.memory.write_heap(self.stk, self.alt)?;
                self.alt = top;
            }

            // Stack
            Opcode::PushPri => self.push(self.pri)?,
            Opcode::PushAlt => self.push(self.alt)?,
            Opcode::PushC => {
                let value = self.operand()?;
                self.push(value)?;
            }
            Opcode::Push => {
                let addr = self.operand()?;
                let value = self.read(addr)?;
                self.push(value)?;
            }
            Opcode::PushS => {
                let offset = self.operand()?;
                let value = self.read(self.frame_addr(offset))?;
                self.push(value)?;
            }
            Opcode::PushAdr => {
                let offset = self.operand()?;
                self.push(self.frame_addr(offset))?;
            }
            Opcode::Push2C => self.op_push_many(2, PushSource::Const)?,
            Opcode::Push3C => self.op_push_many(3, PushSource::Const)?,
            Opcode::Push4C => self.op_push_many(4, PushSource::Const)?,
            Opcode::Push5C => self.op_push_many(5, PushSource::Const)?,
            Opcode::Push2 => self.op_push_many(2, PushSource::Addr)?,
            Opcode::Push3 => self.op_push_many(3, PushSource::Addr)?,
            Opcode::Push4 => self.op_push_many(4, PushSource::Addr)?,
            Opcode::Push5 => self.op_push_many(5, PushSource::Addr)?,
            Opcode::Push2S => self.op_push_many(2, PushSource::Frame)?,
            Opcode::Push3S => self.op_push_many(3, PushSource::Frame)?,
            Opcode::Push4S => self.op_push_many(4, PushSource::Frame)?,
            Opcode::Push5S => self.op_push_many(5, PushSource::Frame)?,
            Opcode::Push2Adr => self.op_push_many(2, PushSource::FrameAddr)?,
            Opcode::Push3Adr => self.op_push_many(3, PushSource::FrameAddr)?,
            Opcode::Push4Adr => self.op_push_many(4, PushSource::FrameAddr)?,
            Opcode::Push5Adr => self.op_push_many(5, PushSource::FrameAddr)?,
            Opcode::PopPri => self.pri = self.pop()?,
            Opcode::PopAlt => self.alt = self.pop()?,
            Opcode::Stack => {
                let delta = self.operand()?;
                self.adjust_stack(i64::from(delta))?;
            }
            Opcode::Heap => {
                let delta = self.operand()?;
                self.alt = self.heap_vm(self.hea);
                self.adjust_heap(i64::from(delta))?;
            }

            // Calls
            Opcode::Proc => {
                self.push(self.heap_vm(self.frm))?;
                self.frm = self.stk;
            }
            Opcode::Ret => self.op_return(false)?,
            Opcode::Retn => self.op_return(true)?,
            Opcode::Call => {
                let target = self.operand()?;
                if let Some(max) = self.options.limits.max_call_depth {
                    if self.call_depth >= max {
                        return Err(Fault::CallDepthExceeded.into());
                    }
                }
                self.push(self.cip as Cell)?;
                self.jump(target)?;
                self.call_depth += 1;
            }

            // Jumps
            Opcode::Jump => self.jump_if(true)?,
            Opcode::Jzer => self.jump_if(self.pri == 0)?,
            Opcode::Jnz => self.jump_if(self.pri != 0)?,
            Opcode::Jeq => self.jump_if(self.pri == self.alt)?,
            Opcode::Jneq => self.jump_if(self.pri != self.alt)?,
            Opcode::Jsless => self.jump_if(self.pri < self.alt)?,
            Opcode::Jsleq => self.jump_if(self.pri <= self.alt)?,
            Opcode::Jsgrtr => self.jump_if(self.pri > self.alt)?,
            Opcode::Jsgeq => self.jump_if(self.pri >= self.alt)?,
            Opcode::Switch => {
                let table = self.operand()?;
                self.op_switch(table)?;
            }

            // Arithmetic
            Opcode::Shl => self.pri = self.pri.wrapping_shl(self.alt as u32),
            Opcode::Shr => self.pri = (self.pri as u32).wrapping_shr(self.alt as u32) as Cell,
            Opcode::Sshr => self.pri = self.pri.wrapping_shr(self.alt as u32),
            Opcode::ShlCPri => {
                let shift = self.operand()?;
                self.pri = self.pri.wrapping_shl(shift as u32);
            }
            Opcode::ShlCAlt => {
                let shift = self.operand()?;
                self.alt = self.alt.wrapping_shl(shift as u32);
            }
            Opcode::ShrCPri => {
                let shift = self.operand()?;
                self.pri = (self.pri as u32).wrapping_shr(shift as u32) as Cell;
            }
            Opcode::ShrCAlt => {
                let shift = self.operand()?;
                self.alt = (self.alt as u32).wrapping_shr(shift as u32) as Cell;
            }
            Opcode::Smul => self.pri = self.pri.wrapping_mul(self.alt),
            Opcode::Sdiv => {
                let (quotient, remainder) = floor_divmod(self.pri, self.alt)?;
                self.pri = quotient;
                self.alt = remainder;
            }
            Opcode::SdivAlt => {
                let (quotient, remainder) = floor_divmod(self.alt, self.pri)?;
                self.pri = quotient;
                self.alt = remainder;
            }
            Opcode::Add => self.pri = self.pri.wrapping_add(self.alt),
            Opcode::Sub => self.pri = self.pri.wrapping_sub(self.alt),
            Opcode::SubAlt => self.pri = self.alt.wrapping_sub(self.pri),
            Opcode::And => self.pri &= self.alt,
            Opcode::Or => self.pri |= self.alt,
            Opcode::Xor => self.pri ^= self.alt,
            Opcode::Not => self.pri = Cell::from(self.pri == 0),
            Opcode::Neg => self.pri = self.pri.wrapping_neg(),
            Opcode::Invert => self.pri = !self.pri,
            Opcode::AddC => {
                let value = self.operand()?;
                self.pri = self.pri.wrapping_add(value);
            }
            Opcode::SmulC => {
                let value = self.operand()?;
                self.pri = self.pri.wrapping_mul(value);
            }

            // Comparisons
            Opcode::Eq => self.pri = Cell::from(self.pri == self.alt),
            Opcode::Neq => self.pri = Cell::from(self.pri != self.alt),
            Opcode::Sless => self.pri = Cell::from(self.pri < self.alt),
            Opcode::Sleq => self.pri = Cell::from(self.pri <= self.alt),
            Opcode::Sgrtr => self.pri = Cell::from(self.pri > self.alt),
            Opcode::Sgeq => self.pri = Cell::from(self.pri >= self.alt),
            Opcode::EqCPri => {
                let value = self.operand()?;
                self.pri = Cell::from(self.pri == value);
            }
            Opcode::EqCAlt => {
                let value = self.operand()?;
                self.pri = Cell::from(self.alt == value);
            }

            // Increments
            Opcode::IncPri => self.pri = self.pri.wrapping_add(1),
            Opcode::IncAlt => self.alt = self.alt.wrapping_add(1),
            Opcode::Inc => {
                let addr = self.operand()?;
                self.op_add_at(addr, 1)?;
            }
            Opcode::IncS => {
                let offset = self.operand()?;
                self.op_add_at(self.frame_addr(offset), 1)?;
            }
            Opcode::IncI => self.op_add_at(self.pri, 1)?,
            Opcode::DecPri => self.pri = self.pri.wrapping_sub(1),
            Opcode::DecAlt => self.alt = self.alt.wrapping_sub(1),
            Opcode::Dec => {
                let addr = self.operand()?;
                self.op_add_at(addr, -1)?;
            }
            Opcode::DecS => {
                let offset = self.operand()?;
                self.op_add_at(self.frame_addr(offset), -1)?;
            }
            Opcode::DecI => self.op_add_at(self.pri, -1)?,

            // Block memory
            Opcode::Movs => {
                let len = self.operand()?;
                self.op_movs(len)?;
            }
            Opcode::Cmps => {
                let len = self.operand()?;
                self.pri = self.op_cmps(len)?;
            }
            Opcode::Fill => {
                let len = self.operand()?;
                self.op_fill(len)?;
            }
            Opcode::Bounds => {
                let limit = self.operand()?;
                if self.pri as u32 > limit as u32 {
                    return Err(Fault::ArrayBounds {
                        index: self.pri,
                        limit,
                    }
                    .into());
                }
            }

            // Natives
            Opcode::SysreqC => {
                let index = self.operand()?;
                self.call_native(index as u32)?;
            }
            Opcode::SysreqN => {
                let index = self.operand()?;
                let count = self.operand()?;
                self.push(count)?;
                self.call_native(index as u32)?;
                self.adjust_stack((i64::from(count) + 1) * i64::from(CELL_SIZE))?;
            }

            // Heap tracking and dynamic arrays
            Opcode::TrackerPushC => {
                let cells = self.operand()?;
                let bytes = u32::try_from(cells)
                    .ok()
                    .and_then(|c| c.checked_mul(CELL_SIZE))
                    .ok_or(Fault::InvalidArraySize)?;
                self.tracker.push(bytes);
            }
            Opcode::TrackerPopSetheap => {
                let bytes = self.tracker.pop().ok_or(Fault::HeapUnderflow)?;
                self.adjust_heap(-i64::from(bytes))?;
            }
            Opcode::Genarray => {
                let dims = self.operand()?;
                self.op_genarray(dims, false)?;
            }
            Opcode::GenarrayZ => {
                let dims = self.operand()?;
                self.op_genarray(dims, true)?;
            }
            Opcode::StradjustPri => {
                self.pri = self.pri.wrapping_add(CELL_SIZE as Cell) >> 2;
            }
            Opcode::HeapSave => self.heap_marks.push(self.hea),
            Opcode::HeapRestore => {
                self.hea = self.heap_marks.pop().ok_or(Fault::HeapUnderflow)?;
            }

            // Floats
            Opcode::Fabs => self.pri = from_float(to_float(self.pri).abs()),
            Opcode::Float => self.pri = from_float(self.pri as f32),
            Opcode::FloatAdd => self.pri = from_float(to_float(self.pri) + to_float(self.alt)),
            Opcode::FloatSub => self.pri = from_float(to_float(self.pri) - to_float(self.alt)),
            Opcode::FloatMul => self.pri = from_float(to_float(self.pri) * to_float(self.alt)),
            Opcode::FloatDiv => self.pri = from_float(to_float(self.pri) / to_float(self.alt)),
            Opcode::RndToNearest => self.pri = (to_float(self.pri) + 0.5).floor() as Cell,
            Opcode::RndToFloor => self.pri = to_float(self.pri).floor() as Cell,
            Opcode::RndToCeil => self.pri = to_float(self.pri).ceil() as Cell,
            Opcode::RndToZero => self.pri = to_float(self.pri).trunc() as Cell,
            Opcode::FloatCmp => {
                self.pri = match to_float(self.pri).partial_cmp(&to_float(self.alt)) {
                    Some(Ordering::Greater) => 1,
                    Some(Ordering::Less) => -1,
                    _ => 0,
                };
            }
            Opcode::FloatGt => self.pri = Cell::from(to_float(self.pri) > to_float(self.alt)),
            Opcode::FloatGe => self.pri = Cell::from(to_float(self.pri) >= to_float(self.alt)),
            Opcode::FloatLt => self.pri = Cell::from(to_float(self.pri) < to_float(self.alt)),
            Opcode::FloatLe => self.pri = Cell::from(to_float(self.pri) <= to_float(self.alt)),
            Opcode::FloatNe => self.pri = Cell::from(to_float(self.pri) != to_float(self.alt)),
            Opcode::FloatEq => self.pri = Cell::from(to_float(self.pri) == to_float(self.alt)),
            Opcode::FloatNot => self.pri = Cell::from(to_float(self.pri) == 0.0),

            // Misc
            Opcode::Halt => {
                self.halt_code = self.operand()?;
                self.state = MachineState::Halted;
            }
            Opcode::Nop | Opcode::Break => {}
            Opcode::Casetbl | Opcode::Endproc | Opcode::Invalid => {
                return Err(Fault::InvalidInstruction(opcode).into())
            }

            _ => return Err(Fault::UnsupportedOpcode(opcode.to_u32()).into()),
        }
        Ok(())
    }

    #[inline]
    fn op_peek(&self) -> Result<Cell, Fault> {
        if self.stk >= self.stp {
            return Err(Fault::StackUnderflow);
        }
        self.memory.read_heap(self.stk)
    }

    fn op_load_bytes(&self, addr: Cell, width: Cell, opcode: Opcode) -> Result<Cell, Fault> {
        let len = match width {
            1 | 2 | 4 => width as u32,
            _ => return Err(Fault::InvalidInstruction(opcode)),
        };
        self.check_access(addr, len)?;
        let bytes = self.memory.bytes(addr, len as usize)?;
        Ok(match bytes {
            [b] => Cell::from(*b),
            [b0, b1] => Cell::from(u16::from_le_bytes([*b0, *b1])),
            _ => Cell::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    fn op_store_bytes(
        &mut self,
        addr: Cell,
        value: Cell,
        width: Cell,
        opcode: Opcode,
    ) -> Result<(), Fault> {
        let len = match width {
            1 | 2 | 4 => width as usize,
            _ => return Err(Fault::InvalidInstruction(opcode)),
        };
        self.check_access(addr, len as u32)?;
        self.memory
            .bytes_mut(addr, len)?
            .copy_from_slice(&value.to_le_bytes()[..len]);
        Ok(())
    }

    fn op_lctrl(&self, index: Cell) -> Result<Cell, Fault> {
        Ok(match index {
            // COD and DAT: code and VM addresses are both zero based
            0 | 1 => 0,
            2 => self.heap_vm(self.hea),
            3 => self.heap_vm(self.stp),
            4 => self.heap_vm(self.stk),
            5 => self.heap_vm(self.frm),
            6 => self.cip as Cell,
            _ => return Err(Fault::InvalidRegister(index)),
        })
    }

    fn op_sctrl(&mut self, index: Cell) -> Result<(), Fault> {
        let value = self.pri;
        let as_heap = |machine: &Machine| {
            machine
                .memory
                .vm_to_heap(value)
                .filter(|&addr| addr <= machine.stp)
                .ok_or(Fault::InvalidAddress(value))
        };
        match index {
            2 => {
                let hea = as_heap(self)?;
                if hea > self.stk {
                    return Err(Fault::HeapOverflow);
                }
                self.hea = hea;
            }
            4 => {
                let stk = as_heap(self)?;
                if stk < self.hea {
                    return Err(Fault::StackOverflow);
                }
                self.stk = stk;
            }
            5 => self.frm = as_heap(self)?,
            6 => self.jump(value)?,
            _ => return Err(Fault::InvalidRegister(index)),
        }
        Ok(())
    }

    fn op_push_many(&mut self, count: usize, source: PushSource) -> Result<(), Fault> {
        for _ in 0..count {
            let operand = self.operand()?;
            let value = match source {
                PushSource::Const => operand,
                PushSource::Addr => self.read(operand)?,
                PushSource::Frame => self.read(self.frame_addr(operand))?,
                PushSource::FrameAddr => self.frame_addr(operand),
            };
            self.push(value)?;
        }
        Ok(())
    }

    fn op_return(&mut self, pop_args: bool) -> Result<(), Fault> {
        let frm = self.pop()?;
        self.frm = self
            .memory
            .vm_to_heap(frm)
            .filter(|&addr| addr <= self.stp)
            .ok_or(Fault::InvalidAddress(frm))?;
        let ret = self.pop()?;
        if pop_args {
            let count = self.pop()?;
            if count < 0 {
                return Err(Fault::StackUnderflow);
            }
            self.adjust_stack(i64::from(count) * i64::from(CELL_SIZE))?;
        }
        self.jump(ret)?;
        self.call_depth = self.call_depth.saturating_sub(1);
        Ok(())
    }

    fn op_switch(&mut self, table: Cell) -> Result<(), Fault> {
        self.check_jump(table)?;
        let base = table as u32;
        let header = self.code_cell(base)? as u32;
        if Opcode::from_cell(header) != Some(Opcode::Casetbl) {
            return Err(Fault::InvalidJump(table));
        }
        let count = self.code_cell(base + CELL_SIZE)?;
        let mut target = self.code_cell(base + 2 * CELL_SIZE)?;
        for case in 0..u32::try_from(count).unwrap_or(0) {
            let entry = base + 3 * CELL_SIZE + case * 2 * CELL_SIZE;
            if self.code_cell(entry)? == self.pri {
                target = self.code_cell(entry + CELL_SIZE)?;
                break;
            }
        }
        self.jump(target)
    }

    fn op_add_at(&mut self, addr: Cell, delta: Cell) -> Result<(), Fault> {
        let value = self.read(addr)?;
        self.write(addr, value.wrapping_add(delta))
    }

    fn block_len(len: Cell) -> Result<u32, Fault> {
        u32::try_from(len).map_err(|_| Fault::InvalidAddress(len))
    }

    fn op_movs(&mut self, len: Cell) -> Result<(), Fault> {
        let len = Self::block_len(len)?;
        self.check_access(self.pri, len)?;
        self.check_access(self.alt, len)?;
        self.memory.copy(self.alt, self.pri, len as usize)
    }

    fn op_cmps(&self, len: Cell) -> Result<Cell, Fault> {
        let len = Self::block_len(len)?;
        self.check_access(self.pri, len)?;
        self.check_access(self.alt, len)?;
        let left = self.memory.bytes(self.pri, len as usize)?;
        let right = self.memory.bytes(self.alt, len as usize)?;
        Ok(match left.cmp(right) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }

    fn op_fill(&mut self, len: Cell) -> Result<(), Fault> {
        let len = Self::block_len(len)?;
        self.check_access(self.alt, len)?;
        self.memory
            .fill_cells(self.alt, (len / CELL_SIZE) as usize, self.pri)
    }

    /// Allocate a (possibly nested) array on the heap
    ///
    /// Dimensions are on the stack, outermost first. Every level but the
    /// last is a vector of indirection cells, each holding the byte offset
    /// from itself to its sub-array. The address replaces the dimensions.
    fn op_genarray(&mut self, dims: Cell, zero: bool) -> Result<(), Fault> {
        let rank = usize::try_from(dims)
            .ok()
            .filter(|&n| n >= 1)
            .ok_or(Fault::InvalidArraySize)?;

        let mut sizes = Vec::with_capacity(rank);
        for level in 0..rank {
            let slot = self
                .stk
                .offset((level as i64) * i64::from(CELL_SIZE))
                .filter(|&slot| slot < self.stp)
                .ok_or(Fault::StackUnderflow)?;
            let size = self.memory.read_heap(slot)?;
            let size = u64::try_from(size)
                .ok()
                .filter(|&s| s > 0)
                .ok_or(Fault::InvalidArraySize)?;
            sizes.push(size);
        }

        let mut indirection_cells = 0u64;
        let mut level_cells = 1u64;
        for &size in &sizes[..rank - 1] {
            level_cells = level_cells
                .checked_mul(size)
                .ok_or(Fault::InvalidArraySize)?;
            indirection_cells += level_cells;
        }
        let data_cells = level_cells
            .checked_mul(sizes[rank - 1])
            .ok_or(Fault::InvalidArraySize)?;
        let total_cells = indirection_cells
            .checked_add(data_cells)
            .ok_or(Fault::InvalidArraySize)?;
        let bytes = total_cells
            .checked_mul(u64::from(CELL_SIZE))
            .and_then(|b| u32::try_from(b).ok())
            .ok_or(Fault::InvalidArraySize)?;

        let base = self.hea;
        self.adjust_heap(i64::from(bytes))?;
        let base_vm = i64::from(self.heap_vm(base));

        if zero {
            self.memory
                .fill_cells(base_vm as Cell, total_cells as usize, 0)?;
        }

        let cell = i64::from(CELL_SIZE);
        let mut block = base_vm;
        let mut count = sizes[0] as i64;
        for level in 0..rank - 1 {
            let next = block + count * cell;
            let stride = sizes[level + 1] as i64 * cell;
            for index in 0..count {
                let slot = block + index * cell;
                let target = next + index * stride;
                self.memory.write_cell(slot as Cell, (target - slot) as Cell)?;
            }
            block = next;
            count *= sizes[level + 1] as i64;
        }

        self.adjust_stack(((rank - 1) as i64) * cell)?;
        self.memory.write_heap(self.stk, base_vm as Cell)?;
        self.tracker.push(bytes);
        Ok(())
    }

    fn call_native(&mut self, index: u32) -> Result<(), Trap> {
        let entry = self.resolve_native(index)?;

        let argc = self.op_peek()?;
        let count = usize::try_from(argc).map_err(|_| Fault::StackUnderflow)?;
        let end = self
            .stk
            .offset((count as i64 + 1) * i64::from(CELL_SIZE))
            .filter(|&end| end <= self.stp)
            .ok_or(Fault::StackUnderflow)?;
        let base = self.heap_vm(self.stk);
        let mut args = Vec::with_capacity(count);
        let mut slot = self.stk;
        while let Some(next) = slot.offset(i64::from(CELL_SIZE)).filter(|&next| next < end) {
            args.push(self.memory.read_heap(next)?);
            slot = next;
        }

        log::trace!("sysreq {} ({} args)", entry.name, count);
        let params = NativeParams { base, args };
        let result = {
            let mut ctx = NativeContext::new(self);
            (entry.func)(&mut ctx, &params)
        };
        match result {
            Ok(value) => {
                self.pri = value;
                Ok(())
            }
            Err(error) => Err(Trap::Native {
                native: entry.name.clone(),
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_divmod() {
        assert_eq!(floor_divmod(-7, 2), Ok((-4, 1)));
        assert_eq!(floor_divmod(7, -2), Ok((-4, -1)));
        assert_eq!(floor_divmod(-7, -2), Ok((3, -1)));
        assert_eq!(floor_divmod(7, 2), Ok((3, 1)));
        assert_eq!(floor_divmod(-8, 2), Ok((-4, 0)));
        assert_eq!(floor_divmod(Cell::MIN, -1), Ok((Cell::MIN, 0)));
        assert_eq!(floor_divmod(1, 0), Err(Fault::DivideByZero));
    }

    #[test]
    fn test_floor_divmod_identity() {
        for dividend in -20..=20 {
            for divisor in [-7, -3, -1, 1, 2, 5] {
                let (q, r) = floor_divmod(dividend, divisor).unwrap();
                assert_eq!(q * divisor + r, dividend);
                assert!(r == 0 || (r < 0) == (divisor < 0));
            }
        }
    }
}
