//! Context handed to natives

use super::{HandleTable, NativeRegistry};
use crate::error::{Fault, NativeError};
use crate::vm::Machine;
use smx_bytecode::{Cell, PluginImage};

/// Access a native has to the calling Machine
///
/// Memory accessors take VM addresses as found in the parameter block and
/// validate them the same way bytecode loads and stores are validated.
pub struct NativeContext<'a> {
    machine: &'a mut Machine,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(machine: &'a mut Machine) -> Self {
        Self { machine }
    }

    /// Image the Machine executes
    pub fn image(&self) -> &PluginImage {
        self.machine.image()
    }

    /// Read the cell at `addr`
    pub fn read_cell(&self, addr: Cell) -> Result<Cell, NativeError> {
        Ok(self.machine.read(addr)?)
    }

    /// Write the cell at `addr`
    pub fn write_cell(&mut self, addr: Cell, value: Cell) -> Result<(), NativeError> {
        Ok(self.machine.write(addr, value)?)
    }

    /// Read the float at `addr`
    pub fn read_float(&self, addr: Cell) -> Result<f32, NativeError> {
        self.read_cell(addr).map(|cell| f32::from_bits(cell as u32))
    }

    /// Write the float at `addr`
    pub fn write_float(&mut self, addr: Cell, value: f32) -> Result<(), NativeError> {
        self.write_cell(addr, value.to_bits() as Cell)
    }

    /// Read `count` consecutive cells starting at `addr`
    pub fn read_cells(&self, addr: Cell, count: usize) -> Result<Vec<Cell>, NativeError> {
        (0..count)
            .map(|i| {
                let offset = Cell::try_from(i * 4).map_err(|_| Fault::InvalidAddress(addr))?;
                self.read_cell(addr.wrapping_add(offset))
            })
            .collect()
    }

    /// Read the NUL-terminated string at `addr`, replacing invalid UTF-8
    pub fn read_string(&self, addr: Cell) -> Result<String, NativeError> {
        let bytes = self.machine.read_cstr(addr)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Write `text` into a plugin buffer of `capacity` bytes
    ///
    /// Returns the number of bytes written, excluding the terminator.
    pub fn write_string(
        &mut self,
        addr: Cell,
        text: &str,
        capacity: usize,
    ) -> Result<usize, NativeError> {
        Ok(self.machine.write_cstr(addr, text, capacity)?)
    }

    /// Append to the console buffer
    pub fn console_write(&mut self, text: &str) {
        self.machine.console_write(text);
    }

    /// Console output gathered so far
    pub fn console(&self) -> &str {
        self.machine.console()
    }

    /// Handle table of the Machine
    pub fn handles(&mut self) -> &mut HandleTable {
        self.machine.handles_mut()
    }

    /// Registry of the Machine; changes apply to later calls
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        self.machine.natives_mut()
    }

    /// Call back into the plugin at code address `addr`
    pub fn invoke(&mut self, addr: u32, args: &[Cell]) -> Result<Cell, NativeError> {
        Ok(self.machine.invoke(addr, args)?)
    }

    /// Call back into the public function `name`
    pub fn invoke_public(&mut self, name: &str, args: &[Cell]) -> Result<Cell, NativeError> {
        let addr = self
            .image()
            .find_public(name)
            .map(|public| public.address)
            .ok_or_else(|| NativeError::raised(format!("unknown public function '{name}'")))?;
        self.invoke(addr, args)
    }

    /// The calling Machine
    pub fn machine(&mut self) -> &mut Machine {
        self.machine
    }
}
