//! Call parameters
//!
//! A [`ParamList`] describes the arguments of one call in declaration
//! order. Scalars travel as plain cells. References, strings and arrays are
//! copied into heap buffers right before the call; buffers marked for
//! copy-back are read again after the call returns. Buffers are allocated
//! in argument order and released in reverse.

use smx_bytecode::{Cell, Value, CELL_SIZE};
use smx_core::{Fault, Machine};

/// How a parameter is passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Plain cell
    Cell,
    /// Binary32 float in a cell
    Float,
    /// Address of a heap cell
    CellRef,
    /// Address of a heap float
    FloatRef,
    /// Address of a NUL-terminated character buffer
    String,
    /// Address of a heap cell array
    Array,
}

impl ParamKind {
    /// Whether the parameter is passed through a heap buffer
    pub fn is_buffered(self) -> bool {
        !matches!(self, ParamKind::Cell | ParamKind::Float)
    }
}

/// Raw contents of a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamData {
    /// A single cell
    Cell(Cell),
    /// Character data, without terminator
    Bytes(Vec<u8>),
    /// Cell array
    Cells(Vec<Cell>),
}

/// One call parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Passing convention
    pub kind: ParamKind,
    /// Value before the call
    pub data: ParamData,
    /// Buffer size: bytes for strings, cells for arrays and references
    pub size: u32,
    /// Read the buffer back after the call
    pub copy_back: bool,
    addr: Option<Cell>,
}

impl Param {
    fn new(kind: ParamKind, data: ParamData, size: u32, copy_back: bool) -> Self {
        Self {
            kind,
            data,
            size,
            copy_back,
            addr: None,
        }
    }

    /// VM address of the buffer while the call is in progress
    pub fn address(&self) -> Option<Cell> {
        self.addr
    }

    fn buffer_bytes(&self) -> u32 {
        match self.kind {
            // A zero-sized string still gets a cell so its address is valid
            ParamKind::String => self.size.max(1),
            _ => self.size.saturating_mul(CELL_SIZE),
        }
    }

    /// Cell placed on the stack
    fn stack_cell(&self) -> Cell {
        match (&self.data, self.addr) {
            (_, Some(addr)) => addr,
            (ParamData::Cell(cell), None) => *cell,
            _ => 0,
        }
    }

    /// Value of the parameter as seen by the host, before any call
    fn value(&self) -> Value {
        match (&self.data, self.kind) {
            (ParamData::Cell(cell), ParamKind::Float | ParamKind::FloatRef) => {
                Value::Float(f32::from_bits(*cell as u32))
            }
            (ParamData::Cell(cell), _) => Value::Int(*cell),
            (ParamData::Bytes(bytes), _) => Value::String(String::from_utf8_lossy(bytes).into()),
            (ParamData::Cells(cells), _) => {
                Value::Array(cells.iter().copied().map(Value::Int).collect())
            }
        }
    }
}

/// Ordered call parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList {
    params: Vec<Param>,
}

impl ParamList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Check if no parameter was pushed
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters in order
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Remove all parameters
    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Push a plain cell
    pub fn push_cell(&mut self, value: Cell) -> &mut Self {
        self.push(Param::new(ParamKind::Cell, ParamData::Cell(value), 1, false))
    }

    /// Push a float
    pub fn push_float(&mut self, value: f32) -> &mut Self {
        let cell = value.to_bits() as Cell;
        self.push(Param::new(ParamKind::Float, ParamData::Cell(cell), 1, false))
    }

    /// Push a cell by reference; the updated value is copied back
    pub fn push_cell_ref(&mut self, value: Cell) -> &mut Self {
        self.push(Param::new(ParamKind::CellRef, ParamData::Cell(value), 1, true))
    }

    /// Push a float by reference; the updated value is copied back
    pub fn push_float_ref(&mut self, value: f32) -> &mut Self {
        let cell = value.to_bits() as Cell;
        self.push(Param::new(ParamKind::FloatRef, ParamData::Cell(cell), 1, true))
    }

    /// Push a read-only string sized to fit
    pub fn push_string(&mut self, value: &str) -> &mut Self {
        let size = value.len() as u32 + 1;
        self.push_string_ex(value.as_bytes(), size, false)
    }

    /// Push a string buffer of `size` bytes
    ///
    /// The contents are cut to `size - 1` bytes plus a terminator. With
    /// `copy_back` the buffer is read again after the call.
    pub fn push_string_ex(&mut self, value: &[u8], size: u32, copy_back: bool) -> &mut Self {
        self.push(Param::new(
            ParamKind::String,
            ParamData::Bytes(value.to_vec()),
            size,
            copy_back,
        ))
    }

    /// Push a cell array
    pub fn push_array(&mut self, cells: &[Cell], copy_back: bool) -> &mut Self {
        self.push_array_ex(cells, cells.len() as u32, copy_back)
    }

    /// Push a cell array of `size` cells, zero-padding or cutting `cells`
    pub fn push_array_ex(&mut self, cells: &[Cell], size: u32, copy_back: bool) -> &mut Self {
        self.push(Param::new(
            ParamKind::Array,
            ParamData::Cells(cells.to_vec()),
            size,
            copy_back,
        ))
    }

    fn push(&mut self, param: Param) -> &mut Self {
        self.params.push(param);
        self
    }

    /// Allocate and fill heap buffers in argument order
    ///
    /// On failure every buffer allocated so far is released again.
    pub(crate) fn allocate(&mut self, machine: &mut Machine) -> Result<(), Fault> {
        for index in 0..self.params.len() {
            if let Err(fault) = self.allocate_one(machine, index) {
                self.release(machine);
                return Err(fault);
            }
        }
        Ok(())
    }

    fn allocate_one(&mut self, machine: &mut Machine, index: usize) -> Result<(), Fault> {
        let param = &mut self.params[index];
        if !param.kind.is_buffered() {
            return Ok(());
        }
        let addr = machine.heap_alloc(param.buffer_bytes())?;
        param.addr = Some(addr);
        match &param.data {
            ParamData::Cell(cell) => machine.write(addr, *cell)?,
            ParamData::Bytes(bytes) => {
                machine.write_cstr_bytes(addr, bytes, param.size as usize)?;
                if param.size == 0 {
                    machine.write(addr, 0)?;
                }
            }
            ParamData::Cells(cells) => {
                for slot in 0..param.size {
                    let value = cells.get(slot as usize).copied().unwrap_or(0);
                    machine.write(addr + (slot * CELL_SIZE) as Cell, value)?;
                }
            }
        }
        Ok(())
    }

    /// Cells to push, in argument order
    pub(crate) fn stack_cells(&self) -> Vec<Cell> {
        self.params.iter().map(Param::stack_cell).collect()
    }

    /// Read copy-back buffers and release all buffers, newest first
    ///
    /// Returns the post-call value of every parameter in argument order.
    pub(crate) fn finish(&mut self, machine: &mut Machine) -> Vec<Value> {
        let mut values = vec![Value::Void; self.params.len()];
        for (index, param) in self.params.iter().enumerate().rev() {
            values[index] = match param.addr {
                Some(addr) if param.copy_back => read_back(machine, param, addr),
                _ => param.value(),
            };
        }
        self.release(machine);
        values
    }

    fn release(&mut self, machine: &mut Machine) {
        for param in self.params.iter_mut().rev() {
            if let Some(addr) = param.addr.take() {
                if let Err(fault) = machine.heap_release(addr) {
                    log::warn!("failed to release parameter buffer at {addr:#x}: {fault}");
                }
            }
        }
    }
}

fn read_back(machine: &Machine, param: &Param, addr: Cell) -> Value {
    let memory = machine.memory();
    let result = match param.kind {
        ParamKind::CellRef => memory.read_cell(addr).map(Value::Int),
        ParamKind::FloatRef => memory
            .read_cell(addr)
            .map(|cell| Value::Float(f32::from_bits(cell as u32))),
        ParamKind::String => memory.bytes(addr, param.size as usize).map(|bytes| {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }),
        ParamKind::Array => (0..param.size)
            .map(|slot| memory.read_cell(addr + (slot * CELL_SIZE) as Cell).map(Value::Int))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ParamKind::Cell | ParamKind::Float => Ok(param.value()),
    };
    result.unwrap_or_else(|fault| {
        log::warn!("copy-back at {addr:#x} failed: {fault}");
        param.value()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_builds_descriptors() {
        let mut params = ParamList::new();
        params
            .push_cell(1)
            .push_float(2.0)
            .push_string("abc")
            .push_string_ex(b"xy", 8, true)
            .push_array(&[1, 2, 3], false);

        let kinds: Vec<ParamKind> = params.params().iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            [
                ParamKind::Cell,
                ParamKind::Float,
                ParamKind::String,
                ParamKind::String,
                ParamKind::Array
            ]
        );
        assert_eq!(params.params()[2].size, 4);
        assert!(!params.params()[2].copy_back);
        assert_eq!(params.params()[3].size, 8);
        assert!(params.params()[3].copy_back);
        assert_eq!(params.params()[4].size, 3);
    }

    #[test]
    fn test_buffer_sizes() {
        let mut params = ParamList::new();
        params.push_string_ex(b"", 0, true).push_cell_ref(4).push_array_ex(&[], 5, false);
        let sizes: Vec<u32> = params.params().iter().map(Param::buffer_bytes).collect();
        assert_eq!(sizes, [1, 4, 20]);
    }

    #[test]
    fn test_values_before_call() {
        let mut params = ParamList::new();
        params.push_float_ref(1.5).push_string("hi");
        let values: Vec<Value> = params.params().iter().map(Param::value).collect();
        assert_eq!(values, [Value::Float(1.5), Value::String("hi".into())]);
    }
}
