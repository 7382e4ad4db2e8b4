//! Machine memory
//!
//! A Machine owns a single byte buffer of `mem_size` bytes:
//!
//! ```text
//! 0            data_size                                   mem_size
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ data       │ heap → ...                     ... ← stack   │
//! └────────────┴──────────────────────────────────────────────┘
//!                ↑ HEA (grows up)           STK (grows down) ↑ STP
//! ```
//!
//! Bytecode sees a single address space: a VM address is a byte offset into
//! this buffer. The host side keeps two address kinds apart. [`DataAddr`] is
//! an offset into the data segment and [`HeapAddr`] an offset into the
//! heap/stack region. The `STK`, `FRM` and `HEA` registers are heap
//! addresses and are converted explicitly whenever they meet a VM address.

use smx_bytecode::{Cell, MemoryView, CELL_SIZE};
use std::fmt;
use std::ops::Range;

use crate::error::Fault;

/// Offset into the data segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataAddr(pub u32);

/// Offset into the heap/stack region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapAddr(pub u32);

impl HeapAddr {
    /// Raw offset
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Move by a signed byte delta, failing on overflow or underflow
    #[inline]
    pub fn offset(self, delta: i64) -> Option<HeapAddr> {
        let moved = i64::from(self.0).checked_add(delta)?;
        u32::try_from(moved).ok().map(HeapAddr)
    }
}

impl fmt::Display for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap+{:#x}", self.0)
    }
}

impl fmt::Display for DataAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data+{:#x}", self.0)
    }
}

/// Byte buffer holding data, heap and stack
#[derive(Clone, Default)]
pub struct Memory {
    bytes: Vec<u8>,
    data_size: u32,
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.bytes.len())
            .field("data_size", &self.data_size)
            .finish()
    }
}

impl Memory {
    /// Allocate `mem_size` bytes and copy the initial data segment
    pub fn new(data: &[u8], data_size: u32, mem_size: u32) -> Self {
        let mut bytes = vec![0u8; mem_size as usize];
        let count = data.len().min(data_size as usize).min(bytes.len());
        bytes[..count].copy_from_slice(&data[..count]);
        Self {
            bytes,
            data_size: data_size.min(mem_size),
        }
    }

    /// Total size in bytes
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Size of the data segment
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Size of the heap/stack region
    pub fn heap_size(&self) -> u32 {
        self.size() - self.data_size
    }

    /// Whole buffer
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// VM address of a data offset
    #[inline]
    pub fn data_to_vm(&self, addr: DataAddr) -> Cell {
        addr.0 as Cell
    }

    /// VM address of a heap offset
    #[inline]
    pub fn heap_to_vm(&self, addr: HeapAddr) -> Cell {
        (self.data_size + addr.0) as Cell
    }

    /// Heap offset of a VM address; the top of the region is included
    #[inline]
    pub fn vm_to_heap(&self, addr: Cell) -> Option<HeapAddr> {
        let addr = u32::try_from(addr).ok()?;
        if addr < self.data_size || addr > self.size() {
            return None;
        }
        Some(HeapAddr(addr - self.data_size))
    }

    /// Data offset of a VM address
    #[inline]
    pub fn vm_to_data(&self, addr: Cell) -> Option<DataAddr> {
        let addr = u32::try_from(addr).ok()?;
        (addr < self.data_size).then_some(DataAddr(addr))
    }

    fn range(&self, addr: Cell, len: usize) -> Result<Range<usize>, Fault> {
        let start = usize::try_from(addr).map_err(|_| Fault::InvalidAddress(addr))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(Fault::InvalidAddress(addr))?;
        Ok(start..end)
    }

    /// Read the cell at VM address `addr`
    #[inline]
    pub fn read_cell(&self, addr: Cell) -> Result<Cell, Fault> {
        let range = self.range(addr, CELL_SIZE as usize)?;
        let b = &self.bytes[range];
        Ok(Cell::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Write the cell at VM address `addr`
    #[inline]
    pub fn write_cell(&mut self, addr: Cell, value: Cell) -> Result<(), Fault> {
        let range = self.range(addr, CELL_SIZE as usize)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a data-segment cell
    pub fn read_data(&self, addr: DataAddr) -> Result<Cell, Fault> {
        self.check_data(addr)?;
        self.read_cell(self.data_to_vm(addr))
    }

    /// Write a data-segment cell
    pub fn write_data(&mut self, addr: DataAddr, value: Cell) -> Result<(), Fault> {
        self.check_data(addr)?;
        self.write_cell(self.data_to_vm(addr), value)
    }

    /// Check that a whole cell at `addr` lies in the data segment
    fn check_data(&self, addr: DataAddr) -> Result<(), Fault> {
        match addr.0.checked_add(CELL_SIZE) {
            Some(end) if end <= self.data_size => Ok(()),
            _ => Err(Fault::InvalidAddress(addr.0 as Cell)),
        }
    }

    /// Read a heap/stack cell
    #[inline]
    pub fn read_heap(&self, addr: HeapAddr) -> Result<Cell, Fault> {
        self.read_cell(self.heap_to_vm(addr))
    }

    /// Write a heap/stack cell
    #[inline]
    pub fn write_heap(&mut self, addr: HeapAddr, value: Cell) -> Result<(), Fault> {
        self.write_cell(self.heap_to_vm(addr), value)
    }

    /// Borrow `len` bytes at `addr`
    pub fn bytes(&self, addr: Cell, len: usize) -> Result<&[u8], Fault> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    /// Mutably borrow `len` bytes at `addr`
    pub fn bytes_mut(&mut self, addr: Cell, len: usize) -> Result<&mut [u8], Fault> {
        let range = self.range(addr, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Bytes of the NUL-terminated string at `addr`, without the NUL
    pub fn read_cstr(&self, addr: Cell) -> Result<&[u8], Fault> {
        let start = self.range(addr, 0)?.start;
        let tail = &self.bytes[start..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Fault::UnterminatedString)?;
        Ok(&tail[..len])
    }

    /// Write `text` plus a NUL into a buffer of `capacity` bytes
    ///
    /// The text is cut to `capacity - 1` bytes. Returns the number of bytes
    /// written, not counting the terminator. A zero capacity writes nothing.
    pub fn write_cstr_bytes(
        &mut self,
        addr: Cell,
        text: &[u8],
        capacity: usize,
    ) -> Result<usize, Fault> {
        if capacity == 0 {
            return Ok(0);
        }
        let len = text.len().min(capacity - 1);
        let out = self.bytes_mut(addr, len + 1)?;
        out[..len].copy_from_slice(&text[..len]);
        out[len] = 0;
        Ok(len)
    }

    /// Like [`Memory::write_cstr_bytes`], cutting on a character boundary
    pub fn write_cstr(&mut self, addr: Cell, text: &str, capacity: usize) -> Result<usize, Fault> {
        let text = truncate_utf8(text, capacity.saturating_sub(1));
        self.write_cstr_bytes(addr, text.as_bytes(), capacity)
    }

    /// Copy `len` bytes from `src` to `dst`
    pub fn copy(&mut self, dst: Cell, src: Cell, len: usize) -> Result<(), Fault> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    /// Store `value` into `count` consecutive cells starting at `addr`
    pub fn fill_cells(&mut self, addr: Cell, count: usize, value: Cell) -> Result<(), Fault> {
        let len = count
            .checked_mul(CELL_SIZE as usize)
            .ok_or(Fault::InvalidAddress(addr))?;
        let bytes = value.to_le_bytes();
        for chunk in self.bytes_mut(addr, len)?.chunks_exact_mut(CELL_SIZE as usize) {
            chunk.copy_from_slice(&bytes);
        }
        Ok(())
    }
}

impl MemoryView for Memory {
    fn read_cell(&self, addr: Cell) -> Option<Cell> {
        Memory::read_cell(self, addr).ok()
    }

    fn read_bytes(&self, addr: Cell, len: usize) -> Option<&[u8]> {
        self.bytes(addr, len).ok()
    }
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a character
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory::new(b"abc\0", 8, 64)
    }

    #[test]
    fn test_layout() {
        let mem = memory();
        assert_eq!(mem.size(), 64);
        assert_eq!(mem.data_size(), 8);
        assert_eq!(mem.heap_size(), 56);
        assert_eq!(mem.heap_to_vm(HeapAddr(4)), 12);
        assert_eq!(mem.vm_to_heap(12), Some(HeapAddr(4)));
        assert_eq!(mem.vm_to_heap(4), None);
        assert_eq!(mem.vm_to_heap(64), Some(HeapAddr(56)));
        assert_eq!(mem.vm_to_data(4), Some(DataAddr(4)));
        assert_eq!(mem.vm_to_data(8), None);
    }

    #[test]
    fn test_cells() {
        let mut mem = memory();
        mem.write_heap(HeapAddr(0), -5).unwrap();
        assert_eq!(mem.read_cell(8).unwrap(), -5);
        assert_eq!(mem.read_cell(61), Err(Fault::InvalidAddress(61)));
        assert_eq!(mem.read_cell(-4), Err(Fault::InvalidAddress(-4)));
        assert!(mem.write_data(DataAddr(8), 1).is_err());
    }

    #[test]
    fn test_data_address_near_limit() {
        let mut mem = memory();
        let addr = DataAddr(u32::MAX - 1);
        assert_eq!(mem.read_data(addr), Err(Fault::InvalidAddress(addr.0 as Cell)));
        assert_eq!(mem.write_data(addr, 1), Err(Fault::InvalidAddress(addr.0 as Cell)));
        assert_eq!(mem.read_data(DataAddr(4)).unwrap(), 0);
    }

    #[test]
    fn test_strings() {
        let mut mem = memory();
        assert_eq!(mem.read_cstr(0).unwrap(), b"abc");

        assert_eq!(mem.write_cstr(16, "hello", 3).unwrap(), 2);
        assert_eq!(mem.read_cstr(16).unwrap(), b"he");
        assert_eq!(mem.write_cstr(16, "hello", 0).unwrap(), 0);
        assert_eq!(mem.read_cstr(16).unwrap(), b"he");

        // "é" is two bytes and must not be split
        assert_eq!(mem.write_cstr(16, "aé", 3).unwrap(), 1);
        assert_eq!(mem.read_cstr(16).unwrap(), b"a");
    }

    #[test]
    fn test_unterminated_string() {
        let mut mem = Memory::new(&[], 0, 4);
        mem.bytes_mut(0, 4).unwrap().copy_from_slice(b"abcd");
        assert_eq!(mem.read_cstr(0), Err(Fault::UnterminatedString));
    }

    #[test]
    fn test_fill_and_copy() {
        let mut mem = memory();
        mem.fill_cells(16, 3, 7).unwrap();
        mem.copy(32, 16, 12).unwrap();
        assert_eq!(mem.read_cell(40).unwrap(), 7);
        assert!(mem.fill_cells(60, 2, 0).is_err());
    }
}
