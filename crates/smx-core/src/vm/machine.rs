//! Machine state and host-facing operations

use crate::error::{Fault, RuntimeError, StackFrame, StackTrace, VmError};
use crate::memory::{HeapAddr, Memory};
use crate::native::{HandleTable, NativeContext, NativeEntry, NativeParams, NativeRegistry};
use crate::options::VmOptions;
use crate::VmResult;
use smx_bytecode::format::align_to_cell;
use smx_bytecode::{Cell, Opcode, PluginImage, CELL_SIZE};
use std::sync::Arc;

/// Maximum nesting of host invocations (natives calling back into bytecode)
pub const MAX_REENTRANCY: usize = 64;

/// Lifecycle of a Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Memory not allocated yet
    Uninitialized,
    /// Ready to execute
    Initialized,
    /// Inside `execute`
    Running,
    /// Last execution reached `halt` or failed
    Halted,
}

/// Register snapshot, addresses as VM addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    /// Primary register
    pub pri: Cell,
    /// Alternate register
    pub alt: Cell,
    /// Code instruction pointer
    pub cip: u32,
    /// Frame pointer
    pub frm: Cell,
    /// Stack pointer
    pub stk: Cell,
    /// Heap pointer
    pub hea: Cell,
}

/// State captured around a nested call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    pri: Cell,
    alt: Cell,
    cip: u32,
    frm: HeapAddr,
    stk: HeapAddr,
    hea: HeapAddr,
    state: MachineState,
    call_depth: usize,
    tracker_len: usize,
    heap_marks_len: usize,
}

/// Register-based bytecode interpreter bound to one plugin image
pub struct Machine {
    pub(super) image: Arc<PluginImage>,
    pub(super) options: VmOptions,
    natives: NativeRegistry,
    bound: Vec<Option<Arc<NativeEntry>>>,
    pub(super) memory: Memory,

    pub(super) pri: Cell,
    pub(super) alt: Cell,
    pub(super) cip: u32,
    pub(super) frm: HeapAddr,
    pub(super) stk: HeapAddr,
    pub(super) hea: HeapAddr,
    pub(super) stp: HeapAddr,

    pub(super) state: MachineState,
    pub(super) halt_code: Cell,
    pub(super) tracker: Vec<u32>,
    pub(super) heap_marks: Vec<HeapAddr>,
    pub(super) steps: u64,
    pub(super) call_depth: usize,
    depth: usize,

    console: String,
    handles: HandleTable,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .field("registers", &self.registers())
            .field("memory", &self.memory)
            .field("natives", &self.natives)
            .finish()
    }
}

impl Machine {
    /// Create a Machine with an empty native registry
    pub fn new(image: Arc<PluginImage>, options: VmOptions) -> Self {
        Self::with_natives(image, options, NativeRegistry::new())
    }

    /// Create a Machine with the given natives
    pub fn with_natives(image: Arc<PluginImage>, options: VmOptions, natives: NativeRegistry) -> Self {
        Self {
            image,
            options,
            natives,
            bound: Vec::new(),
            memory: Memory::default(),
            pri: 0,
            alt: 0,
            cip: 0,
            frm: HeapAddr(0),
            stk: HeapAddr(0),
            hea: HeapAddr(0),
            stp: HeapAddr(0),
            state: MachineState::Uninitialized,
            halt_code: 0,
            tracker: Vec::new(),
            heap_marks: Vec::new(),
            steps: 0,
            call_depth: 0,
            depth: 0,
            console: String::new(),
            handles: HandleTable::new(),
        }
    }

    /// Allocate memory, copy the data segment and reset registers
    ///
    /// Calling `init` on an initialized Machine does nothing.
    pub fn init(&mut self) {
        if self.state != MachineState::Uninitialized {
            return;
        }
        let image = Arc::clone(&self.image);
        self.memory = Memory::new(image.data(), image.data_size(), image.mem_size());
        self.stp = HeapAddr(self.memory.heap_size());
        self.stk = self.stp;
        self.frm = self.stp;
        self.hea = HeapAddr(0);
        self.pri = 0;
        self.alt = 0;
        self.cip = 0;
        self.bound = vec![None; image.natives().len()];

        let missing: Vec<&str> = image
            .natives()
            .iter()
            .map(String::as_str)
            .filter(|name| !self.natives.contains(name))
            .collect();
        if !missing.is_empty() {
            log::debug!("{} natives not registered: {}", missing.len(), missing.join(", "));
        }
        log::debug!(
            "machine initialized: {} bytes data, {} bytes heap/stack",
            self.memory.data_size(),
            self.memory.heap_size()
        );
        self.state = MachineState::Initialized;
    }

    /// Check if `init` has run
    pub fn is_initialized(&self) -> bool {
        self.state != MachineState::Uninitialized
    }

    /// Current lifecycle state
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Operand of the last executed `halt`
    pub fn halt_code(&self) -> Cell {
        self.halt_code
    }

    /// Image being executed
    pub fn image(&self) -> &PluginImage {
        &self.image
    }

    /// Shared handle to the image
    pub fn image_arc(&self) -> &Arc<PluginImage> {
        &self.image
    }

    /// Options the Machine was created with
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Register snapshot
    pub fn registers(&self) -> Registers {
        Registers {
            pri: self.pri,
            alt: self.alt,
            cip: self.cip,
            frm: self.memory.heap_to_vm(self.frm),
            stk: self.memory.heap_to_vm(self.stk),
            hea: self.memory.heap_to_vm(self.hea),
        }
    }

    /// VM address of the stack top (the empty-stack value of `STK`)
    pub fn stp(&self) -> Cell {
        self.memory.heap_to_vm(self.stp)
    }

    /// Primary register
    pub fn pri(&self) -> Cell {
        self.pri
    }

    /// Machine memory
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Mutable machine memory
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Native registry
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Mutable native registry; bindings are re-resolved on next use
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        self.bound.iter_mut().for_each(|slot| *slot = None);
        &mut self.natives
    }

    /// Register a raw native
    pub fn register_native(
        &mut self,
        name: &str,
        func: impl Fn(&mut NativeContext<'_>, &NativeParams) -> Result<Cell, crate::NativeError>
            + Send
            + Sync
            + 'static,
    ) {
        self.natives_mut().register(name, func);
    }

    /// Console output gathered from print natives
    pub fn console(&self) -> &str {
        &self.console
    }

    /// Append to the console buffer
    pub fn console_write(&mut self, text: &str) {
        self.console.push_str(text);
    }

    /// Take and clear the console buffer
    pub fn take_console(&mut self) -> String {
        std::mem::take(&mut self.console)
    }

    /// Handle table
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Mutable handle table
    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }

    /// Capture registers and flags before a nested call
    pub fn save_state(&self) -> SavedState {
        SavedState {
            pri: self.pri,
            alt: self.alt,
            cip: self.cip,
            frm: self.frm,
            stk: self.stk,
            hea: self.hea,
            state: self.state,
            call_depth: self.call_depth,
            tracker_len: self.tracker.len(),
            heap_marks_len: self.heap_marks.len(),
        }
    }

    /// Restore a state captured by [`Machine::save_state`]
    pub fn restore_state(&mut self, saved: SavedState) {
        self.pri = saved.pri;
        self.alt = saved.alt;
        self.cip = saved.cip;
        self.frm = saved.frm;
        self.stk = saved.stk;
        self.hea = saved.hea;
        self.state = saved.state;
        self.call_depth = saved.call_depth;
        self.tracker.truncate(saved.tracker_len);
        self.heap_marks.truncate(saved.heap_marks_len);
    }

    /// Push a cell onto the stack
    pub fn push(&mut self, value: Cell) -> Result<(), Fault> {
        let top = self
            .stk
            .offset(-i64::from(CELL_SIZE))
            .filter(|&top| top >= self.hea)
            .ok_or(Fault::StackOverflow)?;
        self.memory.write_heap(top, value)?;
        self.stk = top;
        Ok(())
    }

    /// Pop a cell from the stack
    pub fn pop(&mut self) -> Result<Cell, Fault> {
        let next = self
            .stk
            .offset(i64::from(CELL_SIZE))
            .filter(|&next| next <= self.stp)
            .ok_or(Fault::StackUnderflow)?;
        let value = self.memory.read_heap(self.stk)?;
        self.stk = next;
        Ok(value)
    }

    /// Move `STK` by a signed byte delta
    pub(super) fn adjust_stack(&mut self, delta: i64) -> Result<(), Fault> {
        let stk = self.stk.offset(delta).ok_or(Fault::StackOverflow)?;
        if stk < self.hea {
            return Err(Fault::StackOverflow);
        }
        if stk > self.stp {
            return Err(Fault::StackUnderflow);
        }
        self.stk = stk;
        Ok(())
    }

    /// Move `HEA` by a signed byte delta
    pub(super) fn adjust_heap(&mut self, delta: i64) -> Result<(), Fault> {
        let hea = self.hea.offset(delta).ok_or(Fault::HeapUnderflow)?;
        if hea > self.stk {
            return Err(Fault::HeapOverflow);
        }
        self.hea = hea;
        Ok(())
    }

    /// Allocate `bytes` (rounded up to whole cells) on the heap
    ///
    /// Returns the VM address of the block. Blocks must be released in
    /// reverse order of allocation.
    pub fn heap_alloc(&mut self, bytes: u32) -> Result<Cell, Fault> {
        let addr = self.hea;
        self.adjust_heap(i64::from(align_to_cell(bytes)))?;
        Ok(self.memory.heap_to_vm(addr))
    }

    /// Release the heap down to `addr`, the address of the newest live block
    pub fn heap_release(&mut self, addr: Cell) -> Result<(), Fault> {
        let hea = self.memory.vm_to_heap(addr).ok_or(Fault::InvalidAddress(addr))?;
        if hea > self.hea {
            return Err(Fault::HeapUnderflow);
        }
        self.hea = hea;
        Ok(())
    }

    /// Validate an access of `len` bytes at VM address `addr`
    ///
    /// Valid memory is the data segment, the used heap below `HEA` and the
    /// live stack from `STK` up to `STP`.
    pub fn check_access(&self, addr: Cell, len: u32) -> Result<(), Fault> {
        let start = u32::try_from(addr).map_err(|_| Fault::InvalidAddress(addr))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.memory.size())
            .ok_or(Fault::InvalidAddress(addr))?;
        let gap_start = self.memory.data_size() + self.hea.get();
        let gap_end = self.memory.data_size() + self.stk.get();
        if start < gap_end && end > gap_start {
            return Err(Fault::InvalidAddress(addr));
        }
        Ok(())
    }

    /// Read a cell through a VM address
    #[inline]
    pub fn read(&self, addr: Cell) -> Result<Cell, Fault> {
        self.check_access(addr, CELL_SIZE)?;
        self.memory.read_cell(addr)
    }

    /// Write a cell through a VM address
    #[inline]
    pub fn write(&mut self, addr: Cell, value: Cell) -> Result<(), Fault> {
        self.check_access(addr, CELL_SIZE)?;
        self.memory.write_cell(addr, value)
    }

    /// Bytes of the NUL-terminated string at `addr`
    pub fn read_cstr(&self, addr: Cell) -> Result<&[u8], Fault> {
        self.check_access(addr, 1)?;
        let bytes = self.memory.read_cstr(addr)?;
        self.check_access(addr, bytes.len() as u32 + 1)?;
        Ok(bytes)
    }

    /// Write a string into a buffer of `capacity` bytes at `addr`
    pub fn write_cstr(&mut self, addr: Cell, text: &str, capacity: usize) -> Result<usize, Fault> {
        let len = crate::memory::truncate_utf8(text, capacity.saturating_sub(1)).len();
        if capacity > 0 {
            self.check_access(addr, len as u32 + 1)?;
        }
        self.memory.write_cstr(addr, text, capacity)
    }

    /// Write raw bytes plus a NUL into a buffer of `capacity` bytes at `addr`
    pub fn write_cstr_bytes(
        &mut self,
        addr: Cell,
        bytes: &[u8],
        capacity: usize,
    ) -> Result<usize, Fault> {
        let len = bytes.len().min(capacity.saturating_sub(1));
        if capacity > 0 {
            self.check_access(addr, len as u32 + 1)?;
        }
        self.memory.write_cstr_bytes(addr, bytes, capacity)
    }

    /// Run bytecode at `addr` until `halt`
    ///
    /// The caller is responsible for the stack layout expected by the code,
    /// see [`Machine::invoke`]. Returns `PRI`.
    pub fn execute(&mut self, addr: u32) -> VmResult<Cell> {
        self.init();
        if self.depth >= MAX_REENTRANCY {
            return Err(self.runtime_error(Fault::ReentrancyLimit, addr, None));
        }
        if let Err(fault) = self.check_jump(addr as Cell) {
            return Err(self.runtime_error(fault, addr, None));
        }
        if self.depth == 0 {
            self.steps = 0;
        }
        self.depth += 1;
        self.cip = addr;
        self.state = MachineState::Running;
        let result = self.run();
        self.depth -= 1;
        result.map(|()| self.pri)
    }

    /// Call the function at `addr` with `args` and restore all registers afterwards
    ///
    /// Arguments are pushed in reverse, followed by their count and a return
    /// address of 0, which always holds `halt`.
    pub fn invoke(&mut self, addr: u32, args: &[Cell]) -> VmResult<Cell> {
        self.init();
        let saved = self.save_state();
        let result = self.enter(addr, args, None);
        self.restore_state(saved);
        result
    }

    /// Call a function returning a fixed-size array
    ///
    /// `buffer` is pushed before the arguments, so it sits just past the
    /// counted arguments and is not part of the argument count. It is popped
    /// again after the callee returns.
    pub fn invoke_with_buffer(
        &mut self,
        addr: u32,
        args: &[Cell],
        buffer: Cell,
    ) -> VmResult<Cell> {
        self.init();
        let saved = self.save_state();
        let result = self.enter(addr, args, Some(buffer));
        self.restore_state(saved);
        result
    }

    fn enter(&mut self, addr: u32, args: &[Cell], buffer: Option<Cell>) -> VmResult<Cell> {
        let count = Cell::try_from(args.len()).unwrap_or(Cell::MAX);
        let frame = buffer
            .into_iter()
            .chain(args.iter().rev().copied())
            .chain([count, 0]);
        for value in frame {
            if let Err(fault) = self.push(value) {
                return Err(self.runtime_error(fault, addr, None));
            }
        }
        let raw = self.execute(addr)?;
        if buffer.is_some() {
            if let Err(fault) = self.pop() {
                return Err(self.runtime_error(fault, addr, None));
            }
        }
        Ok(raw)
    }

    /// Validate a jump target
    pub(super) fn check_jump(&self, target: Cell) -> Result<(), Fault> {
        let code_size = self.image.code().len();
        match usize::try_from(target) {
            Ok(t) if t % CELL_SIZE as usize == 0 && t < code_size => Ok(()),
            _ => Err(Fault::InvalidJump(target)),
        }
    }

    /// Resolve native `index` to its registered entry
    pub(super) fn resolve_native(&mut self, index: u32) -> Result<Arc<NativeEntry>, Fault> {
        if let Some(Some(entry)) = self.bound.get(index as usize) {
            return Ok(Arc::clone(entry));
        }
        let name = self
            .image
            .native(index)
            .ok_or(Fault::InvalidNativeIndex(index))?;
        let entry = self
            .natives
            .get(name)
            .ok_or_else(|| Fault::NativeNotImplemented(name.to_string()))?;
        if let Some(slot) = self.bound.get_mut(index as usize) {
            *slot = Some(Arc::clone(&entry));
        }
        log::trace!("bound native {index} to '{name}'");
        Ok(entry)
    }

    /// Wrap a fault with its location and a stack trace
    pub fn runtime_error(&self, fault: Fault, cip: u32, opcode: Option<Opcode>) -> VmError {
        log::debug!("fault at {cip:#x}: {fault}");
        VmError::Runtime(RuntimeError {
            fault,
            cip,
            opcode,
            trace: self.stack_trace(cip),
        })
    }

    fn frame_at(&self, cip: u32) -> StackFrame {
        StackFrame {
            cip,
            function: self.image.lookup_function(cip).map(str::to_string),
            file: self.image.lookup_file(cip).map(str::to_string),
            line: self.image.lookup_line(cip),
        }
    }

    /// Walk the frame chain starting at the current `FRM`
    ///
    /// Each frame holds the caller's `FRM` at offset 0 and the return
    /// address at offset 4. A return address of 0 marks a host entry.
    pub fn stack_trace(&self, cip: u32) -> StackTrace {
        let limit = self.options.trace_depth.max(1);
        let mut frames = vec![self.frame_at(cip)];
        let mut frm = self.frm;
        while frames.len() < limit && frm < self.stp {
            let Some(ret_slot) = frm.offset(i64::from(CELL_SIZE)) else {
                break;
            };
            let (Ok(caller), Ok(ret)) = (self.memory.read_heap(frm), self.memory.read_heap(ret_slot))
            else {
                break;
            };
            if ret <= 0 {
                break;
            }
            frames.push(self.frame_at(ret as u32));
            match self.memory.vm_to_heap(caller) {
                Some(next) if next > frm => frm = next,
                _ => break,
            }
        }
        StackTrace { frames }
    }
}
