//! Handle natives and the `ArrayList` handle type

use super::cell_or;
use smx_bytecode::Cell;
use smx_core::native::INVALID_HANDLE;
use smx_core::{NativeError, NativeRegistry};

/// Type tag of [`ArrayList`] handles
pub const ARRAY_LIST_TAG: &str = "ArrayList";

/// Growable array of fixed-size cell blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayList {
    block_size: usize,
    blocks: Vec<Vec<Cell>>,
}

impl ArrayList {
    /// Create a list of `len` zeroed blocks of `block_size` cells
    pub fn new(block_size: usize, len: usize) -> Self {
        Self {
            block_size,
            blocks: vec![vec![0; block_size]; len],
        }
    }

    /// Cells per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the list has no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a block whose first cell is `value`; returns its index
    pub fn push(&mut self, value: Cell) -> usize {
        let mut block = vec![0; self.block_size];
        if let Some(first) = block.first_mut() {
            *first = value;
        }
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Cell `offset` of block `index`
    pub fn get(&self, index: usize, offset: usize) -> Option<Cell> {
        self.blocks.get(index)?.get(offset).copied()
    }
}

fn index_arg(value: Cell, index: usize, what: &str) -> Result<usize, NativeError> {
    usize::try_from(value)
        .map_err(|_| NativeError::invalid_argument(index, format!("invalid {what} {value}")))
}

pub(super) fn register(registry: &mut NativeRegistry) {
    registry.register("CloseHandle", |ctx, params| {
        let id = params.cell(0)?;
        if id == INVALID_HANDLE {
            return Ok(0);
        }
        ctx.handles().close(id)?;
        Ok(1)
    });

    registry.register("CloneHandle", |ctx, params| {
        Ok(ctx.handles().clone_handle(params.cell(0)?)?)
    });

    registry.register("CreateArray", |ctx, params| {
        let block_size = index_arg(cell_or(params, 0, 1), 0, "block size")?.max(1);
        let start_size = index_arg(cell_or(params, 1, 0), 1, "start size")?;
        let list = ArrayList::new(block_size, start_size);
        Ok(ctx.handles().create(ARRAY_LIST_TAG, list, None))
    });

    registry.register("PushArrayCell", |ctx, params| {
        let id = params.cell(0)?;
        let value = params.cell(1)?;
        let index = ctx
            .handles()
            .with(id, ARRAY_LIST_TAG, |list: &mut ArrayList| list.push(value))?;
        Ok(index as Cell)
    });

    registry.register("GetArrayCell", |ctx, params| {
        let id = params.cell(0)?;
        let index = index_arg(params.cell(1)?, 1, "index")?;
        let block = index_arg(cell_or(params, 2, 0), 2, "block offset")?;
        ctx.handles()
            .with(id, ARRAY_LIST_TAG, |list: &mut ArrayList| {
                list.get(index, block).ok_or_else(|| {
                    NativeError::raised(format!(
                        "Invalid index {index} (count: {})",
                        list.len()
                    ))
                })
            })?
    });

    registry.register("GetArraySize", |ctx, params| {
        let id = params.cell(0)?;
        let len = ctx
            .handles()
            .with(id, ARRAY_LIST_TAG, |list: &mut ArrayList| list.len())?;
        Ok(len as Cell)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_list_blocks() {
        let mut list = ArrayList::new(2, 1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.push(7), 1);
        assert_eq!(list.get(1, 0), Some(7));
        assert_eq!(list.get(1, 1), Some(0));
        assert_eq!(list.get(1, 2), None);
        assert_eq!(list.get(2, 0), None);
        assert_eq!(list.block_size(), 2);
    }
}
