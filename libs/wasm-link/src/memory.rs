// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::types::MemoryType;

/// A WebAssembly linear memory.
pub struct Memory {
    ty: MemoryType,
    data: RwLock<Vec<u8>>,
}

/// Error for out of bounds [`Memory`] access.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct MemoryAccessError {
    pub offset: usize,
    pub len: usize,
    pub memory_size: usize,
}

// ===== impl Memory =====

impl Memory {
    /// Creates a zeroed memory of `ty.minimum` pages.
    ///
    /// # Panics
    ///
    /// Panics if the size does not fit the host address space.
    pub fn new(ty: MemoryType) -> Self {
        Self {
            ty,
            data: RwLock::new(vec![0; ty.minimum_byte_size()]),
        }
    }

    /// Creates a zeroed memory of exactly `len` bytes, for embedders that manage memory in
    /// units other than WebAssembly pages.
    pub fn with_byte_size(len: usize) -> Self {
        Self {
            ty: MemoryType::new(0, None),
            data: RwLock::new(vec![0; len]),
        }
    }

    pub fn ty(&self) -> MemoryType {
        self.ty
    }

    /// Returns the current size in bytes.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    /// Returns a read guard over the whole memory.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |data| data.as_slice())
    }

    /// Copies `buffer.len()` bytes starting at `offset` into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), MemoryAccessError> {
        let data = self.data.read();
        let src = Self::range(&data, offset, buffer.len())?;
        buffer.copy_from_slice(&data[src]);
        Ok(())
    }

    /// Copies `buffer` into memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds, in which case nothing is written.
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result<(), MemoryAccessError> {
        let mut data = self.data.write();
        let dst = Self::range(&data, offset, buffer.len())?;
        data[dst].copy_from_slice(buffer);
        Ok(())
    }

    fn range(
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<core::ops::Range<usize>, MemoryAccessError> {
        offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .map(|end| offset..end)
            .ok_or(MemoryAccessError {
                offset,
                len,
                memory_size: data.len(),
            })
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("ty", &self.ty)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out of bounds memory access: {} bytes at offset {} in memory of {} bytes",
            self.len, self.offset, self.memory_size
        )
    }
}

impl core::error::Error for MemoryAccessError {}
