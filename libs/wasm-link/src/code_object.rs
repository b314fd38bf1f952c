// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ops::Range;

use anyhow::format_err;
use exec_alloc::{ExecutableAllocator, ExecutableMemoryHandle, JitCompilationEffort, OwnerTag};

/// The location of a function's machine code within a [`CodeObject`]'s text.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FunctionLoc {
    /// The byte offset from the start of the text section where this
    /// function starts.
    pub start: u32,
    /// The byte length of this function's function body.
    pub length: u32,
}

/// The compiled code of a module, copied into executable memory.
#[derive(Debug)]
pub struct CodeObject {
    memory: ExecutableMemoryHandle,
    len: usize,
}

impl CodeObject {
    /// Copies `text` into freshly allocated executable memory leased on behalf of `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator has no executable memory left.
    ///
    /// # Panics
    ///
    /// Panics if the allocator fails fatally, see [`ExecutableAllocator::allocate`].
    pub fn new(
        allocator: &ExecutableAllocator,
        text: &[u8],
        owner: OwnerTag,
        effort: JitCompilationEffort,
    ) -> crate::Result<Self> {
        let memory = allocator.allocate(text.len(), owner, effort).ok_or_else(|| {
            format_err!(
                "failed to allocate {} bytes of executable memory for {owner:?}",
                text.len()
            )
        })?;

        // Safety: the allocation is fresh, we hold the only handle and no code in it runs yet
        unsafe { memory.as_mut_slice()[..text.len()].copy_from_slice(text) };

        tracing::trace!(range = ?memory.as_ptr_range(), len = text.len(), "published code object");

        Ok(Self {
            memory,
            len: text.len(),
        })
    }

    /// The published machine code.
    pub fn text(&self) -> &[u8] {
        &self.memory.as_slice()[..self.len]
    }

    #[inline]
    pub fn text_range(&self) -> Range<*const u8> {
        let start = self.memory.start().as_ptr().cast_const();
        start..start.wrapping_add(self.len)
    }

    /// The lease on the executable memory backing this code.
    pub fn memory(&self) -> &ExecutableMemoryHandle {
        &self.memory
    }

    /// Returns `true` if `loc` lies entirely within the text.
    pub fn contains_loc(&self, loc: FunctionLoc) -> bool {
        self.loc_range(loc).is_some()
    }

    /// Returns the absolute address of the function at `loc`.
    ///
    /// # Panics
    ///
    /// Panics if `loc` does not lie within the text.
    pub fn resolve_function_loc(&self, loc: FunctionLoc) -> usize {
        let range = self.loc_range(loc).unwrap_or_else(|| {
            panic!(
                "function {loc:?} lies outside of the text section ({} bytes)",
                self.len
            )
        });

        let addr = self.text_range().start.addr() + range.start;
        tracing::trace!("resolve_function_loc {loc:?} => {addr:#x}");
        addr
    }

    fn loc_range(&self, loc: FunctionLoc) -> Option<Range<usize>> {
        let start = usize::try_from(loc.start).ok()?;
        let end = start.checked_add(usize::try_from(loc.length).ok()?)?;
        (end <= self.len).then_some(start..end)
    }
}
