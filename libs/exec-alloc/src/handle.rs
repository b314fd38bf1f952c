// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, slice};

/// Opaque identifier of whoever requested an allocation, e.g. the code block the
/// machine code is compiled for. Only used for diagnostics.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct OwnerTag(pub u64);

/// Implemented by allocators that hand out [`ExecutableMemoryHandle`]s so the last
/// handle can give its range back.
pub(crate) trait ReleaseSpace: Send + Sync {
    fn release(&self, start: NonNull<u8>, size_in_bytes: usize);
}

/// A shared lease on a range of executable memory.
///
/// Cloning the handle is cheap and shares the lease. The range is returned to the
/// allocator that produced it when the last clone is dropped, which may in turn
/// decommit the backing pages. The handle keeps its allocator (and therefore the
/// reservation backing the range) alive.
#[derive(Clone)]
pub struct ExecutableMemoryHandle(Arc<HandleInner>);

struct HandleInner {
    start: NonNull<u8>,
    size_in_bytes: usize,
    owner: OwnerTag,
    allocator: Arc<dyn ReleaseSpace>,
}

// Safety: the handle's range is exclusively leased to its holders, mutation goes through
// `as_mut_slice` which is unsafe and requires the caller to synchronize.
unsafe impl Send for HandleInner {}
// Safety: see above
unsafe impl Sync for HandleInner {}

// ===== impl ExecutableMemoryHandle =====

impl ExecutableMemoryHandle {
    pub(crate) fn new(
        start: NonNull<u8>,
        size_in_bytes: usize,
        owner: OwnerTag,
        allocator: Arc<dyn ReleaseSpace>,
    ) -> Self {
        Self(Arc::new(HandleInner {
            start,
            size_in_bytes,
            owner,
            allocator,
        }))
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.0.start
    }

    #[inline]
    pub fn end(&self) -> *const u8 {
        self.0.start.as_ptr().wrapping_add(self.0.size_in_bytes)
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.0.size_in_bytes
    }

    #[inline]
    pub fn owner(&self) -> OwnerTag {
        self.0.owner
    }

    pub fn as_ptr_range(&self) -> Range<*const u8> {
        self.0.start.as_ptr().cast_const()..self.end()
    }

    /// Returns `true` if `addr` lies within the leased range.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.0.start.as_ptr().addr();
        (start..start + self.0.size_in_bytes).contains(&addr)
    }

    /// Returns the leased memory.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the range is committed for as long as this lease is alive
        unsafe { slice::from_raw_parts(self.0.start.as_ptr(), self.0.size_in_bytes) }
    }

    /// Returns the leased memory mutably, e.g. to copy freshly generated code into it.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other clone of this handle reads or writes the range for
    /// the lifetime of the returned slice, and that no code in the range is executing.
    #[expect(clippy::mut_from_ref, reason = "the lease is shared, exclusivity is up to the caller")]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // Safety: ensured by caller
        unsafe { slice::from_raw_parts_mut(self.0.start.as_ptr(), self.0.size_in_bytes) }
    }

    /// Returns `true` if both handles share the same lease.
    pub fn ptr_eq(lhs: &Self, rhs: &Self) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }
}

impl fmt::Debug for ExecutableMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemoryHandle")
            .field("range", &self.as_ptr_range())
            .field("owner", &self.0.owner)
            .finish_non_exhaustive()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.allocator.release(self.start, self.size_in_bytes);
    }
}
