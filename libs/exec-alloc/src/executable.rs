// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use crate::demand::DemandExecutableAllocator;
use crate::handle::{ExecutableMemoryHandle, OwnerTag};
use crate::registry::AllocatorRegistry;

/// How hard the caller depends on an allocation succeeding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JitCompilationEffort {
    /// The caller can fall back (e.g. to a lower tier) if no memory is available.
    CanFail,
    /// There is no fallback, failing to allocate is fatal.
    MustSucceed,
}

/// The executable memory allocator of one runtime.
///
/// Owns a [`DemandExecutableAllocator`] registered with a shared [`AllocatorRegistry`].
/// Pressure queries and the memory limit take every allocator in that registry into
/// account.
#[derive(Debug, Clone)]
pub struct ExecutableAllocator {
    allocator: DemandExecutableAllocator,
}

// ===== impl ExecutableAllocator =====

impl ExecutableAllocator {
    pub fn new(registry: &Arc<AllocatorRegistry>) -> Self {
        Self {
            allocator: DemandExecutableAllocator::new(registry),
        }
    }

    /// Allocates `size_in_bytes` bytes of executable memory on behalf of `owner`.
    ///
    /// Returns `None` if no memory is available, which can only happen with
    /// [`JitCompilationEffort::CanFail`].
    ///
    /// # Panics
    ///
    /// Panics if the allocation fails and `effort` is [`JitCompilationEffort::MustSucceed`],
    /// or if the OS refuses to reserve or commit memory.
    pub fn allocate(
        &self,
        size_in_bytes: usize,
        owner: OwnerTag,
        effort: JitCompilationEffort,
    ) -> Option<ExecutableMemoryHandle> {
        let handle = self.allocator.allocate(size_in_bytes, owner);

        if handle.is_none() {
            assert_ne!(
                effort,
                JitCompilationEffort::MustSucceed,
                "failed to allocate {size_in_bytes} bytes of executable memory for {owner:?}"
            );
            tracing::debug!(size_in_bytes, ?owner, "executable memory allocation failed");
        }

        handle
    }

    /// Returns the number of bytes committed across all allocators in the registry.
    pub fn committed_byte_count(&self) -> usize {
        self.registry().bytes_committed_by_all_allocators()
    }

    /// See [`AllocatorRegistry::under_memory_pressure`].
    pub fn under_memory_pressure(&self) -> bool {
        self.registry().under_memory_pressure()
    }

    /// See [`AllocatorRegistry::memory_pressure_multiplier`].
    pub fn memory_pressure_multiplier(&self, added_bytes: usize) -> f64 {
        self.registry().memory_pressure_multiplier(added_bytes)
    }

    /// Returns `true` if `addr` lies on a page of this allocator that holds live code.
    pub fn is_valid_executable_memory(&self, addr: usize) -> bool {
        self.allocator.is_in_allocated_memory(addr)
    }

    pub fn registry(&self) -> &Arc<AllocatorRegistry> {
        self.allocator.registry()
    }

    pub fn instance_bytes_allocated(&self) -> usize {
        self.allocator.bytes_allocated()
    }

    pub fn instance_bytes_committed(&self) -> usize {
        self.allocator.bytes_committed()
    }

    pub fn instance_bytes_reserved(&self) -> usize {
        self.allocator.bytes_reserved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LARGE_ALLOCATION_PAGES, os};

    #[test]
    fn can_fail_returns_none() {
        let limit = LARGE_ALLOCATION_PAGES * os::page_size();
        let registry = AllocatorRegistry::with_memory_limit(Some(limit));
        let allocator = ExecutableAllocator::new(&registry);

        let _all = allocator
            .allocate(limit, OwnerTag::default(), JitCompilationEffort::CanFail)
            .unwrap();
        assert!(
            allocator
                .allocate(1, OwnerTag::default(), JitCompilationEffort::CanFail)
                .is_none()
        );
    }

    #[test]
    #[should_panic(expected = "failed to allocate")]
    fn must_succeed_is_fatal() {
        let limit = LARGE_ALLOCATION_PAGES * os::page_size();
        let registry = AllocatorRegistry::with_memory_limit(Some(limit));
        let allocator = ExecutableAllocator::new(&registry);

        let _all = allocator
            .allocate(limit, OwnerTag::default(), JitCompilationEffort::MustSucceed)
            .unwrap();
        let _ = allocator.allocate(1, OwnerTag::default(), JitCompilationEffort::MustSucceed);
    }

    #[test]
    fn validates_addresses() {
        let registry = AllocatorRegistry::with_memory_limit(None);
        let allocator = ExecutableAllocator::new(&registry);

        let handle = allocator
            .allocate(100, OwnerTag(1), JitCompilationEffort::CanFail)
            .unwrap();
        let inside = handle.start().as_ptr().addr() + 50;
        assert!(allocator.is_valid_executable_memory(inside));
        assert!(!allocator.is_valid_executable_memory(0x10));
    }
}
