// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::Mutex;

use crate::handle::{ExecutableMemoryHandle, OwnerTag, ReleaseSpace};
use crate::registry::{AllocatorProfile, ByteAccounting};

/// The hooks a [`MetaAllocator`] uses to obtain and manage backing pages.
pub trait PageSource: Send + Sync + 'static {
    /// Provides fresh address space for at least `*num_pages` pages and returns its base.
    ///
    /// Implementations may round `num_pages` up and must write back the number of pages
    /// actually provided. Returning `None` fails the allocation that triggered the growth.
    fn grow(&self, num_pages: &mut usize) -> Option<NonNull<u8>>;

    /// Called when the first live allocation is placed on `page`.
    fn commit(&self, page: NonNull<u8>);

    /// Called when the last live allocation on `page` has been released.
    fn decommit(&self, page: NonNull<u8>);
}

/// A general purpose sub-allocator carving granule-sized pieces out of page ranges
/// obtained from a [`PageSource`].
///
/// Free space is kept in a coalescing free list and handed out best-fit. Every page that
/// overlaps at least one live allocation is committed; pages are decommitted as soon as
/// their last allocation is released.
pub struct MetaAllocator<S> {
    state: Mutex<State>,
    source: S,
    granule: usize,
    page_size: usize,
}

#[derive(Default)]
struct State {
    /// free chunks keyed by start address
    free_by_start: BTreeMap<usize, usize>,
    /// free chunks ordered by `(size, start)` for best-fit lookups
    free_by_size: BTreeSet<(usize, usize)>,
    /// number of live allocations overlapping each page, keyed by page number
    page_occupancy: HashMap<usize, usize>,
    bytes_allocated: usize,
    bytes_committed: usize,
    bytes_reserved: usize,
}

// ===== impl MetaAllocator =====

impl<S: PageSource> MetaAllocator<S> {
    /// # Panics
    ///
    /// Panics if `granule` or `page_size` is not a power of two or if `granule` is larger
    /// than `page_size`.
    pub fn new(source: S, granule: usize, page_size: usize) -> Arc<Self> {
        assert!(granule.is_power_of_two() && page_size.is_power_of_two());
        assert!(granule <= page_size);

        Arc::new(Self {
            state: Mutex::new(State::default()),
            source,
            granule,
            page_size,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn granule(&self) -> usize {
        self.granule
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates `size_in_bytes` bytes (rounded up to the allocation granule, zero-sized
    /// requests take one granule).
    ///
    /// Returns `None` if the request cannot be satisfied from existing free space and the
    /// page source refuses to grow.
    pub fn allocate(
        self: &Arc<Self>,
        size_in_bytes: usize,
        owner: OwnerTag,
    ) -> Option<ExecutableMemoryHandle> {
        let size = size_in_bytes.max(1).checked_next_multiple_of(self.granule)?;

        {
            let mut state = self.state.lock();
            if let Some(start) = state.take_best_fit(size) {
                return Some(self.finish_allocation(&mut state, start, size, owner));
            }
        }

        // Growing may consult other allocators (e.g. to enforce a global limit), so it must
        // happen without our lock held.
        let mut num_pages = size.div_ceil(self.page_size);
        let requested_pages = num_pages;
        let base = self.source.grow(&mut num_pages)?;
        assert!(
            num_pages >= requested_pages,
            "page source provided {num_pages} pages, but {requested_pages} were requested"
        );
        let len = num_pages * self.page_size;

        tracing::trace!(?base, len, size, "grew executable memory pool");

        let mut state = self.state.lock();
        state.bytes_reserved += len;
        state.add_free_space(base.as_ptr().expose_provenance(), len);

        let start = state
            .take_best_fit(size)
            .expect("freshly added space must satisfy the request");
        Some(self.finish_allocation(&mut state, start, size, owner))
    }

    pub fn bytes_allocated(&self) -> usize {
        self.state.lock().bytes_allocated
    }

    pub fn bytes_committed(&self) -> usize {
        self.state.lock().bytes_committed
    }

    pub fn bytes_reserved(&self) -> usize {
        self.state.lock().bytes_reserved
    }

    /// Returns `true` if `addr` lies on a page that currently holds a live allocation.
    pub fn is_in_allocated_memory(&self, addr: usize) -> bool {
        self.state
            .lock()
            .page_occupancy
            .contains_key(&(addr / self.page_size))
    }

    fn finish_allocation(
        self: &Arc<Self>,
        state: &mut State,
        start: usize,
        size: usize,
        owner: OwnerTag,
    ) -> ExecutableMemoryHandle {
        state.bytes_allocated += size;

        for page in self.pages_of(start, size) {
            let count = state.page_occupancy.entry(page).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.source.commit(self.page_ptr(page));
                state.bytes_committed += self.page_size;
            }
        }

        let start = NonNull::new(ptr::with_exposed_provenance_mut(start))
            .expect("allocations never start at null");
        ExecutableMemoryHandle::new(start, size, owner, Arc::clone(self) as Arc<dyn ReleaseSpace>)
    }

    fn pages_of(&self, start: usize, size: usize) -> std::ops::RangeInclusive<usize> {
        debug_assert!(size > 0);
        (start / self.page_size)..=((start + size - 1) / self.page_size)
    }

    fn page_ptr(&self, page: usize) -> NonNull<u8> {
        NonNull::new(ptr::with_exposed_provenance_mut(page * self.page_size))
            .expect("page zero is never handed out")
    }
}

impl<S: PageSource> ReleaseSpace for MetaAllocator<S> {
    fn release(&self, start: NonNull<u8>, size_in_bytes: usize) {
        let start = start.as_ptr().addr();
        let mut state = self.state.lock();

        state.bytes_allocated -= size_in_bytes;

        for page in self.pages_of(start, size_in_bytes) {
            let Entry::Occupied(mut count) = state.page_occupancy.entry(page) else {
                unreachable!("released page {page:#x} has no live allocations")
            };
            *count.get_mut() -= 1;
            if *count.get() == 0 {
                count.remove();
                self.source.decommit(self.page_ptr(page));
                state.bytes_committed -= self.page_size;
            }
        }

        state.add_free_space(start, size_in_bytes);
    }
}

impl<S: PageSource> ByteAccounting for MetaAllocator<S> {
    fn bytes_allocated(&self) -> usize {
        MetaAllocator::bytes_allocated(self)
    }

    fn bytes_committed(&self) -> usize {
        MetaAllocator::bytes_committed(self)
    }

    fn profile(&self) -> AllocatorProfile {
        let state = self.state.lock();
        AllocatorProfile {
            bytes_allocated: state.bytes_allocated,
            bytes_committed: state.bytes_committed,
            bytes_reserved: state.bytes_reserved,
            free_chunks: state.free_by_start.len(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for MetaAllocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetaAllocator")
            .field("source", &self.source)
            .field("granule", &self.granule)
            .field("page_size", &self.page_size)
            .field("bytes_allocated", &state.bytes_allocated)
            .field("bytes_committed", &state.bytes_committed)
            .field("bytes_reserved", &state.bytes_reserved)
            .field("free_chunks", &state.free_by_start.len())
            .finish_non_exhaustive()
    }
}

// ===== impl State =====

impl State {
    fn take_best_fit(&mut self, size: usize) -> Option<usize> {
        let (chunk_size, start) = *self.free_by_size.range((size, 0)..).next()?;

        self.free_by_size.remove(&(chunk_size, start));
        self.free_by_start.remove(&start);

        if chunk_size > size {
            self.insert_free(start + size, chunk_size - size);
        }

        Some(start)
    }

    fn add_free_space(&mut self, mut start: usize, mut size: usize) {
        // merge with the chunk directly before us
        if let Some((&prev_start, &prev_size)) = self.free_by_start.range(..start).next_back() {
            if prev_start + prev_size == start {
                self.remove_free(prev_start, prev_size);
                start = prev_start;
                size += prev_size;
            }
        }

        // merge with the chunk directly after us
        if let Some(&next_size) = self.free_by_start.get(&(start + size)) {
            self.remove_free(start + size, next_size);
            size += next_size;
        }

        self.insert_free(start, size);
    }

    fn insert_free(&mut self, start: usize, size: usize) {
        self.free_by_start.insert(start, size);
        self.free_by_size.insert((size, start));
    }

    fn remove_free(&mut self, start: usize, size: usize) {
        self.free_by_start.remove(&start);
        self.free_by_size.remove(&(size, start));
    }
}
