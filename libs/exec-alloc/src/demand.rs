// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::handle::{ExecutableMemoryHandle, OwnerTag};
use crate::meta::{MetaAllocator, PageSource};
use crate::registry::{AllocatorId, AllocatorRegistry, ByteAccounting};
use crate::reservation::Reservation;
use crate::{EXECUTABLE_POOL_PERMISSIONS, JIT_ALLOCATION_GRANULE, LARGE_ALLOCATION_PAGES, os};

/// A [`PageSource`] that reserves fresh address space from the OS on demand.
///
/// Reservations are made in multiples of [`LARGE_ALLOCATION_PAGES`] pages and are kept
/// until the allocator is dropped. Growth is refused once the registry's memory limit is
/// reached.
pub struct DemandPages {
    registry: Arc<AllocatorRegistry>,
    id: OnceLock<AllocatorId>,
    reservations: Mutex<Vec<Reservation>>,
}

// ===== impl DemandPages =====

impl DemandPages {
    fn new(registry: Arc<AllocatorRegistry>) -> Self {
        Self {
            registry,
            id: OnceLock::new(),
            reservations: Mutex::new(Vec::new()),
        }
    }

    fn with_owning_reservation<R>(&self, page: NonNull<u8>, f: impl FnOnce(&Reservation) -> R) -> R {
        let reservations = self.reservations.lock();
        let reservation = reservations
            .iter()
            .find(|reservation| reservation.contains(page.as_ptr().addr()))
            .unwrap_or_else(|| panic!("page {page:?} does not belong to any reservation"));
        f(reservation)
    }
}

impl PageSource for DemandPages {
    fn grow(&self, num_pages: &mut usize) -> Option<NonNull<u8>> {
        let rounded_pages = num_pages.next_multiple_of(LARGE_ALLOCATION_PAGES);

        if let Some(limit) = self.registry.memory_limit() {
            let allocated = self.registry.bytes_allocated_by_all_allocators();
            if allocated >= limit {
                tracing::warn!(
                    allocated,
                    limit,
                    "executable memory limit reached, refusing to reserve more"
                );
                return None;
            }
        }

        let len = rounded_pages * os::page_size();
        let reservation = Reservation::new(len, EXECUTABLE_POOL_PERMISSIONS)
            .unwrap_or_else(|err| panic!("out of executable address space: {err:?}"));
        let base = reservation.base();

        self.reservations.lock().push(reservation);
        *num_pages = rounded_pages;

        Some(base)
    }

    fn commit(&self, page: NonNull<u8>) {
        tracing::trace!(?page, "committing executable page");
        self.with_owning_reservation(page, |reservation| {
            reservation
                .commit(page)
                .unwrap_or_else(|err| panic!("failed to commit executable page: {err:?}"));
        });
    }

    fn decommit(&self, page: NonNull<u8>) {
        tracing::trace!(?page, "decommitting executable page");
        self.with_owning_reservation(page, |reservation| {
            reservation
                .decommit(page)
                .unwrap_or_else(|err| panic!("failed to decommit executable page: {err:?}"));
        });
    }
}

impl Drop for DemandPages {
    fn drop(&mut self) {
        if let Some(id) = self.id.get() {
            self.registry.deregister(*id);
        }
    }
}

impl fmt::Debug for DemandPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemandPages")
            .field("id", &self.id.get())
            .field("reservations", &*self.reservations.lock())
            .finish_non_exhaustive()
    }
}

/// A [`MetaAllocator`] backed by on-demand OS reservations and registered with an
/// [`AllocatorRegistry`] for the whole of its lifetime.
///
/// The underlying allocator stays alive (and registered) while any handle it produced is
/// still around, even after this value has been dropped.
#[derive(Debug, Clone)]
pub struct DemandExecutableAllocator(Arc<MetaAllocator<DemandPages>>);

// ===== impl DemandExecutableAllocator =====

impl DemandExecutableAllocator {
    pub fn new(registry: &Arc<AllocatorRegistry>) -> Self {
        let allocator = MetaAllocator::new(
            DemandPages::new(Arc::clone(registry)),
            JIT_ALLOCATION_GRANULE,
            os::page_size(),
        );

        let weak = Arc::downgrade(&allocator) as Weak<dyn ByteAccounting>;
        let id = registry.register(weak);
        allocator
            .source()
            .id
            .set(id)
            .unwrap_or_else(|_| unreachable!("allocator was registered twice"));

        Self(allocator)
    }

    pub fn allocate(&self, size_in_bytes: usize, owner: OwnerTag) -> Option<ExecutableMemoryHandle> {
        self.0.allocate(size_in_bytes, owner)
    }

    /// Returns this allocator's id within its registry.
    pub fn id(&self) -> AllocatorId {
        *self
            .0
            .source()
            .id
            .get()
            .unwrap_or_else(|| unreachable!("allocator is registered on construction"))
    }

    pub fn registry(&self) -> &Arc<AllocatorRegistry> {
        &self.0.source().registry
    }

    pub fn bytes_allocated(&self) -> usize {
        self.0.bytes_allocated()
    }

    pub fn bytes_committed(&self) -> usize {
        self.0.bytes_committed()
    }

    pub fn bytes_reserved(&self) -> usize {
        self.0.bytes_reserved()
    }

    pub fn is_in_allocated_memory(&self, addr: usize) -> bool {
        self.0.is_in_allocated_memory(addr)
    }
}
