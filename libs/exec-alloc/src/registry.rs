// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::EXECUTABLE_MEMORY_LIMIT;

/// Per-instance byte counters an allocator exposes to the registry.
pub trait ByteAccounting: Send + Sync {
    fn bytes_allocated(&self) -> usize;
    fn bytes_committed(&self) -> usize;

    /// A snapshot of all counters. Allocators that don't track reservations or free space
    /// report zero for those.
    fn profile(&self) -> AllocatorProfile {
        AllocatorProfile {
            bytes_allocated: self.bytes_allocated(),
            bytes_committed: self.bytes_committed(),
            ..AllocatorProfile::default()
        }
    }
}

/// Counters of one allocator, see [`AllocatorRegistry::profiles`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AllocatorProfile {
    pub bytes_allocated: usize,
    pub bytes_committed: usize,
    pub bytes_reserved: usize,
    /// Number of disjoint free chunks, a measure of fragmentation.
    pub free_chunks: usize,
}

/// Identifies an allocator within its [`AllocatorRegistry`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(u64);

/// The set of live executable allocators in the process.
///
/// Aggregate accounting (and therefore memory pressure) is computed across every
/// registered allocator. The registry only holds weak references, an allocator is
/// registered by its constructor and removed again by its destructor.
pub struct AllocatorRegistry {
    memory_limit: Option<usize>,
    next_id: AtomicU64,
    allocators: Mutex<HashMap<AllocatorId, Weak<dyn ByteAccounting>>>,
}

// ===== impl AllocatorRegistry =====

impl AllocatorRegistry {
    /// Creates a registry enforcing the compile-time [`EXECUTABLE_MEMORY_LIMIT`].
    pub fn new() -> Arc<Self> {
        Self::with_memory_limit(EXECUTABLE_MEMORY_LIMIT)
    }

    /// Creates a registry enforcing `memory_limit` bytes across all of its allocators.
    pub fn with_memory_limit(memory_limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            memory_limit,
            next_id: AtomicU64::new(0),
            allocators: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    /// Adds `allocator` to the registry and returns the id to deregister it with.
    pub fn register(&self, allocator: Weak<dyn ByteAccounting>) -> AllocatorId {
        let id = AllocatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut allocators = self.allocators.lock();
        allocators.insert(id, allocator);
        tracing::debug!(?id, live = allocators.len(), "registered executable allocator");
        id
    }

    /// Removes the allocator identified by `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn deregister(&self, id: AllocatorId) {
        let mut allocators = self.allocators.lock();
        let removed = allocators.remove(&id);
        assert!(removed.is_some(), "allocator {id:?} was not registered");
        tracing::debug!(?id, live = allocators.len(), "deregistered executable allocator");
    }

    /// Returns the number of registered allocators.
    pub fn len(&self) -> usize {
        self.allocators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes allocated across all registered allocators.
    pub fn bytes_allocated_by_all_allocators(&self) -> usize {
        self.sum(|allocator| allocator.bytes_allocated())
    }

    /// Returns the number of bytes committed across all registered allocators.
    pub fn bytes_committed_by_all_allocators(&self) -> usize {
        self.sum(|allocator| allocator.bytes_committed())
    }

    /// Returns `true` once more than half of the memory limit is allocated. Without a limit
    /// there is never any pressure.
    pub fn under_memory_pressure(&self) -> bool {
        self.memory_limit
            .is_some_and(|limit| self.bytes_allocated_by_all_allocators() > limit / 2)
    }

    /// Returns a factor `>= 1.0` that grows as allocating `added_bytes` more would bring the
    /// process closer to the memory limit.
    ///
    /// The factor is `limit / (limit - allocated)` where `allocated` includes
    /// `added_bytes` and is clamped to the limit. At the limit the denominator is clamped to
    /// one so the result is the largest finite pressure (`limit`). Without a limit the
    /// factor is always `1.0`.
    #[expect(
        clippy::float_arithmetic,
        clippy::cast_precision_loss,
        reason = "the multiplier is a heuristic, precision loss on huge limits is irrelevant"
    )]
    pub fn memory_pressure_multiplier(&self, added_bytes: usize) -> f64 {
        let Some(limit) = self.memory_limit else {
            return 1.0;
        };

        let allocated = self
            .bytes_allocated_by_all_allocators()
            .saturating_add(added_bytes)
            .min(limit);
        let headroom = (limit - allocated).max(1);

        (limit as f64 / headroom as f64).max(1.0)
    }

    /// Returns the counters of every live allocator, ordered by id.
    pub fn profiles(&self) -> Vec<(AllocatorId, AllocatorProfile)> {
        let mut profiles = Vec::new();
        self.for_each_live(|id, allocator| profiles.push((id, allocator.profile())));
        profiles.sort_unstable_by_key(|(id, _)| *id);
        profiles
    }

    /// Logs the counters of every live allocator and their totals.
    #[cfg(feature = "profile")]
    pub fn dump_profile(&self) {
        let mut total = AllocatorProfile::default();
        for (id, profile) in self.profiles() {
            tracing::info!(
                ?id,
                allocated = profile.bytes_allocated,
                committed = profile.bytes_committed,
                reserved = profile.bytes_reserved,
                free_chunks = profile.free_chunks,
                "executable allocator profile"
            );
            total.bytes_allocated += profile.bytes_allocated;
            total.bytes_committed += profile.bytes_committed;
            total.bytes_reserved += profile.bytes_reserved;
            total.free_chunks += profile.free_chunks;
        }
        tracing::info!(
            allocated = total.bytes_allocated,
            committed = total.bytes_committed,
            reserved = total.bytes_reserved,
            free_chunks = total.free_chunks,
            "executable allocator profile totals"
        );
    }

    fn sum(&self, f: impl Fn(&dyn ByteAccounting) -> usize) -> usize {
        let mut total = 0;
        self.for_each_live(|_, allocator| total += f(allocator));
        total
    }

    fn for_each_live(&self, mut f: impl FnMut(AllocatorId, &dyn ByteAccounting)) {
        let mut upgraded = Vec::new();

        {
            let allocators = self.allocators.lock();
            for (id, allocator) in &*allocators {
                // allocators that are mid-destruction can no longer be upgraded and are
                // skipped, their deregistration is imminent
                if let Some(allocator) = allocator.upgrade() {
                    f(*id, allocator.as_ref());
                    upgraded.push(allocator);
                }
            }
        }

        // Dropping the last strong reference deregisters the allocator, which takes the
        // registry lock again.
        drop(upgraded);
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("memory_limit", &self.memory_limit)
            .field("allocators", &self.len())
            .finish_non_exhaustive()
    }
}
