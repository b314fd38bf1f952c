// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! On-demand allocator for executable memory.
//!
//! Address space is reserved from the OS in large chunks and handed out in small,
//! granule sized pieces to the code generator. Physical pages are committed when the
//! first allocation touching them is made and decommitted again once the last one is
//! released.
//!
//! Every allocator instance registers itself with an [`AllocatorRegistry`] so that
//! memory pressure decisions can be made based on the consumption of *all* runtimes
//! in the process, not just the calling one.

mod demand;
mod executable;
mod handle;
mod meta;
pub mod os;
mod registry;
mod reservation;

pub type Result<T> = anyhow::Result<T>;

pub use demand::{DemandExecutableAllocator, DemandPages};
pub use executable::{ExecutableAllocator, JitCompilationEffort};
pub use handle::{ExecutableMemoryHandle, OwnerTag};
pub use meta::{MetaAllocator, PageSource};
pub use os::Permissions;
pub use registry::{AllocatorId, AllocatorProfile, AllocatorRegistry, ByteAccounting};
pub use reservation::Reservation;

/// The granule in which executable memory is handed out. Every allocation is rounded
/// up to a multiple of this.
pub const JIT_ALLOCATION_GRANULE: usize = 32;

/// The number of OS pages reserved at once whenever an allocator runs out of space.
///
/// Reserving in large chunks amortizes the cost of the reservation syscall over many
/// small allocations.
pub const LARGE_ALLOCATION_PAGES: usize = 4;

/// The process-wide executable memory limit, in bytes, if any.
#[cfg(feature = "memory-limit")]
pub const EXECUTABLE_MEMORY_LIMIT: Option<usize> = Some(1_000_000);
/// The process-wide executable memory limit, in bytes, if any.
#[cfg(not(feature = "memory-limit"))]
pub const EXECUTABLE_MEMORY_LIMIT: Option<usize> = None;

/// The permissions executable pools are committed with.
pub const EXECUTABLE_POOL_PERMISSIONS: Permissions = Permissions::READ
    .union(Permissions::WRITE)
    .union(Permissions::EXECUTE);
