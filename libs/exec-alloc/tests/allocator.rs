// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, Barrier};
use std::thread;

use exec_alloc::{
    AllocatorRegistry, ExecutableAllocator, JitCompilationEffort, LARGE_ALLOCATION_PAGES, OwnerTag,
    os,
};

fn assert_accounting(allocator: &ExecutableAllocator) {
    let allocated = allocator.instance_bytes_allocated();
    let committed = allocator.instance_bytes_committed();
    let reserved = allocator.instance_bytes_reserved();
    assert!(allocated <= committed, "allocated {allocated} > committed {committed}");
    assert!(committed <= reserved, "committed {committed} > reserved {reserved}");
}

#[test_log::test]
fn aggregate_counts_every_instance() {
    let registry = AllocatorRegistry::with_memory_limit(None);
    let a = ExecutableAllocator::new(&registry);
    let b = ExecutableAllocator::new(&registry);

    let _ha = a.allocate(100, OwnerTag(1), JitCompilationEffort::CanFail).unwrap();
    let hb = b.allocate(200, OwnerTag(2), JitCompilationEffort::CanFail).unwrap();

    assert_eq!(a.instance_bytes_allocated(), 128);
    assert_eq!(b.instance_bytes_allocated(), 224);
    assert_eq!(registry.bytes_allocated_by_all_allocators(), 352);
    assert_eq!(a.committed_byte_count(), 2 * os::page_size());
    assert_eq!(b.committed_byte_count(), a.committed_byte_count());

    // releasing a handle only affects its own allocator
    drop(hb);
    assert_eq!(a.instance_bytes_allocated(), 128);
    assert_eq!(b.instance_bytes_allocated(), 0);
    assert_eq!(b.instance_bytes_committed(), 0);
    assert_eq!(a.committed_byte_count(), os::page_size());
}

#[test_log::test]
fn destroyed_allocators_leave_the_aggregate() {
    let registry = AllocatorRegistry::with_memory_limit(None);
    let a = ExecutableAllocator::new(&registry);
    let b = ExecutableAllocator::new(&registry);

    let _ha = a.allocate(64, OwnerTag::default(), JitCompilationEffort::CanFail).unwrap();
    let hb = b.allocate(64, OwnerTag::default(), JitCompilationEffort::CanFail).unwrap();
    assert_eq!(registry.len(), 2);

    drop(b);
    drop(hb);

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.bytes_allocated_by_all_allocators(), 64);
    assert_eq!(registry.bytes_committed_by_all_allocators(), os::page_size());
}

/// Returns `true` if the page containing `addr` is part of any mapping.
#[cfg(target_os = "linux")]
fn is_mapped(addr: usize) -> bool {
    let page = addr - addr % os::page_size();
    let mut residency = 0u8;
    // Safety: `mincore` only inspects the range and writes a single byte for a single page
    let res = unsafe {
        libc::mincore(
            core::ptr::with_exposed_provenance_mut(page),
            os::page_size(),
            &raw mut residency,
        )
    };
    if res == 0 {
        return true;
    }
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ENOMEM),
        "mincore failed for a reason other than an unmapped range"
    );
    false
}

#[cfg(target_os = "linux")]
#[test_log::test]
fn destroyed_allocators_release_their_reservations() {
    let registry = AllocatorRegistry::with_memory_limit(None);
    let allocator = ExecutableAllocator::new(&registry);

    let handle = allocator
        .allocate(64, OwnerTag::default(), JitCompilationEffort::MustSucceed)
        .unwrap();
    let addr = handle.start().as_ptr().expose_provenance();
    assert!(is_mapped(addr));

    // the handle alone keeps the reservation alive
    drop(allocator);
    assert!(is_mapped(addr));

    drop(handle);
    assert!(registry.is_empty());
    assert!(!is_mapped(addr));
}

#[test_log::test]
fn profiles_report_fragmentation() {
    let registry = AllocatorRegistry::with_memory_limit(None);
    let allocator = ExecutableAllocator::new(&registry);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            allocator
                .allocate(32, OwnerTag::default(), JitCompilationEffort::MustSucceed)
                .unwrap()
        })
        .collect();
    let profiles = registry.profiles();
    let [(_, before)] = profiles.as_slice() else {
        panic!("expected exactly one allocator");
    };
    assert_eq!(before.bytes_allocated, 128);
    assert_eq!(before.bytes_reserved, allocator.instance_bytes_reserved());

    // freeing the 2nd and 4th allocation leaves a hole between two live ones
    let mut handles = handles.into_iter();
    let _a = handles.next();
    drop(handles.next());
    let _c = handles.next();
    drop(handles.next());

    let profiles = registry.profiles();
    let [(_, after)] = profiles.as_slice() else {
        panic!("expected exactly one allocator");
    };
    assert_eq!(after.bytes_allocated, 64);
    assert_eq!(after.free_chunks, before.free_chunks + 1);
}

#[test_log::test]
fn accounting_holds_through_allocate_and_release() {
    let registry = AllocatorRegistry::with_memory_limit(None);
    let allocator = ExecutableAllocator::new(&registry);

    let mut handles = Vec::new();
    for size in [1, 31, 32, 33, 500, 4096, 5000, 12_000, 64] {
        handles.push(
            allocator
                .allocate(size, OwnerTag(size as u64), JitCompilationEffort::MustSucceed)
                .unwrap(),
        );
        assert_accounting(&allocator);
    }

    // release every other handle, then the rest
    let mut keep = true;
    handles.retain(|_| {
        keep = !keep;
        keep
    });
    assert_accounting(&allocator);

    drop(handles);
    assert_accounting(&allocator);
    assert_eq!(allocator.instance_bytes_allocated(), 0);
    assert_eq!(allocator.instance_bytes_committed(), 0);
}

#[test_log::test]
fn memory_limit_makes_allocation_recoverable() {
    let limit = LARGE_ALLOCATION_PAGES * os::page_size();
    let registry = AllocatorRegistry::with_memory_limit(Some(limit));
    let allocator = ExecutableAllocator::new(&registry);

    assert!(!allocator.under_memory_pressure());
    let half = allocator
        .allocate(limit / 2 + 32, OwnerTag::default(), JitCompilationEffort::CanFail)
        .unwrap();
    assert!(allocator.under_memory_pressure());
    assert!(allocator.memory_pressure_multiplier(0) > 1.0);

    let rest = allocator
        .allocate(limit / 2 - 32, OwnerTag::default(), JitCompilationEffort::CanFail)
        .unwrap();
    assert!(
        allocator
            .allocate(32, OwnerTag::default(), JitCompilationEffort::CanFail)
            .is_none()
    );

    // freeing memory makes room again, without growing
    drop(rest);
    assert!(
        allocator
            .allocate(32, OwnerTag::default(), JitCompilationEffort::CanFail)
            .is_some()
    );
    drop(half);
}

#[test_log::test]
fn concurrent_allocation() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 64;

    let registry = AllocatorRegistry::with_memory_limit(None);
    let shared = ExecutableAllocator::new(&registry);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let shared = shared.clone();
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                // half the threads use their own allocator to exercise aggregate queries
                // racing with allocation and destruction
                let own = ExecutableAllocator::new(&registry);
                let allocator = if thread % 2 == 0 { &shared } else { &own };

                barrier.wait();

                let mut handles = Vec::with_capacity(ROUNDS);
                for round in 0..ROUNDS {
                    let size = 32 * (1 + (thread * ROUNDS + round) % 48);
                    let handle = allocator
                        .allocate(size, OwnerTag(thread as u64), JitCompilationEffort::MustSucceed)
                        .unwrap();

                    // Safety: this thread holds the only clone of the handle
                    unsafe { handle.as_mut_slice().fill(u8::try_from(thread).unwrap()) };
                    handles.push(handle);

                    let _ = registry.bytes_committed_by_all_allocators();
                    let _ = allocator.memory_pressure_multiplier(size);
                }

                for handle in &handles {
                    let expected = u8::try_from(thread).unwrap();
                    assert!(handle.as_slice().iter().all(|byte| *byte == expected));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(registry.len(), 1);
    assert_eq!(shared.instance_bytes_allocated(), 0);
    assert_eq!(shared.committed_byte_count(), 0);
}
