// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;

use anyhow::Context;

use crate::os::{self, Permissions};

/// A contiguous range of reserved address space.
///
/// Pages inside the reservation start out inaccessible and are made usable one at a
/// time through [`Reservation::commit`]. The whole range is returned to the OS when the
/// reservation is dropped.
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
    permissions: Permissions,
}

// Safety: the reservation exclusively owns its address range, the raw pointer is only
// used as an address and for OS calls.
unsafe impl Send for Reservation {}
// Safety: see above
unsafe impl Sync for Reservation {}

// ===== impl Reservation =====

impl Reservation {
    /// Reserves `len` bytes of address space whose pages will be committed with
    /// `permissions`.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is not a multiple of the page size or if the OS refuses
    /// the reservation.
    pub fn new(len: usize, permissions: Permissions) -> crate::Result<Self> {
        anyhow::ensure!(
            len > 0 && len % os::page_size() == 0,
            "reservation size {len:#x} is not a non-zero multiple of the page size"
        );

        let base = os::reserve(len)
            .with_context(|| format!("failed to reserve {len:#x} bytes of address space"))?;

        tracing::debug!(?base, len, ?permissions, "reserved executable address space");

        Ok(Self {
            base,
            len,
            permissions,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns the reserved address range.
    pub fn range(&self) -> Range<usize> {
        let start = self.base.as_ptr().addr();
        start..start + self.len
    }

    /// Returns `true` if `addr` falls inside this reservation.
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Commits the single page starting at `page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS fails to commit the page.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not a page-aligned address inside this reservation.
    pub fn commit(&self, page: NonNull<u8>) -> crate::Result<()> {
        self.assert_owns_page(page);
        // Safety: we checked that the page lies inside our reservation
        unsafe { os::commit(page, os::page_size(), self.permissions) }
            .with_context(|| format!("failed to commit page {page:?}"))
    }

    /// Decommits the single page starting at `page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS fails to decommit the page.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not a page-aligned address inside this reservation.
    pub fn decommit(&self, page: NonNull<u8>) -> crate::Result<()> {
        self.assert_owns_page(page);
        // Safety: we checked that the page lies inside our reservation, the caller (the
        // meta allocator) only decommits pages without live allocations.
        unsafe { os::decommit(page, os::page_size()) }
            .with_context(|| format!("failed to decommit page {page:?}"))
    }

    fn assert_owns_page(&self, page: NonNull<u8>) {
        let addr = page.as_ptr().addr();
        assert!(
            addr % os::page_size() == 0 && self.contains(addr),
            "page {page:?} is not part of reservation {self:?}"
        );
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        tracing::debug!(base = ?self.base, len = self.len, "releasing reservation");

        // Safety: base and len describe exactly the reservation made in `new`
        let res = unsafe { os::release(self.base, self.len) };
        debug_assert!(res.is_ok(), "failed to release reservation: {res:?}");
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("range", &format_args!("{:#x?}", self.range()))
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}
