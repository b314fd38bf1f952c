// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrappers around the host's virtual memory primitives.
//!
//! Address space is first *reserved* (no access, no physical backing), individual pages
//! are then *committed* with the desired permissions and *decommitted* again once
//! they hold no live data. None of these functions track state, that is the job of
//! [`Reservation`](crate::Reservation).

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads from the memory region
        const READ = 1 << 0;
        /// Allow writes to the memory region
        const WRITE = 1 << 1;
        /// Allow code execution from the memory region
        const EXECUTE = 1 << 2;
    }
}

/// Returns the host page size in bytes.
///
/// # Panics
///
/// Panics if the OS reports a page size that is not a power of two.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let page_size = sys::page_size();
        assert!(page_size.is_power_of_two());
        page_size
    })
}

/// Reserves `len` bytes of inaccessible address space.
///
/// # Errors
///
/// Returns the OS error if the address space could not be reserved.
pub fn reserve(len: usize) -> io::Result<NonNull<u8>> {
    debug_assert_eq!(len % page_size(), 0);
    sys::reserve(len)
}

/// Backs `len` bytes starting at `ptr` with physical memory and applies `permissions`.
///
/// # Errors
///
/// Returns the OS error if the pages could not be committed.
///
/// # Safety
///
/// The range must lie within a single live reservation obtained from [`reserve`].
pub unsafe fn commit(ptr: NonNull<u8>, len: usize, permissions: Permissions) -> io::Result<()> {
    // Safety: ensured by caller
    unsafe { sys::commit(ptr, len, permissions) }
}

/// Drops the physical backing of `len` bytes starting at `ptr` and makes them
/// inaccessible. The address space stays reserved.
///
/// # Errors
///
/// Returns the OS error if the pages could not be decommitted.
///
/// # Safety
///
/// The range must lie within a single live reservation obtained from [`reserve`] and must
/// not contain any data that is still in use.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // Safety: ensured by caller
    unsafe { sys::decommit(ptr, len) }
}

/// Returns a whole reservation to the OS.
///
/// # Errors
///
/// Returns the OS error if the range could not be released.
///
/// # Safety
///
/// `ptr` and `len` must describe exactly one reservation obtained from [`reserve`], and no
/// references into it may outlive this call.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // Safety: ensured by caller
    unsafe { sys::release(ptr, len) }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys {
            use std::io;
            use std::ptr::{self, NonNull};

            use super::Permissions;

            pub(super) fn page_size() -> usize {
                // Safety: sysconf has no preconditions
                let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(page_size).expect("sysconf returned a negative page size")
            }

            fn protection(permissions: Permissions) -> libc::c_int {
                let mut prot = libc::PROT_NONE;
                if permissions.contains(Permissions::READ) {
                    prot |= libc::PROT_READ;
                }
                if permissions.contains(Permissions::WRITE) {
                    prot |= libc::PROT_WRITE;
                }
                if permissions.contains(Permissions::EXECUTE) {
                    prot |= libc::PROT_EXEC;
                }
                prot
            }

            pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
                cfg_if::cfg_if! {
                    if #[cfg(any(target_os = "linux", target_os = "android"))] {
                        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
                    } else {
                        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                    }
                }

                // Safety: an anonymous, non-fixed mapping does not alias any existing memory
                let ptr = unsafe { libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, flags, -1, 0) };
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }

                NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
            }

            pub(super) unsafe fn commit(
                ptr: NonNull<u8>,
                len: usize,
                permissions: Permissions,
            ) -> io::Result<()> {
                // Safety: ensured by caller
                let ret = unsafe { libc::mprotect(ptr.as_ptr().cast(), len, protection(permissions)) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            pub(super) unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
                // Safety: ensured by caller
                unsafe {
                    if libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_NONE) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            }

            pub(super) unsafe fn release(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
                // Safety: ensured by caller
                let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
        }
    } else if #[cfg(windows)] {
        mod sys {
            use std::io;
            use std::mem::MaybeUninit;
            use std::ptr::{self, NonNull};

            use windows_sys::Win32::System::Memory::{
                MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE,
                PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
                PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree,
            };
            use windows_sys::Win32::System::SystemInformation::GetSystemInfo;

            use super::Permissions;

            pub(super) fn page_size() -> usize {
                let mut info = MaybeUninit::uninit();
                // Safety: GetSystemInfo always initializes the struct
                let info = unsafe {
                    GetSystemInfo(info.as_mut_ptr());
                    info.assume_init()
                };
                usize::try_from(info.dwPageSize).expect("page size does not fit in usize")
            }

            fn protection(permissions: Permissions) -> PAGE_PROTECTION_FLAGS {
                let read = permissions.contains(Permissions::READ);
                let write = permissions.contains(Permissions::WRITE);
                let execute = permissions.contains(Permissions::EXECUTE);

                match (read, write, execute) {
                    (_, true, true) => PAGE_EXECUTE_READWRITE,
                    (true, false, true) => PAGE_EXECUTE_READ,
                    (false, false, true) => PAGE_EXECUTE,
                    (_, true, false) => PAGE_READWRITE,
                    (true, false, false) => PAGE_READONLY,
                    (false, false, false) => PAGE_NOACCESS,
                }
            }

            pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
                // Safety: reserving fresh address space does not alias any existing memory
                let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
                NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
            }

            pub(super) unsafe fn commit(
                ptr: NonNull<u8>,
                len: usize,
                permissions: Permissions,
            ) -> io::Result<()> {
                // Safety: ensured by caller
                let ret = unsafe {
                    VirtualAlloc(ptr.as_ptr().cast(), len, MEM_COMMIT, protection(permissions))
                };
                if ret.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            pub(super) unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
                // Safety: ensured by caller
                let ret = unsafe { VirtualFree(ptr.as_ptr().cast(), len, MEM_DECOMMIT) };
                if ret == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            pub(super) unsafe fn release(ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
                // Safety: ensured by caller
                let ret = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
                if ret == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
        }
    } else {
        compile_error!("exec-alloc only supports unix and windows hosts");
    }
}
