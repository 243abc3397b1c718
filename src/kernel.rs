use std::ptr::{self, NonNull};

/// This trait provides an abstraction to handle the platform's virtual
/// memory syscalls. The allocator above thinks strictly in whole pages and
/// has nothing to do with the concrete mapping APIs offered by each kernel.
trait PlatformMemory {
    /// Request a mapping of `len` bytes of anonymous read/write memory.
    /// Returns the base address, or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the mapping of size `len` starting at `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Unit type the per-platform modules hang their [`PlatformMemory`] impl on.
struct Kernel;

/// Virtual memory page size of this machine. Usually 4096.
pub(crate) fn page_size() -> usize {
    unsafe { Kernel::page_size() }
}

/// Maps `units` contiguous anonymous read/write pages and zero-fills them.
///
/// Returns None when the OS refuses the mapping. Anonymous mappings arrive
/// zeroed on both supported platforms; the zeroing here makes that part of
/// this function's contract rather than the platform's.
pub(crate) fn request_vm_pages(units: usize, page_size: usize) -> Option<NonNull<u8>> {
    let len = units * page_size;

    unsafe {
        let base = Kernel::request_memory(len)?;
        ptr::write_bytes(base.as_ptr(), 0, len);

        Some(base)
    }
}

/// Unmaps `units` pages at `base`.
///
/// **SAFETY**: `base` must be exactly what [`request_vm_pages`] returned,
/// with the same `units`, and nothing may reference the region afterwards.
pub(crate) unsafe fn release_vm_pages(base: *mut u8, units: usize, page_size: usize) {
    unsafe { Kernel::return_memory(base, units * page_size) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory, never executable.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
