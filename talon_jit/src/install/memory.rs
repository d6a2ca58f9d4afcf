//! Executable memory backed by anonymous mappings.
//!
//! Regions start out read+write. `make_executable` flips them to
//! read+execute; they are never writable and executable at once.
//!
//! Compiled code addresses are 32 bits wide, so every mapping lies below
//! 4 GiB. x86-64 Linux asks the kernel for that with `MAP_32BIT`; other
//! hosts walk a low address hint and reject anything placed above it.
//!
//! # Safety
//! All memory management is inherently unsafe. This module keeps the raw
//! mapping behind `MmapRegion`, which owns it exclusively until drop.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use talon_core::{CodeAllocator, CodeRegion};
use tracing::trace;

/// Fallback when the page size cannot be queried.
const DEFAULT_PAGE_SIZE: usize = 4096;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[inline]
const fn align_to(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}

// =============================================================================
// Placement
// =============================================================================

/// Mappings must end at or below this address.
const ADDRESS_LIMIT: u64 = 1 << 32;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LOW_FLAGS: libc::c_int = libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const LOW_FLAGS: libc::c_int = 0;

/// First address hint when the kernel has no low-mapping flag.
const FIRST_HINT: usize = 0x1000_0000;

/// Distance the hint moves after a mapping lands out of range.
const HINT_STEP: usize = 1 << 24;

const MAX_ATTEMPTS: usize = 16;

static NEXT_HINT: AtomicUsize = AtomicUsize::new(FIRST_HINT);

#[inline]
fn below_limit(base: usize, mapped: usize) -> bool {
    base as u64 + mapped as u64 <= ADDRESS_LIMIT
}

fn address_hint() -> *mut libc::c_void {
    if LOW_FLAGS != 0 {
        ptr::null_mut()
    } else {
        NEXT_HINT.load(Ordering::Relaxed) as *mut libc::c_void
    }
}

// =============================================================================
// Region
// =============================================================================

/// One mapping holding one method's code.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    /// Bytes requested by the caller.
    len: usize,
    /// Page-aligned size of the mapping.
    mapped: usize,
    executable: bool,
}

impl MmapRegion {
    fn map(len: usize) -> io::Result<Self> {
        let mapped = align_to(len.max(1), page_size());
        for _ in 0..MAX_ATTEMPTS {
            // SAFETY: without MAP_FIXED the hint never replaces an existing
            // mapping, and a fresh private anonymous mapping aliases nothing.
            let raw = unsafe {
                libc::mmap(
                    address_hint(),
                    mapped,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | LOW_FLAGS,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let ptr = NonNull::new(raw.cast::<u8>())
                .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
            let region = Self {
                ptr,
                len,
                mapped,
                executable: false,
            };
            if below_limit(region.base(), mapped) {
                trace!(base = region.base(), mapped, "mapped code region");
                return Ok(region);
            }
            trace!(base = region.base(), "code region above 4 GiB, retrying");
            NEXT_HINT.fetch_add(HINT_STEP, Ordering::Relaxed);
            drop(region);
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "no code region available below 4 GiB",
        ))
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Size of the underlying mapping.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.mapped
    }

    fn protect(&mut self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: the range is exactly the mapping this region owns.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.mapped, prot) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl CodeRegion for MmapRegion {
    #[inline]
    fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is readable in both protection states and
        // at least `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(!self.executable, "code region written while executable");
        // SAFETY: the mapping is writable and exclusively borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn make_writable(&mut self) -> io::Result<()> {
        if self.executable {
            self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
            self.executable = false;
        }
        Ok(())
    }

    fn make_executable(&mut self) -> io::Result<()> {
        if !self.executable {
            self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
            self.executable = true;
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by this region and no longer borrowed.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.mapped);
        }
    }
}

// SAFETY: the region owns its mapping; mutation requires `&mut self`.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

// =============================================================================
// Allocator
// =============================================================================

/// Hands out one fresh mapping per method.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAllocator;

impl CodeAllocator for MmapAllocator {
    fn allocate(&self, len: usize) -> io::Result<Box<dyn CodeRegion>> {
        Ok(Box::new(MmapRegion::map(len)?))
    }
}
