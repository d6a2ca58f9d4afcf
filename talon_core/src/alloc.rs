//! Executable-memory contract.
//!
//! The JIT writes into a region while it is writable, then flips it to
//! read+execute before publishing. Regions are never writable and
//! executable at the same time.

use std::io;

/// A block of memory that will hold one compiled method.
pub trait CodeRegion: Send + Sync {
    /// Absolute address of the first byte.
    fn base(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the region's contents.
    fn bytes(&self) -> &[u8];

    /// Mutable view; only valid between `make_writable` and `make_executable`.
    fn bytes_mut(&mut self) -> &mut [u8];

    fn make_writable(&mut self) -> io::Result<()>;

    fn make_executable(&mut self) -> io::Result<()>;
}

/// Source of code regions.
pub trait CodeAllocator: Send + Sync {
    /// Allocate a writable region of at least `len` bytes.
    fn allocate(&self, len: usize) -> io::Result<Box<dyn CodeRegion>>;
}
