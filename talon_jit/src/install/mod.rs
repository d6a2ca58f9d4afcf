//! Publishing compiled methods.
//!
//! - [`CodeCache`]: the table of installed methods, searchable by id and by
//!   code address, and the entry point for collector-driven relocation
//! - [`MmapAllocator`]: page-granular W^X executable memory on unix

pub mod code_cache;
#[cfg(unix)]
pub mod memory;

pub use code_cache::{CodeCache, CodeCacheStats};
#[cfg(unix)]
pub use memory::{MmapAllocator, MmapRegion};
