//! Table of installed methods.
//!
//! Installation moves a method's code into executable memory and publishes
//! it under a write lock, so readers see either no entry or a complete one.
//! The cache accounts installed bytes against a fixed capacity.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use talon_core::{CodeAllocator, MethodId, ObjectMotion};
use tracing::{debug, trace};

use crate::error::InstallError;
use crate::method::CompiledMethod;

#[derive(Debug, Default)]
struct Installed {
    methods: FxHashMap<MethodId, CompiledMethod>,
    used: usize,
}

/// Installed compiled methods, keyed by source method.
///
/// Thread-safe via internal locking.
#[derive(Debug)]
pub struct CodeCache {
    inner: RwLock<Installed>,
    capacity: usize,
    installs: AtomicU64,
    uninstalls: AtomicU64,
    rejections: AtomicU64,
    relocation_passes: AtomicU64,
    moves: AtomicU64,
}

impl CodeCache {
    /// Create a cache admitting at most `capacity` bytes of code.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Installed::default()),
            capacity,
            installs: AtomicU64::new(0),
            uninstalls: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            relocation_passes: AtomicU64::new(0),
            moves: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.read().methods.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of installed code.
    #[inline]
    pub fn used(&self) -> usize {
        self.inner.read().used
    }

    /// Install `method` into memory from `allocator` and publish it.
    ///
    /// Returns the entry address. On failure nothing is published and the
    /// method stays interpreted.
    pub fn install(
        &self,
        method: CompiledMethod,
        allocator: &dyn CodeAllocator,
    ) -> Result<usize, InstallError> {
        let id = method.source().id;
        let requested = method.length();
        let mut inner = self.inner.write();

        if inner.methods.contains_key(&id) {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(InstallError::AlreadyInstalled(id));
        }
        if inner.used + requested > self.capacity {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(InstallError::CacheFull {
                used: inner.used,
                capacity: self.capacity,
                requested,
            });
        }

        let installed = method.install_into(allocator)?;
        let entry = installed.entry_address();
        inner.used += requested;
        inner.methods.insert(id, installed);
        self.installs.fetch_add(1, Ordering::Relaxed);
        debug!(method = %id, entry = format_args!("{entry:#x}"), bytes = requested, "installed");
        Ok(entry)
    }

    /// Unpublish the method compiled for `id`.
    ///
    /// The returned method is already discarded; its memory is released when
    /// the caller drops it.
    pub fn uninstall(&self, id: MethodId) -> Result<CompiledMethod, InstallError> {
        let mut inner = self.inner.write();
        let mut method = inner
            .methods
            .remove(&id)
            .ok_or(InstallError::NotInstalled(id))?;
        inner.used -= method.length();
        method.discard();
        self.uninstalls.fetch_add(1, Ordering::Relaxed);
        debug!(method = %id, "uninstalled");
        Ok(method)
    }

    pub fn entry_address(&self, id: MethodId) -> Option<usize> {
        self.inner.read().methods.get(&id).map(|m| m.entry_address())
    }

    /// Find the method whose code contains `address`.
    pub fn method_at(&self, address: usize) -> Option<MethodId> {
        self.inner
            .read()
            .methods
            .values()
            .find(|m| m.contains(address))
            .map(|m| m.source().id)
    }

    /// Run `f` on the installed method for `id`.
    pub fn with_method<R>(&self, id: MethodId, f: impl FnOnce(&CompiledMethod) -> R) -> Option<R> {
        self.inner.read().methods.get(&id).map(f)
    }

    /// Rewrite heap references in every installed method.
    ///
    /// Called from a collection pause. Returns the number of words patched.
    pub fn relocate_for_object_motion(&self, motion: &dyn ObjectMotion) -> Result<usize, InstallError> {
        let mut inner = self.inner.write();
        let mut patched = 0;
        for method in inner.methods.values_mut() {
            patched += method.relocate_for_object_motion(motion)?;
        }
        self.relocation_passes.fetch_add(1, Ordering::Relaxed);
        trace!(methods = inner.methods.len(), patched, "object motion applied to code cache");
        Ok(patched)
    }

    /// Move an installed method into a fresh region from `allocator`.
    ///
    /// The method is republished at its new address under the write lock and
    /// its old region released; the caller guarantees no thread is executing
    /// it. On failure the method stays where it was. Returns the new entry
    /// address.
    pub fn relocate_for_code_motion(
        &self,
        id: MethodId,
        allocator: &dyn CodeAllocator,
    ) -> Result<usize, InstallError> {
        let mut inner = self.inner.write();
        let method = inner
            .methods
            .get_mut(&id)
            .ok_or(InstallError::NotInstalled(id))?;
        let from = method.entry_address();
        let patched = method.relocate_into(allocator)?;
        let entry = method.entry_address();
        self.moves.fetch_add(1, Ordering::Relaxed);
        debug!(
            method = %id,
            from = format_args!("{from:#x}"),
            to = format_args!("{entry:#x}"),
            patched,
            "moved"
        );
        Ok(entry)
    }

    pub fn stats(&self) -> CodeCacheStats {
        let inner = self.inner.read();
        CodeCacheStats {
            methods: inner.methods.len(),
            bytes_used: inner.used,
            capacity: self.capacity,
            installs: self.installs.load(Ordering::Relaxed),
            uninstalls: self.uninstalls.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            relocation_passes: self.relocation_passes.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub methods: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub installs: u64,
    pub uninstalls: u64,
    /// Installs refused for capacity or duplication.
    pub rejections: u64,
    pub relocation_passes: u64,
    /// Installed methods moved to a new region.
    pub moves: u64,
}

impl CodeCacheStats {
    /// Fraction of the capacity in use.
    #[inline]
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.capacity as f64
        }
    }
}
