//! Method entry traps.
//!
//! A trap makes a method's compiled entry call the `MethodTrap` stub with
//! the trap's handle before running the body. The table is created at VM
//! startup with a fixed capacity, passed to the compiler explicitly, and
//! disposed at shutdown.

use parking_lot::RwLock;
use talon_core::MethodId;
use tracing::debug;

use crate::error::TrapError;

/// Why a method is trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind {
    Breakpoint,
    /// Count entries for the profiler.
    EntryCount,
}

/// Index of an entry, passed to the trap stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapHandle(u32);

impl TrapHandle {
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// An outstanding trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub handle: TrapHandle,
    pub method: MethodId,
    pub kind: TrapKind,
}

#[derive(Debug)]
pub struct TrapTable {
    slots: RwLock<Box<[Option<Trap>]>>,
}

impl TrapTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity].into_boxed_slice()),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trap `method`, replacing the kind of an existing trap.
    ///
    /// Methods already compiled keep running untrapped until recompiled.
    pub fn set_trap(&self, method: MethodId, kind: TrapKind) -> Result<TrapHandle, TrapError> {
        let mut slots = self.slots.write();
        if let Some(trap) = slots.iter_mut().flatten().find(|t| t.method == method) {
            trap.kind = kind;
            return Ok(trap.handle);
        }
        let capacity = slots.len();
        let Some(index) = slots.iter().position(Option::is_none) else {
            return Err(TrapError::TableFull { capacity });
        };
        let handle = TrapHandle(index as u32);
        slots[index] = Some(Trap {
            handle,
            method,
            kind,
        });
        debug!(%method, ?kind, handle = index, "trap set");
        Ok(handle)
    }

    /// Remove the trap on `method`, returning its kind.
    pub fn clear_trap(&self, method: MethodId) -> Option<TrapKind> {
        let mut slots = self.slots.write();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.is_some_and(|t| t.method == method))?;
        slot.take().map(|trap| trap.kind)
    }

    pub fn trap_for(&self, method: MethodId) -> Option<Trap> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|t| t.method == method)
            .copied()
    }

    /// Look up the trap a stub was called with.
    pub fn resolve(&self, handle: TrapHandle) -> Option<Trap> {
        self.slots.read().get(handle.0 as usize).copied().flatten()
    }

    /// Tear the table down at shutdown, returning the traps still set.
    pub fn dispose(self) -> Vec<Trap> {
        let outstanding: Vec<Trap> = self.slots.into_inner().into_vec().into_iter().flatten().collect();
        debug!(outstanding = outstanding.len(), "trap table disposed");
        outstanding
    }
}
