//! Runtime entry points reachable from compiled code.

use std::fmt;

/// A runtime routine compiled code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stub {
    /// Transfer to another method; callee id in the first argument register.
    Invoke = 0,
    /// Soft-float single-precision addition.
    FloatAdd = 1,
    /// Method entry trap (breakpoints, profiling).
    MethodTrap = 2,
}

impl Stub {
    pub const COUNT: usize = 3;

    pub const ALL: [Stub; Self::COUNT] = [Stub::Invoke, Stub::FloatAdd, Stub::MethodTrap];

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Stub::Invoke => "invoke",
            Stub::FloatAdd => "float_add",
            Stub::MethodTrap => "method_trap",
        }
    }
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a stub lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubLocation {
    /// Inside the compiled-code heap; reached with a PC-relative call.
    CodeHeap(u32),
    /// Native runtime code at a fixed absolute address.
    Native(u32),
}

impl StubLocation {
    #[inline]
    pub const fn address(self) -> u32 {
        match self {
            StubLocation::CodeHeap(addr) | StubLocation::Native(addr) => addr,
        }
    }
}

/// Addresses of every runtime stub, fixed at VM startup.
#[derive(Debug, Clone, Default)]
pub struct StubTable {
    locations: [Option<StubLocation>; Stub::COUNT],
}

impl StubTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stub location.
    pub fn with(mut self, stub: Stub, location: StubLocation) -> Self {
        self.locations[stub as usize] = Some(location);
        self
    }

    #[inline]
    pub fn location(&self, stub: Stub) -> Option<StubLocation> {
        self.locations[stub as usize]
    }

    /// Find the stub whose entry is at `address`.
    pub fn stub_at(&self, address: u32) -> Option<Stub> {
        Stub::ALL
            .into_iter()
            .find(|&stub| self.location(stub).map(StubLocation::address) == Some(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_table_lookup() {
        let table = StubTable::new()
            .with(Stub::Invoke, StubLocation::CodeHeap(0x4000))
            .with(Stub::FloatAdd, StubLocation::Native(0x9000));
        assert_eq!(table.location(Stub::Invoke), Some(StubLocation::CodeHeap(0x4000)));
        assert_eq!(table.location(Stub::MethodTrap), None);
        assert_eq!(table.stub_at(0x9000), Some(Stub::FloatAdd));
        assert_eq!(table.stub_at(0x1234), None);
    }
}
