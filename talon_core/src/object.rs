//! Opaque heap references as seen by compiled code.

use std::fmt;

/// Address of a heap object.
///
/// Compiled code embeds these as 32-bit words, so the collector must keep
/// every object referenced from code below 4 GiB.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(u32);

impl ObjectRef {
    #[inline]
    pub const fn from_address(address: u32) -> Self {
        Self(address)
    }

    #[inline]
    pub const fn address(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Answers "has this object moved, and where to" during a collection pause.
///
/// Implementations are called with the world stopped and must neither block
/// nor allocate.
pub trait ObjectMotion {
    fn forwarded(&self, obj: ObjectRef) -> Option<ObjectRef>;
}

impl<F> ObjectMotion for F
where
    F: Fn(ObjectRef) -> Option<ObjectRef>,
{
    #[inline]
    fn forwarded(&self, obj: ObjectRef) -> Option<ObjectRef> {
        self(obj)
    }
}

/// Printable identity of heap objects for diagnostics.
pub trait ObjectDescriber {
    fn describe(&self, obj: ObjectRef) -> String;
}

/// Describes objects by address only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressDescriber;

impl ObjectDescriber for AddressDescriber {
    fn describe(&self, obj: ObjectRef) -> String {
        format!("obj@{:#x}", obj.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_motion() {
        let motion = |obj: ObjectRef| Some(ObjectRef::from_address(obj.address() + 0x10));
        let moved = motion.forwarded(ObjectRef::from_address(0x100));
        assert_eq!(moved, Some(ObjectRef::from_address(0x110)));
    }

    #[test]
    fn test_address_describer() {
        let text = AddressDescriber.describe(ObjectRef::from_address(0x2a0));
        assert_eq!(text, "obj@0x2a0");
    }
}
