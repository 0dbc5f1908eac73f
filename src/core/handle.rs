//! Job handles.
//!
//! A handle is a capability token referencing a completion counter in the manager's
//! handle table. It packs the counter's slot index in the low 16 bits and the slot's
//! generation in the high 16 bits. Every time a slot is recycled its generation
//! advances, which makes every handle still carrying the old generation stale.

use std::fmt;

pub(crate) const HANDLE_ID_MASK: u32 = 0x0000_ffff;
pub(crate) const HANDLE_GENERATION_SHIFT: u32 = 16;

/// Default number of handle slots.
pub const MAX_JOB_HANDLE_COUNT: usize = 4096;

/// Opaque reference to a job completion counter.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(u32);

impl JobHandle {
    /// "No handle". Behaves like a handle that already completed.
    ///
    /// The slot part of this value is 0xffff which the table never hands out.
    pub const INVALID: JobHandle = JobHandle(u32::MAX);

    #[inline]
    pub(crate) fn new(slot: u16, generation: u16) -> Self {
        debug_assert!((slot as u32) < HANDLE_ID_MASK);
        JobHandle(((generation as u32) << HANDLE_GENERATION_SHIFT) | slot as u32)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != JobHandle::INVALID
    }

    #[inline]
    pub fn slot(&self) -> u16 {
        (self.0 & HANDLE_ID_MASK) as u16
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        (self.0 >> HANDLE_GENERATION_SHIFT) as u16
    }

    /// The raw packed value, for interop with code that stores handles as integers.
    #[inline]
    pub fn to_bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        JobHandle(bits)
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        JobHandle::INVALID
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(f, "JobHandle(#{}@{})", self.slot(), self.generation())
        } else {
            f.write_str("JobHandle(INVALID)")
        }
    }
}

#[test]
fn handle_packing() {
    let handle = JobHandle::new(4095, 0xffff);
    assert_eq!(handle.slot(), 4095);
    assert_eq!(handle.generation(), 0xffff);
    assert!(handle.is_valid());
    assert_eq!(JobHandle::from_bits(handle.to_bits()), handle);

    // The generation never spills into the slot bits, even at its maximum.
    let a = JobHandle::new(7, 0xffff);
    let b = JobHandle::new(7, 0xffffu16.wrapping_add(1));
    assert_eq!(a.slot(), b.slot());
    assert_ne!(a, b);

    assert!(!JobHandle::default().is_valid());
    assert_eq!(format!("{:?}", JobHandle::INVALID), "JobHandle(INVALID)");
    assert_eq!(format!("{:?}", JobHandle::new(3, 2)), "JobHandle(#3@2)");
}
