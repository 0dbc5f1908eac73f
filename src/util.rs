use crate::sync::{AtomicBool, Ordering};

/// Dynamically asserts that something is owned by a single party at a time, for
/// example a fiber being bound to at most one worker.
///
/// Only use this for debugging.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    /// Take ownership. Panics if it is already taken.
    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }
}

#[test]
fn exclusive_check_rebind() {
    let lock = ExclusiveCheck::with_tag("fiber");

    lock.begin();
    lock.end();

    lock.begin();
    lock.end();

    lock.begin();
    lock.end();
}

#[test]
#[should_panic]
fn exclusive_check_double_bind() {
    let lock = ExclusiveCheck::with_tag(7u32);

    lock.begin();
    lock.begin();

    lock.end();
    lock.end();
}

