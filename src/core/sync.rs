pub use std::sync::atomic::Ordering;
use std::sync::PoisonError;

#[cfg(not(loom))] pub use std::sync::{
    Arc, Mutex, MutexGuard, Condvar,
    atomic::{AtomicBool, AtomicU32, AtomicU64},
};

#[cfg(loom)] pub use loom::sync::{
    Arc, Mutex, MutexGuard, Condvar,
    atomic::{AtomicBool, AtomicU32, AtomicU64},
};

/// Lock a mutex, ignoring poisoning.
///
/// Jobs are not protected against panics, so a job that panics while its worker
/// holds one of our locks must not wedge every other thread of the manager.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub fn wait<'l, T>(cond: &Condvar, guard: MutexGuard<'l, T>) -> MutexGuard<'l, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
