//! A process-wide job system.
//!
//! Thin wrappers around a single [`Manager`] for code that doesn't want to pass one
//! around. Everything here fails with [`Error::NotInitialized`] or does nothing when
//! called outside of `initialize`/`uninitialize`.

use crate::core::manager::{default_worker_count, Manager};
use crate::core::worker::{self, WorkerThread};
use crate::core::sync::Arc;
use crate::{Error, JobHandle, JobInfo};

use std::sync::{Mutex, MutexGuard, PoisonError};

static MANAGER: Mutex<Option<Manager>> = Mutex::new(None);

fn global() -> MutexGuard<'static, Option<Manager>> {
    MANAGER.lock().unwrap_or_else(PoisonError::into_inner)
}

fn manager() -> Option<Manager> {
    global().clone()
}

/// Start the global job system with `worker_count` threads, or one per logical CPU
/// plus one if `worker_count` is zero.
///
/// Returns false if it is already running.
pub fn initialize(worker_count: u32) -> bool {
    let mut global = global();
    if global.is_some() {
        tracing::warn!("global job system is already initialized");
        return false;
    }

    let worker_count = if worker_count == 0 { default_worker_count() } else { worker_count };
    *global = Some(Manager::initialize(worker_count));

    true
}

/// Stop the global job system. Does nothing if it isn't running.
pub fn uninitialize() {
    // Don't hold the lock while joining, jobs may still use the global functions.
    let manager = global().take();
    if let Some(manager) = manager {
        manager.uninitialize();
    }
}

pub fn is_initialized() -> bool {
    global().is_some()
}

pub fn num_worker_threads() -> u32 {
    manager().map_or(0, |manager| manager.num_worker_threads())
}

pub fn run(job: JobInfo, handle: Option<&mut JobHandle>) -> Result<(), Error> {
    manager().ok_or(Error::NotInitialized)?.run(job, handle)
}

pub fn run_ex<F>(func: F, handle: Option<&mut JobHandle>, precondition: JobHandle) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    manager().ok_or(Error::NotInitialized)?.run_ex(func, handle, precondition)
}

pub fn wait(handle: JobHandle) {
    if let Some(manager) = manager() {
        manager.wait(handle);
    }
}

pub fn allocate_handle() -> Result<JobHandle, Error> {
    manager().ok_or(Error::NotInitialized)?.allocate_handle()
}

pub fn dec_handle(handle: JobHandle) {
    if let Some(manager) = manager() {
        manager.dec_handle(handle);
    }
}

/// The worker the caller runs on, if it belongs to the global job system.
pub fn get_worker() -> Option<Arc<WorkerThread>> {
    let id = manager()?.id();
    worker::get_worker().filter(|worker| worker.manager_id() == id)
}

#[test]
fn global_job_system() {
    use std::sync::atomic::{AtomicU32, Ordering};

    // Single test so that nothing else races on the global state.
    assert!(!is_initialized());
    assert!(matches!(run(JobInfo::new(|| {}), None), Err(Error::NotInitialized)));
    wait(JobHandle::INVALID);
    uninitialize();

    assert!(initialize(3));
    assert!(!initialize(5));
    assert_eq!(num_worker_threads(), 3);
    assert!(get_worker().is_none());

    let output = Arc::new(AtomicU32::new(0));
    let workers = Arc::new(AtomicU32::new(0));

    let gate = allocate_handle().unwrap();
    let mut handle = gate;
    for _ in 0..10 {
        let output = Arc::clone(&output);
        let workers = Arc::clone(&workers);
        run(JobInfo::new(move || {
            if get_worker().is_some() {
                workers.fetch_add(1, Ordering::SeqCst);
            }
            output.fetch_add(1, Ordering::SeqCst);
        }), Some(&mut handle)).unwrap();
    }

    let mut last = JobHandle::INVALID;
    let out = Arc::clone(&output);
    run_ex(move || { out.fetch_add(100, Ordering::SeqCst); }, Some(&mut last), handle).unwrap();

    dec_handle(gate);
    wait(last);
    assert_eq!(output.load(Ordering::SeqCst), 110);
    assert_eq!(workers.load(Ordering::SeqCst), 10);

    uninitialize();
    assert!(!is_initialized());
    assert_eq!(num_worker_threads(), 0);

    assert!(initialize(0));
    assert!(num_worker_threads() >= 1);
    uninitialize();
}
