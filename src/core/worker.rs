//! Worker threads.
//!
//! A worker thread's own stack is its primary fiber. It only runs the small loop in
//! `WorkerThread::run` that resumes worker fibers and deals with what they yield:
//! jobs themselves always run on a worker fiber.
//!
//! Once a fiber has a stack it belongs to the worker that created it and is only ever
//! resumed on that worker's thread, idle or not. Its context is destroyed on that
//! thread too, when the worker exits.

use super::sync::{lock, Arc, Mutex, AtomicBool, AtomicU32, AtomicU64, Ordering};
use super::fiber::{FiberId, FiberInput, FiberYield};
use super::manager::ManagerId;
use super::Shared;

use corosensei::CoroutineResult;
use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::CachePadded;

use std::cell::RefCell;
use std::thread::JoinHandle;

const NO_FIBER: u32 = u32::MAX;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerThread>>> = RefCell::new(None);
}

/// Returns the worker thread the caller runs on, if any.
///
/// Set when a worker thread starts and cleared right before it exits, so this returns
/// `None` everywhere except inside jobs and the scheduler's own control flow.
pub fn get_worker() -> Option<Arc<WorkerThread>> {
    CURRENT_WORKER.with(|worker| worker.borrow().clone())
}

fn set_current_worker(worker: Option<Arc<WorkerThread>>) {
    CURRENT_WORKER.with(|current| *current.borrow_mut() = worker);
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of jobs executed.
    pub jobs_executed: u64,
    /// How many times a fiber was parked in `wait`.
    pub fibers_parked: u64,
    /// How many times a parked fiber was resumed.
    pub fibers_resumed: u64,
}

pub struct WorkerThread {
    index: u32,
    manager: ManagerId,
    is_finished: AtomicBool,
    has_exited: AtomicBool,
    current_fiber: AtomicU32,
    // Fibers parked in `wait`, ready or not.
    parked: AtomicU32,
    // Parked fibers of this worker whose handle completed. Any thread can push,
    // only this worker pops.
    ready: CachePadded<Injector<FiberId>>,
    // Realized fibers of this worker that don't run a job.
    idle: Mutex<Vec<FiberId>>,
    jobs_executed: AtomicU64,
    fibers_parked: AtomicU64,
    fibers_resumed: AtomicU64,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

enum Switch {
    Start(FiberId),
    Resume(FiberId),
}

impl WorkerThread {
    pub(crate) fn new(index: u32, manager: ManagerId) -> Self {
        WorkerThread {
            index,
            manager,
            is_finished: AtomicBool::new(false),
            has_exited: AtomicBool::new(false),
            current_fiber: AtomicU32::new(NO_FIBER),
            parked: AtomicU32::new(0),
            ready: CachePadded::new(Injector::new()),
            idle: Mutex::new(Vec::new()),
            jobs_executed: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            thread: std::sync::Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 { self.index }

    pub fn manager_id(&self) -> ManagerId { self.manager }

    /// Whether the worker was asked to stop.
    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::Acquire)
    }

    /// Whether the worker left its scheduling loop.
    pub fn has_exited(&self) -> bool {
        self.has_exited.load(Ordering::Acquire)
    }

    /// The fiber this worker is currently running, if any.
    pub fn current_fiber(&self) -> Option<FiberId> {
        match self.current_fiber.load(Ordering::Acquire) {
            NO_FIBER => None,
            id => Some(FiberId(id)),
        }
    }

    /// Number of this worker's fibers parked in `wait`.
    pub fn parked_fibers(&self) -> u32 {
        self.parked.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.is_finished.store(true, Ordering::Release);
    }

    pub(crate) fn job_executed(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn make_ready(&self, fiber: FiberId) {
        self.ready.push(fiber);
    }

    pub(crate) fn fiber_parked(&self) {
        self.fibers_parked.fetch_add(1, Ordering::Relaxed);
        self.parked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn fiber_resumed(&self) {
        self.fibers_resumed.fetch_add(1, Ordering::Relaxed);
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn push_idle_fiber(&self, fiber: FiberId) {
        lock(&self.idle).push(fiber);
    }

    pub(crate) fn pop_idle_fiber(&self) -> Option<FiberId> {
        lock(&self.idle).pop()
    }

    pub(crate) fn take_idle_fibers(&self) -> Vec<FiberId> {
        std::mem::take(&mut *lock(&self.idle))
    }

    pub(crate) fn has_ready_fibers(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn pop_ready(&self) -> Option<FiberId> {
        loop {
            match self.ready.steal() {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }

    /// Entry point of the worker's OS thread.
    pub(crate) fn run(self: Arc<Self>, shared: Arc<Shared>) {
        profiling::register_thread!("Worker");

        set_current_worker(Some(Arc::clone(&self)));
        shared.hooks.on_start(self.index);

        match shared.fibers.acquire(&shared, &self) {
            Ok(fiber) => self.schedule(&shared, fiber),
            Err(err) => {
                tracing::error!(worker = self.index, %err, "worker could not get a fiber");
            }
        }

        shared.fibers.destroy_owned(&self);

        shared.hooks.on_exit(self.index);
        set_current_worker(None);
        self.has_exited.store(true, Ordering::Release);

        tracing::debug!(worker = self.index, "worker exited");
    }

    fn schedule(&self, shared: &Shared, first: FiberId) {
        let mut next = Switch::Start(first);
        loop {
            let (fiber, input) = match next {
                Switch::Start(fiber) => (fiber, FiberInput::Start),
                Switch::Resume(fiber) => {
                    self.fiber_resumed();
                    (fiber, FiberInput::Resume)
                }
            };

            self.current_fiber.store(fiber.0, Ordering::Release);
            // Safety: the fiber is bound to this worker and suspended.
            let result = unsafe { shared.fibers.resume(fiber, input) };
            self.current_fiber.store(NO_FIBER, Ordering::Release);

            next = match result {
                CoroutineResult::Return(()) => {
                    shared.fibers.retire(fiber);
                    return;
                }
                CoroutineResult::Yield(FiberYield::Idle) => {
                    match self.pop_ready() {
                        Some(ready) => {
                            shared.fibers.release(self, fiber);
                            Switch::Resume(ready)
                        }
                        None => Switch::Start(fiber),
                    }
                }
                CoroutineResult::Yield(FiberYield::Wait { handle, replacement }) => {
                    self.fiber_parked();
                    shared.park(self, fiber, handle);
                    Switch::Start(replacement)
                }
            };
        }
    }
}

#[test]
#[cfg(not(loom))]
fn ready_fibers() {
    let worker = WorkerThread::new(3, ManagerId(0));
    assert_eq!(worker.index(), 3);
    assert!(!worker.has_ready_fibers());
    assert_eq!(worker.current_fiber(), None);

    worker.make_ready(FiberId(5));
    worker.make_ready(FiberId(7));
    assert!(worker.has_ready_fibers());
    assert_eq!(worker.pop_ready(), Some(FiberId(5)));
    assert_eq!(worker.pop_ready(), Some(FiberId(7)));
    assert_eq!(worker.pop_ready(), None);

    worker.push_idle_fiber(FiberId(1));
    worker.push_idle_fiber(FiberId(2));
    assert_eq!(worker.pop_idle_fiber(), Some(FiberId(2)));
    assert_eq!(worker.take_idle_fibers(), vec![FiberId(1)]);
    assert_eq!(worker.pop_idle_fiber(), None);
    assert_eq!(worker.parked_fibers(), 0);

    assert!(!worker.is_finished());
    worker.mark_finished();
    assert!(worker.is_finished());
    assert_eq!(worker.stats(), Stats::default());
    assert!(get_worker().is_none());
}
