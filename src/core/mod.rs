pub mod job;
pub mod handle;
pub mod fiber;
pub mod worker;
pub mod manager;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;
mod counter;
mod queue;

use corosensei::Yielder;

use sync::{lock, wait, Arc, Mutex, Condvar, AtomicBool, Ordering};
use counter::{HandleTable, Released, Waiter};
use fiber::{FiberId, FiberInput, FiberPool, FiberSlot, FiberYield};
use handle::JobHandle;
use job::{JobInfo, JobRecord};
use manager::{ManagerBuilder, Manager, ManagerId};
use queue::{JobQueue, Next};
use worker::{get_worker, WorkerThread};
use crate::error::Error;

use std::sync::OnceLock;
use std::thread;

/// Hard cap on the number of worker threads.
pub const MAX_WORKER_COUNT: u32 = 64;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_MANAGER_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data accessible from every worker, fiber and producer thread.
pub(crate) struct Shared {
    pub id: ManagerId,
    /// The handle table. This is the manager's main lock: attaching jobs to counters,
    /// parking fibers and releasing handles are all serialized by it.
    handles: Mutex<HandleTable>,
    /// Signaled whenever handles are released, for threads blocking in `wait`.
    released: Condvar,
    pub queue: JobQueue,
    pub fibers: FiberPool,
    /// Set once all worker threads are spawned, before any job can be submitted.
    workers: OnceLock<Vec<Arc<WorkerThread>>>,
    pub is_shut_down: AtomicBool,
    pub hooks: WorkerHooks,
}

pub(crate) fn init(params: ManagerBuilder) -> Manager {
    let requested = params.num_threads.clamp(1, MAX_WORKER_COUNT);
    if requested != params.num_threads {
        tracing::debug!(requested = params.num_threads, workers = requested, "clamped worker count");
    }

    let shared = Arc::new(Shared {
        id: ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)),
        handles: Mutex::new(HandleTable::new(params.handle_capacity)),
        released: Condvar::new(),
        queue: JobQueue::new(),
        fibers: FiberPool::new(params.num_fibers, params.fiber_stack_size),
        workers: OnceLock::new(),
        is_shut_down: AtomicBool::new(false),
        hooks: WorkerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    let core_ids = if params.affinity { core_affinity::get_core_ids() } else { None };

    let mut workers = Vec::with_capacity(requested as usize);
    for cpu in 0..requested as usize {
        let worker = Arc::new(WorkerThread::new(workers.len() as u32, shared.id));

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(worker.index()));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let core = core_ids.as_ref().and_then(|ids| ids.get(cpu).copied());
        let thread_worker = Arc::clone(&worker);
        let thread_shared = Arc::clone(&shared);
        let spawned = builder.spawn(move || {
            if let Some(core) = core {
                if !core_affinity::set_for_current(core) {
                    tracing::debug!(worker = thread_worker.index(), cpu = core.id, "could not pin worker");
                }
            }

            thread_worker.run(thread_shared);
        });

        match spawned {
            Ok(handle) => {
                worker.set_thread(handle);
                workers.push(worker);
            }
            Err(err) => {
                tracing::warn!(cpu, %err, "failed to create worker thread");
            }
        }
    }

    tracing::debug!(
        manager = shared.id.0,
        workers = workers.len(),
        fibers = shared.fibers.capacity(),
        "job system initialized",
    );

    let _ = shared.workers.set(workers);

    Manager { shared }
}

impl Shared {
    pub fn workers(&self) -> &[Arc<WorkerThread>] {
        self.workers.get().map_or(&[], Vec::as_slice)
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    pub fn allocate_handle(&self) -> Result<JobHandle, Error> {
        let handle = lock(&self.handles).allocate()?;
        tracing::trace!(?handle, "allocated handle");

        Ok(handle)
    }

    pub fn inc_handle(&self, handle: &mut JobHandle) -> Result<(), Error> {
        lock(&self.handles).inc(handle)
    }

    pub fn dec_handle(&self, handle: JobHandle) {
        let mut table = lock(&self.handles);
        if let Some(released) = table.dec(handle) {
            self.dispatch_released(released);
        }
    }

    pub fn release_handle(&self, handle: JobHandle) {
        let mut table = lock(&self.handles);
        let released = table.release(handle);
        self.dispatch_released(released);
    }

    pub fn link_handles(&self, owner: JobHandle, sibling: JobHandle) -> bool {
        lock(&self.handles).link(owner, sibling)
    }

    pub fn is_handle_live(&self, handle: JobHandle) -> bool {
        lock(&self.handles).is_live(handle)
    }

    pub fn is_handle_zero(&self, handle: JobHandle) -> bool {
        lock(&self.handles).is_zero(handle)
    }

    pub fn handle_value(&self, handle: JobHandle) -> Option<i32> {
        lock(&self.handles).value(handle)
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.handles).live_count()
    }

    pub fn handle_capacity(&self) -> usize {
        lock(&self.handles).capacity()
    }

    // Called with the handle table locked, which is what makes releasing atomic with
    // respect to attaching jobs and parking fibers.
    fn dispatch_released(&self, released: Released) {
        tracing::trace!(slots = released.slots, jobs = released.jobs.len(), waiters = released.waiters.len(), "released handles");

        let jobs = released.jobs.into_iter().map(|job| self.normalize(job)).collect();
        self.queue.push_all(jobs);

        if !released.waiters.is_empty() {
            let workers = self.workers();
            let resumed = released.waiters.len() as u32;
            for Waiter { worker, fiber } in released.waiters {
                workers[worker as usize].make_ready(fiber);
            }
            self.queue.jobs_resumed(resumed);
        }

        self.released.notify_all();
    }

    fn normalize(&self, mut job: JobInfo) -> JobInfo {
        let num_workers = self.workers().len();
        if let (Some(idx), true) = (job.worker_index, num_workers > 0) {
            job.worker_index = Some((idx as usize % num_workers) as u8);
        }

        job
    }

    pub fn push_job(&self, job: JobInfo) {
        self.queue.push(self.normalize(job));
    }

    /// Submit a job, optionally adding a completion obligation to `handle` that the
    /// job discharges when it finishes.
    pub fn submit(&self, mut job: JobInfo, handle: Option<&mut JobHandle>) -> Result<(), Error> {
        profiling::scope!("submit");

        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let mut table = lock(&self.handles);
        if let Some(handle) = handle {
            table.inc(handle)?;
            job.finish_handle = *handle;
        }

        let precondition = job.precondition;
        match table.attach(precondition, job) {
            Ok(()) => tracing::trace!(?precondition, "job waits on precondition"),
            Err(job) => self.push_job(job),
        }

        Ok(())
    }

    pub fn wait(&self, handle: JobHandle) {
        profiling::scope!("wait");

        if self.is_handle_zero(handle) {
            return;
        }

        if let Some(worker) = get_worker() {
            if worker.manager_id() == self.id {
                if let Some(fiber) = worker.current_fiber() {
                    if self.suspend(worker, fiber, handle) {
                        return;
                    }
                }
            }
        }

        let mut table = lock(&self.handles);
        while !table.is_zero(handle) {
            table = wait(&self.released, table);
        }
    }

    /// Park the calling fiber on `handle`, letting its worker run other jobs.
    ///
    /// Returns false if no replacement fiber is available.
    fn suspend(&self, worker: Arc<WorkerThread>, fiber: FiberId, handle: JobHandle) -> bool {
        let replacement = match self.fibers.acquire(self, &worker) {
            Ok(replacement) => replacement,
            Err(err) => {
                tracing::warn!(?handle, %err, "can't park fiber, blocking its worker thread instead");
                return false;
            }
        };
        drop(worker);

        // Safety: we are running on `fiber`, as reported by our worker.
        let input = unsafe { self.fibers.slot(fiber).suspend(FiberYield::Wait { handle, replacement }) };
        debug_assert!(matches!(input, FiberInput::Resume), "{:?}", input);

        true
    }

    /// Called by a worker's primary fiber once `fiber` is fully suspended.
    pub fn park(&self, worker: &WorkerThread, fiber: FiberId, handle: JobHandle) {
        let mut table = lock(&self.handles);
        if table.park(handle, Waiter { worker: worker.index(), fiber }) {
            self.queue.job_parked();
        } else {
            // Completed between the check in `wait` and now.
            worker.make_ready(fiber);
        }
    }

    pub fn current_job(&self) -> Option<JobRecord> {
        let worker = get_worker()?;
        if worker.manager_id() != self.id {
            return None;
        }

        let fiber = worker.current_fiber()?;
        self.fibers.slot(fiber).current_job()
    }

    /// The job dispatch loop, running on worker fibers.
    fn dispatch(&self, worker: &WorkerThread, slot: &FiberSlot) -> Dispatch {
        loop {
            match self.queue.next(worker) {
                Next::Job(job) => self.run_job(worker, slot, job),
                Next::Resume => return Dispatch::Yield,
                Next::Shutdown => return Dispatch::Shutdown,
            }
        }
    }

    fn run_job(&self, worker: &WorkerThread, slot: &FiberSlot, job: JobInfo) {
        profiling::scope!("run_job");

        slot.set_current_job(Some(job.record()));
        let finish_handle = job.execute();
        slot.set_current_job(None);

        worker.job_executed();

        if finish_handle.is_valid() {
            let mut table = lock(&self.handles);
            if let Some(released) = table.dec_finished(finish_handle) {
                self.dispatch_released(released);
            }
        }

        self.queue.job_finished();
    }
}

enum Dispatch {
    /// Give the worker back to its primary fiber so it can resume a ready fiber.
    Yield,
    Shutdown,
}

/// Body of every worker fiber.
pub(crate) fn fiber_main(
    shared: &Shared,
    worker: &WorkerThread,
    slot: &FiberSlot,
    yielder: &Yielder<FiberInput, FiberYield>,
    mut input: FiberInput,
) {
    slot.set_yielder(yielder);

    loop {
        match input {
            FiberInput::Start => {}
            FiberInput::Exit => return,
            FiberInput::Resume => {
                debug_assert!(false, "resumed idle fiber {:?}", slot.id());
            }
        }

        match shared.dispatch(worker, slot) {
            Dispatch::Shutdown => return,
            Dispatch::Yield => {}
        }

        input = yielder.suspend(FiberYield::Idle);
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

impl WorkerHooks {
    pub fn on_start(&self, worker: u32) {
        if let Some(hook) = &self.start {
            hook.run(worker);
        }
    }

    pub fn on_exit(&self, worker: u32) {
        if let Some(hook) = &self.exit {
            hook.run(worker);
        }
    }
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
