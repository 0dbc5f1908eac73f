use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::fiber::{MAX_FIBER_COUNT, DEFAULT_FIBER_STACK_SIZE};
use super::handle::{JobHandle, MAX_JOB_HANDLE_COUNT};
use super::job::{JobInfo, JobRecord};
use super::shutdown::{begin_shut_down, ShutdownHandle};
use super::worker::WorkerThread;
use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManagerId(pub(crate) u32);

/// A reference to a job system.
///
/// Owns the handle table, the fiber pool, the job queue and the worker threads.
/// Cloning it is cheap and all clones refer to the same job system.
#[derive(Clone)]
pub struct Manager {
    pub(crate) shared: Arc<Shared>,
}

/// Logical CPU count plus one, which keeps a core busy while a worker blocks.
pub fn default_worker_count() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    cpus as u32 + 1
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder {
            num_threads: default_worker_count(),
            num_fibers: MAX_FIBER_COUNT,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            handle_capacity: MAX_JOB_HANDLE_COUNT,
            affinity: true,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Start a job system with `num_workers` worker threads, between 1 and 64.
    pub fn initialize(num_workers: u32) -> Manager {
        Manager::builder().with_worker_threads(num_workers).build()
    }

    /// Stop the worker threads and destroy the fibers.
    ///
    /// Jobs still in the queue are executed first, jobs waiting on a precondition
    /// that never completes are dropped.
    pub fn uninitialize(self) {
        self.shut_down().wait();
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> ManagerId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 {
        self.shared.workers().len() as u32
    }

    pub fn worker(&self, index: u32) -> Option<Arc<WorkerThread>> {
        self.shared.workers().get(index as usize).cloned()
    }

    /// Submit a job.
    ///
    /// If `handle` is provided, a completion obligation is added to it (or a fresh
    /// handle is written to it if it is already complete) and the job discharges it
    /// when it finishes. Passing the same handle to several calls groups the jobs.
    pub fn run(&self, job: JobInfo, handle: Option<&mut JobHandle>) -> Result<(), Error> {
        self.shared.submit(job, handle)
    }

    /// Submit a job that must not start before `precondition` completes.
    pub fn run_ex<F>(&self, func: F, handle: Option<&mut JobHandle>, precondition: JobHandle) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(JobInfo::new(func).with_precondition(precondition), handle)
    }

    /// Queue a job right away, ignoring its precondition.
    pub fn push_job(&self, job: JobInfo) -> Result<(), Error> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }

        self.shared.push_job(job);
        Ok(())
    }

    /// Block until `handle` completes.
    ///
    /// On a worker fiber this only suspends the fiber: the worker thread picks up
    /// other jobs in the meantime. Invalid and stale handles return immediately.
    pub fn wait(&self, handle: JobHandle) {
        self.shared.wait(handle);
    }

    pub fn allocate_handle(&self) -> Result<JobHandle, Error> {
        self.shared.allocate_handle()
    }

    pub fn inc_handle(&self, handle: &mut JobHandle) -> Result<(), Error> {
        self.shared.inc_handle(handle)
    }

    pub fn dec_handle(&self, handle: JobHandle) {
        self.shared.dec_handle(handle);
    }

    /// Release a handle and its siblings right away, whatever their pending counts.
    pub fn release_handle(&self, handle: JobHandle) {
        self.shared.release_handle(handle);
    }

    /// Release `sibling` together with `owner`.
    pub fn link_handles(&self, owner: JobHandle, sibling: JobHandle) -> bool {
        self.shared.link_handles(owner, sibling)
    }

    /// Whether the handle still refers to the counter it was created for.
    pub fn is_handle_live(&self, handle: JobHandle) -> bool {
        self.shared.is_handle_live(handle)
    }

    /// Whether the handle completed. Invalid and stale handles count as complete.
    pub fn is_handle_zero(&self, handle: JobHandle) -> bool {
        self.shared.is_handle_zero(handle)
    }

    pub fn handle_value(&self, handle: JobHandle) -> Option<i32> {
        self.shared.handle_value(handle)
    }

    pub fn live_handles(&self) -> usize {
        self.shared.live_handles()
    }

    pub fn handle_capacity(&self) -> usize {
        self.shared.handle_capacity()
    }

    /// The job running on the calling fiber, if it belongs to this manager.
    pub fn current_job(&self) -> Option<JobRecord> {
        self.shared.current_job()
    }

    pub fn num_fibers(&self) -> usize {
        self.shared.fibers.capacity()
    }

    pub fn free_fibers(&self) -> usize {
        self.shared.fibers.free_count()
    }

    pub fn realized_fibers(&self) -> u32 {
        self.shared.fibers.realized_count()
    }

    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.len()
    }
}

pub struct ManagerBuilder {
    pub(crate) num_threads: u32,
    pub(crate) num_fibers: usize,
    pub(crate) fiber_stack_size: usize,
    pub(crate) handle_capacity: usize,
    pub(crate) affinity: bool,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl ManagerBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);
        self
    }

    /// Clamped to `1..=64` when the job system is built: asking for zero workers
    /// still starts one.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Size of the fiber pool. Each worker holds one fiber at all times, plus one for
    /// every fiber it has parked in `wait`.
    pub fn with_fiber_count(mut self, num_fibers: usize) -> Self {
        self.num_fibers = num_fibers.max(1);
        self
    }

    pub fn with_fiber_stack_size(mut self, size: usize) -> Self {
        self.fiber_stack_size = size;
        self
    }

    pub fn with_handle_capacity(mut self, capacity: usize) -> Self {
        // Slot ids are 16 bits, the last one only ever appears in the invalid handle.
        assert!(capacity > 0 && capacity <= 0xffff, "invalid handle capacity {}", capacity);
        self.handle_capacity = capacity;
        self
    }

    /// Pin worker N to logical CPU N. On by default.
    pub fn with_affinity(mut self, affinity: bool) -> Self {
        self.affinity = affinity;
        self
    }

    /// Stack size of the worker OS threads. Jobs run on fiber stacks, so this
    /// rarely needs to change.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn build(self) -> Manager {
        crate::core::init(self)
    }
}

#[test]
fn output_cell() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let manager = Manager::initialize(4);
    assert_eq!(manager.num_worker_threads(), 4);

    let output = Arc::new(AtomicU32::new(0));
    let mut handle = JobHandle::INVALID;
    let out = Arc::clone(&output);
    manager.run(JobInfo::new(move || { out.store(42, Ordering::SeqCst); }), Some(&mut handle)).unwrap();
    assert!(handle.is_valid());

    manager.wait(handle);
    assert_eq!(output.load(Ordering::SeqCst), 42);
    assert!(manager.is_handle_zero(handle));
    assert!(!manager.is_handle_live(handle));
    assert_eq!(manager.live_handles(), 0);

    manager.uninitialize();
}

#[test]
fn precondition_is_respected() {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    let manager = Manager::builder().with_worker_threads(4).with_affinity(false).build();

    for _ in 0..50 {
        let flag = Arc::new(AtomicBool::new(false));
        let failures = Arc::new(AtomicU32::new(0));

        let mut handle_a = JobHandle::INVALID;
        let mut handle_b = JobHandle::INVALID;

        let f = Arc::clone(&flag);
        manager.run(JobInfo::new(move || {
            std::thread::sleep(Duration::from_micros(200));
            f.store(true, Ordering::SeqCst);
        }), Some(&mut handle_a)).unwrap();

        let f = Arc::clone(&flag);
        let fails = Arc::clone(&failures);
        manager.run_ex(move || {
            if !f.load(Ordering::SeqCst) {
                fails.fetch_add(1, Ordering::SeqCst);
            }
        }, Some(&mut handle_b), handle_a).unwrap();

        manager.wait(handle_b);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(flag.load(Ordering::SeqCst));
    }

    manager.uninitialize();
}

#[test]
fn dependency_chain() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let manager = Manager::builder().with_worker_threads(3).with_affinity(false).build();
    let step = Arc::new(AtomicU32::new(0));
    let out_of_order = Arc::new(AtomicU32::new(0));

    let mut previous = JobHandle::INVALID;
    for i in 0..200 {
        let mut handle = JobHandle::INVALID;
        let step = Arc::clone(&step);
        let out_of_order = Arc::clone(&out_of_order);
        manager.run_ex(move || {
            if step.fetch_add(1, Ordering::SeqCst) != i {
                out_of_order.fetch_add(1, Ordering::SeqCst);
            }
        }, Some(&mut handle), previous).unwrap();
        previous = handle;
    }

    manager.wait(previous);
    assert_eq!(step.load(Ordering::SeqCst), 200);
    assert_eq!(out_of_order.load(Ordering::SeqCst), 0);

    manager.uninitialize();
}

#[test]
fn precondition_already_complete() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let manager = Manager::builder().with_worker_threads(2).with_affinity(false).build();
    let count = Arc::new(AtomicU32::new(0));

    let done = manager.allocate_handle().unwrap();
    manager.dec_handle(done);
    assert!(manager.is_handle_zero(done));

    let gate = manager.allocate_handle().unwrap();
    let mut handle = gate;
    for precondition in [JobHandle::INVALID, done] {
        let count = Arc::clone(&count);
        manager.run_ex(move || { count.fetch_add(1, Ordering::SeqCst); }, Some(&mut handle), precondition).unwrap();
    }

    manager.dec_handle(gate);
    manager.wait(handle);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    manager.uninitialize();
}

#[test]
fn shared_finish_handle() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    let manager = Manager::builder().with_worker_threads(4).with_affinity(false).build();
    let done = Arc::new(AtomicU32::new(0));

    // Keep the group open until every job is submitted, otherwise early completions
    // would recycle the handle and later jobs would start a new group.
    let gate = manager.allocate_handle().unwrap();
    let mut group = gate;

    const K: u32 = 64;
    for _ in 0..K {
        let done = Arc::clone(&done);
        manager.run(JobInfo::new(move || {
            std::thread::sleep(Duration::from_micros(50));
            done.fetch_add(1, Ordering::SeqCst);
        }), Some(&mut group)).unwrap();
    }
    assert_eq!(group, gate);
    assert_eq!(manager.handle_value(group), Some(K as i32 + 1));

    manager.dec_handle(gate);
    manager.wait(group);
    assert_eq!(done.load(Ordering::SeqCst), K);

    // Waiting again returns right away.
    manager.wait(group);
    assert_eq!(manager.live_handles(), 0);

    manager.uninitialize();
}

#[test]
fn wait_inside_jobs_suspends_fibers() {
    use std::sync::atomic::{AtomicU32, Ordering};

    // With a single worker, a job waiting on its children can only make progress if
    // waiting parks the fiber instead of blocking the thread.
    let manager = Manager::builder().with_worker_threads(1).with_affinity(false).build();
    let sum = Arc::new(AtomicU32::new(0));

    let gate = manager.allocate_handle().unwrap();
    let mut root = gate;
    for _ in 0..8 {
        let m = manager.clone();
        let sum = Arc::clone(&sum);
        manager.run(JobInfo::new(move || {
            let mut children = JobHandle::INVALID;
            for _ in 0..4 {
                let sum = Arc::clone(&sum);
                m.run(JobInfo::new(move || { sum.fetch_add(1, Ordering::SeqCst); }), Some(&mut children)).unwrap();
            }
            m.wait(children);
            assert!(m.is_handle_zero(children));
            sum.fetch_add(100, Ordering::SeqCst);
        }), Some(&mut root)).unwrap();
    }

    manager.dec_handle(gate);
    manager.wait(root);
    assert_eq!(sum.load(Ordering::SeqCst), 8 * 104);

    let stats = manager.worker(0).unwrap().stats();
    assert_eq!(stats.jobs_executed, 8 * 5);
    assert_eq!(stats.fibers_parked, stats.fibers_resumed);
    // Nothing is parked anymore: only the worker's own fiber is in use.
    assert_eq!(manager.free_fibers(), manager.num_fibers() - 1);

    manager.uninitialize();
}

#[test]
fn fibers_stay_on_their_worker() {
    use super::worker::get_worker;
    use std::sync::atomic::{AtomicU32, Ordering};

    let manager = Manager::builder().with_worker_threads(3).with_affinity(false).build();
    let moved = Arc::new(AtomicU32::new(0));

    for _ in 0..10 {
        let gate = manager.allocate_handle().unwrap();
        let mut group = gate;
        for _ in 0..12 {
            let m = manager.clone();
            let moved = Arc::clone(&moved);
            manager.run(JobInfo::new(move || {
                let thread = std::thread::current().id();
                let worker = get_worker().unwrap().index();

                let mut children = JobHandle::INVALID;
                for _ in 0..3 {
                    m.run(JobInfo::new(|| { std::thread::yield_now(); }), Some(&mut children)).unwrap();
                }
                m.wait(children);

                if std::thread::current().id() != thread || get_worker().unwrap().index() != worker {
                    moved.fetch_add(1, Ordering::SeqCst);
                }
            }), Some(&mut group)).unwrap();
        }
        manager.dec_handle(gate);
        manager.wait(group);
    }

    assert_eq!(moved.load(Ordering::SeqCst), 0);
    // Idle fibers were reused by the workers that created them rather than leaked.
    assert_eq!(manager.free_fibers() + 3, manager.num_fibers());

    manager.uninitialize();
}

#[test]
fn wait_blocks_when_fibers_run_out() {
    use std::sync::atomic::{AtomicU32, Ordering};

    // Both fibers are taken by the workers, so waiting has to block the thread and
    // the other worker runs the child.
    let manager = Manager::builder()
        .with_worker_threads(2)
        .with_fiber_count(2)
        .with_affinity(false)
        .build();

    let value = Arc::new(AtomicU32::new(0));
    let mut parent = JobHandle::INVALID;
    let m = manager.clone();
    let v = Arc::clone(&value);
    manager.run(JobInfo::new(move || {
        let mut child = JobHandle::INVALID;
        let v2 = Arc::clone(&v);
        m.run(JobInfo::new(move || { v2.store(7, Ordering::SeqCst); }), Some(&mut child)).unwrap();
        m.wait(child);
        v.fetch_add(1, Ordering::SeqCst);
    }), Some(&mut parent)).unwrap();

    manager.wait(parent);
    assert_eq!(value.load(Ordering::SeqCst), 8);

    manager.uninitialize();
}

#[test]
fn affinity_and_current_job() {
    use super::worker::get_worker;
    use std::sync::Mutex;

    let manager = Manager::builder().with_worker_threads(3).with_affinity(false).build();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let gate = manager.allocate_handle().unwrap();
    let mut handle = gate;
    for i in 0..12u8 {
        let m = manager.clone();
        let seen = Arc::clone(&seen);
        manager.run(JobInfo::new(move || {
            let worker = get_worker().unwrap();
            let job = m.current_job().unwrap();
            seen.lock().unwrap().push((i, worker.index(), job.worker_index));
        }).with_worker(i), Some(&mut handle)).unwrap();
    }

    manager.dec_handle(gate);
    manager.wait(handle);
    assert!(get_worker().is_none());
    assert!(manager.current_job().is_none());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 12);
    for &(i, worker, pinned) in seen.iter() {
        assert_eq!(worker, i as u32 % 3);
        assert_eq!(pinned, Some(i % 3));
    }

    manager.uninitialize();
}

#[test]
fn raw_jobs() {
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bump(data: *mut ()) {
        let counter = unsafe { &*(data as *const AtomicU32) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let manager = Manager::builder().with_worker_threads(2).with_affinity(false).build();
    let counter = Box::new(AtomicU32::new(0));
    let data = &*counter as *const AtomicU32 as *mut ();

    let gate = manager.allocate_handle().unwrap();
    let mut handle = gate;
    for _ in 0..10 {
        manager.run(unsafe { JobInfo::from_raw(bump, data) }, Some(&mut handle)).unwrap();
    }
    manager.dec_handle(gate);
    manager.wait(handle);
    assert_eq!(counter.load(Ordering::SeqCst), 10);

    manager.uninitialize();
}

#[test]
fn stale_handles_fail_closed() {
    let manager = Manager::builder().with_worker_threads(1).with_handle_capacity(1).with_affinity(false).build();

    let stale = manager.allocate_handle().unwrap();
    manager.dec_handle(stale);
    let fresh = manager.allocate_handle().unwrap();
    assert_eq!(stale.slot(), fresh.slot());

    // Neither waiting nor chaining on the stale handle is affected by the new owner.
    manager.wait(stale);
    assert!(!manager.is_handle_live(stale));
    assert!(manager.is_handle_live(fresh));

    match manager.allocate_handle() {
        Err(Error::HandleExhausted { capacity: 1 }) => {}
        other => panic!("expected exhaustion, got {:?}", other),
    }

    let mut handle = JobHandle::INVALID;
    assert!(matches!(
        manager.run(JobInfo::new(|| {}), Some(&mut handle)),
        Err(Error::HandleExhausted { .. })
    ));

    manager.release_handle(fresh);
    assert_eq!(manager.live_handles(), 0);

    manager.uninitialize();
}

#[test]
fn siblings_release_together() {
    let manager = Manager::builder().with_worker_threads(1).with_affinity(false).build();

    let owner = manager.allocate_handle().unwrap();
    let mut sibling = manager.allocate_handle().unwrap();
    manager.inc_handle(&mut sibling).unwrap();
    assert!(manager.link_handles(owner, sibling));

    manager.dec_handle(owner);
    assert!(manager.is_handle_zero(sibling));
    assert_eq!(manager.live_handles(), 0);

    manager.uninitialize();
}

#[test]
fn sibling_released_under_running_job() {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    let manager = Manager::builder().with_worker_threads(1).with_affinity(false).build();
    let started = Arc::new(AtomicBool::new(false));
    let later = Arc::new(AtomicU32::new(0));

    let mut running = JobHandle::INVALID;
    let s = Arc::clone(&started);
    manager.run(JobInfo::new(move || {
        s.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
    }), Some(&mut running)).unwrap();

    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    // Releasing the owner takes the running job's finish handle with it.
    let owner = manager.allocate_handle().unwrap();
    assert!(manager.link_handles(owner, running));
    manager.dec_handle(owner);
    assert!(!manager.is_handle_live(running));
    manager.wait(running);

    // The single worker only gets to this job once the first one discharged its
    // finish handle.
    let mut handle = JobHandle::INVALID;
    let l = Arc::clone(&later);
    manager.run(JobInfo::new(move || { l.fetch_add(1, Ordering::SeqCst); }), Some(&mut handle)).unwrap();
    manager.wait(handle);

    assert_eq!(later.load(Ordering::SeqCst), 1);
    assert_eq!(manager.worker(0).unwrap().stats().jobs_executed, 2);
    assert_eq!(manager.live_handles(), 0);

    manager.uninitialize();
}

#[test]
fn clamps_worker_count() {
    let manager = Manager::builder().with_worker_threads(1000).with_affinity(false).build();
    assert_eq!(manager.num_worker_threads(), 64);

    let workers: Vec<_> = (0..64).filter_map(|i| manager.worker(i)).collect();
    assert_eq!(workers.len(), 64);
    manager.uninitialize();

    for worker in workers {
        assert!(worker.is_finished());
        assert!(worker.has_exited());
    }
}

#[test]
fn zero_workers_starts_one() {
    let manager = Manager::builder().with_worker_threads(0).with_affinity(false).build();
    assert_eq!(manager.num_worker_threads(), 1);

    let mut handle = JobHandle::INVALID;
    manager.run(JobInfo::new(|| {}), Some(&mut handle)).unwrap();
    manager.wait(handle);
    assert!(manager.is_handle_zero(handle));

    manager.uninitialize();
}

#[test]
fn run_after_shut_down() {
    let manager = Manager::builder().with_worker_threads(1).with_affinity(false).build();
    let other = manager.clone();
    manager.uninitialize();

    assert!(matches!(other.run(JobInfo::new(|| {}), None), Err(Error::ShutDown)));
    assert_eq!(other.realized_fibers(), 0);

    // Shutting down again is harmless.
    other.uninitialize();
}
