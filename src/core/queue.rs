//! The shared job queue.
//!
//! A single LIFO stack of jobs guarded by a mutex, and a condition variable that
//! worker fibers sleep on when there is nothing to do. Pushing a job wakes every
//! worker: with affinity and ready fibers in the mix, waking a single one could
//! wake the wrong one.
//!
//! The queue also counts active jobs: jobs that were popped and are either running
//! or sitting on a ready fiber, as opposed to parked in `wait`. A finished worker that
//! still has parked fibers stays alive as long as something can complete them.

use super::sync::{lock, wait, Arc, Mutex, Condvar};
use super::job::JobInfo;
use super::worker::WorkerThread;

pub(crate) enum Next {
    Job(JobInfo),
    /// The worker has a parked fiber that became ready.
    Resume,
    Shutdown,
}

struct State {
    jobs: Vec<JobInfo>,
    active: u32,
}

pub(crate) struct JobQueue {
    state: Mutex<State>,
    wake: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue {
            state: Mutex::new(State { jobs: Vec::new(), active: 0 }),
            wake: Condvar::new(),
        }
    }

    pub fn push(&self, job: JobInfo) {
        profiling::scope!("push_job");
        lock(&self.state).jobs.push(job);
        self.wake.notify_all();
    }

    pub fn push_all(&self, new_jobs: Vec<JobInfo>) {
        if new_jobs.is_empty() {
            return;
        }

        lock(&self.state).jobs.extend(new_jobs);
        self.wake.notify_all();
    }

    /// A job finished running.
    pub fn job_finished(&self) {
        self.deactivate(1);
    }

    /// A running job got its fiber parked.
    pub fn job_parked(&self) {
        self.deactivate(1);
    }

    /// Parked jobs had their fibers made ready.
    pub fn jobs_resumed(&self, count: u32) {
        lock(&self.state).active += count;
        self.wake.notify_all();
    }

    fn deactivate(&self, count: u32) {
        let mut state = lock(&self.state);
        debug_assert!(state.active >= count);
        state.active = state.active.saturating_sub(count);
        if state.active == 0 {
            drop(state);
            self.wake.notify_all();
        }
    }

    pub fn active_jobs(&self) -> u32 {
        lock(&self.state).active
    }

    /// Wake every sleeping worker so that it re-evaluates its state.
    ///
    /// Taking the lock orders this with workers that are about to sleep: a worker
    /// checks its state and starts waiting without releasing the lock in between.
    pub fn wake_all(&self) {
        drop(lock(&self.state));
        self.wake.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    /// Block until the worker has something to do.
    pub fn next(&self, worker: &WorkerThread) -> Next {
        let mut state = lock(&self.state);
        loop {
            if worker.has_ready_fibers() {
                return Next::Resume;
            }

            // Most recently pushed first, skipping jobs pinned to other workers.
            let index = worker.index();
            if let Some(pos) = state.jobs.iter().rposition(|job| job.can_run_on(index)) {
                state.active += 1;
                return Next::Job(state.jobs.remove(pos));
            }

            if worker.is_finished() {
                // Parked fibers can only be completed by running or queued jobs. Once
                // there are none, whatever they wait on is up to other threads and
                // the worker doesn't wait for it.
                let stuck = state.active == 0 && state.jobs.is_empty();
                if worker.parked_fibers() == 0 || stuck {
                    return Next::Shutdown;
                }
            }

            profiling::scope!("sleep");
            state = wait(&self.wake, state);
        }
    }

    /// Ask the workers to stop once they run out of jobs.
    pub fn finish(&self, workers: &[Arc<WorkerThread>]) {
        let state = lock(&self.state);
        for worker in workers {
            worker.mark_finished();
        }
        drop(state);

        self.wake.notify_all();
    }
}

#[test]
#[cfg(not(loom))]
fn lifo_with_affinity() {
    use super::manager::ManagerId;
    use std::sync::atomic::{AtomicU32, Ordering};

    static ORDER: AtomicU32 = AtomicU32::new(0);

    let queue = JobQueue::new();
    let worker = WorkerThread::new(0, ManagerId(0));

    queue.push(JobInfo::new(|| { ORDER.store(1, Ordering::SeqCst); }));
    queue.push(JobInfo::new(|| { ORDER.store(2, Ordering::SeqCst); }));
    queue.push(JobInfo::new(|| { ORDER.store(3, Ordering::SeqCst); }).with_worker(1));
    assert_eq!(queue.len(), 3);

    for expected in [2, 1] {
        match queue.next(&worker) {
            Next::Job(job) => { job.execute(); }
            _ => panic!("expected a job"),
        }
        assert_eq!(ORDER.load(Ordering::SeqCst), expected);
    }

    // Only the job pinned to worker 1 is left.
    worker.mark_finished();
    assert!(matches!(queue.next(&worker), Next::Shutdown));
    assert_eq!(queue.len(), 1);
}

#[test]
#[cfg(not(loom))]
fn finished_worker_with_parked_fiber() {
    use super::manager::ManagerId;

    let queue = JobQueue::new();
    let worker = WorkerThread::new(0, ManagerId(0));

    queue.push(JobInfo::new(|| {}));
    queue.push(JobInfo::new(|| {}).with_worker(1));
    assert!(matches!(queue.next(&worker), Next::Job(_)));
    assert_eq!(queue.active_jobs(), 1);

    // The job waits on something and its fiber gets parked.
    worker.fiber_parked();
    queue.job_parked();
    assert_eq!(queue.active_jobs(), 0);
    worker.mark_finished();

    // Waiting on the parked fiber would be pointless if nothing could complete it,
    // but the job pinned to the other worker still might.
    assert_eq!(queue.len(), 1);
    queue.jobs_resumed(1);
    worker.make_ready(super::fiber::FiberId(0));
    assert!(matches!(queue.next(&worker), Next::Resume));

    worker.pop_ready();
    worker.fiber_resumed();
    queue.job_finished();
    assert_eq!(queue.active_jobs(), 0);
    assert!(matches!(queue.next(&worker), Next::Shutdown));

    // With nothing running and nothing queued anywhere, a parked fiber is stuck.
    let other = WorkerThread::new(1, ManagerId(0));
    assert!(matches!(queue.next(&other), Next::Job(_)));
    other.fiber_parked();
    queue.job_parked();
    other.mark_finished();
    assert!(matches!(queue.next(&other), Next::Shutdown));
}

#[test]
#[cfg(loom)]
fn loom_finish_does_not_lose_jobs() {
    use super::manager::ManagerId;

    loom::model(|| {
        let queue = Arc::new(JobQueue::new());
        let worker = Arc::new(WorkerThread::new(0, ManagerId(0)));

        let consumer = {
            let queue = queue.clone();
            let worker = worker.clone();
            loom::thread::spawn(move || {
                let mut executed = 0;
                loop {
                    match queue.next(&worker) {
                        Next::Job(job) => {
                            job.execute();
                            executed += 1;
                        }
                        Next::Resume => unreachable!(),
                        Next::Shutdown => return executed,
                    }
                }
            })
        };

        queue.push(JobInfo::new(|| {}));
        queue.finish(std::slice::from_ref(&worker));

        assert_eq!(consumer.join().unwrap(), 1);
    });
}
