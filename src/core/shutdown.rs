/// Shutdown
///
/// Shutting down is a two step process. First every worker is marked as finished under
/// the queue lock and woken up: a finished worker keeps executing jobs and resuming its
/// ready fibers, and leaves its scheduling loop once it has nothing left to do and none
/// of its parked fibers can still be resumed. On its way out a worker destroys the
/// fibers it owns. The shutdown handle joins the worker threads and cleans up after
/// the ones that died.

use crate::sync::{Ordering, Arc};

use crate::core::Shared;
use crate::core::worker::get_worker;

use crossbeam_utils::Backoff;

pub(crate) fn begin_shut_down(shared: Arc<Shared>) -> ShutdownHandle {
    if !shared.is_shut_down.swap(true, Ordering::AcqRel) {
        tracing::debug!(manager = shared.id.0, "shutting down");
        shared.queue.finish(shared.workers());
    }

    ShutdownHandle { shared }
}

pub struct ShutdownHandle {
    shared: Arc<Shared>
}

impl ShutdownHandle {
    /// Block until all worker threads have exited.
    pub fn wait(self) {
        profiling::scope!("shutdown");

        // A job shutting down its own manager can't join the thread it runs on.
        let own_worker = get_worker()
            .filter(|worker| worker.manager_id() == self.shared.id)
            .map(|worker| worker.index());

        if let Some(index) = own_worker {
            tracing::warn!(worker = index, "shutting down from a worker thread, it won't be joined");
        }

        for worker in self.shared.workers() {
            if Some(worker.index()) == own_worker {
                continue;
            }

            if let Some(thread) = worker.take_thread() {
                // Finished workers sleeping on the queue are notified by `finish`, keep
                // nudging for a little while in case one was between checks.
                let backoff = Backoff::new();
                while !thread.is_finished() && !backoff.is_completed() {
                    self.shared.queue.wake_all();
                    backoff.snooze();
                }

                if thread.join().is_err() {
                    tracing::error!(worker = worker.index(), "worker thread panicked");
                }
            }
        }

        if own_worker.is_some() {
            return;
        }

        let destroyed = self.shared.fibers.destroy_all();
        tracing::debug!(manager = self.shared.id.0, fibers = destroyed, "job system shut down");
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::Manager;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..5 {
        for num_threads in 1..9 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let manager = Manager::builder()
                .with_worker_threads(num_threads)
                .with_affinity(false)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build();

            let handle = manager.shut_down();
            handle.wait();

            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(manager.realized_fibers(), 0);
        }
    }
}

#[test]
fn queued_jobs_run_before_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::{JobInfo, Manager};

    let manager = Manager::builder().with_worker_threads(2).with_affinity(false).build();
    let count = Arc::new(AtomicU32::new(0));
    for _ in 0..100 {
        let count = Arc::clone(&count);
        manager.run(JobInfo::new(move || { count.fetch_add(1, Ordering::SeqCst); }), None).unwrap();
    }

    manager.uninitialize();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

#[test]
fn parked_fiber_is_destroyed() {
    use crate::{JobInfo, Manager};

    let manager = Manager::builder().with_worker_threads(1).with_affinity(false).build();
    let never = manager.allocate_handle().unwrap();

    let m = manager.clone();
    let mut started = crate::JobHandle::INVALID;
    manager.run(JobInfo::new(move || { m.wait(never); }), Some(&mut started)).unwrap();

    // The job never finishes, only its fiber is parked.
    while manager.worker(0).unwrap().stats().fibers_parked == 0 {
        std::thread::yield_now();
    }

    let other = manager.clone();
    manager.uninitialize();

    // Nothing could ever complete `never`: the fiber was unwound by its worker and
    // the job's finish handle was never discharged.
    assert_eq!(other.realized_fibers(), 0);
    assert!(other.is_handle_live(started));
    assert_eq!(other.handle_value(started), Some(1));
}

#[test]
fn parked_jobs_finish_before_shutdown() {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use crate::{JobHandle, JobInfo, Manager};

    let manager = Manager::builder().with_worker_threads(2).with_affinity(false).build();
    let finished = Arc::new(AtomicBool::new(false));

    let m = manager.clone();
    let f = Arc::clone(&finished);
    manager.run(JobInfo::new(move || {
        let mut child = JobHandle::INVALID;
        m.run(JobInfo::new(|| {
            std::thread::sleep(Duration::from_millis(300));
        }).with_worker(1), Some(&mut child)).unwrap();

        m.wait(child);
        f.store(true, Ordering::SeqCst);
    }).with_worker(0), None).unwrap();

    // Shut down while the parent is parked and the child still runs.
    while manager.worker(0).unwrap().stats().fibers_parked == 0 {
        std::thread::yield_now();
    }
    let other = manager.clone();
    manager.uninitialize();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(other.realized_fibers(), 0);
    assert_eq!(other.live_handles(), 0);
}
