//! A fiber based job scheduler.
//!
//! Jobs are submitted to a shared LIFO queue and executed by a fixed set of worker
//! threads, each pinned to a logical CPU. Jobs run on pooled fibers, so a job that
//! waits for other jobs only suspends its fiber: the worker thread keeps executing
//! other jobs and resumes the waiting fiber once the awaited work is done.
//!
//! Completion is tracked with [`JobHandle`]s, small generation-tagged references to
//! counters in a fixed size table. A handle can group any number of jobs, and jobs
//! can be made to wait for a handle before they start.
//!
//! ```no_run
//! use fiberjob::{JobHandle, JobInfo, Manager};
//!
//! let manager = Manager::initialize(4);
//!
//! let mut loaded = JobHandle::INVALID;
//! manager.run(JobInfo::new(|| { /* load */ }), Some(&mut loaded)).unwrap();
//!
//! let mut done = JobHandle::INVALID;
//! manager.run_ex(|| { /* process */ }, Some(&mut done), loaded).unwrap();
//!
//! manager.wait(done);
//! manager.uninitialize();
//! ```
//!
//! There is also a process-wide job system in [`global`].

// TODO: catch panics in jobs instead of losing the worker thread.

mod core;
mod error;
pub mod global;
pub mod util;

pub use crate::error::Error;
pub use crate::core::MAX_WORKER_COUNT;
pub use crate::core::WorkerHook;
pub use crate::core::manager::{Manager, ManagerBuilder, ManagerId, default_worker_count};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::handle::{JobHandle, MAX_JOB_HANDLE_COUNT};
pub use crate::core::job::{JobFunc, JobInfo, JobRecord};
pub use crate::core::fiber::{FiberId, MAX_FIBER_COUNT, DEFAULT_FIBER_STACK_SIZE};
pub use crate::core::worker::{get_worker, Stats, WorkerThread};
pub use crate::core::sync;
