use super::handle::JobHandle;

use std::fmt;

/// Raw job entry point, for callers that manage their own job data.
pub type JobFunc = fn(*mut ());

enum Task {
    Closure(Box<dyn FnOnce() + Send>),
    Raw { func: JobFunc, data: RawData },
}

#[derive(Copy, Clone)]
struct RawData(*mut ());

// The caller of `JobInfo::from_raw` guarantees the data can be used from
// whichever worker runs the job.
unsafe impl Send for RawData {}

/// A unit of work along with its scheduling parameters.
///
/// Jobs are moved into the job queue (or onto the counter of their precondition)
/// and consumed by the worker that executes them.
pub struct JobInfo {
    task: Task,
    pub(crate) finish_handle: JobHandle,
    pub(crate) precondition: JobHandle,
    pub(crate) worker_index: Option<u8>,
}

impl JobInfo {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        JobInfo {
            task: Task::Closure(Box::new(func)),
            finish_handle: JobHandle::INVALID,
            precondition: JobHandle::INVALID,
            worker_index: None,
        }
    }

    /// Create a job from a function pointer and an opaque data pointer.
    ///
    /// # Safety
    ///
    /// `data` must remain valid until the job has run, and `func` must be
    /// sound to call with it from any worker thread.
    pub unsafe fn from_raw(func: JobFunc, data: *mut ()) -> Self {
        JobInfo {
            task: Task::Raw { func, data: RawData(data) },
            finish_handle: JobHandle::INVALID,
            precondition: JobHandle::INVALID,
            worker_index: None,
        }
    }

    /// Don't start the job before `handle` reaches zero.
    #[inline]
    pub fn with_precondition(mut self, handle: JobHandle) -> Self {
        self.precondition = handle;
        self
    }

    /// Only let the worker with this index execute the job.
    ///
    /// The index is taken modulo the number of worker threads.
    #[inline]
    pub fn with_worker(mut self, worker_index: u8) -> Self {
        self.worker_index = Some(worker_index);
        self
    }

    #[inline]
    pub fn precondition(&self) -> JobHandle {
        self.precondition
    }

    #[inline]
    pub fn worker_index(&self) -> Option<u8> {
        self.worker_index
    }

    pub(crate) fn record(&self) -> JobRecord {
        JobRecord {
            finish_handle: self.finish_handle,
            precondition: self.precondition,
            worker_index: self.worker_index,
        }
    }

    pub(crate) fn can_run_on(&self, worker_index: u32) -> bool {
        self.worker_index.map_or(true, |idx| idx as u32 == worker_index)
    }

    /// Consume the job and run its task.
    ///
    /// Returns the finish handle, which the caller is responsible for decrementing.
    pub(crate) fn execute(self) -> JobHandle {
        match self.task {
            Task::Closure(func) => func(),
            Task::Raw { func, data } => func(data.0),
        }

        self.finish_handle
    }
}

impl fmt::Debug for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobInfo")
            .field("finish_handle", &self.finish_handle)
            .field("precondition", &self.precondition)
            .field("worker_index", &self.worker_index)
            .finish()
    }
}

/// What a fiber records about the job it is running, for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub finish_handle: JobHandle,
    pub precondition: JobHandle,
    pub worker_index: Option<u8>,
}

#[test]
fn raw_job() {
    fn store_42(data: *mut ()) {
        unsafe { *(data as *mut u32) = 42; }
    }

    let mut output = 0u32;
    let job = unsafe { JobInfo::from_raw(store_42, &mut output as *mut u32 as *mut ()) };
    assert!(!job.execute().is_valid());
    assert_eq!(output, 42);
}

#[test]
fn job_affinity() {
    let job = JobInfo::new(|| {}).with_worker(2);
    assert!(job.can_run_on(2));
    assert!(!job.can_run_on(0));
    assert!(JobInfo::new(|| {}).can_run_on(5));
    assert_eq!(job.record().worker_index, Some(2));
}
