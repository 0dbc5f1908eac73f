//! Completion counters and the table that recycles them.
//!
//! The table is a flat arena of counters plus a free list of slot indices. It is not
//! synchronized by itself: the manager keeps it behind its main lock, which is also
//! what serializes attaching a dependent job to a counter with releasing it.

use super::fiber::FiberId;
use super::handle::{JobHandle, HANDLE_ID_MASK};
use super::job::JobInfo;
use crate::error::Error;

/// A fiber parked on a counter, to be resumed by the worker that parked it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub worker: u32,
    pub fiber: FiberId,
}

struct JobCounter {
    // Pending completions. Reaching zero releases the slot.
    value: i32,
    // Jobs that have this counter as their precondition.
    next_jobs: Vec<JobInfo>,
    // Counters that are released along with this one.
    siblings: Vec<JobHandle>,
    waiters: Vec<Waiter>,
    generation: u16,
    live: bool,
}

impl JobCounter {
    fn new() -> Self {
        JobCounter {
            value: 0,
            next_jobs: Vec::new(),
            siblings: Vec::new(),
            waiters: Vec::new(),
            generation: 0,
            live: false,
        }
    }
}

/// Everything that has to happen outside of the table after releasing handles.
#[derive(Default)]
pub(crate) struct Released {
    pub jobs: Vec<JobInfo>,
    pub waiters: Vec<Waiter>,
    pub slots: u32,
}

pub(crate) struct HandleTable {
    counters: Box<[JobCounter]>,
    free: Vec<u16>,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= HANDLE_ID_MASK as usize, "invalid handle capacity {}", capacity);

        HandleTable {
            counters: (0..capacity).map(|_| JobCounter::new()).collect(),
            // Reversed so that low slots are handed out first.
            free: (0..capacity as u16).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.counters.len()
    }

    pub fn live_count(&self) -> usize {
        self.counters.len() - self.free.len()
    }

    pub fn allocate(&mut self) -> Result<JobHandle, Error> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                return Err(Error::HandleExhausted { capacity: self.capacity() });
            }
        };

        let counter = &mut self.counters[slot as usize];
        debug_assert!(!counter.live);
        debug_assert!(counter.next_jobs.is_empty() && counter.waiters.is_empty());
        counter.value = 1;
        counter.live = true;
        counter.siblings.clear();

        Ok(JobHandle::new(slot, counter.generation))
    }

    fn live_counter(&self, handle: JobHandle) -> Option<&JobCounter> {
        if !handle.is_valid() {
            return None;
        }

        self.counters
            .get(handle.slot() as usize)
            .filter(|counter| counter.live && counter.generation == handle.generation())
    }

    fn live_counter_mut(&mut self, handle: JobHandle) -> Option<&mut JobCounter> {
        if !handle.is_valid() {
            return None;
        }

        self.counters
            .get_mut(handle.slot() as usize)
            .filter(|counter| counter.live && counter.generation == handle.generation())
    }

    /// Whether the handle still refers to the counter it was created for.
    pub fn is_live(&self, handle: JobHandle) -> bool {
        self.live_counter(handle).is_some()
    }

    /// Whether waiting on the handle would return immediately.
    ///
    /// Invalid and stale handles count as complete.
    pub fn is_zero(&self, handle: JobHandle) -> bool {
        self.live_counter(handle).map_or(true, |counter| counter.value == 0)
    }

    pub fn value(&self, handle: JobHandle) -> Option<i32> {
        self.live_counter(handle).map(|counter| counter.value)
    }

    /// Add a completion obligation to `handle`, or allocate a new handle in its
    /// place if it is already complete.
    pub fn inc(&mut self, handle: &mut JobHandle) -> Result<(), Error> {
        if let Some(counter) = self.live_counter_mut(*handle) {
            if counter.value > 0 {
                counter.value += 1;
                return Ok(());
            }
        }

        *handle = self.allocate()?;

        Ok(())
    }

    /// Returns what needs to be done if the counter reached zero.
    ///
    /// Decrementing a stale handle is a broken caller contract: it asserts in debug
    /// builds and is otherwise ignored.
    pub fn dec(&mut self, handle: JobHandle) -> Option<Released> {
        let counter = match self.live_counter_mut(handle) {
            Some(counter) => counter,
            None => {
                debug_assert!(false, "decrementing stale or invalid handle {:?}", handle);
                tracing::error!(?handle, "decrementing stale or invalid handle");
                return None;
            }
        };

        debug_assert!(counter.value > 0);
        counter.value -= 1;
        if counter.value > 0 {
            return None;
        }

        Some(self.release(handle))
    }

    /// Discharge the finish handle of a job that completed.
    ///
    /// Unlike `dec`, a handle that is no longer live is fine here: it was released
    /// along with a sibling while the job was pending, which already accounted for it.
    pub fn dec_finished(&mut self, handle: JobHandle) -> Option<Released> {
        if !self.is_live(handle) {
            tracing::trace!(?handle, "finish handle already released");
            return None;
        }

        self.dec(handle)
    }

    /// Release `handle` and every counter reachable through its sibling list,
    /// regardless of their pending counts.
    pub fn release(&mut self, handle: JobHandle) -> Released {
        let mut released = Released::default();
        let mut pending = vec![handle];

        while let Some(handle) = pending.pop() {
            let counter = match self.live_counter_mut(handle) {
                Some(counter) => counter,
                // Siblings may have been released on their own already.
                None => continue,
            };

            released.jobs.append(&mut counter.next_jobs);
            released.waiters.append(&mut counter.waiters);
            pending.append(&mut counter.siblings);

            counter.value = 0;
            counter.live = false;
            counter.generation = counter.generation.wrapping_add(1);
            self.free.push(handle.slot());
            released.slots += 1;
        }

        released
    }

    /// Chain `job` on `precondition`.
    ///
    /// Gives the job back if the precondition is already complete, in which case
    /// it can be scheduled right away.
    pub fn attach(&mut self, precondition: JobHandle, job: JobInfo) -> Result<(), JobInfo> {
        match self.live_counter_mut(precondition) {
            Some(counter) if counter.value > 0 => {
                counter.next_jobs.push(job);
                Ok(())
            }
            _ => Err(job),
        }
    }

    /// Park a fiber on `handle`. Returns false if the handle is already complete.
    pub fn park(&mut self, handle: JobHandle, waiter: Waiter) -> bool {
        match self.live_counter_mut(handle) {
            Some(counter) if counter.value > 0 => {
                counter.waiters.push(waiter);
                true
            }
            _ => false,
        }
    }

    /// Release `sibling` whenever `owner` is released.
    pub fn link(&mut self, owner: JobHandle, sibling: JobHandle) -> bool {
        if owner == sibling || !self.is_live(sibling) {
            return false;
        }

        match self.live_counter_mut(owner) {
            Some(counter) => {
                counter.siblings.push(sibling);
                true
            }
            None => false,
        }
    }
}

#[test]
fn live_handles_are_unique() {
    use std::collections::HashSet;

    let mut table = HandleTable::new(64);
    let mut live = Vec::new();
    let mut seen_live: HashSet<JobHandle> = HashSet::new();

    // A cheap deterministic interleaving of allocations and releases.
    let mut state = 0x2545_f491u32;
    for _ in 0..10_000 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;

        if state % 3 != 0 && live.len() < 64 {
            let handle = table.allocate().unwrap();
            assert!(seen_live.insert(handle), "{:?} handed out twice", handle);
            live.push(handle);
        } else if !live.is_empty() {
            let handle = live.swap_remove(state as usize % live.len());
            assert!(table.dec(handle).is_some());
            assert!(seen_live.remove(&handle));
            assert!(!table.is_live(handle));
            assert!(table.is_zero(handle));
        }

        assert_eq!(table.live_count(), live.len());
    }
}

#[test]
fn inc_then_dec_releases_once() {
    let mut table = HandleTable::new(4);
    let mut handle = JobHandle::INVALID;

    table.inc(&mut handle).unwrap();
    assert!(table.is_live(handle));
    assert_eq!(table.value(handle), Some(1));

    let first = handle;
    for _ in 0..4 {
        table.inc(&mut handle).unwrap();
    }
    assert_eq!(handle, first);
    assert_eq!(table.value(handle), Some(5));

    for _ in 0..4 {
        assert!(table.dec(handle).is_none());
        assert!(!table.is_zero(handle));
    }

    let released = table.dec(handle).unwrap();
    assert_eq!(released.slots, 1);
    assert!(table.is_zero(handle));
    assert!(!table.is_live(handle));

    // Incrementing a completed handle hands out a new one.
    table.inc(&mut handle).unwrap();
    assert_ne!(handle, first);
    assert!(table.is_live(handle));
    assert!(!table.is_live(first));
}

#[test]
fn exhaustion() {
    let mut table = HandleTable::new(super::handle::MAX_JOB_HANDLE_COUNT);
    let handles: Vec<JobHandle> = (0..table.capacity()).map(|_| table.allocate().unwrap()).collect();

    match table.allocate() {
        Err(Error::HandleExhausted { capacity }) => assert_eq!(capacity, 4096),
        other => panic!("expected exhaustion, got {:?}", other),
    }

    let mut handle = JobHandle::INVALID;
    assert!(table.inc(&mut handle).is_err());
    assert!(!handle.is_valid());

    // The table is still consistent and usable.
    for &handle in &handles {
        assert_eq!(table.value(handle), Some(1));
    }
    table.dec(handles[10]);
    let recycled = table.allocate().unwrap();
    assert_eq!(recycled.slot(), handles[10].slot());
    assert_ne!(recycled.generation(), handles[10].generation());
    assert!(!table.is_live(handles[10]));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn stale_dec_asserts() {
    let mut table = HandleTable::new(4);
    let handle = table.allocate().unwrap();
    table.dec(handle);
    table.dec(handle);
}

#[test]
fn stale_handle_does_not_touch_reused_slot() {
    let mut table = HandleTable::new(1);
    let stale = table.allocate().unwrap();
    table.dec(stale);

    let fresh = table.allocate().unwrap();
    assert_eq!(stale.slot(), fresh.slot());

    assert!(table.is_zero(stale));
    assert!(!table.park(stale, Waiter { worker: 0, fiber: FiberId(0) }));
    assert!(table.attach(stale, JobInfo::new(|| {})).is_err());

    let mut handle = stale;
    table.inc(&mut handle).unwrap_err();
    assert_eq!(table.value(fresh), Some(1));
}

#[test]
fn chained_jobs_and_siblings() {
    let mut table = HandleTable::new(8);
    let owner = table.allocate().unwrap();
    let sibling = table.allocate().unwrap();
    let nested = table.allocate().unwrap();

    assert!(table.link(owner, sibling));
    assert!(table.link(sibling, nested));
    assert!(!table.link(owner, owner));

    assert!(table.attach(owner, JobInfo::new(|| {})).is_ok());
    assert!(table.attach(nested, JobInfo::new(|| {})).is_ok());
    assert!(table.park(sibling, Waiter { worker: 1, fiber: FiberId(3) }));

    let released = table.dec(owner).unwrap();
    assert_eq!(released.slots, 3);
    assert_eq!(released.jobs.len(), 2);
    assert_eq!(released.waiters, vec![Waiter { worker: 1, fiber: FiberId(3) }]);
    assert_eq!(table.live_count(), 0);
    assert!(table.is_zero(sibling) && table.is_zero(nested));
}

#[test]
fn finished_job_on_released_sibling() {
    let mut table = HandleTable::new(4);
    let owner = table.allocate().unwrap();
    let sibling = table.allocate().unwrap();
    assert!(table.link(owner, sibling));

    table.dec(owner).unwrap();
    assert!(!table.is_live(sibling));

    // The job that held `sibling` as its finish handle completes afterwards.
    assert!(table.dec_finished(sibling).is_none());
    assert_eq!(table.live_count(), 0);

    let mut handle = table.allocate().unwrap();
    table.inc(&mut handle).unwrap();
    assert!(table.dec_finished(handle).is_none());
    assert!(table.dec_finished(handle).is_some());
}

#[test]
fn generation_wraps() {
    let mut table = HandleTable::new(1);
    let first = table.allocate().unwrap();
    table.dec(first);

    for _ in 0..0xffff {
        let handle = table.allocate().unwrap();
        table.dec(handle);
    }

    // After a full cycle the generation comes back around without touching the slot.
    let handle = table.allocate().unwrap();
    assert_eq!(handle.generation(), first.generation());
    assert_eq!(handle.slot(), 0);
    assert!(handle.is_valid());
}
