//! Worker fibers.
//!
//! Each fiber is a stackful coroutine running the job dispatch loop. The OS stack of
//! a worker thread acts as its primary fiber: it resumes worker fibers and gets control
//! back whenever one of them parks itself in `wait`, goes idle to let a parked fiber
//! continue, or exits at shutdown.
//!
//! Fibers are pooled. A slot is lazily given a stack the first time it is acquired, by
//! a worker that owns the fiber from then on: an idle fiber goes back to its owner's
//! idle list, not to the shared one. Only slots without a stack are shared between
//! workers. A coroutine never moves to another thread, so neither do the thread
//! locals it may have cached.

use super::sync::{lock, Arc, Mutex, AtomicBool, AtomicU32, Ordering};
use super::handle::JobHandle;
use super::job::JobRecord;
use super::worker::WorkerThread;
use super::Shared;
use crate::error::Error;
use crate::util::ExclusiveCheck;

use aliasable::boxed::AliasableBox;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use std::cell::{Cell, UnsafeCell};

/// Default number of fiber slots.
pub const MAX_FIBER_COUNT: usize = 512;
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u32);

impl FiberId {
    pub fn index(&self) -> usize { self.0 as usize }
}

/// Sent by the primary fiber when resuming a worker fiber.
#[derive(Debug)]
pub(crate) enum FiberInput {
    /// Run the dispatch loop.
    Start,
    /// The handle we were parked on completed.
    Resume,
    /// Leave the dispatch loop for good. Only sent to idle fibers.
    Exit,
}

/// Sent by a worker fiber when it gives control back to the primary fiber.
#[derive(Debug)]
pub(crate) enum FiberYield {
    /// A parked fiber of this worker is ready, release us to the pool.
    Idle,
    /// Park us on `handle` and continue with `replacement`.
    Wait { handle: JobHandle, replacement: FiberId },
}

type FiberCoroutine = Coroutine<FiberInput, FiberYield, (), DefaultStack>;

pub(crate) struct FiberSlot {
    id: FiberId,
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    // Points into the coroutine's own stack, valid while the coroutine is running.
    yielder: Cell<*const Yielder<FiberInput, FiberYield>>,
    current_job: Cell<Option<JobRecord>>,
    // Index of the worker that realized the coroutine.
    owner: AtomicU32,
    binding: ExclusiveCheck<FiberId>,
}

// A slot is only touched by the worker it is bound to (or by the pool while it
// is free), which `binding` checks in debug builds. Realized slots are only bound
// by their owner.
unsafe impl Sync for FiberSlot {}
unsafe impl Send for FiberSlot {}

impl FiberSlot {
    #[inline]
    pub fn id(&self) -> FiberId { self.id }

    fn owner(&self) -> u32 { self.owner.load(Ordering::Acquire) }

    pub fn current_job(&self) -> Option<JobRecord> {
        self.current_job.get()
    }

    pub fn set_current_job(&self, job: Option<JobRecord>) {
        self.current_job.set(job);
    }

    pub fn set_yielder(&self, yielder: &Yielder<FiberInput, FiberYield>) {
        self.yielder.set(yielder);
    }

    /// Give control back to the primary fiber.
    ///
    /// Safety: must be called from this fiber's own coroutine.
    pub unsafe fn suspend(&self, val: FiberYield) -> FiberInput {
        let yielder = self.yielder.get();
        debug_assert!(!yielder.is_null());
        (*yielder).suspend(val)
    }

    fn bind(&self) {
        if cfg!(debug_assertions) {
            self.binding.begin();
        }
    }

    fn unbind(&self) {
        if cfg!(debug_assertions) {
            self.binding.end();
        }
    }
}

pub(crate) struct FiberPool {
    slots: AliasableBox<[FiberSlot]>,
    // Slots without a stack, shared by every worker.
    unrealized: Mutex<Vec<FiberId>>,
    // Realized fibers sitting in some worker's idle list.
    idle: AtomicU32,
    stack_size: usize,
    realized: AtomicU32,
    destroyed: AtomicBool,
}

const NO_OWNER: u32 = u32::MAX;

impl FiberPool {
    pub fn new(count: usize, stack_size: usize) -> Self {
        assert!(count > 0 && count <= u32::MAX as usize);

        let slots: Box<[FiberSlot]> = (0..count as u32).map(|idx| FiberSlot {
            id: FiberId(idx),
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(std::ptr::null()),
            current_job: Cell::new(None),
            owner: AtomicU32::new(NO_OWNER),
            binding: ExclusiveCheck::with_tag(FiberId(idx)),
        }).collect();

        FiberPool {
            slots: AliasableBox::from_unique(slots),
            // Reversed so that low slots are handed out first.
            unrealized: Mutex::new((0..count as u32).rev().map(FiberId).collect()),
            idle: AtomicU32::new(0),
            stack_size,
            realized: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize { self.slots.len() }

    /// Fibers that don't run a job, with or without a stack.
    pub fn free_count(&self) -> usize {
        lock(&self.unrealized).len() + self.idle.load(Ordering::Acquire) as usize
    }

    /// Number of slots that currently own a stack.
    pub fn realized_count(&self) -> u32 { self.realized.load(Ordering::Acquire) }

    pub fn slot(&self, id: FiberId) -> &FiberSlot {
        &self.slots[id.index()]
    }

    /// Take one of the worker's idle fibers, or realize a new one owned by the worker.
    pub fn acquire(&self, shared: &Shared, worker: &Arc<WorkerThread>) -> Result<FiberId, Error> {
        profiling::scope!("acquire_fiber");

        if let Some(id) = worker.pop_idle_fiber() {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            let slot = self.slot(id);
            debug_assert_eq!(slot.owner(), worker.index());
            slot.bind();
            return Ok(id);
        }

        let id = match lock(&self.unrealized).pop() {
            Some(id) => id,
            None => return Err(Error::FiberExhausted { capacity: self.capacity() }),
        };

        let slot = self.slot(id);
        slot.bind();

        let stack = match DefaultStack::new(self.stack_size) {
            Ok(stack) => stack,
            Err(err) => {
                slot.unbind();
                lock(&self.unrealized).push(id);
                return Err(Error::FiberStack(err));
            }
        };

        let shared: *const Shared = shared;
        let slot_ptr: *const FiberSlot = slot;
        let owner = Arc::clone(worker);
        let coroutine = Coroutine::with_stack(stack, move |yielder, input| {
            // Safety: the pool is owned by `Shared` and fibers never outlive it.
            unsafe { super::fiber_main(&*shared, &owner, &*slot_ptr, yielder, input) }
        });

        // Safety: the slot was unrealized, so nobody else is using it.
        unsafe {
            *slot.coroutine.get() = Some(coroutine);
        }
        slot.owner.store(worker.index(), Ordering::Release);

        let realized = self.realized.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(fiber = id.0, worker = worker.index(), realized, "created fiber context");

        Ok(id)
    }

    /// Switch to a fiber.
    ///
    /// Safety: the fiber must be bound to the calling worker and must not be running.
    pub unsafe fn resume(&self, id: FiberId, input: FiberInput) -> CoroutineResult<FiberYield, ()> {
        match &mut *self.slot(id).coroutine.get() {
            Some(coroutine) => coroutine.resume(input),
            None => unreachable!("resuming unrealized fiber {:?}", id),
        }
    }

    /// Put a fiber that doesn't run a job back in its owner's idle list.
    pub fn release(&self, worker: &WorkerThread, id: FiberId) {
        let slot = self.slot(id);
        debug_assert_eq!(slot.owner(), worker.index());
        slot.set_current_job(None);
        slot.unbind();
        self.idle.fetch_add(1, Ordering::AcqRel);
        worker.push_idle_fiber(id);
    }

    /// Drop the context of a bound fiber and give the slot back to every worker.
    ///
    /// Dropping a suspended coroutine unwinds its stack, so this must run on the
    /// owner's thread.
    fn unrealize(&self, id: FiberId) {
        let slot = self.slot(id);
        // Safety: the fiber is bound to the caller and isn't running.
        let context = unsafe { (*slot.coroutine.get()).take() };
        drop(context);

        slot.set_current_job(None);
        slot.owner.store(NO_OWNER, Ordering::Release);
        slot.unbind();
        self.realized.fetch_sub(1, Ordering::AcqRel);
        lock(&self.unrealized).push(id);
    }

    /// Free the slot of a fiber whose coroutine returned.
    pub fn retire(&self, id: FiberId) {
        self.unrealize(id);
    }

    /// Destroy every fiber owned by `worker`. Called by the worker thread itself once
    /// it left its scheduling loop.
    ///
    /// Idle fibers are asked to leave their dispatch loop, fibers still parked in
    /// `wait` are unwound.
    pub fn destroy_owned(&self, worker: &WorkerThread) -> u32 {
        let mut destroyed = 0;

        for id in worker.take_idle_fibers() {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            self.slot(id).bind();
            // Safety: the fiber is ours and suspended in its dispatch loop.
            let _ = unsafe { self.resume(id, FiberInput::Exit) };
            self.unrealize(id);
            destroyed += 1;
        }

        for slot in self.slots.iter() {
            if slot.owner() != worker.index() {
                continue;
            }

            // Safety: only the owner touches a realized slot, and that's us.
            if unsafe { (*slot.coroutine.get()).is_none() } {
                continue;
            }

            tracing::warn!(worker = worker.index(), fiber = slot.id.0, "destroying a fiber parked in wait");
            // Parked fibers are still bound to us.
            self.unrealize(slot.id);
            destroyed += 1;
        }

        if destroyed > 0 {
            tracing::trace!(worker = worker.index(), fibers = destroyed, "destroyed worker fibers");
        }

        destroyed
    }

    /// Get rid of the fibers left behind by workers that didn't exit normally.
    ///
    /// Must only be called once all worker threads are gone. Contexts suspended mid
    /// run are leaked rather than unwound on a thread they don't belong to.
    pub fn destroy_all(&self) -> u32 {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut destroyed = 0;
        for slot in self.slots.iter() {
            // Safety: no worker is left to touch the slots.
            let coroutine = unsafe { &mut *slot.coroutine.get() };
            let context = match coroutine.take() {
                Some(context) => context,
                None => continue,
            };

            if context.started() && !context.done() {
                tracing::warn!(fiber = slot.id.0, worker = slot.owner(), "leaking the fiber of a dead worker");
                std::mem::forget(context);
            } else {
                drop(context);
            }

            self.realized.fetch_sub(1, Ordering::AcqRel);
            destroyed += 1;
        }

        destroyed
    }
}
