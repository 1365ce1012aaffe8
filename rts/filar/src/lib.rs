//! Cooperative single-threaded coroutine scheduler.
//!
//! filar multiplexes suspendable tasks on one thread: no OS threads, no
//! atomics, no I/O. A coroutine is a resume function plus the record of its
//! progress; the event loop repeatedly visits every scheduled coroutine,
//! resumes the ones that are ready, and reaps the ones nothing references
//! anymore.
//!
//! # Coroutine Lifecycle
//!
//! ```text
//!  Coro::new      add_task        resume()*        refs == 0
//!     |              |               |                 |
//!     v              v               v                 v
//! +------+      +-----------+    +------+          +--------+
//! | Init | ---> | scheduled | -> | Done | -------> | reaped |
//! +------+      +-----------+    +------+          +--------+
//!                     |                                ^
//!                     | cancel (request)               |
//!                     v                                |
//!               +------------+  next loop visit        |
//!               | cancelling | ------------------------+
//!               +------------+   (hook runs, err = Canceled)
//! ```
//!
//! A resume runs the body to its next suspension ([`Step::Pending`]) or to
//! completion ([`Step::Done`]). Completion releases the reference the body
//! holds on itself; once the count reaches zero the loop tears the state
//! down on its next visit — cancel hook (if the state never finished), then
//! the scratch arena, then the slot.
//!
//! # Reference counts
//!
//! The count on a [`Coro`] is a scheduling-level count, not a memory count:
//! it says how many owners still care whether the coroutine runs. Memory is
//! managed by the handles themselves. [`Coro::decref`] therefore never frees
//! anything — it marks the state reapable for the loop's next pass.
//!
//! # Example
//!
//! ```
//! use filar::{combinators, get_event_loop};
//! use std::time::Duration;
//!
//! let lp = get_event_loop();
//! let nap = combinators::sleep(Duration::from_millis(1));
//! lp.run_until_complete(nap);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod combinators;
pub mod slots;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use filar_arena::Scratch;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::slots::SlotQueue;

// ============================================================================
// Errors
// ============================================================================

/// Failure conditions a coroutine or loop operation can record.
///
/// The set is closed; a coroutine's error field is `Option<Error>`, with
/// `None` meaning no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// An allocation could not be reserved while scheduling.
    #[error("MEMORY ALLOCATION ERROR")]
    Nomem,
    /// The coroutine was cancelled, externally or by a timeout.
    #[error("COROUTINE WAS CANCELLED")]
    Canceled,
    /// A state was passed to an operation it is not valid for. Reserved for
    /// adapter layers built on top of this crate.
    #[error("INVALID STATE WAS PASSED TO COROUTINE")]
    InvalidState,
}

/// Human-readable string for an error value, `None` (no error) included.
#[must_use]
pub fn strerror(err: Option<Error>) -> &'static str {
    match err {
        None => "OK",
        Some(Error::Nomem) => "MEMORY ALLOCATION ERROR",
        Some(Error::Canceled) => "COROUTINE WAS CANCELLED",
        Some(Error::InvalidState) => "INVALID STATE WAS PASSED TO COROUTINE",
    }
}

// ============================================================================
// Progress and suspension
// ============================================================================

/// Progress cursor of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Created, never resumed.
    Init,
    /// Resumed at least once, not finished.
    Cont,
    /// Terminal. A `Done` coroutine never resumes again.
    Done,
}

/// What one resume of a body reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The body suspended; resume it again later.
    Pending,
    /// The body ran to completion.
    Done,
}

bitflags! {
    /// Scheduling state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct CoroFlags: u8 {
        /// The coroutine occupies a slot in an event loop.
        const SCHEDULED = 1 << 0;
        /// Cancellation was requested and awaits the loop's next visit.
        const CANCEL = 1 << 1;
    }
}

// ============================================================================
// Coroutine state
// ============================================================================

type BodyFn = Box<dyn FnMut(&Coro) -> Step>;
type CancelHook = Box<dyn FnMut(&Coro)>;

/// The state record behind a [`Coro`] handle.
struct RawCoro {
    /// Resume function. Runs to the next suspension or to completion.
    body: RefCell<BodyFn>,
    progress: Cell<Progress>,
    flags: Cell<CoroFlags>,
    /// Scheduling-level reference count. Starts at 1: the body owns itself
    /// until it completes or is cancelled.
    refs: Cell<usize>,
    err: Cell<Option<Error>>,
    /// Cleanup run when the loop tears down a state that never finished.
    cancel_hook: RefCell<Option<CancelHook>>,
    /// Guards against `cancel` re-entering from this state's own hook.
    in_hook: Cell<bool>,
    /// Coroutine this one is blocked on via [`Coro::fawait`]. Used for the
    /// resume gate and cancellation propagation only; ownership of the child
    /// is carried by its reference count.
    child: RefCell<Option<Coro>>,
    scratch: Scratch,
}

/// Handle to a suspendable coroutine.
///
/// Handles are cheap to clone and all refer to the same state. Cloning a
/// handle does not change the coroutine's reference count — call
/// [`Coro::incref`] to take scheduling-level ownership.
pub struct Coro {
    inner: Rc<RawCoro>,
}

impl Clone for Coro {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Coro {
    /// Create a coroutine from its body.
    ///
    /// The body is called once per resume with a handle to its own state; it
    /// reports [`Step::Pending`] to suspend and [`Step::Done`] to finish.
    /// The new state starts at [`Progress::Init`] with a reference count of
    /// one and is not scheduled anywhere.
    pub fn new(body: impl FnMut(&Coro) -> Step + 'static) -> Self {
        Self::build(Box::new(body), None)
    }

    /// Create a coroutine with a cancel hook.
    ///
    /// The hook runs when the loop tears the state down before it finished
    /// — after an external [`Coro::cancel`], or when the reference count
    /// reaches zero first. It never runs on a state that completed normally.
    pub fn with_hook(
        body: impl FnMut(&Coro) -> Step + 'static,
        hook: impl FnMut(&Coro) + 'static,
    ) -> Self {
        Self::build(Box::new(body), Some(Box::new(hook)))
    }

    fn build(body: BodyFn, hook: Option<CancelHook>) -> Self {
        Self {
            inner: Rc::new(RawCoro {
                body: RefCell::new(body),
                progress: Cell::new(Progress::Init),
                flags: Cell::new(CoroFlags::empty()),
                refs: Cell::new(1),
                err: Cell::new(None),
                cancel_hook: RefCell::new(hook),
                in_hook: Cell::new(false),
                child: RefCell::new(None),
                scratch: Scratch::new(),
            }),
        }
    }

    /// Whether two handles refer to the same state.
    #[must_use]
    pub fn ptr_eq(a: &Coro, b: &Coro) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Current progress cursor.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.inner.progress.get()
    }

    /// Whether the coroutine reached its terminal state.
    #[must_use]
    pub fn done(&self) -> bool {
        self.inner.progress.get() == Progress::Done
    }

    /// Whether cancellation was requested but possibly not yet finalized.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.inner.flags.get().contains(CoroFlags::CANCEL)
            || self.inner.err.get() == Some(Error::Canceled)
    }

    /// Request cancellation.
    ///
    /// This only sets a flag; the loop performs the actual teardown on its
    /// next visit (hook, child propagation, `err = Canceled`). Requesting
    /// cancellation of a state from inside that state's own cancel hook is
    /// ignored: the teardown already in progress cannot be restarted.
    pub fn cancel(&self) {
        if self.inner.in_hook.get() {
            warn!("cancel re-entered from the state's own cancel hook; ignored");
            return;
        }
        self.inner.flags.set(self.inner.flags.get() | CoroFlags::CANCEL);
    }

    /// Error recorded on this coroutine, if any.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        self.inner.err.get()
    }

    /// Record or clear this coroutine's error.
    pub fn set_err(&self, err: Option<Error>) {
        self.inner.err.set(err);
    }

    /// Current scheduling-level reference count.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.inner.refs.get()
    }

    /// Take a scheduling-level reference on this coroutine.
    pub fn incref(&self) {
        self.inner.refs.set(self.inner.refs.get() + 1);
    }

    /// Drop a scheduling-level reference.
    ///
    /// A count that reaches zero does not free anything; it marks the state
    /// reapable, and the loop tears it down on its next visit to the slot.
    pub fn decref(&self) {
        let refs = self.inner.refs.get();
        debug_assert!(refs > 0, "reference count underflow");
        self.inner.refs.set(refs.saturating_sub(1));
    }

    /// Scratch arena owned by this coroutine.
    ///
    /// Blocks registered here are dropped when the loop tears the state
    /// down, on every path — completion, cancellation, loop destruction.
    #[must_use]
    pub fn scratch(&self) -> &Scratch {
        &self.inner.scratch
    }

    /// Advance the coroutine by one resume.
    ///
    /// A [`Progress::Done`] state is left untouched. Otherwise the body runs
    /// once; if it reports [`Step::Done`], the cursor becomes `Done` and the
    /// reference the body held on itself is released. Returns the cursor
    /// after the step.
    ///
    /// # Panics
    ///
    /// Panics if called from inside this coroutine's own body (the body is
    /// already borrowed for the resume in progress).
    pub fn resume(&self) -> Progress {
        if self.done() {
            return Progress::Done;
        }
        if self.inner.progress.get() == Progress::Init {
            self.inner.progress.set(Progress::Cont);
        }
        let step = {
            let mut body = self.inner.body.borrow_mut();
            (body)(self)
        };
        if step == Step::Done && !self.done() {
            self.inner.progress.set(Progress::Done);
            self.decref();
        }
        self.inner.progress.get()
    }

    /// Block this coroutine on `child` until the child is done.
    ///
    /// Meant to be called from inside a body on each resume. The first call
    /// schedules the child on the installed loop, takes a reference on it,
    /// and records it as this state's child link — the loop then skips this
    /// coroutine until the child finishes, and cancellation of this
    /// coroutine propagates to the child. Once the child is done the link is
    /// cleared, the reference released, and `true` returned.
    ///
    /// If the child cannot be scheduled, `Error::Nomem` is recorded on this
    /// coroutine and `true` is returned so the body can observe
    /// [`Coro::err`] and exit.
    pub fn fawait(&self, child: &Coro) -> bool {
        let linked = self
            .inner
            .child
            .borrow()
            .as_ref()
            .is_some_and(|current| Coro::ptr_eq(current, child));
        if linked {
            if !child.done() {
                return false;
            }
            *self.inner.child.borrow_mut() = None;
            child.decref();
            return true;
        }
        if get_event_loop().add_task(child.clone()).is_err() {
            self.set_err(Some(Error::Nomem));
            return true;
        }
        child.incref();
        *self.inner.child.borrow_mut() = Some(child.clone());
        false
    }

    /// Tear down a coroutine that was never scheduled.
    ///
    /// Drains the scratch arena and drops this handle. States that have been
    /// scheduled are reaped by the loop instead; calling this on one of
    /// those only releases scratch blocks early.
    pub fn dispose(self) {
        self.inner.scratch.clear();
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.inner.flags.get().contains(CoroFlags::SCHEDULED)
    }

    pub(crate) fn set_scheduled(&self) {
        self.inner.flags.set(self.inner.flags.get() | CoroFlags::SCHEDULED);
    }

    pub(crate) fn clear_scheduled(&self) {
        self.inner.flags.set(self.inner.flags.get() - CoroFlags::SCHEDULED);
    }

    /// Whether the resume gate is open: no child link, or the child is done.
    pub(crate) fn child_ready(&self) -> bool {
        self.inner.child.borrow().as_ref().map_or(true, |c| c.done())
    }

    /// Run the cancel hook, if one is present. The hook is taken out of the
    /// state first, so it runs at most once over the coroutine's lifetime.
    pub(crate) fn run_cancel_hook(&self) {
        let hook = self.inner.cancel_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            self.inner.in_hook.set(true);
            hook(self);
            self.inner.in_hook.set(false);
        }
    }

    /// Finalize a requested cancellation: release the body's self-reference,
    /// run the hook, propagate one level down the child link, and move the
    /// state to its terminal cursor with `err = Canceled`.
    pub(crate) fn finalize_cancel(&self) {
        if !self.done() {
            self.decref();
            self.run_cancel_hook();
        }
        if let Some(child) = self.inner.child.borrow_mut().take() {
            child.decref();
            child.cancel();
        }
        self.inner.err.set(Some(Error::Canceled));
        self.inner.progress.set(Progress::Done);
        trace!(refs = self.refs(), "cancellation finalized");
    }
}

impl fmt::Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("progress", &self.progress())
            .field("refs", &self.refs())
            .field("cancelled", &self.cancelled())
            .field("err", &self.err())
            .finish()
    }
}

/// Tear down a batch of never-scheduled coroutines.
pub fn dispose_all(coros: impl IntoIterator<Item = Coro>) {
    for coro in coros {
        coro.dispose();
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// Operation set every event loop implementation provides.
///
/// The default implementation is [`SlotLoop`]; an alternative satisfying the
/// same contracts can be installed with [`set_event_loop`].
pub trait EventLoop {
    /// Reset the loop's task tables to empty.
    fn init(&self);

    /// Cancel and reap every remaining task, then release the tables.
    fn destroy(&self);

    /// Schedule one coroutine.
    ///
    /// An already-scheduled coroutine is returned unchanged. On allocation
    /// failure the coroutine is torn down and `Error::Nomem` returned.
    fn add_task(&self, coro: Coro) -> Result<Coro, Error>;

    /// Schedule a batch of coroutines.
    ///
    /// Reserves space for the whole batch up front; on reservation failure
    /// the task table is left unchanged and no coroutine is scheduled.
    fn add_tasks(&self, coros: &[Coro]) -> Result<(), Error>;

    /// Run passes until no slot is occupied.
    fn run_forever(&self);

    /// Drive `main` directly, interleaved with normal passes, until it is
    /// done. Unfinished tasks persist in the loop across invocations.
    fn run_until_complete(&self, main: Coro);
}

/// The provided event loop: a slotted task table with a vacancy free-list.
///
/// Tasks are visited in slot order; vacated slots are reused LIFO. No
/// fairness beyond that ordering is promised.
pub struct SlotLoop {
    tasks: RefCell<SlotQueue<Coro>>,
}

impl SlotLoop {
    /// Create an empty loop.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(SlotQueue::new()),
        }
    }

    /// Total slots, vacant included.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Slots currently holding a task.
    #[must_use]
    pub fn occupied_count(&self) -> usize {
        self.tasks.borrow().occupied()
    }

    /// Length of the vacancy free-list.
    #[must_use]
    pub fn vacant_count(&self) -> usize {
        self.tasks.borrow().vacant()
    }

    /// One pass over every slot in order.
    ///
    /// Per occupied slot: reap if nothing references the state anymore;
    /// otherwise finalize a pending cancellation; otherwise resume the body
    /// if it is not done and not gated on an unfinished child.
    fn pass(&self) {
        let mut i = 0;
        loop {
            let coro = {
                let tasks = self.tasks.borrow();
                if i >= tasks.len() {
                    break;
                }
                tasks.get(i).cloned()
            };
            let Some(coro) = coro else {
                i += 1;
                continue;
            };
            if coro.refs() == 0 {
                self.reap(i, &coro);
            } else if coro.cancelled() && coro.err() != Some(Error::Canceled) {
                coro.finalize_cancel();
            } else if !coro.done() && coro.child_ready() {
                coro.resume();
            }
            i += 1;
        }
    }

    /// One destroy-mode pass: like [`SlotLoop::pass`], but instead of
    /// resuming, any task not yet cancelled is cancelled and its slot
    /// revisited so the cancellation finalizes in the same pass.
    fn destroy_pass(&self) {
        let mut i = 0;
        loop {
            let coro = {
                let tasks = self.tasks.borrow();
                if i >= tasks.len() {
                    break;
                }
                tasks.get(i).cloned()
            };
            let Some(coro) = coro else {
                i += 1;
                continue;
            };
            if coro.refs() == 0 {
                self.reap(i, &coro);
            } else if coro.cancelled() && coro.err() != Some(Error::Canceled) {
                coro.finalize_cancel();
            } else if !coro.cancelled() {
                coro.cancel();
                continue; // revisit this slot
            }
            i += 1;
        }
    }

    /// Tear down the state in `slot` and return the slot to the free-list.
    fn reap(&self, slot: usize, coro: &Coro) {
        if !coro.done() {
            coro.run_cancel_hook();
        }
        coro.scratch().clear();
        coro.clear_scheduled();
        self.tasks.borrow_mut().vacate(slot);
        trace!(slot, "coroutine reaped");
    }
}

impl Default for SlotLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for SlotLoop {
    fn init(&self) {
        self.tasks.borrow_mut().clear();
    }

    fn destroy(&self) {
        while self.tasks.borrow().occupied() > 0 {
            self.destroy_pass();
        }
        self.tasks.borrow_mut().clear();
        debug!("event loop destroyed");
    }

    fn add_task(&self, coro: Coro) -> Result<Coro, Error> {
        if coro.is_scheduled() {
            return Ok(coro);
        }
        let installed = self.tasks.borrow_mut().install(coro.clone());
        match installed {
            Ok(slot) => {
                coro.set_scheduled();
                trace!(slot, "task scheduled");
                Ok(coro)
            }
            Err(e) => {
                coro.scratch().clear();
                Err(e)
            }
        }
    }

    fn add_tasks(&self, coros: &[Coro]) -> Result<(), Error> {
        self.tasks.borrow_mut().try_reserve(coros.len())?;
        let mut tasks = self.tasks.borrow_mut();
        for coro in coros {
            if !coro.is_scheduled() {
                // Cannot fail: the batch was reserved above.
                tasks.push(coro.clone());
                coro.set_scheduled();
            }
        }
        Ok(())
    }

    fn run_forever(&self) {
        while self.tasks.borrow().occupied() > 0 {
            self.pass();
        }
    }

    fn run_until_complete(&self, main: Coro) {
        while main.resume() != Progress::Done {
            self.pass();
        }
        if main.refs() == 0 {
            main.scratch().clear();
        }
    }
}

// ============================================================================
// Installed loop and task creation
// ============================================================================

thread_local! {
    /// The installed event loop. One per thread: the runtime is
    /// single-threaded, and every thread using it owns an independent loop.
    static EVENT_LOOP: RefCell<Rc<dyn EventLoop>> = RefCell::new(Rc::new(SlotLoop::new()));
}

/// Handle to the installed event loop.
#[must_use]
pub fn get_event_loop() -> Rc<dyn EventLoop> {
    EVENT_LOOP.with(|lp| Rc::clone(&lp.borrow()))
}

/// Install a replacement event loop.
///
/// Meant to be called between `init`/`destroy` cycles; swapping the loop
/// while tasks are scheduled strands them in the old loop.
pub fn set_event_loop(lp: Rc<dyn EventLoop>) {
    EVENT_LOOP.with(|slot| *slot.borrow_mut() = lp);
}

/// Schedule a coroutine on the installed loop.
pub fn create_task(coro: Coro) -> Result<Coro, Error> {
    get_event_loop().add_task(coro)
}

/// Schedule a batch of coroutines on the installed loop.
pub fn create_tasks(coros: &[Coro]) -> Result<(), Error> {
    get_event_loop().add_tasks(coros)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn install_fresh_loop() -> Rc<SlotLoop> {
        let lp = Rc::new(SlotLoop::new());
        set_event_loop(lp.clone());
        lp
    }

    /// A body that suspends `yields` times, then completes.
    fn yielder(yields: u32) -> Coro {
        let mut left = yields;
        Coro::new(move |_| {
            if left == 0 {
                Step::Done
            } else {
                left -= 1;
                Step::Pending
            }
        })
    }

    #[test]
    fn strerror_covers_every_value() {
        assert_eq!(strerror(None), "OK");
        assert_eq!(strerror(Some(Error::Nomem)), "MEMORY ALLOCATION ERROR");
        assert_eq!(strerror(Some(Error::Canceled)), "COROUTINE WAS CANCELLED");
        assert_eq!(
            strerror(Some(Error::InvalidState)),
            "INVALID STATE WAS PASSED TO COROUTINE"
        );
        assert_eq!(Error::Canceled.to_string(), "COROUTINE WAS CANCELLED");
    }

    #[test]
    fn fresh_state_defaults() {
        let coro = yielder(0);
        assert_eq!(coro.progress(), Progress::Init);
        assert_eq!(coro.refs(), 1);
        assert!(!coro.done());
        assert!(!coro.cancelled());
        assert_eq!(coro.err(), None);
    }

    #[test]
    fn resume_until_done_releases_self_reference() {
        let coro = yielder(2);
        assert_eq!(coro.resume(), Progress::Cont);
        assert_eq!(coro.resume(), Progress::Cont);
        assert_eq!(coro.resume(), Progress::Done);
        assert_eq!(coro.refs(), 0);
        // A done coroutine never resumes again.
        assert_eq!(coro.resume(), Progress::Done);
    }

    #[test]
    fn add_task_twice_occupies_one_slot() {
        let lp = install_fresh_loop();
        let coro = yielder(1);
        lp.add_task(coro.clone()).unwrap();
        lp.add_task(coro).unwrap();
        assert_eq!(lp.occupied_count(), 1);
    }

    #[test]
    fn run_forever_reaps_everything() {
        let lp = install_fresh_loop();
        lp.add_task(yielder(3)).unwrap();
        lp.add_task(yielder(1)).unwrap();
        lp.run_forever();
        assert_eq!(lp.occupied_count(), 0);
        assert_eq!(lp.vacant_count(), lp.slot_count());
    }

    #[test]
    fn vacated_slots_are_reused_lifo() {
        let lp = install_fresh_loop();
        lp.add_task(yielder(0)).unwrap();
        lp.add_task(yielder(0)).unwrap();
        lp.run_forever();
        assert_eq!(lp.slot_count(), 2);
        assert_eq!(lp.vacant_count(), 2);

        lp.add_task(yielder(0)).unwrap();
        // The free-list is LIFO: slot 1 was vacated last, so it fills first.
        assert_eq!(lp.slot_count(), 2);
        assert_eq!(lp.occupied_count(), 1);
    }

    #[test]
    fn cancel_is_a_deferred_request() {
        let lp = install_fresh_loop();
        let ran = Rc::new(Cell::new(0u32));
        let ran2 = Rc::clone(&ran);
        let coro = Coro::new(move |_| {
            ran2.set(ran2.get() + 1);
            Step::Pending
        });
        let handle = lp.add_task(coro).unwrap();

        handle.cancel();
        assert!(!handle.done(), "cancel alone must not finalize");
        lp.run_forever();
        assert!(handle.done());
        assert_eq!(handle.err(), Some(Error::Canceled));
        assert_eq!(handle.refs(), 0);
        assert_eq!(ran.get(), 0, "cancelled before its first resume");
    }

    #[test]
    fn cancel_twice_equals_cancel_once() {
        let lp = install_fresh_loop();
        let coro = lp.add_task(yielder(100)).unwrap();
        coro.cancel();
        coro.cancel();
        lp.run_forever();
        assert!(coro.done());
        assert_eq!(coro.err(), Some(Error::Canceled));
        assert_eq!(coro.refs(), 0);
    }

    #[test]
    fn hook_runs_on_cancellation_only() {
        let lp = install_fresh_loop();
        let hook_runs = Rc::new(Cell::new(0u32));

        // Completes normally: hook must not run.
        let runs = Rc::clone(&hook_runs);
        let finished = Coro::with_hook(|_| Step::Done, move |_| runs.set(runs.get() + 1));
        lp.add_task(finished).unwrap();
        lp.run_forever();
        assert_eq!(hook_runs.get(), 0);

        // Cancelled: hook runs exactly once.
        let runs = Rc::clone(&hook_runs);
        let doomed = Coro::with_hook(|_| Step::Pending, move |_| runs.set(runs.get() + 1));
        let doomed = lp.add_task(doomed).unwrap();
        doomed.cancel();
        lp.run_forever();
        assert_eq!(hook_runs.get(), 1);
    }

    #[test]
    fn incref_defers_reaping() {
        let lp = install_fresh_loop();
        let coro = lp.add_task(yielder(0)).unwrap();
        coro.incref();
        // Drive a few passes. run_forever would spin here: a done task that
        // is still referenced keeps its slot occupied.
        lp.run_until_complete(yielder(2));
        assert!(coro.done());
        assert_eq!(lp.occupied_count(), 1);

        coro.decref();
        lp.run_until_complete(yielder(2));
        assert_eq!(lp.occupied_count(), 0);
    }

    #[test]
    fn fawait_gates_parent_on_child() {
        let lp = install_fresh_loop();
        let child = yielder(2);
        let child_for_parent = child.clone();
        let order = Rc::new(RefCell::new(Vec::new()));
        let order2 = Rc::clone(&order);
        let parent = Coro::new(move |cx| {
            if !cx.fawait(&child_for_parent) {
                order2.borrow_mut().push("waiting");
                return Step::Pending;
            }
            order2.borrow_mut().push("child done");
            Step::Done
        });
        lp.add_task(parent.clone()).unwrap();
        lp.run_forever();

        assert!(parent.done());
        assert!(child.done());
        assert_eq!(order.borrow().last(), Some(&"child done"));
        // The gate kept the parent from being resumed while the child ran.
        assert_eq!(
            order.borrow().iter().filter(|s| **s == "waiting").count(),
            1
        );
    }

    #[test]
    fn cancelling_parent_propagates_to_fawaited_child() {
        let lp = install_fresh_loop();
        let child = yielder(u32::MAX);
        let child2 = child.clone();
        let parent = Coro::new(move |cx| {
            if cx.fawait(&child2) {
                Step::Done
            } else {
                Step::Pending
            }
        });
        let parent = lp.add_task(parent).unwrap();

        // Let the parent run once so the child link is established.
        lp.pass();
        parent.cancel();
        lp.run_forever();

        assert!(parent.done());
        assert_eq!(parent.err(), Some(Error::Canceled));
        assert!(child.done());
        assert_eq!(child.err(), Some(Error::Canceled));
        assert_eq!(lp.occupied_count(), 0);
    }

    #[test]
    fn destroy_cancels_and_drains() {
        let lp = install_fresh_loop();
        let hook_ran = Rc::new(Cell::new(false));
        let ran = Rc::clone(&hook_ran);
        let coro = Coro::with_hook(|_| Step::Pending, move |_| ran.set(true));
        let coro = lp.add_task(coro).unwrap();
        lp.add_task(yielder(u32::MAX)).unwrap();

        lp.destroy();
        assert!(hook_ran.get());
        assert!(coro.done());
        assert_eq!(coro.err(), Some(Error::Canceled));
        assert_eq!(lp.slot_count(), 0);
        assert_eq!(lp.vacant_count(), 0);
    }

    #[test]
    fn destroy_then_init_allows_reuse() {
        let lp = install_fresh_loop();
        lp.add_task(yielder(5)).unwrap();
        lp.destroy();
        lp.init();
        lp.add_task(yielder(0)).unwrap();
        lp.run_forever();
        assert_eq!(lp.occupied_count(), 0);
    }

    #[test]
    fn run_until_complete_leaves_unfinished_tasks() {
        let lp = install_fresh_loop();
        let slow = lp.add_task(yielder(10)).unwrap();
        lp.run_until_complete(yielder(1));
        assert!(!slow.done());
        // A later invocation picks the leftover task back up.
        lp.run_until_complete(yielder(20));
        assert!(slow.done());
    }

    #[test]
    fn dispose_drains_scratch() {
        let coro = yielder(3);
        let block = coro.scratch().alloc(Cell::new(1u8));
        assert_eq!(coro.scratch().len(), 1);
        coro.dispose();
        assert_eq!(Rc::strong_count(&block), 1);
    }

    #[test]
    fn cancel_inside_own_hook_is_ignored() {
        let lp = install_fresh_loop();
        let coro = Coro::with_hook(|_| Step::Pending, |cx| cx.cancel());
        let coro = lp.add_task(coro).unwrap();
        coro.cancel();
        lp.run_forever();
        assert!(coro.done());
        assert_eq!(coro.err(), Some(Error::Canceled));
    }

    #[test]
    fn set_event_loop_swaps_the_installed_loop() {
        let first = install_fresh_loop();
        let second = Rc::new(SlotLoop::new());
        set_event_loop(second.clone());

        create_task(yielder(0)).unwrap();
        assert_eq!(first.occupied_count(), 0);
        assert_eq!(second.occupied_count(), 1);
        second.run_forever();
    }
}
