//! Composition of coroutines: timed sleeps, run-in-parallel, bounded waits.
//!
//! Every combinator here is an ordinary coroutine built with the public
//! constructors; none of them is special to the loop. They compose by
//! holding references on child states — scheduling a child, taking a
//! reference for as long as the result matters, and releasing it exactly
//! once on every exit path, cancellation included.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::{get_event_loop, Coro, Error, Step};

/// A coroutine that suspends exactly once, then completes.
///
/// The cheapest way to hand the rest of the current pass to other tasks.
#[must_use]
pub fn yield_once() -> Coro {
    let mut yielded = false;
    Coro::new(move |_| {
        if yielded {
            Step::Done
        } else {
            yielded = true;
            Step::Pending
        }
    })
}

/// A coroutine that completes once `delay` has elapsed.
///
/// A zero delay degenerates to [`yield_once`]. The delay is measured from
/// the first resume with a monotonic clock; resolution is the loop's pass
/// cadence, not a timer.
#[must_use]
pub fn sleep(delay: Duration) -> Coro {
    if delay.is_zero() {
        return yield_once();
    }
    let mut start: Option<Instant> = None;
    Coro::new(move |_| {
        let begun = *start.get_or_insert_with(Instant::now);
        if begun.elapsed() >= delay {
            Step::Done
        } else {
            Step::Pending
        }
    })
}

/// A coroutine that completes when every child has completed.
///
/// Construction schedules all children on the installed loop and takes a
/// reference on each; the gatherer then sweeps its list every resume,
/// dropping finished children and their references, and completes when the
/// list is empty. An empty `children` completes on the first resume.
///
/// Cancelling the gatherer releases and cancels every child still running.
///
/// # Errors
///
/// If the loop cannot reserve space for the batch, every child and the
/// gatherer itself are torn down and `Error::Nomem` is returned; nothing
/// ends up scheduled.
pub fn gather(children: Vec<Coro>) -> Result<Coro, Error> {
    trace!(children = children.len(), "gather");
    let frame = Rc::new(RefCell::new(children));
    let body_frame = Rc::clone(&frame);
    let hook_frame = Rc::clone(&frame);

    let coro = Coro::with_hook(
        move |_| {
            let mut kids = body_frame.borrow_mut();
            let mut i = 0;
            while i < kids.len() {
                if kids[i].done() {
                    kids[i].decref();
                    kids.remove(i);
                } else {
                    i += 1;
                }
            }
            if kids.is_empty() {
                Step::Done
            } else {
                Step::Pending
            }
        },
        move |_| {
            for child in hook_frame.borrow().iter() {
                child.decref();
                child.cancel();
            }
        },
    );
    coro.scratch().adopt(Rc::clone(&frame));

    let scheduled = get_event_loop().add_tasks(&frame.borrow());
    if let Err(e) = scheduled {
        let children = std::mem::take(&mut *frame.borrow_mut());
        crate::dispose_all(children);
        coro.dispose();
        return Err(e);
    }
    for child in frame.borrow().iter() {
        child.incref();
    }
    Ok(coro)
}

/// Variadic form of [`gather`].
///
/// ```
/// use filar::{combinators, get_event_loop, vgather};
/// use std::time::Duration;
///
/// let gathered = vgather![
///     combinators::yield_once(),
///     combinators::sleep(Duration::from_millis(1)),
/// ]
/// .unwrap();
/// get_event_loop().run_until_complete(gathered);
/// ```
#[macro_export]
macro_rules! vgather {
    ($($child:expr),* $(,)?) => {
        $crate::combinators::gather(::std::vec![$($child),*])
    };
}

struct WaitFrame {
    child: Option<Coro>,
    start: Option<Instant>,
}

/// A coroutine that drives `child` for at most `timeout`.
///
/// Takes ownership of the child: a reference is taken here and the caller
/// must not reuse the handle afterwards. The child is scheduled on the
/// waiter's first resume. If it finishes in time the waiter completes
/// cleanly; on timeout the waiter records `Error::Canceled` on itself,
/// cancels the child, and completes. Cancelling the waiter cancels the
/// child too.
#[must_use]
pub fn wait_for(child: Coro, timeout: Duration) -> Coro {
    child.incref();
    let frame = Rc::new(RefCell::new(WaitFrame {
        child: Some(child),
        start: None,
    }));
    let body_frame = Rc::clone(&frame);
    let hook_frame = Rc::clone(&frame);

    let coro = Coro::with_hook(
        move |cx| {
            let mut frame = body_frame.borrow_mut();
            let Some(child) = frame.child.clone() else {
                return Step::Done;
            };
            let started = match frame.start {
                Some(t) => t,
                None => {
                    if get_event_loop().add_task(child.clone()).is_err() {
                        frame.child = None;
                        cx.set_err(Some(Error::Nomem));
                        return Step::Done;
                    }
                    let now = Instant::now();
                    frame.start = Some(now);
                    now
                }
            };
            if !child.done() && started.elapsed() < timeout {
                return Step::Pending;
            }
            if !child.done() {
                trace!("wait_for timed out");
                cx.set_err(Some(Error::Canceled));
                child.cancel();
            }
            child.decref();
            frame.child = None;
            Step::Done
        },
        move |_| {
            let child = hook_frame.borrow_mut().child.take();
            if let Some(child) = child {
                // Make sure the child is in the table: a never-scheduled
                // child would otherwise survive its cancellation unreaped.
                if get_event_loop().add_task(child.clone()).is_ok() {
                    if !child.done() {
                        child.cancel();
                    }
                    child.decref();
                }
            }
        },
    );
    coro.scratch().adopt(frame);
    coro
}
