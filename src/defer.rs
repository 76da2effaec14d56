//! Deferred calls, panic, and recover.
//!
//! `defer`/`panic`/`recover` are often primitives a compiler weaves into
//! every function's prologue/epilogue. This crate has no compiler backend
//! to do that, so they're surfaced as an explicit API a task calls
//! directly: `task.defer(..)` to push, `task.run_deferred()` where a
//! compiler would have emitted an implicit defer-return, and
//! `task.panic_now(..)` / `task.recover()` for the unwind protocol. LIFO
//! ordering, panic-walks-defers, and recover-cancels-panic semantics are
//! the same either way; only the trigger points move from codegen to
//! explicit calls.

use core::any::Any;
use std::cell::RefCell;

use crate::stack::current_stack_pointer;

type DeferFn = Box<dyn FnMut() + Send>;

struct PanicRecord {
    payload: Box<dyn Any + Send>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PanicOutcome {
    /// A deferred call recovered the panic before the chain drained.
    Recovered,
    /// The defer chain emptied with no recovery.
    Unrecovered,
}

/// How many bytes of stack growth between the point a deferred call begins
/// and a `recover` call are tolerated before treating the latter as reached
/// through an intervening function call rather than directly by the
/// deferred closure itself.
///
/// This stands in for the segment/`Stktop.panic` identity check described
/// for a true split-stack runtime: lacking compiler-inserted frame
/// bookkeeping, the stack pointer itself is the only reliable signal this
/// crate has for "how many calls deep are we". A closure that calls
/// `recover()` directly pays only its own (usually small) frame plus
/// `recover`'s; routing through a helper first adds that helper's frame on
/// top. The budget is sized generously for the former and tight enough to
/// catch the latter in the common case — it is a heuristic, not an exact
/// frame-identity check.
const DIRECT_CALL_SP_BUDGET: u64 = 768;

#[derive(Default)]
pub struct Defers {
    stack: RefCell<Vec<DeferFn>>,
    panics: RefCell<Vec<PanicRecord>>,
    /// Stack-pointer marker, pushed just before `panic_now` invokes each
    /// deferred call and popped right after. Re-entrant (a deferred call
    /// that itself panics pushes another marker on top), so `recover`
    /// always compares against the innermost currently-running call, not
    /// some enclosing one. Empty whenever no deferred call is executing.
    active_defer_sp: RefCell<Vec<u64>>,
}

impl Defers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a deferred action (LIFO).
    pub fn defer(&self, action: impl FnMut() + Send + 'static) {
        self.stack.borrow_mut().push(Box::new(action));
    }

    /// Run at most one deferred call — the hosted stand-in for the
    /// compiler-emitted `defer_return` at a normal function exit.
    pub fn run_deferred(&self) -> bool {
        let next = self.stack.borrow_mut().pop();
        match next {
            Some(mut action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Run every remaining deferred call, in LIFO order (used when a task
    /// exits, just before it's marked `Moribund`).
    pub fn run_all_deferred(&self) {
        while self.run_deferred() {}
    }

    /// Push a new panic and walk the defer chain, invoking each deferred
    /// call in turn. If one calls [`Defers::recover`] successfully, the
    /// panic is cancelled and the walk stops. If the chain drains without
    /// recovery, the panic is left unrecovered for the caller to act on.
    pub fn panic_now(&self, payload: Box<dyn Any + Send>) -> PanicOutcome {
        self.panics.borrow_mut().push(PanicRecord { payload });

        loop {
            let next = self.stack.borrow_mut().pop();
            let Some(mut action) = next else {
                return PanicOutcome::Unrecovered;
            };

            let depth_before = self.panics.borrow().len();
            self.active_defer_sp.borrow_mut().push(current_stack_pointer());
            action();
            self.active_defer_sp.borrow_mut().pop();

            // `recover()` pops the record on success, so a shrunken stack
            // means this call claimed the panic.
            if self.panics.borrow().len() < depth_before {
                return PanicOutcome::Recovered;
            }
        }
    }

    /// Attempt to recover the in-flight panic. Succeeds only while called
    /// directly by the deferred call `panic_now` is currently invoking for
    /// the topmost panic — not by some function that call itself calls. See
    /// [`DIRECT_CALL_SP_BUDGET`].
    #[inline(never)]
    pub fn recover(&self) -> Option<Box<dyn Any + Send>> {
        let marker = *self.active_defer_sp.borrow().last()?;
        let here = current_stack_pointer();
        // Stacks grow down: `here` is always <= `marker`. A direct call
        // measures only the deferred closure's own frame plus this one; an
        // intervening helper adds its frame on top of that.
        if marker.saturating_sub(here) > DIRECT_CALL_SP_BUDGET {
            return None;
        }
        let mut panics = self.panics.borrow_mut();
        panics.pop().map(|record| record.payload)
    }

    pub fn has_pending_panic(&self) -> bool {
        !self.panics.borrow().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // `defer` requires `Send` closures (tasks may hand their defer chain to
    // a different worker than the one that pushed it), so these tests share
    // state through `Arc<Mutex<_>>` / atomics rather than `Rc<RefCell<_>>`.

    #[test]
    fn deferred_calls_run_lifo() {
        let defers = Defers::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        defers.defer(move || o1.lock().unwrap().push(1));
        let o2 = order.clone();
        defers.defer(move || o2.lock().unwrap().push(2));
        let o3 = order.clone();
        defers.defer(move || o3.lock().unwrap().push(3));

        defers.run_all_deferred();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn run_deferred_pops_one_at_a_time() {
        let defers = Defers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        defers.defer(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        defers.defer(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(defers.run_deferred());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(defers.run_deferred());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!defers.run_deferred());
    }

    #[test]
    fn recover_only_works_inside_the_active_defer() {
        let defers = Defers::new();
        // Carried into the closure as a plain address: an `Arc<Defers>`
        // can't be `Send` here (`Defers` holds `RefCell`s, so it isn't
        // `Sync`), but the test only ever touches `defers` from this one
        // thread, synchronously, so a raw address is sound.
        let defers_addr = &defers as *const Defers as usize;
        let caught = Arc::new(Mutex::new(None::<i32>));

        let c = caught.clone();
        defers.defer(move || {
            let d = unsafe { &*(defers_addr as *const Defers) };
            if let Some(payload) = d.recover() {
                *c.lock().unwrap() = payload.downcast_ref::<i32>().copied();
            }
        });

        let outcome = defers.panic_now(Box::new(7i32));
        assert_eq!(outcome, PanicOutcome::Recovered);
        assert_eq!(*caught.lock().unwrap(), Some(7));
        assert!(!defers.has_pending_panic());

        // Outside any defer, recover() must see nothing even with a fresh
        // panic in flight and no handler popping it.
        defers.defer(|| {});
        assert!(defers.recover().is_none());
    }

    #[test]
    fn recover_through_a_helper_call_does_not_succeed() {
        let defers = Defers::new();
        // Same rationale as `recover_only_works_inside_the_active_defer`
        // above for carrying `defers` by address into a `Send` closure.
        let defers_addr = &defers as *const Defers as usize;
        let caught = Arc::new(Mutex::new(None::<Option<i32>>));

        #[inline(never)]
        fn recover_via_helper(defers: &Defers) -> Option<Box<dyn Any + Send>> {
            defers.recover()
        }

        let c = caught.clone();
        defers.defer(move || {
            let d = unsafe { &*(defers_addr as *const Defers) };
            let result = recover_via_helper(d);
            *c.lock().unwrap() = Some(result.and_then(|p| p.downcast_ref::<i32>().copied()));
        });

        let outcome = defers.panic_now(Box::new(9i32));
        // The deferred closure never called `recover` directly — it went
        // through `recover_via_helper` — so the panic must NOT be
        // considered recovered, even though some `recover()` call ran
        // while this exact panic was in flight.
        assert_eq!(outcome, PanicOutcome::Unrecovered);
        assert_eq!(*caught.lock().unwrap(), Some(None));
    }

    #[test]
    fn unrecovered_panic_drains_the_whole_chain() {
        let defers = Defers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        defers.defer(move || s1.lock().unwrap().push("a"));
        let s2 = seen.clone();
        defers.defer(move || s2.lock().unwrap().push("b"));

        let outcome = defers.panic_now(Box::new("boom"));
        assert_eq!(outcome, PanicOutcome::Unrecovered);
        assert_eq!(*seen.lock().unwrap(), vec!["b", "a"]);
        assert!(defers.is_empty());
    }
}
