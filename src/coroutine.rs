// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers
// Copyright (c) 2026 Corovisor Contributors

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Coroutine identity, state machine, and lifecycle (§3 "Coroutine", §4.2).
//!
//! A coroutine is a private stack plus a register-save area, entered
//! through a trampoline that calls the user's entry function and marks
//! `Finished` on return. Reclamation is explicit: every holder of a
//! coroutine pointer (a waiter, a select clause, a scheduler queue) raises
//! its refcount while holding it; `Finished` coroutines are pushed onto
//! their scheduler's retire queue and destroyed only once the refcount
//! reaches zero, which is what avoids the use-after-free races a naive
//! "free on finish" design hits when a concurrent resume races with
//! reclamation.
//!
//! Grounded on the teacher's `coroutine_unique.rs` (`State`, the
//! `coroutine_initialize` trampoline, thread-local "current") generalized
//! from the teacher's clonable/unique `Handle` split to a single
//! refcounted `CoroutineRef`, since this crate's waiter and select
//! protocols need shared, not unique, ownership of a parked coroutine.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::{self, RegisterSaveArea};
use crate::stack::Stack;

/// A hook a scheduler installs on every coroutine it spawns, letting a
/// channel or select wake a parked coroutine without this module depending
/// on the scheduler module (§4.3's "owning scheduler" pointer, expressed as
/// a callback to avoid a layering cycle).
pub type WakeFn = Arc<dyn Fn(CoroutineRef) + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A coroutine's position in its lifecycle (§3 "State machine").
///
/// `Created -> Ready -> Running -> {Suspended | Parked} -> Ready -> ... ->
/// Finished`. A coroutine is enqueued on a scheduler only while `Ready`;
/// only the worker owning its "main" may drive it into `Running`;
/// `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Ready,
    Running,
    Suspended,
    Parked,
    Finished,
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// The inner, heap-allocated coroutine object. Never moved once created --
/// every reference to it is a raw pointer wrapped by [`CoroutineRef`], since
/// the register-save area's address is baked into the stack's initial
/// frame by [`context::initialize_call_frame`].
pub struct Coroutine {
    id: u64,
    state: Cell<State>,
    regs: RefCell<RegisterSaveArea>,
    stack: RefCell<Option<Stack>>,
    entry: RefCell<Option<EntryFn>>,
    refcount: AtomicUsize,
    label: Option<&'static str>,
    /// The worker "main" to switch back to on yield/park/finish. Null for a
    /// main coroutine itself.
    yield_target: Cell<*const Coroutine>,
    wake_fn: RefCell<Option<WakeFn>>,
}

unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn label(&self) -> Option<&'static str> {
        self.label
    }

    /// Transition `Suspended` or `Parked` back to `Ready` so a scheduler
    /// may enqueue it for another turn (§3 "State machine").
    pub fn mark_ready(&self) {
        debug_assert!(
            matches!(self.state.get(), State::Suspended | State::Parked),
            "mark_ready on coroutine {} in state {:?}",
            self.id,
            self.state.get()
        );
        self.state.set(State::Ready);
    }

    /// Install the scheduler-provided wake hook (§4.3's owning-scheduler
    /// pointer). A coroutine with no hook installed (created outside a
    /// scheduler) can still be parked/unparked; re-enqueuing it is then the
    /// caller's own responsibility.
    pub fn set_wake_fn(&self, f: WakeFn) {
        *self.wake_fn.borrow_mut() = Some(f);
    }

    pub fn wake_fn(&self) -> Option<WakeFn> {
        self.wake_fn.borrow().clone()
    }
}

/// A refcounted, shareable pointer to a [`Coroutine`].
///
/// Cloning raises the refcount (§3 "Ownership": "waiters and select holders
/// raise refcount while holding pointers"). Dropping the last reference to
/// a `Finished` coroutine frees its stack and struct; dropping a reference
/// to a still-live coroutine just lowers the count.
pub struct CoroutineRef(NonNull<Coroutine>);

unsafe impl Send for CoroutineRef {}
unsafe impl Sync for CoroutineRef {}

impl CoroutineRef {
    fn from_box(co: Box<Coroutine>) -> CoroutineRef {
        CoroutineRef(unsafe { NonNull::new_unchecked(Box::into_raw(co)) })
    }

    /// Construct the permanent "main" coroutine for a worker thread: no
    /// stack of its own (it runs on the thread's native stack), id 0.
    pub fn new_main() -> CoroutineRef {
        let co = Coroutine {
            id: 0,
            state: Cell::new(State::Running),
            regs: RefCell::new(RegisterSaveArea::empty()),
            stack: RefCell::new(None),
            entry: RefCell::new(None),
            refcount: AtomicUsize::new(1),
            label: Some("main"),
            yield_target: Cell::new(std::ptr::null()),
            wake_fn: RefCell::new(None),
        };
        CoroutineRef::from_box(Box::new(co))
    }

    /// Allocate a private stack and seed it so the first [`resume`] lands
    /// in the trampoline and calls `entry` (§4.2 "create").
    pub fn spawn(
        stack: Stack,
        entry: impl FnOnce() + Send + 'static,
        label: Option<&'static str>,
    ) -> CoroutineRef {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let co = Box::new(Coroutine {
            id,
            state: Cell::new(State::Created),
            regs: RefCell::new(RegisterSaveArea::empty()),
            stack: RefCell::new(Some(stack)),
            entry: RefCell::new(Some(Box::new(entry) as EntryFn)),
            refcount: AtomicUsize::new(1),
            label,
            yield_target: Cell::new(std::ptr::null()),
            wake_fn: RefCell::new(None),
        });
        let co_ref = CoroutineRef::from_box(co);

        let stack_top = {
            let stack_guard = co_ref.0.as_ref_coroutine().stack.borrow();
            stack_guard.as_ref().unwrap().top()
        };
        let arg = co_ref.0.as_ptr() as usize;
        unsafe {
            let mut regs = co_ref.0.as_ref_coroutine().regs.borrow_mut();
            context::initialize_call_frame(&mut regs, stack_top, trampoline, arg);
        }
        co_ref
    }

    pub fn ptr(&self) -> *const Coroutine {
        self.0.as_ptr()
    }

    /// # Safety
    /// `ptr` must have been produced by [`CoroutineRef::ptr`] on a
    /// `CoroutineRef` whose refcount the caller has already raised (e.g. a
    /// waiter token holds one implicit count for as long as it is
    /// enqueued).
    pub unsafe fn from_raw(ptr: *const Coroutine) -> CoroutineRef {
        let this = CoroutineRef(NonNull::new_unchecked(ptr as *mut Coroutine));
        this.0.as_ref_coroutine().refcount.fetch_add(1, Ordering::Relaxed);
        this
    }
}

trait AsRefCoroutine {
    fn as_ref_coroutine(&self) -> &Coroutine;
}

impl AsRefCoroutine for NonNull<Coroutine> {
    fn as_ref_coroutine(&self) -> &Coroutine {
        unsafe { self.as_ref() }
    }
}

impl std::ops::Deref for CoroutineRef {
    type Target = Coroutine;
    fn deref(&self) -> &Coroutine {
        self.0.as_ref_coroutine()
    }
}

impl Clone for CoroutineRef {
    fn clone(&self) -> CoroutineRef {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        CoroutineRef(self.0)
    }
}

impl Drop for CoroutineRef {
    fn drop(&mut self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug_assert_eq!(
                self.state(),
                State::Finished,
                "coroutine {} dropped its last reference while not Finished",
                self.id()
            );
            unsafe {
                drop(Box::from_raw(self.0.as_ptr()));
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CoroutineRef>> = RefCell::new(None);
}

/// The coroutine currently running on this thread, if any. Set by
/// [`resume`] for the duration of the switch into its target; a worker
/// thread that has never called `resume` (e.g. before its scheduler loop
/// starts) sees `None`.
pub fn current() -> Option<CoroutineRef> {
    CURRENT.with(|c| c.borrow().as_ref().map(|r| r.clone()))
}

fn set_current(co: Option<CoroutineRef>) -> Option<CoroutineRef> {
    CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), co))
}

/// Resume `target`, switching the calling coroutine (`caller`) to
/// `Suspended` for the duration (§4.2 "resume"). Requires
/// `target.state() ∈ {Created, Ready}`; a `Finished` or already-`Running`
/// target is a no-op matching the spec's stated leniency for a dead
/// target.
///
/// # Safety
/// `caller` and `target` must each own a private stack (or be a "main")
/// that remains valid for the duration of the switch; the trampoline and
/// every suspension point uphold this by construction.
pub unsafe fn resume(caller: CoroutineRef, target: CoroutineRef) {
    match target.state() {
        State::Created | State::Ready => {}
        _ => return,
    }

    target.yield_target.set(caller.ptr());
    target.state.set(State::Running);
    caller.state.set(State::Suspended);

    let from_regs = caller.regs.as_ptr();
    let to_regs = target.regs.as_ptr();

    let previous = set_current(Some(target));
    context::switch(from_regs, to_regs);
    set_current(previous);

    caller.state.set(State::Running);
}

/// Suspend the current coroutine back to its yield target, equivalent to a
/// bare resume of `main` (§4.2 "yield").
///
/// # Safety
/// Must be called from within a coroutine previously entered via
/// [`resume`] or the trampoline.
pub unsafe fn yield_now() {
    let current = match current() {
        Some(c) => c,
        None => return,
    };
    let target_ptr = current.yield_target.get();
    if target_ptr.is_null() {
        return;
    }
    current.state.set(State::Suspended);

    let from_regs = current.regs.as_ptr();
    let to_regs = (*target_ptr).regs.as_ptr();
    context::switch(from_regs, to_regs);

    current.state.set(State::Running);
}

/// Park the current coroutine and switch to its yield target. The caller
/// is responsible for arranging an eventual [`unpark`] (§4.2 "park").
///
/// # Safety
/// Same requirement as [`yield_now`].
pub unsafe fn park() {
    let current = match current() {
        Some(c) => c,
        None => return,
    };
    let target_ptr = current.yield_target.get();
    current.state.set(State::Parked);

    let from_regs = current.regs.as_ptr();
    let to_regs = (*target_ptr).regs.as_ptr();
    context::switch(from_regs, to_regs);

    current.state.set(State::Running);
}

/// True if `co` has exactly one live reference -- i.e. the caller's own.
/// Used by the scheduler's retire queue to decide when a `Finished`
/// coroutine's struct and stack may be freed (§4.2 "Refcount & retire").
pub fn is_sole_reference(co: &CoroutineRef) -> bool {
    co.refcount.load(Ordering::Acquire) == 1
}

/// If `co` is `Parked`, mark it `Ready`. Re-enqueuing it onto a scheduler
/// is the caller's responsibility (§4.3 "Enqueue discipline" governs where
/// it lands); this function only performs the state transition (§4.2
/// "unpark").
pub fn unpark(co: &Coroutine) -> bool {
    if co.state.get() == State::Parked {
        co.state.set(State::Ready);
        true
    } else {
        false
    }
}

/// The single entry point of every freshly created coroutine (§4.2
/// "Trampoline"). Reached via [`context::switch`] landing on the seeded
/// frame; runs the entry closure, marks `Finished`, and switches back to
/// the yield target. A return from this function past the final switch is
/// an unrecoverable invariant violation and aborts the process.
extern "C" fn trampoline(arg: usize) -> ! {
    let co_ptr = arg as *const Coroutine;
    let co = unsafe { &*co_ptr };
    co.state.set(State::Running);

    let entry = co.entry.borrow_mut().take();
    if let Some(entry) = entry {
        let result = panic::catch_unwind(AssertUnwindSafe(entry));
        if let Err(payload) = result {
            log::error!(
                "coroutine {} ({}) panicked",
                co.id,
                co.label.unwrap_or("<unnamed>")
            );
            drop(payload);
        }
    }

    co.state.set(State::Finished);

    let target_ptr = co.yield_target.get();
    unsafe {
        let mut dummy = RegisterSaveArea::empty();
        context::switch(&mut dummy, (*target_ptr).regs.as_ptr());
    }

    // A Finished coroutine is never resumed again; reaching here means the
    // retire/reclaim protocol was violated.
    log::error!("trampoline for coroutine {} resumed after Finished", co.id);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::DEFAULT_STACK_SIZE;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn spawned_coroutine_starts_created() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let co = CoroutineRef::spawn(stack, || {}, Some("t"));
        assert_eq!(co.state(), State::Created);
    }

    #[test]
    fn resume_runs_entry_and_finishes() {
        let main = CoroutineRef::new_main();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let co = CoroutineRef::spawn(
            stack,
            move || {
                ran2.store(true, Ordering::SeqCst);
            },
            Some("t"),
        );

        unsafe {
            resume(main.clone(), co.clone());
        }

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(co.state(), State::Finished);
    }

    #[test]
    fn yielding_coroutine_can_be_resumed_again() {
        let main = CoroutineRef::new_main();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter2 = counter.clone();
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let co = CoroutineRef::spawn(
            stack,
            move || {
                counter2.fetch_add(1, Ordering::SeqCst);
                unsafe {
                    yield_now();
                }
                counter2.fetch_add(1, Ordering::SeqCst);
            },
            Some("t"),
        );

        unsafe {
            resume(main.clone(), co.clone());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), State::Suspended);

        unsafe {
            resume(main.clone(), co.clone());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(co.state(), State::Finished);
    }

    #[test]
    fn unpark_requires_parked_state() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let co = CoroutineRef::spawn(stack, || {}, None);
        assert!(!unpark(&co));
    }
}
