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

//! The work-stealing scheduler (§4.3).
//!
//! Each worker thread owns a permanent "main" coroutine, a local deque
//! (`crossbeam_deque::Worker`, owner pushes/pops the same end), and a
//! single-slot fastpath handoff. Shared across workers: an injector queue
//! for external submissions, a global overflow queue, and a retire queue
//! for `Finished` coroutines awaiting their last reference to drop.
//!
//! Grounded on the teacher's `scheduler.rs` (per-thread `Scheduler`,
//! `workstealer`/`private_work` fastpath, neighbor-stealing `schedule()`
//! loop), replacing the teacher's `deque` crate + `mio` event-loop
//! integration with `crossbeam-deque` (the maintained descendant of the
//! same Chase-Lev design), `crossbeam-utils::Backoff` for the steal retry
//! spin (its usual pairing with `crossbeam-deque`), and a condvar
//! park/unpark idle strategy, modeled on the park/unpark pattern in
//! `other_examples/.../coio-rs scheduler.rs`.
//!
//! Each trip through a worker's loop also sweeps
//! [`crate::channel::sweep_pending_coroutine_waits`], so a coroutine parked
//! on a channel or `Select` with a deadline or cancel token still resolves
//! even when no partner op ever runs.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalDeque};
use crossbeam_utils::Backoff;
use rand::Rng;

use crate::coroutine::{self, CoroutineRef, State};
use crate::stack::{Stack, DEFAULT_STACK_SIZE};

/// Bounds the number of victim workers probed per failed steal attempt
/// before a worker falls back to parking (§4.3 "Tunable `STEAL_SCAN_MAX`").
const STEAL_SCAN_MAX: usize = 4;

/// Construction-time tunables (§9 Design Notes resolves the cache/backoff
/// Open Question as runtime-configurable fields rather than build-time
/// constants).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub inject_cap: usize,
    pub stack_cache_capacity: usize,
    pub worker_park_backoff_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> SchedulerOptions {
        SchedulerOptions {
            workers: std::cmp::max(1, num_cpus::get()),
            queue_capacity: 256,
            inject_cap: 4096,
            stack_cache_capacity: 32,
            worker_park_backoff_ms: 10,
        }
    }
}

struct WorkerShared {
    stealer: Stealer<CoroutineRef>,
    fastpath: Mutex<Option<CoroutineRef>>,
}

struct Inner {
    options: SchedulerOptions,
    workers: Vec<WorkerShared>,
    injector: Injector<CoroutineRef>,
    global: Mutex<Vec<CoroutineRef>>,
    retire: Mutex<Vec<CoroutineRef>>,
    shutting_down: AtomicBool,
    pending: AtomicUsize,
    park_mu: Mutex<()>,
    park_cv: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A running scheduler: a fixed pool of worker threads cooperating over
/// shared ready-work structures (§4.3 "Structure").
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start `opts.workers` worker threads, each parked on the shared idle
    /// condvar until there is work.
    pub fn init(opts: SchedulerOptions) -> Scheduler {
        let workers = opts.workers.max(1);
        let mut locals = Vec::with_capacity(workers);
        let mut shared = Vec::with_capacity(workers);

        for _ in 0..workers {
            let local = LocalDeque::new_lifo();
            shared.push(WorkerShared {
                stealer: local.stealer(),
                fastpath: Mutex::new(None),
            });
            locals.push(local);
        }

        let inner = Arc::new(Inner {
            options: opts,
            workers: shared,
            injector: Injector::new(),
            global: Mutex::new(Vec::new()),
            retire: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            park_mu: Mutex::new(()),
            park_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(workers);
        for (idx, local) in locals.into_iter().enumerate() {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("corovisor-worker-{idx}"))
                .spawn(move || worker_loop(inner, idx, local))
                .expect("failed to spawn corovisor worker thread");
            handles.push(handle);
        }
        *inner.threads.lock().unwrap() = handles;

        Scheduler { inner }
    }

    pub fn default() -> Scheduler {
        Scheduler::init(SchedulerOptions::default())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Spawn a coroutine running `f` on a private stack of
    /// [`crate::stack::DEFAULT_STACK_SIZE`], injected for any worker to
    /// pick up (§4.3 "Spawning").
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.spawn_co(DEFAULT_STACK_SIZE, f)
    }

    /// As [`Scheduler::spawn`], with an explicit stack size.
    pub fn spawn_co(&self, stack_size: usize, f: impl FnOnce() + Send + 'static) {
        let stack = match Stack::new(stack_size) {
            Ok(stack) => stack,
            Err(err) => {
                log::error!("corovisor: failed to map coroutine stack: {err}");
                return;
            }
        };
        let co = CoroutineRef::spawn(stack, f, None);
        let sched = self.clone();
        co.set_wake_fn(Arc::new(move |co| unpark_and_enqueue(&sched, co)));
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inject(co);
    }

    fn inject(&self, co: CoroutineRef) {
        self.inner.injector.push(co);
        self.wake_one();
    }

    fn wake_one(&self) {
        let _guard = self.inner.park_mu.lock().unwrap();
        self.inner.park_cv.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.inner.park_mu.lock().unwrap();
        self.inner.park_cv.notify_all();
    }

    /// Block until every spawned coroutine has reached `Finished`, or
    /// `timeout_ms` elapses (`<=0` waits forever). Returns whether the
    /// drain completed (as opposed to timing out).
    pub fn drain(&self, timeout_ms: i64) -> bool {
        let deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };

        loop {
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Request exit, wake every parked worker, and join all worker threads.
    /// Channels are not closed automatically (§4.3 "Drain / shutdown").
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.wake_all();
        let mut threads = self.inner.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

thread_local! {
    /// `(worker index, raw pointer to this worker's local deque, raw
    /// pointer to the owning scheduler's `Inner`)`, set once near the top
    /// of [`worker_loop`]. Consulted by [`unpark_and_enqueue`] so a wake
    /// that happens to run on a worker thread of the *same* scheduler can
    /// use the fastpath/local-deque discipline instead of always paying
    /// the inject-queue path (§4.3 "Enqueue discipline"). The deque pointer
    /// stays valid for the worker thread's whole lifetime since `local` is
    /// never moved out of its stack frame in `worker_loop`.
    static WORKER_CTX: Cell<Option<(usize, *const LocalDeque<CoroutineRef>, *const Inner)>> =
        Cell::new(None);
}

fn worker_loop(inner: Arc<Inner>, idx: usize, local: LocalDeque<CoroutineRef>) {
    let main = CoroutineRef::new_main();
    let backoff = Duration::from_millis(inner.options.worker_park_backoff_ms.max(1));
    WORKER_CTX.with(|c| c.set(Some((idx, &local as *const LocalDeque<CoroutineRef>, Arc::as_ptr(&inner)))));

    loop {
        crate::channel::sweep_pending_coroutine_waits();

        if let Some(co) = take_fastpath(&inner, idx)
            .or_else(|| local.pop())
            .or_else(|| steal_from_injector(&inner, &local))
            .or_else(|| take_from_global(&inner))
            .or_else(|| steal_from_peers(&inner, idx, &local))
        {
            run_one(&inner, idx, &local, &main, co);
            continue;
        }

        if inner.shutting_down.load(Ordering::SeqCst) {
            reap_retired(&inner);
            return;
        }

        let guard = inner.park_mu.lock().unwrap();
        let _ = inner.park_cv.wait_timeout(guard, backoff).unwrap();
    }
}

fn take_fastpath(inner: &Inner, idx: usize) -> Option<CoroutineRef> {
    inner.workers[idx].fastpath.lock().unwrap().take()
}

fn steal_from_injector(inner: &Inner, local: &LocalDeque<CoroutineRef>) -> Option<CoroutineRef> {
    let backoff = Backoff::new();
    loop {
        match inner.injector.steal_batch_and_pop(local) {
            Steal::Success(co) => return Some(co),
            Steal::Retry => backoff.spin(),
            Steal::Empty => return None,
        }
    }
}

fn take_from_global(inner: &Inner) -> Option<CoroutineRef> {
    inner.global.lock().unwrap().pop()
}

fn steal_from_peers(
    inner: &Inner,
    idx: usize,
    local: &LocalDeque<CoroutineRef>,
) -> Option<CoroutineRef> {
    let n = inner.workers.len();
    if n <= 1 {
        return None;
    }
    let attempts = STEAL_SCAN_MAX.min(n - 1);
    let mut rng = rand::thread_rng();

    for _ in 0..attempts {
        let victim = rng.gen_range(0..n);
        if victim == idx {
            continue;
        }
        let backoff = Backoff::new();
        loop {
            match inner.workers[victim].stealer.steal_batch_and_pop(local) {
                Steal::Success(co) => return Some(co),
                Steal::Retry => backoff.spin(),
                Steal::Empty => break,
            }
        }
    }
    None
}

fn run_one(
    inner: &Inner,
    idx: usize,
    local: &LocalDeque<CoroutineRef>,
    main: &CoroutineRef,
    co: CoroutineRef,
) {
    unsafe {
        coroutine::resume(main.clone(), co.clone());
    }

    match co.state() {
        State::Finished => {
            inner.pending.fetch_sub(1, Ordering::SeqCst);
            inner.retire.lock().unwrap().push(co);
            reap_retired(inner);
        }
        State::Suspended => {
            co.mark_ready();
            enqueue_from_worker(inner, idx, local, co);
        }
        State::Parked => {
            // A waiter elsewhere owns the reference that will unpark and
            // re-enqueue this coroutine; this worker's reference is simply
            // dropped here.
        }
        other => {
            log::error!("corovisor: coroutine left in unexpected state {other:?} after resume");
        }
    }
}

/// Re-enqueue a coroutine that just ran on this worker: fastpath slot if
/// free, else the worker's own local deque (§4.3 "Enqueue discipline").
fn enqueue_from_worker(
    inner: &Inner,
    idx: usize,
    local: &LocalDeque<CoroutineRef>,
    co: CoroutineRef,
) {
    let mut slot = inner.workers[idx].fastpath.lock().unwrap();
    if slot.is_none() {
        *slot = Some(co);
    } else {
        drop(slot);
        local.push(co);
    }
}

/// Unpark `co` (transition `Parked -> Ready`) and enqueue it onto the
/// scheduler it belongs to (§4.3). When the wake happens to run on one of
/// that same scheduler's own worker threads -- the common case for a
/// channel send/recv or `Select` claim waking a waiting coroutine -- this
/// uses the fastpath/local-deque discipline of [`enqueue_from_worker`] to
/// preserve cache locality, same as a coroutine's own self-reschedule.
/// Otherwise (woken from outside any worker, or from a different
/// scheduler's worker) it falls back to the inject queue, with overflow to
/// the global queue.
pub fn unpark_and_enqueue(sched: &Scheduler, co: CoroutineRef) {
    if !coroutine::unpark(&co) {
        return;
    }

    let same_scheduler_worker = WORKER_CTX
        .with(|c| c.get())
        .filter(|&(_, _, inner_ptr)| inner_ptr == Arc::as_ptr(&sched.inner));

    match same_scheduler_worker {
        Some((idx, local_ptr, _)) => {
            let local = unsafe { &*local_ptr };
            enqueue_from_worker(&sched.inner, idx, local, co);
        }
        None => {
            if sched.inner.injector.len() < sched.inner.options.inject_cap {
                sched.inner.injector.push(co);
            } else {
                sched.inner.global.lock().unwrap().push(co);
            }
        }
    }
    sched.wake_one();
}

/// Drain the retire queue, dropping every entry whose refcount indicates
/// the retire queue holds the last reference -- this is what actually
/// frees a `Finished` coroutine's struct and stack (§4.2 "Refcount &
/// retire").
fn reap_retired(inner: &Inner) {
    let mut retire = inner.retire.lock().unwrap();
    retire.retain(|co| {
        if crate::coroutine::is_sole_reference(co) {
            false
        } else {
            true
        }
    });
}

/// Cooperatively yield the current coroutine back to its worker for
/// another scheduling round (library surface: `Scheduler::yield_now`).
pub fn yield_now() {
    unsafe {
        coroutine::yield_now();
    }
}

/// Coarse cooperative sleep: repeatedly yields until `ms` has elapsed. Not
/// a precise timer -- callers needing exact wakeups should use a channel
/// with a deadline instead.
pub fn sleep_ms(ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if coroutine::current().is_some() {
            unsafe {
                coroutine::yield_now();
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_after_spawned_coroutines_finish() {
        let _ = env_logger::try_init();
        let sched = Scheduler::init(SchedulerOptions {
            workers: 2,
            ..SchedulerOptions::default()
        });

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            sched.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(sched.drain(5_000));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        sched.shutdown();
    }

    #[test]
    fn yielding_coroutine_eventually_finishes() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 2,
            ..SchedulerOptions::default()
        });

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        sched.spawn(move || {
            for _ in 0..5 {
                counter2.fetch_add(1, Ordering::SeqCst);
                yield_now();
            }
        });

        assert!(sched.drain(5_000));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        sched.shutdown();
    }

    #[test]
    fn drain_times_out_on_unfinished_work() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        sched.inner.pending.fetch_add(1, Ordering::SeqCst);
        assert!(!sched.drain(20));
        sched.inner.pending.fetch_sub(1, Ordering::SeqCst);
        sched.shutdown();
    }
}
