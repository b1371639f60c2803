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

//! Structured concurrency scopes (§4.6).
//!
//! A `Scope` owns a cancellation context and a live-child count. Every
//! coroutine launched through it is removed from that count on completion;
//! `wait_all` blocks (or polls, or waits to a deadline) until the count
//! reaches zero; `cancel` trips the scope's token and, as a defensive extra
//! for actors that might be blocked on something other than the token,
//! explicitly stops every actor launched through the scope.
//!
//! Grounded on §4.6 end to end -- the teacher has no scope/actor analog --
//! built on [`crate::scheduler::Scheduler::spawn_co`] and
//! [`crate::channel::Channel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::channel::{Channel, Kind};
use crate::error::{Code, RtResult};
use crate::scheduler::Scheduler;
use crate::stack::DEFAULT_STACK_SIZE;

struct ScopeState {
    count: usize,
}

struct Inner {
    scheduler: Scheduler,
    token: CancelToken,
    shutting_down: AtomicBool,
    state: Mutex<ScopeState>,
    cv: Condvar,
    actor_stops: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        debug_assert_eq!(state.count, 0, "scope dropped with live children; call wait_all first");
    }
}

/// `scope_init(parent_token?)` (§6); children run on `scheduler`.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    pub fn init(scheduler: &Scheduler, parent: Option<&CancelToken>) -> Scope {
        let token = match parent {
            Some(parent) => CancelToken::child(parent),
            None => CancelToken::new(),
        };
        Scope {
            inner: Arc::new(Inner {
                scheduler: scheduler.clone(),
                token,
                shutting_down: AtomicBool::new(false),
                state: Mutex::new(ScopeState { count: 0 }),
                cv: Condvar::new(),
                actor_stops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// `scope_token(scope)` (§6): the scope's cancellation token, shared by
    /// every child launched through it.
    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// `launch(scope, fn, arg, stack)` (§6): spawn `f` as a child coroutine.
    /// Rejected with [`Code::Cancelled`] once the scope is shutting down
    /// (`cancel` was called); the child removes itself from the live count
    /// on completion regardless of how it ends.
    pub fn launch(&self, stack_size: usize, f: impl FnOnce() + Send + 'static) -> RtResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(Code::Cancelled);
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.count += 1;
        }

        let inner = self.inner.clone();
        self.inner.scheduler.spawn_co(stack_size, move || {
            f();
            child_done(&inner);
        });
        Ok(())
    }

    /// As [`Scope::launch`], with [`crate::stack::DEFAULT_STACK_SIZE`].
    pub fn launch_default(&self, f: impl FnOnce() + Send + 'static) -> RtResult<()> {
        self.launch(DEFAULT_STACK_SIZE, f)
    }

    /// `produce(scope, kind, elem_size, capacity, fn, user)` (§6):
    /// create a channel, hand it to `f` running as a child coroutine, and
    /// close it once `f` returns (by any path, including panics caught by
    /// the coroutine trampoline).
    pub fn produce<T: Send + 'static>(
        &self,
        kind: Kind,
        capacity: usize,
        stack_size: usize,
        f: impl FnOnce(Channel<T>) + Send + 'static,
    ) -> RtResult<Channel<T>> {
        let channel: Channel<T> = Channel::new(kind, capacity);
        let task_channel = channel.clone();
        self.launch(stack_size, move || {
            f(task_channel.clone());
            task_channel.close();
        })?;
        Ok(channel)
    }

    /// Spawn an actor: a child coroutine that loops receiving on `channel`,
    /// invoking `process` per element, and exiting when the channel closes,
    /// the scope is cancelled, `process` returns `false`, or
    /// [`ActorHandle::stop`] is called (§4.6 "Actor", §9 Design Notes).
    pub fn actor<T: Send + 'static>(
        &self,
        channel: Channel<T>,
        stack_size: usize,
        mut process: impl FnMut(T) -> bool + Send + 'static,
        on_done: Option<Box<dyn FnOnce() + Send>>,
    ) -> RtResult<ActorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_loop = stop.clone();
        let done_for_loop = done.clone();
        let token = self.inner.token.clone();

        self.inner.actor_stops.lock().unwrap().push(stop.clone());

        self.launch(stack_size, move || {
            loop {
                if stop_for_loop.load(Ordering::Acquire) || token.is_cancelled() {
                    break;
                }
                match channel.recv(-1, Some(&token)) {
                    Ok(value) => {
                        if !process(value) {
                            break;
                        }
                        crate::scheduler::yield_now();
                    }
                    Err(_) => break,
                }
            }

            {
                let mut finished = done_for_loop.0.lock().unwrap();
                *finished = true;
            }
            done_for_loop.1.notify_all();

            if let Some(cb) = on_done {
                cb();
            }
        })?;

        Ok(ActorHandle { stop, done })
    }

    /// `wait_all(scope, timeout_ms)` (§6): `0` polls immediately, `<0` waits
    /// indefinitely, `>0` waits to an absolute deadline and returns
    /// [`Code::Deadline`] if children remain.
    pub fn wait_all(&self, timeout_ms: i64) -> RtResult<()> {
        let state = self.inner.state.lock().unwrap();

        if timeout_ms == 0 {
            return if state.count == 0 { Ok(()) } else { Err(Code::WouldBlock) };
        }

        if timeout_ms < 0 {
            let mut state = state;
            while state.count != 0 {
                state = self.inner.cv.wait(state).unwrap();
            }
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut state = state;
        while state.count != 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(Code::Deadline);
            }
            let (next, _) = self.inner.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        Ok(())
    }

    /// `cancel(scope)` (§6): trip the scope's token, mark it shutting down
    /// (rejecting further `launch`/`produce`/`actor` calls), and explicitly
    /// stop every actor launched through it.
    pub fn cancel(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.token.trigger();
        for stop in self.inner.actor_stops.lock().unwrap().iter() {
            stop.store(true, Ordering::Release);
        }
    }
}

fn child_done(inner: &Inner) {
    let mut state = inner.state.lock().unwrap();
    state.count -= 1;
    if state.count == 0 {
        inner.cv.notify_all();
    }
}

/// A handle to a running actor (§4.6 "Actor"), independent of the scope
/// that owns its lifetime.
#[derive(Clone)]
pub struct ActorHandle {
    stop: Arc<AtomicBool>,
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl ActorHandle {
    /// Request the actor's loop to exit after its current `process` call
    /// returns (or immediately, if it is parked in `recv`).
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        *self.done.0.lock().unwrap()
    }

    /// Block until the actor's loop has exited and `on_done` (if any) has
    /// run.
    pub fn wait(&self) {
        let mut finished = self.done.0.lock().unwrap();
        while !*finished {
            finished = self.done.1.wait(finished).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerOptions;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn launch_children_are_counted_and_awaited() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 2,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = counter.clone();
            scope.launch_default(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
        }

        assert!(scope.wait_all(5_000).is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        sched.shutdown();
    }

    #[test]
    fn launch_after_cancel_is_rejected() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        scope.cancel();
        assert_eq!(scope.launch_default(|| {}), Err(Code::Cancelled));
        sched.shutdown();
    }

    #[test]
    fn cancel_propagates_to_child_token() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        let child_token = CancelToken::child(scope.token());
        scope.cancel();
        assert!(child_token.is_cancelled());
        sched.shutdown();
    }

    #[test]
    fn produce_closes_channel_when_producer_returns() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        let channel: Channel<i32> = scope
            .produce(Kind::Unlimited, 0, DEFAULT_STACK_SIZE, |ch| {
                for i in 0..5 {
                    ch.try_send(i).unwrap();
                }
            })
            .unwrap();

        assert!(scope.wait_all(5_000).is_ok());
        for i in 0..5 {
            assert_eq!(channel.try_recv(), Ok(i));
        }
        assert_eq!(channel.try_recv(), Err(Code::Closed));
        sched.shutdown();
    }

    #[test]
    fn actor_stops_on_explicit_stop_request() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        let channel: Channel<i32> = Channel::new(Kind::Unlimited, 0);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();

        let handle = scope
            .actor(channel.clone(), DEFAULT_STACK_SIZE, move |_msg| {
                seen2.fetch_add(1, Ordering::SeqCst);
                true
            }, None)
            .unwrap();

        channel.try_send(1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        handle.stop();
        channel.try_send(2).ok();
        handle.wait();

        assert!(seen.load(Ordering::SeqCst) >= 1);
        assert!(scope.wait_all(5_000).is_ok());
        sched.shutdown();
    }

    #[test]
    fn actor_process_returning_false_stops_loop() {
        let sched = Scheduler::init(SchedulerOptions {
            workers: 1,
            ..SchedulerOptions::default()
        });
        let scope = Scope::init(&sched, None);
        let channel: Channel<i32> = Channel::new(Kind::Unlimited, 0);
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let handle = scope
            .actor(channel, DEFAULT_STACK_SIZE, move |_msg| {
                seen2.fetch_add(1, Ordering::SeqCst);
                false
            }, None)
            .unwrap();

        handle.wait();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(scope.wait_all(5_000).is_ok());
        sched.shutdown();
    }
}
