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

//! A user-space cooperative M:N coroutine runtime: private guarded stacks, a
//! work-stealing scheduler, typed channels of four kinds, multi-clause
//! `select`, and structured-concurrency scopes with cancellation
//! propagation.
//!
//! The pieces compose the way the module list below reads: [`stack`] and
//! [`context`] give a coroutine somewhere to run and a way to switch into
//! it; [`coroutine`] is the state machine on top of those two;
//! [`scheduler`] runs many coroutines across worker threads; [`channel`]
//! and [`select`] are how coroutines (or plain threads) hand values to each
//! other; [`scope`] is structured ownership and cancellation layered over
//! `scheduler` and `channel`.

pub mod cancel;
pub mod channel;
pub mod config;
mod context;
pub mod coroutine;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod scope;
pub mod select;
mod stack;

pub use cancel::{CancelToken, Deadline};
pub use channel::{Channel, Kind as ChannelKind};
pub use config::{MetricsConfig, RuntimeConfig};
pub use coroutine::{CoroutineRef, State as CoroutineState};
pub use error::{Code, FailureKind, RtResult};
pub use metrics::{Counters, EmitPolicy, MetricsEvent};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use scope::{ActorHandle, Scope};
pub use select::{Outcome as SelectOutcome, Select};
pub use stack::{Stack, StackPool, DEFAULT_STACK_SIZE};

use std::sync::OnceLock;

static DEFAULT_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// The process-wide default scheduler, started lazily on first use with
/// [`SchedulerOptions::default`]. Most programs only ever need this one;
/// [`Scheduler::init`] remains available for tests and programs that want
/// more than one pool.
pub fn default_scheduler() -> &'static Scheduler {
    DEFAULT_SCHEDULER.get_or_init(Scheduler::default)
}

/// Spawn a coroutine on the default scheduler.
///
/// Equivalent to `default_scheduler().spawn(f)`.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    default_scheduler().spawn(f)
}

/// The currently running coroutine, or `None` if called from a plain thread
/// that never `resume`d into one.
///
/// Equivalent to `coroutine::current`.
pub fn current() -> Option<CoroutineRef> {
    coroutine::current()
}

/// Cooperatively yield the current coroutine back to its worker.
///
/// Equivalent to `scheduler::yield_now`.
pub fn yield_now() {
    scheduler::yield_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn top_level_spawn_runs_on_default_scheduler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        spawn(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(default_scheduler().drain(5_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
