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

//! Multi-clause channel selection (§4.5 "Select").
//!
//! `Select<T>` multiplexes a set of send/recv clauses across channels of the
//! same element type `T`: the spec's byte-oriented clause list is generalized
//! the same way [`crate::channel::Channel`] generalizes the wire-level
//! channel, so callers pick a winning clause without any unsafe buffer
//! juggling. Fairness is biased -- clauses are probed and registered in the
//! order they were added, matching the source's actual (non-randomized)
//! behavior. [`Select::create_with_options`] accepts an `unbiased: bool`
//! construction option for a future rotating-start policy; it is accepted
//! but not yet consulted by the probe/register passes.
//!
//! Grounded on §4.5 end to end; there is no teacher analog, so the clause
//! bookkeeping below reuses [`crate::channel::WaiterToken`]'s claim/wait
//! machinery directly rather than inventing a parallel protocol: every
//! clause's token shares one status cell and one winner-index cell, so the
//! first partner to claim any clause is the select's single winner.

use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::sync::Arc;

use crate::cancel::{CancelToken, Deadline};
use crate::channel::{self, Channel, WaiterToken};
use crate::error::Code;

enum Direction<T> {
    Send(Option<T>),
    Recv,
}

struct Clause<T> {
    channel: Channel<T>,
    direction: Direction<T>,
}

/// What a winning clause actually did.
pub enum Outcome<T> {
    Sent,
    Received(T),
}

/// A registered set of send/recv clauses over channels sharing element type
/// `T`, resolved by [`Select::wait`] (§4.5).
///
/// Not `Send`/`Sync`: a select belongs to exactly one coroutine or thread for
/// its lifetime, matching how that coroutine/thread parks against it.
pub struct Select<T> {
    clauses: Vec<Clause<T>>,
    cancel: Option<CancelToken>,
    /// Accepted but not yet consulted by the probe/register passes; see the
    /// module doc comment.
    unbiased: bool,
}

impl<T: Send + 'static> Select<T> {
    /// `create(cancel_token?)` (§6). Equivalent to
    /// `create_with_options(cancel, false)`.
    pub fn create(cancel: Option<CancelToken>) -> Select<T> {
        Select::create_with_options(cancel, false)
    }

    /// `create(cancel_token?, unbiased)`: `unbiased` is accepted for
    /// forward compatibility with a future rotating-start fairness policy
    /// but does not yet change probe or register order (§9 Design Notes).
    pub fn create_with_options(cancel: Option<CancelToken>, unbiased: bool) -> Select<T> {
        Select {
            clauses: Vec::new(),
            cancel,
            unbiased,
        }
    }

    /// Whether this select was constructed with the `unbiased` option set.
    pub fn is_unbiased(&self) -> bool {
        self.unbiased
    }

    /// `add_send(ch, in_buf)`: register a send clause carrying `value`.
    /// Returns the clause's index.
    pub fn add_send(&mut self, channel: Channel<T>, value: T) -> usize {
        self.clauses.push(Clause {
            channel,
            direction: Direction::Send(Some(value)),
        });
        self.clauses.len() - 1
    }

    /// `add_recv(ch, out_buf)`: register a receive clause. Returns the
    /// clause's index.
    pub fn add_recv(&mut self, channel: Channel<T>) -> usize {
        self.clauses.push(Clause {
            channel,
            direction: Direction::Recv,
        });
        self.clauses.len() - 1
    }

    /// Drop every registered clause so the `Select` can be reused with a
    /// fresh set via further `add_send`/`add_recv` calls (§6 "reset").
    pub fn reset(&mut self) {
        self.clauses.clear();
    }

    /// `wait(timeout_ms) -> (index, op_result)` (§4.5): probe every clause
    /// non-blockingly in order, then -- unless `timeout_ms == 0` -- register
    /// a waiter on every clause and block for the first claim, a deadline,
    /// or cancellation, whichever comes first.
    pub fn wait(&mut self, timeout_ms: i64) -> Result<(usize, Outcome<T>), Code> {
        for i in 0..self.clauses.len() {
            if let Some(outcome) = self.probe(i) {
                return Ok((i, outcome));
            }
        }

        if timeout_ms == 0 {
            return Err(Code::WouldBlock);
        }

        let deadline = Deadline::from_timeout_ms(timeout_ms);
        let status = Arc::new(AtomicU8::new(channel::WAITER_ENQUEUED));
        let winner = Arc::new(AtomicIsize::new(-1));
        let parked = channel::current_parked();

        // Register pass: every clause gets a token sharing `status`,
        // `winner`, and `parked` -- the first partner to claim any one of
        // them is this select's single winner (§4.5 "Claim protocol").
        let mut tokens: Vec<Arc<WaiterToken<T>>> = Vec::with_capacity(self.clauses.len());
        for (i, clause) in self.clauses.iter_mut().enumerate() {
            let token = match &mut clause.direction {
                Direction::Send(slot) => {
                    let value = slot.take().expect("send clause value taken twice");
                    let token =
                        WaiterToken::new_for_select(Some(value), status.clone(), parked.clone(), winner.clone(), i);
                    clause.channel.push_sender_waiter(token.clone());
                    token
                }
                Direction::Recv => {
                    let token = WaiterToken::new_for_select(None, status.clone(), parked.clone(), winner.clone(), i);
                    clause.channel.push_receiver_waiter(token.clone());
                    token
                }
            };
            tokens.push(token);
        }

        // Block: any one clause's token is enough, since they share
        // `status` and `parked`.
        channel::wait_token(&tokens[0], deadline, self.cancel.as_ref());

        let final_status = status.load(Ordering::Acquire);
        let result = if final_status == channel::WAITER_CLAIMED {
            let idx = winner.load(Ordering::Acquire);
            debug_assert!(idx >= 0, "claimed select recorded no winner index");
            let idx = idx as usize;
            let outcome = match &self.clauses[idx].direction {
                Direction::Send(_) => Outcome::Sent,
                Direction::Recv => {
                    Outcome::Received(tokens[idx].take_slot().expect("claimed recv clause carries a value"))
                }
            };
            Ok((idx, outcome))
        } else if self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
            Err(Code::Cancelled)
        } else {
            Err(Code::Deadline)
        };

        // Cleanup: drop every non-winning registration so a loser clause's
        // token doesn't linger on its channel's wait queue.
        let winning_idx = result.as_ref().ok().map(|(idx, _)| *idx);
        for (i, clause) in self.clauses.iter().enumerate() {
            if Some(i) == winning_idx {
                continue;
            }
            tokens[i].try_cancel();
            match &clause.direction {
                Direction::Send(_) => clause.channel.remove_sender_waiter(&tokens[i]),
                Direction::Recv => clause.channel.remove_receiver_waiter(&tokens[i]),
            }
        }

        result
    }

    /// Non-blocking attempt on clause `i`; `Some` on success.
    fn probe(&mut self, i: usize) -> Option<Outcome<T>> {
        let clause = &mut self.clauses[i];
        match &mut clause.direction {
            Direction::Send(slot) => {
                let value = slot.take().expect("send clause value taken twice");
                match clause.channel.try_send_once(value) {
                    Ok(()) => Some(Outcome::Sent),
                    Err((_, returned)) => {
                        *slot = returned;
                        None
                    }
                }
            }
            Direction::Recv => match clause.channel.try_recv_once() {
                Ok(value) => Some(Outcome::Received(value)),
                Err(_) => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Kind;

    #[test]
    fn probe_pass_prefers_first_ready_clause_in_order() {
        let a: Channel<i32> = Channel::new(Kind::Buffered, 1);
        let b: Channel<i32> = Channel::new(Kind::Buffered, 1);
        a.try_send(1).unwrap();
        b.try_send(2).unwrap();

        let mut sel = Select::create(None);
        sel.add_recv(a.clone());
        sel.add_recv(b.clone());

        let (idx, outcome) = sel.wait(0).unwrap();
        assert_eq!(idx, 0);
        match outcome {
            Outcome::Received(v) => assert_eq!(v, 1),
            Outcome::Sent => panic!("recv clause reported Sent"),
        }
    }

    #[test]
    fn try_wait_would_block_when_nothing_ready() {
        let a: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
        let mut sel: Select<i32> = Select::create(None);
        sel.add_recv(a);
        assert!(matches!(sel.wait(0), Err(Code::WouldBlock)));
    }

    #[test]
    fn deadline_elapses_to_timed_out() {
        let a: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
        let mut sel: Select<i32> = Select::create(None);
        sel.add_recv(a);
        assert!(matches!(sel.wait(20), Err(Code::Deadline)));
    }

    #[test]
    fn cancellation_wins_over_pending_deadline() {
        let a: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
        let token = CancelToken::new();
        token.trigger();
        let mut sel = Select::create(Some(token));
        sel.add_recv(a);
        assert!(matches!(sel.wait(5_000), Err(Code::Cancelled)));
    }

    #[test]
    fn blocking_select_wakes_on_partner_send() {
        let a: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
        let b: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
        let a2 = a.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            a2.send(7, -1, None).unwrap();
        });

        let mut sel = Select::create(None);
        sel.add_recv(a);
        sel.add_recv(b);
        let (idx, outcome) = sel.wait(-1).unwrap();
        handle.join().unwrap();

        assert_eq!(idx, 0);
        match outcome {
            Outcome::Received(v) => assert_eq!(v, 7),
            Outcome::Sent => panic!("recv clause reported Sent"),
        }
    }
}
