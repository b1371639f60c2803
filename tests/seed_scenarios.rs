//! Crate-level end-to-end scenarios (§8's seed tests), covering rendezvous
//! ping-pong, buffered MPMC, select+timeout, select+cancellation, scope
//! cancellation propagation, and conflated coalescing across module
//! boundaries rather than within a single file's `#[cfg(test)]` module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corovisor::{
    Channel, ChannelKind as Kind, Code, Scheduler, SchedulerOptions, Scope, Select,
    DEFAULT_STACK_SIZE,
};

#[test]
fn rendezvous_ping_pong() {
    let _ = env_logger::try_init();
    let sched = Scheduler::init(SchedulerOptions {
        workers: 2,
        ..SchedulerOptions::default()
    });

    let ping: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
    let pong: Channel<i32> = Channel::new(Kind::Rendezvous, 0);

    let rounds = 20;
    let ping_a = ping.clone();
    let pong_a = pong.clone();
    sched.spawn(move || {
        for i in 0..rounds {
            ping_a.send(i, -1, None).unwrap();
            let reply = pong_a.recv(-1, None).unwrap();
            assert_eq!(reply, i + 1);
        }
    });

    let ping_b = ping.clone();
    let pong_b = pong.clone();
    sched.spawn(move || {
        for _ in 0..rounds {
            let v = ping_b.recv(-1, None).unwrap();
            pong_b.send(v + 1, -1, None).unwrap();
        }
    });

    assert!(sched.drain(5_000));
    sched.shutdown();
}

#[test]
fn buffered_mpmc_delivers_every_item_exactly_once() {
    let ch: Channel<usize> = Channel::new(Kind::Buffered, 8);
    let producers = 4;
    let per_producer = 50;
    let total = producers * per_producer;

    let mut handles = Vec::new();
    for p in 0..producers {
        let ch = ch.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..per_producer {
                ch.send(p * per_producer + i, -1, None).unwrap();
            }
        }));
    }

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut consumers = Vec::new();
    for _ in 0..4 {
        let ch = ch.clone();
        let received = received.clone();
        consumers.push(std::thread::spawn(move || loop {
            match ch.recv(300, None) {
                Ok(v) => received.lock().unwrap().push(v),
                Err(_) => break,
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    for h in consumers {
        h.join().unwrap();
    }

    let mut seen = received.lock().unwrap().clone();
    seen.sort_unstable();
    let expected: Vec<usize> = (0..total).collect();
    assert_eq!(seen, expected);
}

#[test]
fn select_times_out_when_no_clause_is_ready() {
    let a: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
    let b: Channel<i32> = Channel::new(Kind::Rendezvous, 0);

    let mut sel: Select<i32> = Select::create(None);
    sel.add_recv(a);
    sel.add_recv(b);

    assert!(matches!(sel.wait(30), Err(Code::Deadline)));
}

#[test]
fn select_cancellation_wakes_a_parked_coroutine() {
    let _ = env_logger::try_init();
    let sched = Scheduler::init(SchedulerOptions {
        workers: 2,
        ..SchedulerOptions::default()
    });
    let scope = Scope::init(&sched, None);

    let never_sent: Channel<i32> = Channel::new(Kind::Rendezvous, 0);
    let result = Arc::new(Mutex::new(None));
    let result2 = result.clone();
    let token = scope.token().clone();

    scope
        .launch_default(move || {
            let mut sel: Select<i32> = Select::create(Some(token));
            sel.add_recv(never_sent);
            let outcome = sel.wait(-1);
            *result2.lock().unwrap() = Some(matches!(outcome, Err(Code::Cancelled)));
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    scope.cancel();

    assert!(scope.wait_all(5_000).is_ok());
    assert_eq!(*result.lock().unwrap(), Some(true));
    sched.shutdown();
}

#[test]
fn scope_cancellation_stops_an_actor_parked_in_recv() {
    let _ = env_logger::try_init();
    let sched = Scheduler::init(SchedulerOptions {
        workers: 2,
        ..SchedulerOptions::default()
    });
    let scope = Scope::init(&sched, None);

    let channel: Channel<i32> = Channel::new(Kind::Unlimited, 0);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();

    let handle = scope
        .actor(
            channel,
            DEFAULT_STACK_SIZE,
            move |_msg| {
                seen2.fetch_add(1, Ordering::SeqCst);
                true
            },
            None,
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    scope.cancel();
    handle.wait();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert!(scope.wait_all(5_000).is_ok());
    sched.shutdown();
}

#[test]
fn conflated_channel_coalesces_rapid_sends_and_counts_drops() {
    let ch: Channel<i32> = Channel::new(Kind::Conflated, 1);
    for i in 0..100 {
        ch.try_send(i).unwrap();
    }
    assert_eq!(ch.snapshot().dropped.load(Ordering::Relaxed), 99);
    assert_eq!(ch.try_recv(), Ok(99));
}
