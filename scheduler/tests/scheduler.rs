// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use scheduler::*;

/// Test context: callbacks log their token and advance the shared clock by
/// one centisecond to stand in for real work.
struct Ctx {
    clock: TestClock,
    log: Vec<u64>,
}

fn harness() -> (Scheduler<Ctx>, Ctx) {
    let clock = TestClock::new();
    let sched = Scheduler::with_parts(Box::new(clock.clone()), Box::new(NullTimer));
    let ctx = Ctx {
        clock,
        log: Vec::new(),
    };
    (sched, ctx)
}

fn slow_poll(ctx: &mut Ctx, token: Token, now: CsTick, _up: &TimeUp) -> Option<CsTick> {
    ctx.clock.advance(1);
    ctx.log.push(token.0);
    Some(now + 100)
}

fn greedy(ctx: &mut Ctx, token: Token, now: CsTick, _up: &TimeUp) -> Option<CsTick> {
    ctx.clock.advance(1);
    ctx.log.push(token.0);
    Some(now) // wants to run again immediately
}

fn one_shot(ctx: &mut Ctx, token: Token, _now: CsTick, _up: &TimeUp) -> Option<CsTick> {
    ctx.clock.advance(1);
    ctx.log.push(token.0);
    None
}

#[test]
fn register_then_deregister_leaves_registry_as_before() {
    let (mut sched, mut ctx) = harness();

    sched.register(slow_poll, Token(1), 0, 5).unwrap();
    assert!(sched.is_registered(slow_poll, Token(1)));

    assert!(sched.deregister(slow_poll, Token(1)));
    assert!(!sched.is_registered(slow_poll, Token(1)));
    assert!(sched.is_empty());

    // Deregistering again is a tolerated no-op.
    assert!(!sched.deregister(slow_poll, Token(1)));

    sched.run(&mut ctx);
    assert!(ctx.log.is_empty());

    // Re-registering the same key must succeed.
    sched.register(slow_poll, Token(1), 0, 5).unwrap();
    assert_eq!(sched.len(), 1);
}

#[test]
fn duplicate_keys_rejected() {
    let (mut sched, _ctx) = harness();

    sched.register(slow_poll, Token(1), 0, 5).unwrap();
    assert_eq!(
        sched.register(slow_poll, Token(1), 10, 5),
        Err(SchedError::Duplicate)
    );

    // Same fn under a different token is a different key.
    sched.register(slow_poll, Token(2), 0, 5).unwrap();
    // Different fn under the same token likewise.
    sched.register(one_shot, Token(1), 0, 5).unwrap();
    assert_eq!(sched.len(), 3);
}

#[test]
fn priority_range_enforced() {
    let (mut sched, _ctx) = harness();
    assert_eq!(
        sched.register(slow_poll, Token(1), 0, 0),
        Err(SchedError::BadPriority)
    );
    assert_eq!(
        sched.register(slow_poll, Token(1), 0, 11),
        Err(SchedError::BadPriority)
    );
}

#[test]
fn cursor_round_robin_survives_across_ticks() {
    let (mut sched, mut ctx) = harness();
    sched.register(slow_poll, Token(1), 0, 5).unwrap();
    sched.register(slow_poll, Token(2), 0, 5).unwrap();
    sched.register(slow_poll, Token(3), 0, 5).unwrap();

    // Budget of 2 cs: only the first two get a turn this tick.
    sched.set_time_slice(2);
    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![1, 2]);

    // Everyone due again; the cursor resumes at entry 3.
    ctx.clock.advance(200);
    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![1, 2, 3, 1]);
}

#[test]
fn one_shot_callback_removes_itself() {
    let (mut sched, mut ctx) = harness();
    sched.register(one_shot, Token(9), 0, 5).unwrap();

    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![9]);
    assert!(sched.is_empty());

    // Nothing fires twice.
    ctx.clock.advance(100);
    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![9]);
}

#[test]
fn greedy_callback_exhausts_its_slice_then_yields() {
    let (mut sched, mut ctx) = harness();
    sched.register(greedy, Token(1), 0, 3).unwrap();
    sched.register(slow_poll, Token(2), 0, 5).unwrap();

    sched.run(&mut ctx);

    // The greedy callback gets its 3-centisecond slice before the other
    // entry runs; priority buys slice length, never queue jumping.
    assert_eq!(&ctx.log[..4], &[1, 1, 1, 2]);

    // The whole tick respects the dispatch budget.
    assert_eq!(ctx.clock.now_cs(), DEFAULT_TICK_BUDGET);
}

#[test]
fn callbacks_wait_for_their_due_time() {
    let (mut sched, mut ctx) = harness();
    sched.register(slow_poll, Token(1), 50, 5).unwrap();

    sched.run(&mut ctx);
    assert!(ctx.log.is_empty());

    ctx.clock.set(50);
    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![1]);
}

#[test]
fn suspend_gates_dispatch_and_polling() {
    let (mut sched, mut ctx) = harness();
    sched.register(slow_poll, Token(1), 0, 5).unwrap();

    sched.suspend();
    sched.suspend();
    assert_eq!(sched.next_due(), None);
    sched.run(&mut ctx);
    assert!(ctx.log.is_empty());

    sched.resume();
    sched.run(&mut ctx);
    assert!(ctx.log.is_empty(), "still one suspension outstanding");

    sched.resume();
    sched.run(&mut ctx);
    assert_eq!(ctx.log, vec![1]);
}

#[test]
fn next_due_reports_earliest_entry() {
    let (mut sched, _ctx) = harness();
    assert_eq!(sched.next_due(), None);

    sched.register(slow_poll, Token(1), 70, 5).unwrap();
    sched.register(slow_poll, Token(2), 30, 5).unwrap();
    assert_eq!(sched.next_due(), Some(30));

    sched.deregister(slow_poll, Token(2));
    assert_eq!(sched.next_due(), Some(70));
}
