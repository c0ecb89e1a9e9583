//! End-to-end scenarios exercising the interpreter, cancellation,
//! finalization, and concurrent composition together.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use marrow_runtime::{
    acquire_release, acquire_use_release, for_each, race_all, race_all_first, repeat_n, sleep,
    Concurrency, Effect, Failure, Runtime,
};

#[derive(Default)]
struct BracketProbe {
    acquired: AtomicBool,
    used: AtomicBool,
    released: AtomicBool,
}

/// The acquire/use/release pipeline of the cancellation scenarios: acquire
/// takes 100ms and yields 123, use and release record themselves.
fn bracket_pipeline(probe: &Arc<BracketProbe>) -> Effect<i32, Infallible> {
    let acquired = probe.clone();
    let used = probe.clone();
    let released = probe.clone();
    acquire_use_release(
        Effect::<_, Infallible>::sync(move || {
            acquired.acquired.store(true, Ordering::SeqCst);
            123
        })
        .delay(Duration::from_millis(100)),
        move |a| {
            Effect::sync(move || {
                used.used.store(true, Ordering::SeqCst);
                a
            })
        },
        move |a, _outcome| {
            Effect::sync(move || {
                assert_eq!(a, 123);
                released.released.store(true, Ordering::SeqCst);
            })
        },
    )
}

#[test]
fn scenario_block_on_pure_value() {
    let rt = Runtime::default();
    assert_eq!(rt.block_on(Effect::<_, Infallible>::succeed(1)).unwrap(), 1);
}

#[test]
fn scenario_abort_separates_use_from_acquire() {
    let rt = Runtime::default();
    let probe = Arc::new(BracketProbe::default());

    let effect = bracket_pipeline(&probe).fork().flat_map(|handle| {
        handle.unsafe_abort();
        handle.observe().widen()
    });
    let outcome = rt.block_on(effect).unwrap();

    assert!(matches!(outcome, Err(Failure::Aborted)));
    assert!(probe.acquired.load(Ordering::SeqCst));
    assert!(!probe.used.load(Ordering::SeqCst));
    assert!(probe.released.load(Ordering::SeqCst));
}

#[test]
fn scenario_uninterruptible_pipeline_completes() {
    let rt = Runtime::default();
    let probe = Arc::new(BracketProbe::default());

    let effect = bracket_pipeline(&probe)
        .uninterruptible()
        .fork()
        .flat_map(|handle| {
            handle.unsafe_abort();
            handle.observe().widen()
        });
    let outcome = rt.block_on(effect).unwrap();

    assert!(matches!(outcome, Ok(123)));
    assert!(probe.acquired.load(Ordering::SeqCst));
    assert!(probe.used.load(Ordering::SeqCst));
    assert!(probe.released.load(Ordering::SeqCst));
}

#[test]
fn scenario_sequential_for_each_aborted_mid_stream() {
    let rt = Runtime::default();
    let done: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = done.clone();
    let traversal = for_each(
        1..=6,
        move |i| {
            let sink = sink.clone();
            Effect::<_, Infallible>::sync(move || sink.lock().push(i))
                .delay(Duration::from_millis(50))
        },
        Concurrency::Limit(1),
    );

    let effect = traversal.fork().flat_map(|handle| {
        let aborter = handle.clone();
        sleep::<Infallible>(Duration::from_millis(125))
            .then(Effect::sync(move || aborter.unsafe_abort()))
            .then(handle.observe().widen())
    });
    let outcome = rt.block_on(effect).unwrap();

    assert!(matches!(outcome, Err(Failure::Aborted)));
    assert_eq!(*done.lock(), vec![1, 2]);
}

fn racers(interrupted: &Arc<Mutex<Vec<u64>>>) -> Vec<Effect<u64, &'static str>> {
    [100u64, 75, 50, 0, 25]
        .into_iter()
        .map(|ms| {
            let base = if ms == 0 {
                Effect::fail("boom")
            } else {
                Effect::succeed(ms)
            };
            let sink = interrupted.clone();
            base.delay(Duration::from_millis(ms))
                .on_interrupt(move || Effect::sync(move || sink.lock().push(ms)))
        })
        .collect()
}

#[test]
fn scenario_race_all_first_success_wins_losers_finalized() {
    let rt = Runtime::default();
    let interrupted = Arc::new(Mutex::new(Vec::new()));

    let outcome = rt.block_on(race_all(racers(&interrupted)));
    assert_eq!(outcome.unwrap(), 25);

    let mut seen = interrupted.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![50, 75, 100]);
}

#[test]
fn scenario_race_all_first_takes_first_outcome() {
    let rt = Runtime::default();
    let interrupted = Arc::new(Mutex::new(Vec::new()));

    let outcome = rt.block_on(race_all_first(racers(&interrupted)));
    assert!(matches!(outcome, Err(Failure::Expected("boom"))));

    let mut seen = interrupted.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![25, 50, 75, 100]);
}

#[test]
fn scenario_deep_synchronous_repeat() {
    let rt = Runtime::default();
    let effect = repeat_n(10_000, || Effect::<(), Infallible>::unit());
    assert!(rt.run_sync(effect).is_ok());
}

#[test]
fn preflight_skips_body_of_aborted_effect() {
    let rt = Runtime::default();
    let entered = Arc::new(AtomicBool::new(false));

    let e = entered.clone();
    let effect = Effect::<_, Infallible>::sync(move || e.store(true, Ordering::SeqCst))
        .fork()
        .flat_map(|handle| {
            handle.unsafe_abort();
            handle.join()
        });

    assert!(matches!(rt.block_on(effect), Err(Failure::Aborted)));
    assert!(!entered.load(Ordering::SeqCst));
}

#[test]
fn scoped_resources_release_in_reverse_order() {
    let rt = Runtime::default();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let first = order.clone();
    let second = order.clone();
    let effect = acquire_release(Effect::<_, String>::succeed("a"), move |_, _| {
        Effect::sync(move || first.lock().push("release a"))
    })
    .then(acquire_release(Effect::succeed("b"), move |_, _| {
        Effect::sync(move || second.lock().push("release b"))
    }))
    .as_value(0)
    .scoped();

    assert_eq!(rt.block_on(effect).unwrap(), 0);
    assert_eq!(*order.lock(), vec!["release b", "release a"]);
}

#[test]
fn scoped_releases_on_interruption() {
    let rt = Runtime::default();
    let released = Arc::new(AtomicBool::new(false));

    let r = released.clone();
    let effect = acquire_release(Effect::<_, Infallible>::succeed(7), move |_, exit| {
        let interrupted = exit.is_interrupted();
        Effect::sync(move || r.store(interrupted, Ordering::SeqCst))
    })
    .then(Effect::<i32, Infallible>::never())
    .scoped()
    .fork()
    .flat_map(|handle| {
        let aborter = handle.clone();
        Effect::<(), Infallible>::yield_now()
            .then(Effect::sync(move || aborter.unsafe_abort()))
            .then(handle.observe().widen())
    });

    let outcome = rt.block_on(effect).unwrap();
    assert!(matches!(outcome, Err(Failure::Aborted)));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn timeout_interrupts_the_loser() {
    let rt = Runtime::default();
    let interrupted = Arc::new(AtomicBool::new(false));

    let i = interrupted.clone();
    let effect = Effect::<i32, Infallible>::never()
        .on_interrupt(move || Effect::sync(move || i.store(true, Ordering::SeqCst)))
        .timeout(Duration::from_millis(25));

    assert_eq!(rt.block_on(effect).unwrap(), None);
    assert!(interrupted.load(Ordering::SeqCst));
}

#[test]
fn blocking_work_joins_the_executor() {
    let rt = Runtime::default();
    let effect = Effect::<_, String>::blocking(|| Ok("computed off-thread".to_string()))
        .map(|s| s.len());
    assert_eq!(rt.block_on(effect).unwrap(), "computed off-thread".len());
}

#[test]
fn inherited_concurrency_is_read_from_the_environment() {
    let rt = Runtime::default();
    let effect = for_each(
        0..20u32,
        |n| Effect::<_, Infallible>::succeed(n * 2),
        Concurrency::Inherit,
    )
    .with_concurrency(Concurrency::Limit(4));

    let out = rt.block_on(effect).unwrap();
    assert_eq!(out, (0..20u32).map(|n| n * 2).collect::<Vec<_>>());
}
