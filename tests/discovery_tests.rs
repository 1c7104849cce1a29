
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use multigrain::routing::{Backoff, RetryPolicy};
use test_harness::instance;

fn linear(max_cycles: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy::new(
        max_cycles,
        Backoff::Linear {
            base: Duration::from_millis(base_ms),
        },
    )
}

#[test]
fn test_backoff_shapes() {
    let linear = Backoff::Linear {
        base: Duration::from_millis(100),
    };
    assert_eq!(linear.delay(1), Duration::from_millis(100));
    assert_eq!(linear.delay(4), Duration::from_millis(400));

    let fixed = Backoff::Fixed(Duration::from_millis(250));
    assert_eq!(fixed.delay(1), fixed.delay(9));

    let exponential = Backoff::Exponential {
        base: Duration::from_millis(100),
        max: Duration::from_millis(300),
    };
    assert_eq!(exponential.delay(1), Duration::from_millis(100));
    assert_eq!(exponential.delay(2), Duration::from_millis(200));
    assert_eq!(exponential.delay(3), Duration::from_millis(300));
    assert_eq!(exponential.delay(40), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_empty_snapshot_sleeps_every_cycle() {
    let mut sequence = linear(4, 100).sequence(Vec::new());
    let started = Instant::now();

    assert!(sequence.next().await.is_none());

    let expected: Vec<Duration> = [100, 200, 300, 400]
        .into_iter()
        .map(Duration::from_millis)
        .collect();
    assert_eq!(sequence.backoff_log(), expected.as_slice());
    assert_eq!(sequence.cycles(), 4);
    assert!(sequence.is_done());

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1100), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_walks_snapshot_in_order_each_cycle() {
    let snapshot = vec![
        instance("hypertoast", "10.0.0.1", "a"),
        instance("hypertoast", "10.0.0.2", "b"),
    ];
    let mut sequence = linear(2, 10).sequence(snapshot);

    let mut seen = Vec::new();
    while let Some(next) = sequence.next().await {
        seen.push(next.name);
    }

    assert_eq!(seen, vec!["a", "b", "a", "b"]);
    assert_eq!(sequence.backoff_log().len(), 2);

    // Stays finished.
    assert!(sequence.next().await.is_none());
    assert_eq!(sequence.cycles(), 2);
}

#[tokio::test]
async fn test_zero_cycles_yields_nothing() {
    let mut sequence = linear(0, 100).sequence(vec![instance("hypertoast", "10.0.0.1", "a")]);
    assert!(sequence.next().await.is_none());
    assert!(sequence.backoff_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let token = CancellationToken::new();
    let mut sequence = linear(5, 1000)
        .sequence(Vec::new())
        .with_cancellation(token.clone());

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    assert!(sequence.next().await.is_none());
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(sequence.cycles(), 1);
    assert!(sequence.is_done());
}
