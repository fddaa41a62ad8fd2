//! Property tests for the rate controller.
//!
//! The central property: with steady target TPS and zero ramp, N permits
//! are issued in N / targetTps wall-clock, within a 200 ms window. All
//! tests run on the paused tokio clock so they are exact and instant.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vajra_edge::rate::RateController;

#[tokio::test(start_paused = true)]
async fn thousand_permits_at_steady_rate_land_on_schedule() {
    let controller = RateController::new(200.0, Duration::ZERO);
    let cancel = CancellationToken::new();

    let begin = Instant::now();
    for _ in 0..1_000 {
        controller.acquire(&cancel).await.unwrap();
    }
    let elapsed = begin.elapsed();

    let expected = Duration::from_secs_f64(1_000.0 / 200.0);
    let window = Duration::from_millis(200);
    assert!(
        elapsed >= expected.saturating_sub(window) && elapsed <= expected + window,
        "1000 permits at 200 TPS took {:?}",
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquirers_share_the_schedule() {
    let controller = Arc::new(RateController::new(100.0, Duration::ZERO));
    let cancel = CancellationToken::new();

    let begin = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let controller = controller.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                controller.acquire(&cancel).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 500 permits at 100 TPS ≈ 5 s regardless of how many tasks contend.
    let elapsed = begin.elapsed();
    assert!(
        elapsed >= Duration::from_millis(4_800) && elapsed <= Duration::from_millis(5_400),
        "elapsed was {:?}",
        elapsed
    );
    assert_eq!(controller.permits_issued(), 500);
}

#[tokio::test(start_paused = true)]
async fn ramp_reaches_target_rate_after_ramp_window() {
    let controller = RateController::new(100.0, Duration::from_secs(5));
    let cancel = CancellationToken::new();

    // Burn through the ramp.
    let begin = Instant::now();
    while begin.elapsed() < Duration::from_secs(5) {
        controller.acquire(&cancel).await.unwrap();
    }

    // Post-ramp: 100 permits should take ~1 s.
    let after_ramp = Instant::now();
    for _ in 0..100 {
        controller.acquire(&cancel).await.unwrap();
    }
    let elapsed = after_ramp.elapsed();
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_millis(1_200),
        "post-ramp 100 permits took {:?}",
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn tps_one_with_long_ramp_is_stable() {
    // Boundary case: targetTps=1 with rampDuration far beyond the test
    // window must not divide by zero or stall.
    let controller = RateController::new(1.0, Duration::from_secs(86_400));
    let cancel = CancellationToken::new();

    let begin = Instant::now();
    for _ in 0..3 {
        controller.acquire(&cancel).await.unwrap();
    }
    let elapsed = begin.elapsed();
    assert!(elapsed <= Duration::from_secs(4), "elapsed was {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn no_backfill_after_idle_gap() {
    let controller = RateController::new(20.0, Duration::ZERO);
    let cancel = CancellationToken::new();

    controller.acquire(&cancel).await.unwrap();

    // Idle for 10 s: 200 permits' worth of schedule is forfeited.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let begin = Instant::now();
    for _ in 0..5 {
        controller.acquire(&cancel).await.unwrap();
    }
    // Without the reset these five would be immediate; with it they pace
    // at the 50 ms interval (the first is immediate).
    let elapsed = begin.elapsed();
    assert!(
        elapsed >= Duration::from_millis(180),
        "permits came too fast after idle: {:?}",
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_context_fails_acquire_immediately() {
    let controller = RateController::new(1.0, Duration::ZERO);
    let cancel = CancellationToken::new();
    controller.acquire(&cancel).await.unwrap();

    cancel.cancel();
    let begin = Instant::now();
    assert!(controller.acquire(&cancel).await.is_err());
    assert!(begin.elapsed() < Duration::from_millis(100));
}
