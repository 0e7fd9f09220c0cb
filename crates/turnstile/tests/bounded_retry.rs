//! BoundedOperation: attempt limits, backoff timing and cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use turnstile::{Backoff, BoundedOperation, CancelOrigin, CancellationSignal, OperationError};

#[tokio::test(start_paused = true)]
async fn always_failing_work_runs_exactly_k_plus_one_times() {
    let calls = Arc::new(AtomicU32::new(0));
    let op = BoundedOperation::new("flaky")
        .with_retries(3)
        .with_backoff(Backoff::exponential(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ));

    let started = Instant::now();
    let counter = calls.clone();
    let err = op
        .execute(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(anyhow::anyhow!("attempt {n} failed")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match err {
        OperationError::Failed {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(last_error.to_string(), "attempt 4 failed");
        }
        other => panic!("expected failure, got {other}"),
    }
    // 10 + 20 + 40 of backoff between the four attempts.
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let op = BoundedOperation::new("transient")
        .with_retries(2)
        .with_backoff(Backoff::linear(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(50),
        ));

    let counter = calls.clone();
    let value = op
        .execute(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(n)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 3);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_means_one_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let err = BoundedOperation::new("once")
        .with_retries(0)
        .execute(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("no")) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn parent_cancel_during_backoff_stops_retrying() {
    let session = CancellationSignal::new();
    let calls = Arc::new(AtomicU32::new(0));
    let op = BoundedOperation::new("backoff")
        .with_retries(10)
        .with_backoff(Backoff::linear(
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(1),
        ))
        .with_signal(&session);

    let counter = calls.clone();
    let run = tokio::spawn(async move {
        op.execute(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("busy")) }
        })
        .await
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.cancel("session ended");

    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        OperationError::Cancelled { cancelled, .. } => {
            assert_eq!(cancelled.origin, CancelOrigin::Parent);
            assert_eq!(cancelled.reason, "session ended");
        }
        other => panic!("expected cancellation, got {other}"),
    }
}

#[tokio::test]
async fn already_cancelled_parent_runs_nothing() {
    let session = CancellationSignal::new();
    session.cancel("gone");

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let err = BoundedOperation::new("late")
        .with_signal(&session)
        .execute(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(()) }
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.attempts(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn work_observes_its_signal() {
    let op = BoundedOperation::new("cooperative").with_timeout(Duration::from_millis(30));

    let err = op
        .execute(|signal| async move {
            // Work that checks for cancellation at its own pace.
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if let Err(cancelled) = signal.check() {
                    return Err::<(), anyhow::Error>(cancelled.into());
                }
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
}
