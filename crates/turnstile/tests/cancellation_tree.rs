//! Cancellation trees: propagation direction, deadlines and callback delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use turnstile::{CancelOrigin, CancellationSignal};

#[test]
fn parent_cancel_reaches_whole_subtree_before_returning() {
    let root = CancellationSignal::builder().label("root").build();
    let session = CancellationSignal::builder().label("session").parent(&root).build();
    let call_a = CancellationSignal::child_of(&session);
    let call_b = CancellationSignal::child_of(&session);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for (name, signal) in [("a", &call_a), ("b", &call_b)] {
        let seen = seen.clone();
        signal.register(move |c| seen.lock().unwrap().push((name, c.reason.clone())));
    }

    assert!(root.cancel("shutdown"));

    for signal in [&session, &call_a, &call_b] {
        let cancellation = signal.cancellation().unwrap();
        assert_eq!(cancellation.reason, "shutdown");
        assert_eq!(cancellation.origin, CancelOrigin::Parent);
    }
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("a", "shutdown".to_string()), ("b", "shutdown".to_string())]
    );
}

#[test]
fn child_cancel_does_not_touch_parent_or_siblings() {
    let parent = CancellationSignal::new();
    let left = CancellationSignal::child_of(&parent);
    let right = CancellationSignal::child_of(&parent);

    assert!(left.cancel("only me"));

    assert!(left.is_cancelled());
    assert!(!parent.is_cancelled());
    assert!(!right.is_cancelled());
}

#[test]
fn repeated_cancel_keeps_first_reason_and_fires_once() {
    let parent = CancellationSignal::new();
    let child = CancellationSignal::child_of(&parent);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    child.register(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(child.cancel("first"));
    assert!(parent.cancel("second"));
    assert!(!child.cancel("third"));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let cancellation = child.cancellation().unwrap();
    assert_eq!(cancellation.reason, "first");
    assert_eq!(cancellation.origin, CancelOrigin::Direct);
}

#[test]
fn panicking_cleanup_is_contained() {
    let signal = CancellationSignal::new();
    let child = CancellationSignal::child_of(&signal);
    signal.register(|_| panic!("bad cleanup"));

    let after = Arc::new(AtomicUsize::new(0));
    let counter = after.clone();
    signal.register(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(signal.cancel("go"));
    assert!(child.is_cancelled());
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn awaiting_cancellation_wakes_on_cancel() {
    let signal = CancellationSignal::new();
    let watcher = signal.watcher();

    let waiter = tokio::spawn(async move { watcher.cancelled().await });
    tokio::task::yield_now().await;

    signal.cancel("wake up");
    let cancellation = waiter.await.unwrap();
    assert_eq!(cancellation.reason, "wake up");
}

#[tokio::test(start_paused = true)]
async fn parent_deadline_cancels_children() {
    let session = CancellationSignal::with_timeout(Duration::from_secs(2));
    let call = CancellationSignal::child_of(&session);

    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(!call.is_cancelled());

    let cancellation = call.cancelled().await;
    assert_eq!(cancellation.origin, CancelOrigin::Parent);
    assert_eq!(cancellation.reason, "timeout after 2000ms");
    assert!(session.cancellation().unwrap().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn child_deadline_leaves_parent_alone() {
    let parent = CancellationSignal::new();
    let call = CancellationSignal::builder()
        .parent(&parent)
        .timeout(Duration::from_millis(20))
        .build();

    call.cancelled().await;
    assert!(!parent.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn dropped_signal_disarms_its_timer() {
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let signal = CancellationSignal::with_timeout(Duration::from_millis(10));
        let counter = fired.clone();
        signal.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn any_fires_on_first_member() {
    let user = CancellationSignal::new();
    let deadline = CancellationSignal::new();
    let combined = CancellationSignal::any(&[&user, &deadline]);

    user.cancel("user pressed stop");

    let cancellation = combined.cancellation().unwrap();
    assert_eq!(cancellation.origin, CancelOrigin::Member(0));
    assert_eq!(cancellation.reason, "user pressed stop");
    assert!(!deadline.is_cancelled());
}
