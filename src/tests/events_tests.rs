use super::support::{wait_until, Recorder};
use crate::events::*;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_emit_reaches_every_listener() {
    let bus: EventBus<u32> = EventBus::new();
    let first = Recorder::new();
    let second = Recorder::new();
    bus.subscribe(first.callback());
    bus.subscribe(second.callback());
    assert_eq!(bus.listener_count(), 2);

    bus.emit(7);
    bus.emit(8);

    assert!(wait_until(Duration::from_secs(2), || first.len() == 2 && second.len() == 2).await);
    let mut seen = first.events();
    seen.sort_unstable();
    assert_eq!(seen, vec![7, 8]);
}

#[tokio::test]
async fn test_emit_without_listeners() {
    let bus: EventBus<u32> = EventBus::default();
    bus.emit(1);
    assert_eq!(bus.listener_count(), 0);
}

#[tokio::test]
async fn test_panicking_listener_does_not_affect_others() {
    let bus: EventBus<&'static str> = EventBus::new();
    bus.subscribe(|_| panic!("boom"));
    let recorder = Recorder::new();
    bus.subscribe(recorder.callback());

    bus.emit("a");
    bus.emit("b");
    assert!(wait_until(Duration::from_secs(2), || recorder.len() == 2).await);
}

#[tokio::test]
async fn test_slow_listener_does_not_block_emit() {
    let bus: EventBus<u32> = EventBus::with_timeout(Duration::from_millis(100));
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    bus.subscribe(move |_| {
        std::thread::sleep(Duration::from_millis(300));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let started = std::time::Instant::now();
    bus.emit(1);
    assert!(started.elapsed() < Duration::from_millis(100), "emit returns immediately");
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_signal() {
    let shutdown = Shutdown::new();
    let mut signal = shutdown.subscribe();
    let early = signal.clone();
    assert!(!signal.is_shutdown());
    assert!(!shutdown.is_triggered());

    let waiter = tokio::spawn(async move {
        signal.recv().await;
        true
    });
    shutdown.trigger();
    assert!(waiter.await.expect("join"));
    assert!(early.is_shutdown());
    assert!(shutdown.is_triggered());

    let mut late = shutdown.subscribe();
    tokio::time::timeout(Duration::from_millis(100), late.recv())
        .await
        .expect("already triggered resolves at once");
}

#[tokio::test]
async fn test_dropped_shutdown_releases_waiters() {
    let shutdown = Shutdown::new();
    let mut signal = shutdown.subscribe();
    drop(shutdown);
    tokio::time::timeout(Duration::from_millis(100), signal.recv())
        .await
        .expect("sender gone");
}
