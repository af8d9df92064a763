use std::sync::Arc;

use klaxon_controllers::WorkQueue;

#[tokio::test]
async fn deduplicates_pending_keys() {
    let queue = WorkQueue::new("test");
    queue.add("ns/a");
    queue.add("ns/a");
    queue.add("ns/b");
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
}

#[tokio::test]
async fn readd_during_processing_is_deferred_until_done() {
    let queue = WorkQueue::new("test");
    queue.add("ns/a");
    let key = queue.get().await.unwrap();

    // the key is being processed; a re-add must not hand it out concurrently
    queue.add(&key);
    assert!(queue.is_empty());

    queue.done(&key);
    assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
}

#[tokio::test]
async fn waiters_wake_up_on_add() {
    let queue = Arc::new(WorkQueue::new("test"));
    let waiter = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.get().await }
    });
    tokio::task::yield_now().await;
    queue.add("ns/a");
    assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/a"));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_keys_come_back() {
    let queue = Arc::new(WorkQueue::new("test"));
    queue.add("ns/a");
    let key = queue.get().await.unwrap();
    queue.add_rate_limited(&key);
    queue.done(&key);
    // paused clock auto-advances through the backoff sleep
    assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    queue.forget(&key);
}

#[tokio::test]
async fn shutdown_drains_then_closes() {
    let queue = WorkQueue::new("test");
    queue.add("ns/a");
    queue.add("ns/b");
    queue.shutdown();
    // adds after shutdown are discarded
    queue.add("ns/c");

    assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
    assert_eq!(queue.get().await, None);
    assert_eq!(queue.get().await, None);
}

#[tokio::test]
async fn shutdown_wakes_blocked_getters() {
    let queue = Arc::new(WorkQueue::new("test"));
    let waiter = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.get().await }
    });
    tokio::task::yield_now().await;
    queue.shutdown();
    assert_eq!(waiter.await.unwrap(), None);
}
