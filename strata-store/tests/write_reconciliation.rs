//! Local writes, remote posting and recovery after failed syncs.

use std::sync::Arc;

use strata_store::{
    Bookkeeper, InMemoryBookkeeper, InMemorySourceOfTruth, MutableStore, Store,
    StoreWriteRequest, StoreWriteResponse,
};
use strata_test_utils::fixtures::{a_then_b, init_test_tracing};
use strata_test_utils::RecordingUpdater;

fn store_with_disk() -> (Store<u32, String>, Arc<InMemorySourceOfTruth<u32, String>>) {
    let sot = Arc::new(InMemorySourceOfTruth::one_shot());
    let store = Store::builder(a_then_b())
        .source_of_truth(Arc::clone(&sot))
        .build()
        .unwrap();
    (store, sot)
}

#[tokio::test]
async fn write_reaches_every_tier_and_the_remote() {
    init_test_tracing();
    let (store, sot) = store_with_disk();
    let updater = Arc::new(RecordingUpdater::<u32, String>::accepting());
    let mutable = MutableStore::new(store, Arc::clone(&updater));

    let response = mutable
        .write(StoreWriteRequest::of(1, "local".to_string()))
        .await;
    assert_eq!(response, StoreWriteResponse::Success(1));
    assert_eq!(updater.posts(), vec![(1, "local".to_string())]);
    assert_eq!(sot.peek(&1), Some("local".to_string()));
    assert_eq!(mutable.get(1).await.unwrap(), "local");
    assert_eq!(mutable.pending_writes(&1), 0);
}

#[tokio::test]
async fn failed_sync_is_retried_before_the_next_read() {
    init_test_tracing();
    let (store, _sot) = store_with_disk();
    let updater = Arc::new(RecordingUpdater::<u32, String>::rejecting());
    let bookkeeper = Arc::new(InMemoryBookkeeper::<u32>::new());
    let mutable = MutableStore::builder(store, Arc::clone(&updater))
        .bookkeeper(Arc::clone(&bookkeeper))
        .build();

    let response = mutable
        .write(StoreWriteRequest::of(1, "offline edit".to_string()))
        .await;
    assert!(!response.is_success());
    assert_eq!(mutable.pending_writes(&1), 1);
    assert!(bookkeeper.last_failed_sync(&1).await.unwrap().is_some());

    updater.set_accepting(true);
    assert_eq!(mutable.get(1).await.unwrap(), "offline edit");
    assert_eq!(mutable.pending_writes(&1), 0);
    assert_eq!(bookkeeper.last_failed_sync(&1).await.unwrap(), None);
    assert_eq!(
        updater.posts(),
        vec![
            (1, "offline edit".to_string()),
            (1, "offline edit".to_string())
        ]
    );
}

#[tokio::test]
async fn cancelled_submit_leaves_write_queued() {
    init_test_tracing();
    let (store, _sot) = store_with_disk();
    let updater = Arc::new(RecordingUpdater::<u32, String>::accepting());
    let mutable = MutableStore::new(store, Arc::clone(&updater));

    // The background task cannot start before this test yields.
    let pending = mutable
        .submit(StoreWriteRequest::of(1, "queued".to_string()))
        .await
        .unwrap();
    pending.cancel();
    assert!(!pending.outcome().await.is_success());
    assert_eq!(updater.post_count(), 0);
    assert_eq!(mutable.pending_writes(&1), 1);

    assert_eq!(mutable.get(1).await.unwrap(), "queued");
    assert_eq!(mutable.pending_writes(&1), 0);
    assert_eq!(updater.post_count(), 1);
}

#[tokio::test]
async fn clear_drops_local_state_and_pending_writes() {
    init_test_tracing();
    let (store, sot) = store_with_disk();
    let updater = Arc::new(RecordingUpdater::<u32, String>::rejecting());
    let mutable = MutableStore::new(store, Arc::clone(&updater));

    let _ = mutable
        .write(StoreWriteRequest::of(1, "unsynced".to_string()))
        .await;
    assert_eq!(mutable.pending_writes(&1), 1);

    mutable.clear(&1).await.unwrap();
    assert_eq!(mutable.pending_writes(&1), 0);
    assert_eq!(sot.peek(&1), None);

    // Nothing pending, so the next read fetches.
    assert_eq!(mutable.get(1).await.unwrap(), "A");
    assert_eq!(updater.post_count(), 1);
}
