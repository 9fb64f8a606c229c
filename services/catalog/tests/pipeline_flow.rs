mod common;

use chrono::Utc;
use common::{Harness, StubObjectStore};
use shutter_catalog::{NotificationKind, RecordStore};
use shutter_pipeline::QueueConfig;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_upload_is_recorded_and_announced() {
    let harness = Harness::new();

    harness.object_created("summer+trip.png").await;
    harness.settle().await;

    let record = harness.store.get("summer trip.png").await.unwrap().unwrap();
    assert_eq!(record.origin, "images");
    assert!(record.description.is_none());

    let accepted: Vec<_> = harness
        .notifier
        .messages()
        .into_iter()
        .filter(|m| m.kind == NotificationKind::UploadAccepted)
        .collect();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].text.contains("s3://images/summer trip.png"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_created_event_yields_one_record() {
    let harness = Harness::new();

    harness.object_created("a.png").await;
    harness.object_created("a.png").await;
    harness.settle().await;

    assert_eq!(harness.store.len(), 1);
    assert_eq!(harness.notifier.count(NotificationKind::UploadRejected), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reapplied_upload_refreshes_processed_at() {
    let harness = Harness::new();

    harness.object_created("a.png").await;
    harness.settle().await;
    let first = harness.store.get("a.png").await.unwrap().unwrap();

    let before_second = Utc::now();
    harness.object_created("a.png").await;
    harness.settle().await;
    let second = harness.store.get("a.png").await.unwrap().unwrap();

    assert_eq!(harness.store.len(), 1);
    assert!(first.processed_at <= before_second);
    assert!(second.processed_at >= before_second);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_file_type_is_rejected_once() {
    let harness = Harness::new();

    harness.object_created("doc.pdf").await;
    harness.settle().await;

    assert!(harness.store.get("doc.pdf").await.unwrap().is_none());
    assert_eq!(harness.notifier.count_for(NotificationKind::UploadRejected, "doc.pdf"), 1);
    assert_eq!(harness.notifier.count(NotificationKind::UploadAccepted), 0);
    assert_eq!(harness.objects.head_calls(), 0);
    assert!(harness.catalog.dead_letter_queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_caption_updates_reach_the_record() {
    let harness = Harness::new();

    harness.object_created("a.png").await;
    harness.settle().await;

    harness.caption("a.png", "Ignored", "Other").await;
    harness.settle().await;
    assert!(harness.store.get("a.png").await.unwrap().unwrap().description.is_none());

    harness.caption("a.png", "Sunset", "Caption").await;
    harness.settle().await;

    let record = harness.store.get("a.png").await.unwrap().unwrap();
    assert_eq!(record.description.as_deref(), Some("Sunset"));
    assert_eq!(harness.notifier.count(NotificationKind::DescriptionUpdated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reprocessing_keeps_caption() {
    let harness = Harness::new();

    harness.object_created("a.png").await;
    harness.settle().await;
    harness.caption("a.png", "Sunset", "Caption").await;
    harness.object_created("a.png").await;
    harness.settle().await;

    let record = harness.store.get("a.png").await.unwrap().unwrap();
    assert_eq!(record.description.as_deref(), Some("Sunset"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_key_update_is_dropped() {
    let harness = Harness::new();

    harness.caption("ghost.png", "Sunset", "Caption").await;
    harness.settle().await;

    assert!(harness.store.is_empty());
    assert!(harness.notifier.messages().is_empty());

    // The worker keeps serving later events
    harness.object_created("a.png").await;
    harness.settle().await;
    harness.caption("a.png", "Sunset", "Caption").await;
    harness.settle().await;
    assert_eq!(harness.notifier.count(NotificationKind::DescriptionUpdated), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_deletion_is_announced_once() {
    let harness = Harness::new();

    harness.object_created("a.png").await;
    harness.object_created("b.png").await;
    harness.settle().await;

    harness.object_removed("a.png").await;
    harness.object_removed("a.png").await;
    harness.settle().await;

    assert!(harness.store.get("a.png").await.unwrap().is_none());
    assert_eq!(harness.notifier.count_for(NotificationKind::RecordDeleted, "a.png"), 1);

    // Removal outside the pipeline is announced too
    harness.store.delete("b.png").await.unwrap();
    harness.settle().await;
    assert_eq!(harness.notifier.count_for(NotificationKind::RecordDeleted, "b.png"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_upload_is_retried_then_dead_lettered() {
    let harness = Harness::with_objects(StubObjectStore::unavailable());

    harness.object_created("a.png").await;
    harness.settle().await;

    assert_eq!(harness.objects.head_calls(), 2);
    assert!(harness.store.is_empty());
    assert!(harness.catalog.process_queue().is_empty());
    assert_eq!(harness.notifier.count_for(NotificationKind::UploadRejected, "a.png"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_object_is_dropped() {
    let objects = StubObjectStore::default();
    objects.remove("gone.png");
    let harness = Harness::with_objects(objects);

    harness.object_created("gone.png").await;
    harness.settle().await;

    assert_eq!(harness.objects.head_calls(), 1);
    assert!(harness.store.is_empty());
    assert!(harness.notifier.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queued_uploads() {
    let harness = Harness::with_queue(&QueueConfig::default());

    harness.object_created("a.png").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(harness.stop(Duration::from_secs(10)).await);

    assert!(harness.store.get("a.png").await.unwrap().is_some());
    assert_eq!(harness.notifier.count_for(NotificationKind::UploadAccepted, "a.png"), 1);
    assert!(harness.catalog.queue_stats().iter().all(|stats| stats.total == 0));
}
