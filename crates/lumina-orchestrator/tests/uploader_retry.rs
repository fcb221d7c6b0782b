//! Staged-upload retry, rotation and failure classification.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use common::InMemoryCatalog;
use lumina_orchestrator::{Artifact, FailureKind, ResultUploader, RetryPolicy, UploadItem};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn artifact(name: &str) -> Artifact {
    Artifact { data: Bytes::from_static(b"png"), mime_type: "image/png".to_string(), filename: name.to_string() }
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30), 2.0)
}

#[tokio::test(start_paused = true)]
async fn test_retry_rotates_to_a_working_artifact() {
    let catalog = Arc::new(InMemoryCatalog {
        failing_transfers: ["a.png", "b.png"].iter().map(|s| (*s).to_string()).collect(),
        ..InMemoryCatalog::default()
    });
    let uploader = ResultUploader::new(catalog.clone(), 2, policy());
    let item = UploadItem::new("1001", artifact("a.png"), "Mug photo")
        .with_alternate(artifact("b.png"))
        .with_alternate(artifact("c.png"));

    let start = Instant::now();
    let result = uploader.upload_one(&item).await;

    assert!(result.is_success());
    assert_eq!(result.attempts, 3);
    assert!(result.artifacts_tried >= 2);
    assert_eq!(result.filename, "c.png");
    assert_eq!(*catalog.transfers.lock().unwrap(), vec!["a.png", "b.png", "c.png"]);
    // Backoff of 1s then 2s between the three attempts.
    assert!(start.elapsed() >= Duration::from_secs(3));

    let commits = catalog.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, "gid://shopify/Product/1001");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_step_failure() {
    let catalog = Arc::new(InMemoryCatalog {
        failing_transfers: ["only.png".to_string()].into_iter().collect(),
        ..InMemoryCatalog::default()
    });
    let uploader = ResultUploader::new(catalog.clone(), 1, policy());

    let result = uploader.upload_one(&UploadItem::new("7", artifact("only.png"), "alt")).await;
    assert!(!result.is_success());
    assert_eq!(result.attempts, 4);
    assert_eq!(result.artifacts_tried, 1);

    let failure = result.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Transfer);
    assert!(failure.message.starts_with("transfer failed"));
    // Staged targets are abandoned, never committed.
    assert_eq!(catalog.staged.load(Ordering::SeqCst), 4);
    assert!(catalog.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_item_id_is_not_retried() {
    let catalog = Arc::new(InMemoryCatalog::default());
    let uploader = ResultUploader::new(catalog.clone(), 1, policy());

    let result = uploader.upload_one(&UploadItem::new("not-a-product", artifact("x.png"), "alt")).await;
    assert_eq!(result.failure.unwrap().kind, FailureKind::Permanent);
    assert_eq!(result.attempts, 0);
    assert_eq!(catalog.staged.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_isolates_failures_and_keeps_order() {
    let catalog = Arc::new(InMemoryCatalog {
        failing_transfers: ["2_ai_1.png".to_string()].into_iter().collect(),
        ..InMemoryCatalog::default()
    });
    let uploader = ResultUploader::new(catalog.clone(), 2, RetryPolicy::none());
    let items: Vec<UploadItem> = (1..=4)
        .map(|n| UploadItem::new(n.to_string(), artifact(&format!("{}_ai_1.png", n)), "alt"))
        .collect();

    let results = uploader.upload_all(items, &CancellationToken::new(), None).await;
    let ids: Vec<&str> = results.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);
    assert!(!results[1].is_success());
}

#[tokio::test]
async fn test_cancelled_batch_uploads_nothing() {
    let catalog = Arc::new(InMemoryCatalog::default());
    let uploader = ResultUploader::new(catalog.clone(), 2, RetryPolicy::none());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = uploader.upload_all(vec![UploadItem::new("1", artifact("a.png"), "alt")], &cancel, None).await;
    assert!(results.is_empty());
    assert_eq!(catalog.staged.load(Ordering::SeqCst), 0);
}
