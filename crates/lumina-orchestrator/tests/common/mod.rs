//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lumina_abstraction::{
    CatalogError, CatalogItem, CatalogReader, CatalogWriter, ItemPage, ReferenceImage,
    ReferenceLoader, StagedTarget,
};
use lumina_models::MockImageGenerator;
use lumina_orchestrator::config::LimitsConfig;
use lumina_orchestrator::{
    BatchScheduler, CredentialConfig, QuotaTier, SchedulerSettings, TaskGenerator, Worker,
    WorkerPool,
};
use lumina_orchestrator::worker::Credential;

/// Reference loader that always has the same small image.
pub struct StaticReferences;

#[async_trait]
impl ReferenceLoader for StaticReferences {
    async fn load(&self, _url: &str) -> Option<ReferenceImage> {
        Some(ReferenceImage { data: Bytes::from_static(b"ref"), mime_type: "image/jpeg".to_string() })
    }
}

/// Reference loader that records every locator it is asked for.
#[derive(Default)]
pub struct RecordingReferences {
    pub urls: Mutex<Vec<String>>,
}

#[async_trait]
impl ReferenceLoader for RecordingReferences {
    async fn load(&self, url: &str) -> Option<ReferenceImage> {
        self.urls.lock().unwrap().push(url.to_string());
        Some(ReferenceImage { data: Bytes::from(url.as_bytes().to_vec()), mime_type: "image/jpeg".to_string() })
    }
}

/// Builds a pool of mock-backed workers.
///
/// Returns the generators in the same order so tests can count calls.
pub fn mock_pool(
    credentials: &[(&str, QuotaTier, u32)],
    limits: &LimitsConfig,
    latency: Duration,
) -> (Arc<WorkerPool>, Vec<Arc<MockImageGenerator>>) {
    let mut workers = Vec::new();
    let mut generators = Vec::new();
    for (id, tier, ceiling) in credentials {
        let config = CredentialConfig::inline(*id, *tier, "secret").with_ceiling(*ceiling);
        let generator = Arc::new(MockImageGenerator::new(*id).with_latency(latency));
        workers.push(Worker::new(Credential::from_config(&config, limits), generator.clone()));
        generators.push(generator);
    }
    (Arc::new(WorkerPool::new(workers, limits.window()).unwrap()), generators)
}

/// Scheduler over `pool` with the default settings.
pub fn scheduler(pool: Arc<WorkerPool>) -> BatchScheduler {
    BatchScheduler::new(
        pool,
        Arc::new(TaskGenerator::new(Arc::new(StaticReferences))),
        SchedulerSettings::default(),
    )
}

/// Limits with no safety margin and a one-second spacing for `ceiling = 60`.
pub fn fast_limits() -> LimitsConfig {
    LimitsConfig { window_secs: 60, safety_margin_ms: 0 }
}

pub fn item(n: u64, title: &str) -> CatalogItem {
    CatalogItem::new(format!("gid://shopify/Product/{}", n), title)
        .with_image(format!("gid://shopify/ProductImage/{}", n * 10), format!("https://cdn.test/{}.jpg", n))
}

/// In-memory catalog platform: paginated reads and recorded writes.
#[derive(Default)]
pub struct InMemoryCatalog {
    pub items: Vec<CatalogItem>,
    pub fail_listing: bool,
    pub list_calls: AtomicUsize,
    pub staged: AtomicUsize,
    /// Filenames whose transfer fails.
    pub failing_transfers: HashSet<String>,
    pub transfers: Mutex<Vec<String>>,
    pub commits: Mutex<Vec<(String, String)>>,
    pub deletions: Mutex<Vec<(String, Vec<String>)>>,
    pub tags: Mutex<Vec<(String, String)>>,
}

impl InMemoryCatalog {
    pub fn with_items(items: Vec<CatalogItem>) -> Self {
        Self { items, ..Self::default() }
    }
}

#[async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn list_items(&self, cursor: Option<&str>, page_size: usize) -> Result<ItemPage, CatalogError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing {
            return Err(CatalogError::Request("connection refused".to_string()));
        }
        let start: usize = cursor.map_or(0, |c| c.parse().unwrap_or(0));
        let end = (start + page_size).min(self.items.len());
        Ok(ItemPage {
            items: self.items[start..end].to_vec(),
            next_cursor: (end < self.items.len()).then(|| end.to_string()),
        })
    }
}

#[async_trait]
impl CatalogWriter for InMemoryCatalog {
    async fn create_staged_upload(&self, filename: &str, _mime_type: &str) -> Result<StagedTarget, CatalogError> {
        let n = self.staged.fetch_add(1, Ordering::SeqCst);
        Ok(StagedTarget {
            url: "https://staging.test/upload".to_string(),
            resource_url: format!("https://staging.test/{}/{}", n, filename),
            parameters: vec![("key".to_string(), filename.to_string())],
        })
    }

    async fn transfer(
        &self,
        _target: &StagedTarget,
        _data: &Bytes,
        _mime_type: &str,
        filename: &str,
    ) -> Result<(), CatalogError> {
        self.transfers.lock().unwrap().push(filename.to_string());
        if self.failing_transfers.contains(filename) {
            return Err(CatalogError::Request(format!("{} rejected by storage", filename)));
        }
        Ok(())
    }

    async fn commit(&self, item_id: &str, resource_url: &str, _alt_text: &str) -> Result<String, CatalogError> {
        self.commits.lock().unwrap().push((item_id.to_string(), resource_url.to_string()));
        Ok(format!("https://cdn.test/committed/{}", self.commits.lock().unwrap().len()))
    }

    async fn delete_images(&self, item_id: &str, image_ids: &[String]) -> Result<(), CatalogError> {
        self.deletions.lock().unwrap().push((item_id.to_string(), image_ids.to_vec()));
        Ok(())
    }

    async fn add_tag(&self, item_id: &str, tag: &str) -> Result<(), CatalogError> {
        self.tags.lock().unwrap().push((item_id.to_string(), tag.to_string()));
        Ok(())
    }
}
