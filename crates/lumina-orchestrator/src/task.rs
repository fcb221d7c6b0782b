//! Generation tasks and their results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lumina_abstraction::{
    CatalogItem, GeneratedImage, GenerationRequest, ReferenceImage, ReferenceLoader,
};
use lumina_models::{ProductCategory, PromptBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Classification of a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider declined to produce output. Never retried.
    ContentPolicy,
    /// Transport, timeout, 5xx or quota failure.
    Transient,
    /// Non-retryable provider or input failure.
    Permanent,
    /// Upload staging target could not be created.
    Stage,
    /// Bytes could not be transferred to the staging target.
    Transfer,
    /// Staged resource could not be attached to the item.
    Commit,
    /// The unit of work panicked.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ContentPolicy => "content_policy",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Stage => "stage",
            Self::Transfer => "transfer",
            Self::Commit => "commit",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Why a unit of work failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl TaskFailure {
    /// Creates a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One image variant for one catalog item.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier, `<item short id>-v<variant>`.
    pub id: String,
    /// Parent item identifier.
    pub group_id: String,
    /// Variant index within the group.
    pub variant_index: usize,
    /// Parent item.
    pub item: Arc<CatalogItem>,
    /// Category resolved once for the parent item.
    pub category: ProductCategory,
    /// Reference resource to download before generating.
    pub reference_url: Option<String>,
    /// Pre-fetched reference; skips the download when set.
    pub reference: Option<ReferenceImage>,
}

impl Task {
    /// Creates a task for one variant of `item`.
    pub fn new(item: Arc<CatalogItem>, category: ProductCategory, variant_index: usize) -> Self {
        Self {
            id: format!("{}-v{}", item.short_id(), variant_index + 1),
            group_id: item.id.clone(),
            variant_index,
            reference_url: item.primary_image_url().map(str::to_string),
            reference: None,
            category,
            item,
        }
    }

    /// Expands an item into `variants` tasks, detecting its category once.
    pub fn expand(item: Arc<CatalogItem>, variants: usize) -> Vec<Self> {
        let category = ProductCategory::detect(&item);
        (0..variants).map(|v| Self::new(Arc::clone(&item), category, v)).collect()
    }

    /// Attaches a pre-fetched reference.
    #[must_use]
    pub fn with_reference(mut self, reference: ReferenceImage) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Reference locator for `attempt` (zero-based).
    ///
    /// The first attempt uses `reference_url`; retries rotate through the
    /// item's other photos, wrapping around.
    pub fn reference_url_for(&self, attempt: u32) -> Option<&str> {
        let primary = self.reference_url.as_deref()?;
        let mut candidates = vec![primary];
        candidates.extend(
            self.item
                .images
                .iter()
                .map(|image| image.url.as_str())
                .filter(|url| !url.is_empty() && *url != primary),
        );
        Some(candidates[attempt as usize % candidates.len()])
    }

    /// Label reported to progress callbacks.
    pub fn label(&self) -> String {
        format!("{} (variant {})", self.item.title, self.variant_index + 1)
    }
}

/// Outcome of one task. Exactly one of `image` and `failure` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// Task identifier.
    pub task_id: String,
    /// Parent item identifier.
    pub group_id: String,
    /// Variant index within the group.
    pub variant_index: usize,
    /// Generated artifact on success.
    pub image: Option<GeneratedImage>,
    /// Failure on error.
    pub failure: Option<TaskFailure>,
    /// Credential that served the final attempt.
    pub credential: Option<String>,
    /// Whether the final attempt carried a reference image.
    pub used_reference: bool,
    /// Reference locator of the final attempt.
    pub reference_url: Option<String>,
    /// Attempts made.
    pub attempts: u32,
    /// Wall-clock time from dispatch to result.
    pub elapsed: Duration,
}

impl TaskResult {
    /// Successful result.
    pub fn success(task: &Task, image: GeneratedImage) -> Self {
        Self { image: Some(image), ..Self::blank(task) }
    }

    /// Failed result.
    pub fn failure(task: &Task, failure: TaskFailure) -> Self {
        Self { failure: Some(failure), ..Self::blank(task) }
    }

    fn blank(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            group_id: task.group_id.clone(),
            variant_index: task.variant_index,
            image: None,
            failure: None,
            credential: None,
            used_reference: false,
            reference_url: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether an image was produced.
    pub fn is_success(&self) -> bool {
        self.image.is_some()
    }

    /// Failure kind, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Turns a [`Task`] into a self-contained [`GenerationRequest`].
pub struct TaskGenerator {
    prompts: PromptBuilder,
    loader: Arc<dyn ReferenceLoader>,
    temperature: Option<f32>,
}

impl fmt::Debug for TaskGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGenerator").field("temperature", &self.temperature).finish_non_exhaustive()
    }
}

impl TaskGenerator {
    /// Creates a generator that downloads references through `loader`.
    pub fn new(loader: Arc<dyn ReferenceLoader>) -> Self {
        Self { prompts: PromptBuilder::new(), loader, temperature: None }
    }

    /// Sets the sampling temperature on every request.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Builds the request for a first attempt.
    pub async fn prepare(&self, task: &Task) -> GenerationRequest {
        self.prepare_attempt(task, 0).await
    }

    /// Builds the request for `attempt`, fetching the rotated reference if
    /// needed.
    ///
    /// A reference that cannot be fetched degrades the request to text-only.
    pub async fn prepare_attempt(&self, task: &Task, attempt: u32) -> GenerationRequest {
        let url = task.reference_url_for(attempt);
        let prefetched = task.reference.as_ref().filter(|_| url == task.reference_url.as_deref());
        let reference = match (prefetched, url) {
            (Some(reference), _) => Some(reference.clone()),
            (None, Some(url)) => {
                let loaded = self.loader.load(url).await;
                if loaded.is_none() {
                    debug!(task_id = %task.id, url = %url, "Reference unavailable, generating text-only");
                }
                loaded
            }
            (None, None) => None,
        };

        let prompt =
            self.prompts.build(&task.item, task.category, task.variant_index, reference.is_some());
        let mut request = GenerationRequest::text(prompt);
        if let Some(reference) = reference {
            request = request.with_reference(reference);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        available: bool,
    }

    #[async_trait]
    impl ReferenceLoader for CountingLoader {
        async fn load(&self, _url: &str) -> Option<ReferenceImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.available.then(|| ReferenceImage {
                data: Bytes::from_static(b"ref"),
                mime_type: "image/jpeg".to_string(),
            })
        }
    }

    fn item() -> Arc<CatalogItem> {
        Arc::new(
            CatalogItem::new("gid://shopify/Product/42", "Linen Shirt")
                .with_image("img-1", "https://cdn.test/shirt.jpg"),
        )
    }

    #[test]
    fn test_expand_assigns_ids_and_category() {
        let tasks = Task::expand(item(), 2);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "42-v1");
        assert_eq!(tasks[1].id, "42-v2");
        assert!(tasks.iter().all(|t| t.category == ProductCategory::Apparel));
        assert!(tasks.iter().all(|t| t.group_id == "gid://shopify/Product/42"));
        assert_eq!(tasks[0].reference_url.as_deref(), Some("https://cdn.test/shirt.jpg"));
    }

    #[tokio::test]
    async fn test_prepare_downloads_reference() {
        let loader = Arc::new(CountingLoader { available: true, ..Default::default() });
        let generator = TaskGenerator::new(loader.clone()).with_temperature(0.5);
        let request = generator.prepare(&Task::expand(item(), 1)[0]).await;

        assert!(request.reference.is_some());
        assert!(request.prompt.contains("reference image"));
        assert_eq!(request.temperature, Some(0.5));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prepare_degrades_to_text_only() {
        let loader = Arc::new(CountingLoader::default());
        let generator = TaskGenerator::new(loader.clone());
        let request = generator.prepare(&Task::expand(item(), 1)[0]).await;

        assert!(request.reference.is_none());
        assert!(!request.prompt.contains("reference image"));
    }

    #[tokio::test]
    async fn test_prefetched_reference_skips_download() {
        let loader = Arc::new(CountingLoader { available: true, ..Default::default() });
        let generator = TaskGenerator::new(loader.clone());
        let task = Task::expand(item(), 1).remove(0).with_reference(ReferenceImage {
            data: Bytes::from_static(b"pre"),
            mime_type: "image/png".to_string(),
        });

        let request = generator.prepare(&task).await;
        assert_eq!(request.reference.unwrap().data.as_ref(), b"pre");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reference_rotates_through_item_photos() {
        let item = Arc::new(
            CatalogItem::new("gid://shopify/Product/7", "Canvas Tote")
                .with_image("img-1", "https://cdn.test/front.jpg")
                .with_image("img-2", "")
                .with_image("img-3", "https://cdn.test/side.jpg"),
        );
        let task = Task::expand(item, 1).remove(0);

        assert_eq!(task.reference_url_for(0), Some("https://cdn.test/front.jpg"));
        assert_eq!(task.reference_url_for(1), Some("https://cdn.test/side.jpg"));
        assert_eq!(task.reference_url_for(2), Some("https://cdn.test/front.jpg"));

        let bare = Task::expand(Arc::new(CatalogItem::new("9", "Mug")), 1).remove(0);
        assert_eq!(bare.reference_url_for(3), None);
    }

    #[tokio::test]
    async fn test_retry_attempt_loads_rotated_reference() {
        let loader = Arc::new(CountingLoader { available: true, ..Default::default() });
        let generator = TaskGenerator::new(loader.clone());
        let item = Arc::new(
            CatalogItem::new("gid://shopify/Product/7", "Canvas Tote")
                .with_image("img-1", "https://cdn.test/front.jpg")
                .with_image("img-2", "https://cdn.test/side.jpg"),
        );
        let task = Task::expand(item, 1).remove(0).with_reference(ReferenceImage {
            data: Bytes::from_static(b"pre"),
            mime_type: "image/png".to_string(),
        });

        let first = generator.prepare_attempt(&task, 0).await;
        assert_eq!(first.reference.unwrap().data.as_ref(), b"pre");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);

        let retry = generator.prepare_attempt(&task, 1).await;
        assert_eq!(retry.reference.unwrap().data.as_ref(), b"ref");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }
}
