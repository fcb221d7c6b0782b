//! Boundary abstractions for Lumina.
//!
//! This crate defines the traits and plain data types through which the
//! scheduling core talks to its external collaborators: the image-generation
//! provider, the catalog platform (read and write sides) and the content
//! safety filter.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error returned by an image-generation provider call.
///
/// A content-policy rejection is *not* an error: it is reported as
/// [`GenerationOutput::NoOutput`] because the remote call itself succeeded.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationError {
    /// Network-level failure (connection refused, reset, DNS, ...).
    #[error("Request Error: {0}")]
    Request(String),

    /// The per-request client timeout elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The credential's quota was exhausted (HTTP 429 / RESOURCE_EXHAUSTED).
    #[error("Quota exceeded{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    QuotaExceeded {
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The provider answered with a non-success status.
    #[error("Server Error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The response could not be decoded.
    #[error("Invalid Response: {0}")]
    InvalidResponse(String),

    /// The client could not be built from its credential.
    #[error("Configuration Error: {0}")]
    Configuration(String),
}

impl GenerationError {
    /// Returns `true` for failures that may succeed when tried again later:
    /// transport errors, timeouts, quota signals and 5xx responses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout(_) | Self::QuotaExceeded { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::Configuration(_) => false,
        }
    }

    /// Returns `true` when the provider signalled quota exhaustion.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Reference image sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    /// Raw image bytes.
    pub data: Bytes,
    /// Media type of `data` (e.g. "image/jpeg").
    pub mime_type: String,
}

/// Self-contained payload for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Prompt text.
    pub prompt: String,
    /// Optional reference image; `None` means text-only generation.
    pub reference: Option<ReferenceImage>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    /// Creates a text-only request.
    #[must_use]
    pub fn text(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), reference: None, temperature: None }
    }

    /// Attaches a reference image.
    #[must_use]
    pub fn with_reference(mut self, reference: ReferenceImage) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// An artifact produced by a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Image bytes.
    pub data: Bytes,
    /// Media type of `data`.
    pub mime_type: String,
}

/// Outcome of a generation call that reached the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutput {
    /// The provider produced an image.
    Image(GeneratedImage),
    /// The provider accepted the call but returned no image (content policy).
    NoOutput {
        /// Finish reason or accompanying text, when the provider gave one.
        reason: Option<String>,
    },
}

/// A client able to generate images, bound to a single credential.
///
/// Implementations must be `Send + Sync`; the scheduler shares them across tasks.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Issues one generation request.
    ///
    /// # Errors
    /// Returns a `GenerationError` for transport, quota and server failures.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError>;

    /// Returns the model identifier this client calls.
    fn model_id(&self) -> &str;
}

/// Errors raised by catalog platform calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Network-level failure.
    #[error("Catalog request failed: {0}")]
    Request(String),

    /// The platform throttled the caller.
    #[error("Catalog rate limited")]
    RateLimited,

    /// The platform rejected the input.
    #[error("Catalog rejected request: {}", .0.join("; "))]
    UserErrors(Vec<String>),

    /// An item identifier was malformed.
    #[error("Invalid item id: {0}")]
    InvalidId(String),

    /// The referenced item does not exist.
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Anything else.
    #[error("Catalog error: {0}")]
    Other(String),
}

/// An existing image attached to a catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemImage {
    /// Platform resource id.
    pub id: String,
    /// Public URL of the image.
    pub url: String,
}

/// A catalog item as exposed by the platform's listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Stable item identifier.
    pub id: String,
    /// Item title.
    pub title: String,
    /// Item description (may be empty).
    #[serde(default)]
    pub description: String,
    /// Tag list.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Existing images.
    #[serde(default)]
    pub images: Vec<ItemImage>,
}

impl CatalogItem {
    /// Creates an item with no description, tags or images.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds an existing image.
    #[must_use]
    pub fn with_image(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.images.push(ItemImage { id: id.into(), url: url.into() });
        self
    }

    /// Returns `true` if the item carries `tag` (case-insensitive).
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Returns the trailing segment of the id (`gid://x/Product/42` -> `42`).
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// URL of the first existing image, used as generation reference.
    #[must_use]
    pub fn primary_image_url(&self) -> Option<&str> {
        self.images.first().map(|img| img.url.as_str()).filter(|url| !url.is_empty())
    }
}

/// One page of a paginated item listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPage {
    /// Items on this page.
    pub items: Vec<CatalogItem>,
    /// Cursor for the next page, `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Read side of the catalog platform.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Fetches one page of items starting after `cursor`.
    async fn list_items(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ItemPage, CatalogError>;
}

/// Loads reference resources (e.g. an item's existing photo) before generation.
#[async_trait]
pub trait ReferenceLoader: Send + Sync {
    /// Fetches the resource at `url`.
    ///
    /// Returns `None` when the resource cannot be loaded; callers degrade to
    /// text-only generation rather than failing.
    async fn load(&self, url: &str) -> Option<ReferenceImage>;
}

/// Descriptor returned by the staging step of a staged upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedTarget {
    /// Where to transfer the bytes.
    pub url: String,
    /// Resource reference to pass to the commit step.
    pub resource_url: String,
    /// Form parameters that must accompany the transfer.
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

/// Write side of the catalog platform.
#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Step 1: requests a staging target for a file.
    async fn create_staged_upload(
        &self,
        filename: &str,
        mime_type: &str,
    ) -> Result<StagedTarget, CatalogError>;

    /// Step 2: transfers the bytes to the staging target.
    async fn transfer(
        &self,
        target: &StagedTarget,
        data: &Bytes,
        mime_type: &str,
        filename: &str,
    ) -> Result<(), CatalogError>;

    /// Step 3: attaches the staged resource to an item; returns the new image URL.
    async fn commit(
        &self,
        item_id: &str,
        resource_url: &str,
        alt_text: &str,
    ) -> Result<String, CatalogError>;

    /// Removes images from an item.
    async fn delete_images(&self, item_id: &str, image_ids: &[String]) -> Result<(), CatalogError>;

    /// Adds a tag to an item.
    async fn add_tag(&self, item_id: &str, tag: &str) -> Result<(), CatalogError>;
}

/// Verdict of the content-safety filter for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    /// Whether the item may be sent to the generator.
    pub is_safe: bool,
    /// Human-readable reason ("safe" when allowed).
    pub reason: String,
}

impl SafetyVerdict {
    /// An allowing verdict.
    #[must_use]
    pub fn safe() -> Self {
        Self { is_safe: true, reason: "safe".to_string() }
    }

    /// A blocking verdict with the given reason.
    #[must_use]
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self { is_safe: false, reason: reason.into() }
    }
}

/// Pure classification of an item before any generation work is scheduled.
pub trait SafetyFilter: Send + Sync {
    /// Checks one item.
    fn check(&self, item: &CatalogItem) -> SafetyVerdict;
}
