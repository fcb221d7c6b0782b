//! Collaborator implementations for Lumina.
//!
//! This crate provides concrete implementations of the boundary traits in
//! `lumina-abstraction`.
//!
//! # Contents
//!
//! - **Gemini**: image generation over the Gemini REST API (API key required)
//! - **Reference loader**: HTTP download of reference images
//! - **Safety filter**: regex/keyword content-safety classification
//! - **Prompts**: category detection and prompt construction
//! - **Mock**: scripted image generator for testing and development

pub mod fetch;
pub mod gemini;
pub mod prompt;
pub mod safety;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lumina_abstraction::{
    GeneratedImage, GenerationError, GenerationOutput, GenerationRequest, ImageGenerator,
};
use tracing::debug;

pub use fetch::HttpReferenceLoader;
pub use gemini::GeminiImageModel;
pub use prompt::{ProductCategory, PromptBuilder};
pub use safety::PatternSafetyFilter;

/// A scripted implementation of [`ImageGenerator`] for tests and dry runs.
///
/// Responses are taken from a queue; once the queue is empty every call
/// returns a small PNG-tagged payload. An optional latency simulates the
/// remote round trip.
#[derive(Debug, Default)]
pub struct MockImageGenerator {
    id: String,
    latency: Duration,
    script: Mutex<VecDeque<Result<GenerationOutput, GenerationError>>>,
    fail_prompts_containing: Option<String>,
    calls: AtomicUsize,
}

impl MockImageGenerator {
    /// Creates a mock with the given model ID that always succeeds.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Sets a simulated latency per call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues a scripted response, consumed in FIFO order.
    #[must_use]
    pub fn with_response(self, response: Result<GenerationOutput, GenerationError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
        self
    }

    /// Makes every call whose prompt contains `needle` fail with a server error.
    #[must_use]
    pub fn failing_prompts_containing(mut self, needle: impl Into<String>) -> Self {
        self.fail_prompts_containing = Some(needle.into());
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The payload returned when no scripted response is queued.
    #[must_use]
    pub fn default_image() -> GeneratedImage {
        GeneratedImage { data: Bytes::from_static(b"\x89PNG mock"), mime_type: "image/png".to_string() }
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(model_id = %self.id, prompt_len = request.prompt.len(), "MockImageGenerator generating");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(needle) = &self.fail_prompts_containing {
            if request.prompt.contains(needle.as_str()) {
                return Err(GenerationError::Server {
                    status: 500,
                    message: format!("forced failure for '{}'", needle),
                });
            }
        }

        let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
        scripted.unwrap_or_else(|| Ok(GenerationOutput::Image(Self::default_image())))
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}
