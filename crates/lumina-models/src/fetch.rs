//! Reference-resource download over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use lumina_abstraction::{GenerationError, ReferenceImage, ReferenceLoader};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

/// Downloads reference images with a bounded timeout.
///
/// Any failure (transport, non-200, empty body) yields `None` so the caller
/// can fall back to text-only generation.
#[derive(Debug, Clone)]
pub struct HttpReferenceLoader {
    client: Client,
}

impl HttpReferenceLoader {
    /// Creates a loader whose requests time out after `timeout`.
    ///
    /// # Errors
    /// Returns `GenerationError::Configuration` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            GenerationError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { client })
    }
}

/// Guesses an image media type from a URL path, defaulting to JPEG.
pub fn guess_mime_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

#[async_trait]
impl ReferenceLoader for HttpReferenceLoader {
    async fn load(&self, url: &str) -> Option<ReferenceImage> {
        if url.is_empty() {
            return None;
        }

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Reference download failed");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Reference download returned error status");
            return None;
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"))
            .unwrap_or_else(|| guess_mime_type(url).to_string());

        match response.bytes().await {
            Ok(data) if !data.is_empty() => {
                debug!(url = %url, bytes = data.len(), "Downloaded reference image");
                Some(ReferenceImage { data, mime_type })
            }
            Ok(_) => {
                warn!(url = %url, "Reference download returned an empty body");
                None
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to read reference body");
                None
            }
        }
    }
}
