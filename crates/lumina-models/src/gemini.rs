//! Google Gemini image-generation client.
//!
//! Implements [`ImageGenerator`] against the `generateContent` endpoint with
//! `responseModalities = ["IMAGE", "TEXT"]`. One client is bound to exactly
//! one API key; the scheduler builds one per credential.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use lumina_abstraction::{
    GeneratedImage, GenerationError, GenerationOutput, GenerationRequest, ImageGenerator,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Default Gemini API base URL.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default image-capable model.
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-exp-image-generation";

/// Gemini image model bound to one API key.
#[derive(Debug, Clone)]
pub struct GeminiImageModel {
    /// The model ID (e.g. "gemini-2.0-flash-exp-image-generation").
    model_id: String,
    /// The API key for authentication.
    api_key: String,
    /// The base URL for the Gemini API.
    base_url: String,
    /// HTTP client with the per-request timeout applied.
    client: Client,
}

impl GeminiImageModel {
    /// Creates a client for `model_id` authenticated with `api_key`.
    ///
    /// # Errors
    /// Returns `GenerationError::Configuration` if the key is blank or the
    /// HTTP client cannot be constructed.
    pub fn new(
        model_id: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(GenerationError::Configuration("API key is empty".to_string()));
        }
        if api_key.chars().any(char::is_whitespace) {
            return Err(GenerationError::Configuration(
                "API key contains whitespace".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            GenerationError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self { model_id: model_id.into(), api_key, base_url: DEFAULT_BASE_URL.to_string(), client })
    }

    /// Overrides the API base URL (used for proxies and tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(request: &GenerationRequest) -> GeminiRequest {
        let mut parts = Vec::with_capacity(2);
        if let Some(reference) = &request.reference {
            parts.push(GeminiRequestPart::InlineData {
                inline_data: GeminiInlineData {
                    mime_type: reference.mime_type.clone(),
                    data: STANDARD.encode(&reference.data),
                },
            });
        }
        parts.push(GeminiRequestPart::Text { text: request.prompt.clone() });

        GeminiRequest {
            contents: vec![GeminiRequestContent { role: "user".to_string(), parts }],
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                response_modalities: vec!["IMAGE".to_string(), "TEXT".to_string()],
            },
        }
    }

    fn map_error_status(status: StatusCode, body: String) -> GenerationError {
        let upper = body.to_uppercase();
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::PAYMENT_REQUIRED
            || upper.contains("RESOURCE_EXHAUSTED")
        {
            return GenerationError::QuotaExceeded { message: Some(body) };
        }
        GenerationError::Server { status: status.as_u16(), message: body }
    }

    /// Picks the first inline image out of a decoded response, or explains
    /// why there is none.
    fn extract_output(response: GeminiResponse) -> Result<GenerationOutput, GenerationError> {
        let mut reason = response.prompt_feedback.and_then(|f| f.block_reason);

        for candidate in response.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(inline) = part.inline_data {
                        if inline.data.is_empty() {
                            continue;
                        }
                        let data = STANDARD.decode(inline.data.as_bytes()).map_err(|e| {
                            GenerationError::InvalidResponse(format!(
                                "Inline image is not valid base64: {}",
                                e
                            ))
                        })?;
                        return Ok(GenerationOutput::Image(GeneratedImage {
                            data: Bytes::from(data),
                            mime_type: inline.mime_type.unwrap_or_else(|| "image/png".to_string()),
                        }));
                    }
                    if reason.is_none() {
                        reason = part.text.filter(|t| !t.trim().is_empty());
                    }
                }
            }
            if let Some(finish) = candidate.finish_reason {
                if finish != "STOP" {
                    reason = Some(finish);
                }
            }
        }

        Ok(GenerationOutput::NoOutput { reason })
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageModel {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        debug!(
            model_id = %self.model_id,
            prompt_len = request.prompt.len(),
            has_reference = request.reference.is_some(),
            "GeminiImageModel generating image"
        );

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model_id, self.api_key
        );
        let body = Self::build_request(request);

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                warn!(model_id = %self.model_id, "Gemini request timed out");
                GenerationError::Timeout(e.to_string())
            } else {
                error!(error = %e, "Failed to send request to Gemini API");
                GenerationError::Request(format!("Network error: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!(status = %status, "Gemini API returned error status");
            return Err(Self::map_error_status(status, error_text));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse Gemini API response");
            GenerationError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        Self::extract_output(parsed)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiRequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiRequestContent {
    role: String,
    parts: Vec<GeminiRequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiRequestPart {
    InlineData {
        #[serde(rename = "inline_data")]
        inline_data: GeminiInlineData,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    #[serde(rename = "mime_type")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<GeminiResponseInlineData>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseInlineData {
    #[serde(rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}
