//! Workers: one credential, its rate limiter and its generation client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lumina_abstraction::{GenerationError, GenerationOutput, GenerationRequest, ImageGenerator};
use lumina_models::GeminiImageModel;
use serde::Serialize;
use tracing::debug;

use crate::config::{CredentialConfig, GenerationConfig, LimitsConfig, QuotaTier};
use crate::limiter::{CredentialRateLimiter, min_interval};

/// Immutable description of one credential. The secret is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Identifier used in logs and results.
    pub id: String,
    /// Quota tier.
    pub tier: QuotaTier,
    /// Requests per window.
    pub ceiling: u32,
    /// Derived `window / ceiling + margin`.
    pub min_interval: Duration,
}

impl Credential {
    /// Builds a credential from its configuration entry.
    pub fn from_config(config: &CredentialConfig, limits: &LimitsConfig) -> Self {
        let ceiling = config.ceiling();
        Self {
            id: config.id.clone(),
            tier: config.tier,
            ceiling,
            min_interval: min_interval(limits.window(), ceiling, limits.safety_margin()),
        }
    }
}

/// Builds a generation client for a credential's secret.
///
/// The pool calls this once per configured credential; an `Err` drops that
/// credential only.
pub trait GeneratorFactory: Send + Sync {
    /// Creates the client.
    fn build(
        &self,
        credential: &CredentialConfig,
        api_key: &str,
    ) -> Result<Arc<dyn ImageGenerator>, GenerationError>;
}

impl<F> GeneratorFactory for F
where
    F: Fn(&CredentialConfig, &str) -> Result<Arc<dyn ImageGenerator>, GenerationError>
        + Send
        + Sync,
{
    fn build(
        &self,
        credential: &CredentialConfig,
        api_key: &str,
    ) -> Result<Arc<dyn ImageGenerator>, GenerationError> {
        self(credential, api_key)
    }
}

/// Factory for [`GeminiImageModel`] clients.
#[derive(Debug, Clone)]
pub struct GeminiFactory {
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiFactory {
    /// Uses the model, base URL and timeout from `config`.
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            timeout: config.request_timeout(),
        }
    }
}

impl GeneratorFactory for GeminiFactory {
    fn build(
        &self,
        _credential: &CredentialConfig,
        api_key: &str,
    ) -> Result<Arc<dyn ImageGenerator>, GenerationError> {
        let model = GeminiImageModel::new(&self.model, api_key, self.timeout)?
            .with_base_url(&self.base_url);
        Ok(Arc::new(model))
    }
}

/// Per-worker counters for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    /// Credential identifier.
    pub credential: String,
    /// Quota tier.
    pub tier: QuotaTier,
    /// Requests per window.
    pub ceiling: u32,
    /// Requests issued.
    pub requests: u64,
    /// Requests that produced an image.
    pub successes: u64,
    /// Requests that did not.
    pub failures: u64,
    /// `successes / requests`, or 0 before the first request.
    pub success_rate: f64,
    /// Cumulative limiter wait.
    #[serde(with = "duration_millis")]
    pub total_wait: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// One credential paired with its limiter and client.
pub struct Worker {
    credential: Credential,
    limiter: CredentialRateLimiter,
    generator: Arc<dyn ImageGenerator>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("credential", &self.credential)
            .field("model", &self.generator.model_id())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker around an already-built client.
    pub fn new(credential: Credential, generator: Arc<dyn ImageGenerator>) -> Self {
        let limiter = CredentialRateLimiter::new(credential.id.clone(), credential.min_interval);
        Self { credential, limiter, generator }
    }

    /// Builds a worker from configuration, resolving the secret and creating
    /// the client through `factory`.
    ///
    /// # Errors
    /// Returns `GenerationError::Configuration` if the secret cannot be
    /// resolved or the client cannot be built.
    pub fn from_config(
        config: &CredentialConfig,
        limits: &LimitsConfig,
        factory: &dyn GeneratorFactory,
    ) -> Result<Self, GenerationError> {
        let api_key = config.resolve().map_err(|e| GenerationError::Configuration(e.to_string()))?;
        let generator = factory.build(config, &api_key)?;
        Ok(Self::new(Credential::from_config(config, limits), generator))
    }

    /// The credential this worker serves.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The credential's rate limiter.
    pub fn limiter(&self) -> &CredentialRateLimiter {
        &self.limiter
    }

    /// Waits for a rate-limit slot, then issues one request.
    ///
    /// Returns the provider outcome and how long the limiter made the caller
    /// wait. Only an image counts as a success in the worker's counters.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> (Result<GenerationOutput, GenerationError>, Duration) {
        let waited = self.limiter.acquire().await;
        let outcome = {
            let _in_flight = self.limiter.begin_call();
            self.generator.generate(request).await
        };

        let success = matches!(outcome, Ok(GenerationOutput::Image(_)));
        self.limiter.record(success);
        debug!(
            credential = %self.credential.id,
            success,
            wait_ms = waited.as_millis() as u64,
            "Worker request finished"
        );
        (outcome, waited)
    }

    /// Snapshot of this worker's counters.
    pub fn stats(&self) -> WorkerStats {
        let snapshot = self.limiter.snapshot();
        let finished = snapshot.successes + snapshot.failures;
        WorkerStats {
            credential: self.credential.id.clone(),
            tier: self.credential.tier,
            ceiling: self.credential.ceiling,
            requests: snapshot.requests,
            successes: snapshot.successes,
            failures: snapshot.failures,
            success_rate: if finished == 0 {
                0.0
            } else {
                snapshot.successes as f64 / finished as f64
            },
            total_wait: snapshot.total_wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumina_models::MockImageGenerator;

    fn limits() -> LimitsConfig {
        LimitsConfig { window_secs: 60, safety_margin_ms: 1000 }
    }

    fn mock_factory(_: &CredentialConfig, _: &str) -> Result<Arc<dyn ImageGenerator>, GenerationError> {
        Ok(Arc::new(MockImageGenerator::new("mock")))
    }

    #[test]
    fn test_credential_interval_from_tier() {
        let high = Credential::from_config(&CredentialConfig::inline("a", QuotaTier::High, "k"), &limits());
        assert_eq!(high.ceiling, 10);
        assert_eq!(high.min_interval, Duration::from_secs(7));

        let low = Credential::from_config(&CredentialConfig::inline("b", QuotaTier::Low, "k"), &limits());
        assert_eq!(low.min_interval, Duration::from_secs(31));
    }

    #[test]
    fn test_from_config_rejects_blank_key() {
        let config = CredentialConfig::inline("blank", QuotaTier::High, "");
        let err = Worker::from_config(&config, &limits(), &mock_factory).unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));
    }

    #[test]
    fn test_gemini_factory_rejects_malformed_key() {
        let factory = GeminiFactory::new(&GenerationConfig::default());
        let config = CredentialConfig::inline("bad", QuotaTier::High, "has space");
        assert!(Worker::from_config(&config, &limits(), &factory).is_err());

        let good = CredentialConfig::inline("good", QuotaTier::High, "AIza-test");
        assert!(Worker::from_config(&good, &limits(), &factory).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_updates_stats() {
        let generator = MockImageGenerator::new("mock")
            .with_response(Ok(GenerationOutput::NoOutput { reason: Some("SAFETY".to_string()) }));
        let worker = Worker::new(
            Credential::from_config(&CredentialConfig::inline("a", QuotaTier::High, "k"), &limits()),
            Arc::new(generator),
        );
        let request = GenerationRequest::text("a lamp");

        let (first, waited) = worker.generate(&request).await;
        assert!(matches!(first, Ok(GenerationOutput::NoOutput { .. })));
        assert_eq!(waited, Duration::ZERO);

        let (second, waited) = worker.generate(&request).await;
        assert!(matches!(second, Ok(GenerationOutput::Image(_))));
        assert_eq!(waited, Duration::from_secs(7));

        let stats = worker.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.total_wait, Duration::from_secs(7));
    }
}
