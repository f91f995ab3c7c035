use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use constellation_common::{AgentKind, Error, HistoryMessage, Result};
use constellation_config::{GatewayConfig, RetryConfig};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::providers::{AnthropicProvider, LlmProvider, LlmRequest, OpenAiProvider};

/// Routing prefix OpenRouter uses for xAI models.
const XAI_ROUTER_PREFIX: &str = "x-ai/";

/// Remote backend a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Anthropic,
    OpenRouter,
    XaiDirect,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Anthropic => "anthropic",
            Backend::OpenRouter => "openrouter",
            Backend::XaiDirect => "xai",
        }
    }
}

/// Where one agent's calls go and with which model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub backend: Backend,
    pub model: String,
    /// The caller's own key when the route uses it; `None` means the shared
    /// default credential.
    pub credential: Option<String>,
}

/// Bounded exponential backoff for rate-limited calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            jitter: false,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(20);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let backoff = self.backoff_for(retry);
        if !self.jitter {
            return backoff;
        }
        let millis = backoff.as_millis() as u64;
        if millis < 2 {
            return backoff;
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }

    /// Run `op` until it succeeds, fails with a non-rate-limit error, or the
    /// attempt budget is spent. Exhaustion surfaces as `Error::Provider`.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() => {
                    if attempt >= attempts {
                        return Err(Error::Provider(format!(
                            "rate limit persisted after {attempts} attempts: {err}"
                        )));
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        "{} rate limited (attempt {}/{}), retrying in {:?}",
                        label, attempt, attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Uniform call surface over the remote model providers.
///
/// Shared providers are built once from the explicit `GatewayConfig`; agents
/// that bring their own key get a dedicated provider, cached per key.
pub struct ProviderGateway {
    config: GatewayConfig,
    alternate_routing: bool,
    retry: RetryPolicy,
    shared: HashMap<Backend, Arc<dyn LlmProvider>>,
    pinned: HashMap<Backend, Arc<dyn LlmProvider>>,
    dedicated: Mutex<HashMap<(Backend, String), Arc<dyn LlmProvider>>>,
}

impl ProviderGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let mut shared: HashMap<Backend, Arc<dyn LlmProvider>> = HashMap::new();

        if let Some(key) = non_blank(config.anthropic_api_key.as_deref()) {
            let mut provider = AnthropicProvider::new(key);
            if let Some(base_url) = &config.anthropic_base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            shared.insert(Backend::Anthropic, Arc::new(provider));
        }
        if let Some(key) = non_blank(config.openrouter_api_key.as_deref()) {
            let provider = OpenAiProvider::new(key, config.openrouter_base_url.clone());
            shared.insert(Backend::OpenRouter, Arc::new(provider));
        }

        info!(
            "provider gateway ready with {} shared backend(s)",
            shared.len()
        );

        Self {
            retry: RetryPolicy::from_config(&config.retry),
            config,
            alternate_routing: true,
            shared,
            pinned: HashMap::new(),
            dedicated: Mutex::new(HashMap::new()),
        }
    }

    /// Whether Grok agents with their own key go straight to xAI.
    pub fn with_alternate_routing(mut self, enabled: bool) -> Self {
        self.alternate_routing = enabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Serve every call routed to `backend` from `provider`, whichever
    /// credential the route carries.
    pub fn with_provider(mut self, backend: Backend, provider: Arc<dyn LlmProvider>) -> Self {
        self.pinned.insert(backend, provider);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn route(&self, kind: AgentKind, model: &str, credential: Option<&str>) -> Route {
        let credential = non_blank(credential).map(str::to_string);
        match kind {
            AgentKind::Claude | AgentKind::Pascal => Route {
                backend: Backend::Anthropic,
                model: model.to_string(),
                credential,
            },
            AgentKind::Grok => match credential {
                Some(key) if self.alternate_routing => Route {
                    backend: Backend::XaiDirect,
                    model: model
                        .strip_prefix(XAI_ROUTER_PREFIX)
                        .unwrap_or(model)
                        .to_string(),
                    credential: Some(key),
                },
                _ => Route {
                    backend: Backend::OpenRouter,
                    model: model.to_string(),
                    credential: None,
                },
            },
        }
    }

    /// Fail fast when `kind` has neither its own key nor a shared one.
    pub fn validate(&self, kind: AgentKind, credential: Option<&str>) -> Result<()> {
        let route = self.route(kind, "", credential);
        if route.credential.is_some()
            || self.pinned.contains_key(&route.backend)
            || self.shared.contains_key(&route.backend)
        {
            return Ok(());
        }
        Err(missing_credential(kind, route.backend))
    }

    fn provider_for(&self, kind: AgentKind, route: &Route) -> Result<Arc<dyn LlmProvider>> {
        if let Some(provider) = self.pinned.get(&route.backend) {
            return Ok(Arc::clone(provider));
        }

        let Some(key) = &route.credential else {
            return self
                .shared
                .get(&route.backend)
                .cloned()
                .ok_or_else(|| missing_credential(kind, route.backend));
        };

        let mut cache = self
            .dedicated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let provider = cache
            .entry((route.backend, key.clone()))
            .or_insert_with(|| self.build_dedicated(route.backend, key));
        Ok(Arc::clone(provider))
    }

    fn build_dedicated(&self, backend: Backend, key: &str) -> Arc<dyn LlmProvider> {
        debug!("building dedicated {} provider", backend.as_str());
        match backend {
            Backend::Anthropic => {
                let mut provider = AnthropicProvider::new(key);
                if let Some(base_url) = &self.config.anthropic_base_url {
                    provider = provider.with_base_url(base_url.clone());
                }
                Arc::new(provider)
            }
            Backend::XaiDirect => Arc::new(
                OpenAiProvider::new(key, Some(self.config.xai_base_url.clone()))
                    .with_provider_id("xai"),
            ),
            Backend::OpenRouter => Arc::new(OpenAiProvider::new(
                key,
                self.config.openrouter_base_url.clone(),
            )),
        }
    }

    /// One completion for a relay turn, with rate-limit retries applied.
    #[instrument(skip_all, fields(kind = %kind, model = %model))]
    pub async fn invoke(
        &self,
        kind: AgentKind,
        model: &str,
        history: &[HistoryMessage],
        system_prompt: &str,
        credential: Option<&str>,
    ) -> Result<String> {
        let route = self.route(kind, model, credential);
        let provider = self.provider_for(kind, &route)?;

        let mut request = LlmRequest::from_history(&route.model, history, system_prompt);
        request.max_tokens = Some(self.config.max_tokens);
        request.temperature = self.config.temperature;

        let provider = provider.as_ref();
        let request = &request;
        let response = self
            .retry
            .run(provider.provider_id(), move || provider.complete(request))
            .await?;

        if let Some(usage) = &response.usage {
            debug!(
                "{} replied: {} input tokens, {} output tokens",
                provider.provider_id(),
                usage.input_tokens,
                usage.output_tokens
            );
        }
        Ok(response.text)
    }

    /// Probe every configured backend concurrently.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let mut providers: Vec<(Backend, Arc<dyn LlmProvider>)> = self
            .shared
            .iter()
            .filter(|(backend, _)| !self.pinned.contains_key(*backend))
            .chain(self.pinned.iter())
            .map(|(backend, provider)| (*backend, Arc::clone(provider)))
            .collect();
        providers.sort_by_key(|(backend, _)| backend.as_str());

        let checks = providers.iter().map(|(backend, provider)| async move {
            let healthy = match provider.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!("health check for {} failed: {}", backend.as_str(), e);
                    false
                }
            };
            (backend.as_str().to_string(), healthy)
        });
        futures::future::join_all(checks).await
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn missing_credential(kind: AgentKind, backend: Backend) -> Error {
    let hint = match backend {
        Backend::Anthropic => "CONSTELLATION_ANTHROPIC_API_KEY",
        Backend::OpenRouter => "CONSTELLATION_OPENROUTER_API_KEY",
        Backend::XaiDirect => "a custom xAI key",
    };
    Error::Config(format!(
        "no credential for {kind} agent: provide its own key or set {hint}"
    ))
}
