//! LLM router - fallback chains, health tracking and load balancing.
//!
//! Providers sit behind the [`CompletionBackend`] trait. A call resolves a
//! fallback chain, walks it in order skipping unhealthy providers, and
//! returns the first success. Rate-limited providers are marked unhealthy
//! and automatically re-enabled after a cooldown.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agentflow_models::{AccessMode, UsageRecord};
use agentflow_traits::UsageSink;

use crate::config::LoadBalancing;
use crate::error::{CoreError, Result};

/// Cooldown before a rate-limited provider is considered healthy again.
const REHEALTH_DELAY: Duration = Duration::from_secs(60);

/// Per-million-token prices.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
}

/// Static configuration of one routed provider.
#[derive(Debug, Clone)]
pub struct LlmProvider {
    pub id: String,
    pub model: String,
    pub cost: CostRates,
    /// Requests per minute, if limited.
    pub rate_limit: Option<u64>,
    /// Weight for the `weighted` strategy; also the preference order hint.
    pub priority: u32,
}

/// Ordered fallback chain over provider ids.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub id: String,
    pub providers: Vec<String>,
}

/// Router construction options.
#[derive(Debug, Clone)]
pub struct LlmRouterConfig {
    pub providers: Vec<LlmProvider>,
    pub fallback_chains: Vec<ChainConfig>,
    pub load_balancing: LoadBalancing,
    pub enable_failover: bool,
    pub enable_cost_tracking: bool,
    pub enable_observability: bool,
    pub timeout: Duration,
}

impl Default for LlmRouterConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            fallback_chains: Vec::new(),
            load_balancing: LoadBalancing::RoundRobin,
            enable_failover: true,
            enable_cost_tracking: true,
            enable_observability: false,
            timeout: Duration::from_secs(120),
        }
    }
}

/// A completion request routed through a chain.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    /// Chain to use; None picks the default (first configured) chain.
    pub chain_id: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            chain_id: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_chain(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }
}

/// Token counts reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw completion from a backend.
#[derive(Debug, Clone)]
pub struct BackendCompletion {
    pub content: String,
    pub usage: LlmUsage,
}

/// Routed completion returned to the caller.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: LlmUsage,
    pub cost_usd: f64,
    pub latency: Duration,
    /// True iff at least one prior in-chain attempt failed.
    pub used_fallback: bool,
    pub trace_id: Option<String>,
}

/// One LLM provider implementation.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<BackendCompletion>;
}

/// Monotonic router counters.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub fallback_count: AtomicU64,
}

struct ProviderState {
    config: LlmProvider,
    backend: Arc<dyn CompletionBackend>,
    healthy: std::sync::atomic::AtomicBool,
    /// EWMA latency in microseconds; 0 = no samples yet.
    avg_latency_us: AtomicU64,
}

/// Multi-provider completion router.
pub struct LlmRouter {
    config: LlmRouterConfig,
    providers: HashMap<String, Arc<ProviderState>>,
    /// Provider ids in configuration order.
    order: Vec<String>,
    round_robin: AtomicUsize,
    metrics: RouterMetrics,
    usage_sink: Option<Arc<dyn UsageSink>>,
    rehealth_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LlmRouter {
    pub fn new(
        config: LlmRouterConfig,
        backends: HashMap<String, Arc<dyn CompletionBackend>>,
        usage_sink: Option<Arc<dyn UsageSink>>,
    ) -> Result<Self> {
        let mut providers = HashMap::new();
        let mut order = Vec::new();

        for provider in &config.providers {
            let backend = backends.get(&provider.id).cloned().ok_or_else(|| {
                CoreError::Validation(format!("no backend registered for provider {}", provider.id))
            })?;
            order.push(provider.id.clone());
            providers.insert(
                provider.id.clone(),
                Arc::new(ProviderState {
                    config: provider.clone(),
                    backend,
                    healthy: std::sync::atomic::AtomicBool::new(true),
                    avg_latency_us: AtomicU64::new(0),
                }),
            );
        }

        Ok(Self {
            config,
            providers,
            order,
            round_robin: AtomicUsize::new(0),
            metrics: RouterMetrics::default(),
            usage_sink,
            rehealth_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Route a completion through the resolved fallback chain.
    pub async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let chain = self.resolve_chain(request.chain_id.as_deref())?;
        let trace_id = self.config.enable_observability.then(make_trace_id);

        let mut used_fallback = false;
        let mut last_error: Option<CoreError> = None;

        for provider_id in &chain {
            let Some(state) = self.providers.get(provider_id) else {
                continue;
            };
            // Unhealthy providers are skipped silently: no fallback count.
            if !state.healthy.load(Ordering::Acquire) {
                debug!(provider = %provider_id, "Skipping unhealthy provider");
                continue;
            }

            let started = Instant::now();
            let attempt = tokio::time::timeout(
                self.config.timeout,
                state.backend.complete(&request),
            )
            .await;
            let latency = started.elapsed();

            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(format!(
                    "provider {} exceeded {}ms",
                    provider_id,
                    self.config.timeout.as_millis()
                ))),
            };

            match result {
                Ok(completion) => {
                    self.record_latency(state, latency);
                    self.metrics
                        .successful_requests
                        .fetch_add(1, Ordering::Relaxed);

                    let cost_usd = compute_cost(&state.config.cost, completion.usage);
                    if self.config.enable_cost_tracking {
                        self.emit_usage(provider_id, completion.usage, cost_usd).await;
                    }

                    return Ok(LlmResponse {
                        content: completion.content,
                        provider: provider_id.clone(),
                        model: state.config.model.clone(),
                        usage: completion.usage,
                        cost_usd,
                        latency,
                        used_fallback,
                        trace_id,
                    });
                }
                Err(error) => {
                    warn!(provider = %provider_id, error = %error, "Provider attempt failed");
                    if is_rate_limit(&error) {
                        self.mark_unhealthy(state.clone());
                    }
                    used_fallback = true;
                    self.metrics.fallback_count.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(error);

                    if !self.config.enable_failover {
                        break;
                    }
                }
            }
        }

        self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
        Err(last_error.unwrap_or_else(|| {
            CoreError::NoProviderAvailable("no healthy provider in chain".to_string())
        }))
    }

    fn resolve_chain(&self, chain_id: Option<&str>) -> Result<Vec<String>> {
        match chain_id {
            Some(id) => self
                .config
                .fallback_chains
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.providers.clone())
                .ok_or_else(|| CoreError::Validation(format!("unknown fallback chain: {id}"))),
            None => {
                if let Some(chain) = self.config.fallback_chains.first() {
                    Ok(chain.providers.clone())
                } else {
                    // No chains configured: every provider in configuration
                    // order forms the implicit default chain.
                    Ok(self.order.clone())
                }
            }
        }
    }

    /// Pick a single provider outside any chain, per the configured
    /// load-balancing strategy. Only healthy providers are considered.
    pub fn select_provider(&self) -> Option<String> {
        let healthy: Vec<&Arc<ProviderState>> = self
            .order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .filter(|s| s.healthy.load(Ordering::Acquire))
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = match self.config.load_balancing {
            LoadBalancing::RoundRobin => {
                let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx]
            }
            LoadBalancing::LeastCost => healthy
                .iter()
                .min_by(|a, b| {
                    let ca = (a.config.cost.input + a.config.cost.output) / 2.0;
                    let cb = (b.config.cost.input + b.config.cost.output) / 2.0;
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()?,
            LoadBalancing::Weighted => {
                let total: u64 = healthy.iter().map(|s| s.config.priority as u64).sum();
                if total == 0 {
                    healthy[0]
                } else {
                    let mut threshold = rand::rng().random_range(0..total);
                    let mut pick = healthy[0];
                    for state in healthy.iter().copied() {
                        let weight = state.config.priority as u64;
                        if threshold < weight {
                            pick = state;
                            break;
                        }
                        threshold -= weight;
                    }
                    pick
                }
            }
            // Providers without samples report zero latency, so they sort
            // first and get tried.
            LoadBalancing::LeastLatency => healthy
                .iter()
                .min_by_key(|s| s.avg_latency_us.load(Ordering::Relaxed))
                .copied()?,
        };

        Some(chosen.config.id.clone())
    }

    fn mark_unhealthy(&self, state: Arc<ProviderState>) {
        state.healthy.store(false, Ordering::Release);
        warn!(provider = %state.config.id, "Provider marked unhealthy after rate limit");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(REHEALTH_DELAY).await;
            state.healthy.store(true, Ordering::Release);
            debug!(provider = %state.config.id, "Provider health restored");
        });
        self.rehealth_tasks.lock().push(handle);
    }

    fn record_latency(&self, state: &ProviderState, latency: Duration) {
        let sample = latency.as_micros() as u64;
        let previous = state.avg_latency_us.load(Ordering::Relaxed);
        let updated = if previous == 0 {
            sample
        } else {
            // EWMA with alpha = 1/4.
            previous - previous / 4 + sample / 4
        };
        state.avg_latency_us.store(updated, Ordering::Relaxed);
    }

    async fn emit_usage(&self, provider_id: &str, usage: LlmUsage, cost_usd: f64) {
        if let Some(sink) = &self.usage_sink {
            let record = UsageRecord::new(provider_id, AccessMode::Api)
                .with_tokens(usage.input_tokens, usage.output_tokens)
                .with_cost(cost_usd);
            if let Err(error) = sink.record_usage(record).await {
                warn!(provider = %provider_id, error = %error, "Failed to record usage");
            }
        }
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Health flag for one provider; used by tests and dashboards.
    pub fn is_healthy(&self, provider_id: &str) -> Option<bool> {
        self.providers
            .get(provider_id)
            .map(|s| s.healthy.load(Ordering::Acquire))
    }

    /// Force a provider healthy again, bypassing the cooldown.
    pub fn restore_health(&self, provider_id: &str) {
        if let Some(state) = self.providers.get(provider_id) {
            state.healthy.store(true, Ordering::Release);
        }
    }

    /// Abort pending re-health timers. Called on shutdown so no timer
    /// outlives the router's owner.
    pub fn shutdown(&self) {
        for handle in self.rehealth_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for LlmRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compute_cost(rates: &CostRates, usage: LlmUsage) -> f64 {
    (usage.input_tokens as f64 * rates.input + usage.output_tokens as f64 * rates.output) / 1e6
}

fn is_rate_limit(error: &CoreError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("rate limit") || message.contains("429")
}

fn make_trace_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random: u32 = rand::rng().random_range(0..0xFFFF_FFFF);
    format!("trace-{millis}-{random:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedBackend {
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<BackendCompletion>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<BackendCompletion>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses.into_iter().rev().collect()),
            })
        }

        fn ok(content: &str) -> Result<BackendCompletion> {
            Ok(BackendCompletion {
                content: content.to_string(),
                usage: LlmUsage {
                    input_tokens: 1_000,
                    output_tokens: 500,
                },
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _request: &LlmRequest) -> Result<BackendCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(CoreError::Execution("script exhausted".to_string())))
        }
    }

    fn provider(id: &str, input_cost: f64, output_cost: f64) -> LlmProvider {
        LlmProvider {
            id: id.to_string(),
            model: format!("{id}-model"),
            cost: CostRates {
                input: input_cost,
                output: output_cost,
            },
            rate_limit: None,
            priority: 1,
        }
    }

    fn router_with(
        providers: Vec<LlmProvider>,
        chains: Vec<ChainConfig>,
        backends: HashMap<String, Arc<dyn CompletionBackend>>,
    ) -> LlmRouter {
        let config = LlmRouterConfig {
            providers,
            fallback_chains: chains,
            ..Default::default()
        };
        LlmRouter::new(config, backends, None).unwrap()
    }

    #[tokio::test]
    async fn test_single_provider_success() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::ok("hello")]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), backend.clone());

        let router = router_with(vec![provider("a", 3.0, 15.0)], vec![], backends);
        let response = router.complete(LlmRequest::new("hi")).await.unwrap();

        assert_eq!(response.content, "hello");
        assert_eq!(response.provider, "a");
        assert!(!response.used_fallback);
        // (1000 * 3.0 + 500 * 15.0) / 1e6
        assert!((response.cost_usd - 0.0105).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_on_rate_limit_marks_unhealthy() {
        let a = ScriptedBackend::new(vec![Err(CoreError::Execution(
            "429 rate limit exceeded".to_string(),
        ))]);
        let b = ScriptedBackend::new(vec![ScriptedBackend::ok("from b")]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), a.clone());
        backends.insert("b".to_string(), b.clone());

        let router = router_with(
            vec![provider("a", 1.0, 1.0), provider("b", 1.0, 1.0)],
            vec![ChainConfig {
                id: "default".to_string(),
                providers: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            }],
            backends,
        );

        let response = router.complete(LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "b");
        assert!(response.used_fallback);
        assert_eq!(router.metrics().fallback_count.load(Ordering::Relaxed), 1);
        assert_eq!(router.is_healthy("a"), Some(false));

        router.shutdown();
    }

    #[tokio::test]
    async fn test_unhealthy_provider_skipped_silently() {
        let a = ScriptedBackend::new(vec![]);
        let b = ScriptedBackend::new(vec![ScriptedBackend::ok("ok")]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), a.clone());
        backends.insert("b".to_string(), b.clone());

        let router = router_with(
            vec![provider("a", 1.0, 1.0), provider("b", 1.0, 1.0)],
            vec![],
            backends,
        );
        // Force a unhealthy out of band.
        router
            .providers
            .get("a")
            .unwrap()
            .healthy
            .store(false, Ordering::Release);

        let response = router.complete(LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "b");
        // Skipping an unhealthy provider is not a fallback.
        assert!(!response.used_fallback);
        assert_eq!(router.metrics().fallback_count.load(Ordering::Relaxed), 0);
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_fail_returns_last_error() {
        let a = ScriptedBackend::new(vec![Err(CoreError::Execution("first".to_string()))]);
        let b = ScriptedBackend::new(vec![Err(CoreError::Execution("second".to_string()))]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), a);
        backends.insert("b".to_string(), b);

        let router = router_with(
            vec![provider("a", 1.0, 1.0), provider("b", 1.0, 1.0)],
            vec![],
            backends,
        );

        let error = router.complete(LlmRequest::new("hi")).await.unwrap_err();
        assert!(error.to_string().contains("second"));
        assert_eq!(router.metrics().failed_requests.load(Ordering::Relaxed), 1);
        assert_eq!(router.metrics().fallback_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_provider_reheals_after_cooldown() {
        let a = ScriptedBackend::new(vec![Err(CoreError::Execution(
            "rate limit exceeded".to_string(),
        ))]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), a);

        let router = router_with(vec![provider("a", 1.0, 1.0)], vec![], backends);
        assert!(router.complete(LlmRequest::new("hi")).await.is_err());
        assert_eq!(router.is_healthy("a"), Some(false));

        tokio::time::advance(REHEALTH_DELAY + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(router.is_healthy("a"), Some(true));

        router.shutdown();
    }

    #[tokio::test]
    async fn test_restore_health() {
        let a = ScriptedBackend::new(vec![
            Err(CoreError::Execution("rate limit".to_string())),
            ScriptedBackend::ok("recovered"),
        ]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), a);

        let router = router_with(vec![provider("a", 1.0, 1.0)], vec![], backends);

        assert!(router.complete(LlmRequest::new("hi")).await.is_err());
        assert_eq!(router.is_healthy("a"), Some(false));

        // Cooldown elapses (forced here rather than waiting 60s).
        router.restore_health("a");
        let response = router.complete(LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.content, "recovered");

        router.shutdown();
    }

    #[tokio::test]
    async fn test_least_cost_selection() {
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("cheap".to_string(), ScriptedBackend::new(vec![]) as _);
        backends.insert("pricey".to_string(), ScriptedBackend::new(vec![]) as _);

        let config = LlmRouterConfig {
            providers: vec![provider("pricey", 10.0, 30.0), provider("cheap", 1.0, 2.0)],
            load_balancing: LoadBalancing::LeastCost,
            ..Default::default()
        };
        let router = LlmRouter::new(config, backends, None).unwrap();
        assert_eq!(router.select_provider().as_deref(), Some("cheap"));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), ScriptedBackend::new(vec![]) as _);
        backends.insert("b".to_string(), ScriptedBackend::new(vec![]) as _);

        let router = router_with(
            vec![provider("a", 1.0, 1.0), provider("b", 1.0, 1.0)],
            vec![],
            backends,
        );
        let first = router.select_provider().unwrap();
        let second = router.select_provider().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_trace_ids_unique() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::ok("one"),
            ScriptedBackend::ok("two"),
        ]);
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), backend);

        let config = LlmRouterConfig {
            providers: vec![provider("a", 1.0, 1.0)],
            enable_observability: true,
            ..Default::default()
        };
        let router = LlmRouter::new(config, backends, None).unwrap();

        let first = router.complete(LlmRequest::new("x")).await.unwrap();
        let second = router.complete(LlmRequest::new("y")).await.unwrap();
        let a = first.trace_id.unwrap();
        let b = second.trace_id.unwrap();
        assert!(a.starts_with("trace-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unknown_chain_rejected() {
        let mut backends: HashMap<String, Arc<dyn CompletionBackend>> = HashMap::new();
        backends.insert("a".to_string(), ScriptedBackend::new(vec![]) as _);
        let router = router_with(vec![provider("a", 1.0, 1.0)], vec![], backends);

        let error = router
            .complete(LlmRequest::new("hi").with_chain("missing"))
            .await
            .unwrap_err();
        assert!(matches!(error, CoreError::Validation(_)));
    }
}
