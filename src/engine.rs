//! Engine composition.
//!
//! One `Engine` value is constructed at startup and passed explicitly;
//! components receive only the capabilities they need (event sink,
//! stores, similarity backend). There is no module-level state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use crate::cache::TtlCache;
use crate::cancel::CancellationToken;
use crate::config::AragoraConfig;
use crate::debate::convergence::{backend_from_config, SharedSimilarity};
use crate::debate::orchestrator::{DebateAgent, Orchestrator};
use crate::debate::state::{ConsensusPolicy, ConvergenceSettings, DebateRecord, DebateSettings};
use crate::events::{BusResult, DebateEvent, EventBus, EventSink, SharedEventBus};
use crate::invoker::{AgentInvoker, InvokerConfig};
use crate::providers::{AnthropicClient, OpenAiClient, SharedProvider, StreamOptions};
use crate::ranking::{EloSettings, FlipSettings, RankingEngine};
use crate::server::auth::AuthGate;
use crate::server::metrics::Metrics;
use crate::server::rate_limit::RateLimiter;
use crate::store::{SharedStore, SqliteStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("metrics failure: {0}")]
    Metrics(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("agent '{0}' has no usable provider (is its API key configured?)")]
    NoProvider(String),
    #[error("debate failed: {0}")]
    Debate(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Sink wrapper that counts published events.
#[derive(Debug)]
struct MeteredSink {
    inner: SharedEventBus,
    counter: prometheus::IntCounter,
}

impl EventSink for MeteredSink {
    fn publish(&self, event: DebateEvent) -> BusResult<DebateEvent> {
        let published = self.inner.publish(event)?;
        self.counter.inc();
        Ok(published)
    }
}

/// Agent specification parsed from `name=provider/model`, a bare
/// `provider/model`, or a well-known alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub provider: String,
    pub model: String,
}

impl AgentSpec {
    pub fn parse(spec: &str) -> EngineResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(EngineError::InvalidInput("empty agent spec".to_string()));
        }
        let (name, rest) = match spec.split_once('=') {
            Some((name, rest)) => (Some(name.trim()), rest.trim()),
            None => (None, spec),
        };
        // Aliases kept from the original agent roster.
        let (provider, model) = match rest {
            "anthropic-api" | "claude" => ("anthropic", "claude-3-5-sonnet-latest"),
            "openai-api" | "gpt" => ("openai", "gpt-4o"),
            "gemini" => ("gemini", "gemini-1.5-pro"),
            other => other.split_once('/').ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "agent spec '{spec}' is not an alias or provider/model pair"
                ))
            })?,
        };
        Ok(Self {
            name: name.unwrap_or(rest).to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

/// A request to start a debate, as accepted over HTTP or the CLI.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DebateRequest {
    pub task: String,
    pub agents: Vec<String>,
    #[serde(default)]
    pub rounds: Option<u32>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Handle returned when a debate is admitted.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DebateTicket {
    pub debate_id: String,
    pub slug_hint: String,
}

/// The composed engine.
pub struct Engine {
    pub config: AragoraConfig,
    pub store: SharedStore,
    pub bus: SharedEventBus,
    pub similarity: SharedSimilarity,
    pub ranking: Arc<RankingEngine>,
    pub metrics: Arc<Metrics>,
    pub auth: AuthGate,
    pub token_limiter: RateLimiter,
    pub ip_limiter: RateLimiter,
    pub leaderboard_cache: TtlCache<String, serde_json::Value>,
    sink: Arc<dyn EventSink>,
    orchestrator: Orchestrator,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    /// Build the engine from configuration, opening storage on disk.
    pub fn new(config: AragoraConfig) -> EngineResult<Arc<Self>> {
        let store = SqliteStore::open(&config.storage_path)?.shared();
        Self::with_store(config, store)
    }

    /// Build the engine over an existing store (tests use in-memory).
    pub fn with_store(config: AragoraConfig, store: SharedStore) -> EngineResult<Arc<Self>> {
        let bus = EventBus::new(store.clone()).shared();
        let metrics =
            Arc::new(Metrics::new().map_err(|e| EngineError::Metrics(e.to_string()))?);
        let sink: Arc<dyn EventSink> = Arc::new(MeteredSink {
            inner: bus.clone(),
            counter: metrics.events_published.clone(),
        });
        let similarity = backend_from_config(&config);
        let ranking = Arc::new(RankingEngine::new(
            store.clone(),
            sink.clone(),
            similarity.clone(),
            EloSettings {
                k: config.elo_k_factor,
                initial: config.elo_initial,
            },
            FlipSettings::default(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            sink.clone(),
            ranking.clone(),
            similarity.clone(),
        );

        Ok(Arc::new(Self {
            auth: AuthGate::new(config.auth_hmac_key.as_deref(), config.token_ttl_seconds),
            token_limiter: RateLimiter::per_minute(config.rate_limit_per_minute),
            ip_limiter: RateLimiter::per_minute(config.ip_rate_limit_per_minute),
            leaderboard_cache: TtlCache::new(
                64,
                Duration::from_secs(config.cache_ttl_leaderboard_seconds),
            ),
            store,
            bus,
            similarity,
            ranking,
            metrics,
            sink,
            orchestrator,
            active: Mutex::new(HashMap::new()),
            config,
        }))
    }

    /// Event sink shared with every component.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    /// Resolve a provider client for an agent spec.
    pub fn provider_for(&self, spec: &AgentSpec) -> EngineResult<SharedProvider> {
        match spec.provider.as_str() {
            "anthropic" => match &self.config.anthropic_api_key {
                Some(key) => Ok(Arc::new(AnthropicClient::new(key))),
                None => Err(EngineError::NoProvider(spec.name.clone())),
            },
            "openai" => match &self.config.openai_api_key {
                Some(key) => Ok(Arc::new(OpenAiClient::new(
                    "openai",
                    "https://api.openai.com/v1",
                    key,
                ))),
                None => Err(EngineError::NoProvider(spec.name.clone())),
            },
            "gemini" => match &self.config.gemini_api_key {
                Some(key) => Ok(Arc::new(OpenAiClient::new(
                    "gemini",
                    "https://generativelanguage.googleapis.com/v1beta/openai",
                    key,
                ))),
                None => Err(EngineError::NoProvider(spec.name.clone())),
            },
            other => Err(EngineError::InvalidInput(format!(
                "unknown provider '{other}'"
            ))),
        }
    }

    /// Build debate agents from textual specs.
    pub fn build_agents(&self, specs: &[String]) -> EngineResult<Vec<DebateAgent>> {
        let mut agents = Vec::with_capacity(specs.len());
        for raw in specs {
            let spec = AgentSpec::parse(raw)?;
            let provider = self.provider_for(&spec)?;
            let invoker = Arc::new(AgentInvoker::new(
                provider,
                self.sink.clone(),
                InvokerConfig::default(),
            ));
            agents.push(DebateAgent {
                name: spec.name.clone(),
                invoker,
                options: StreamOptions {
                    model: spec.model,
                    ..StreamOptions::default()
                },
            });
        }
        Ok(agents)
    }

    /// Debate settings derived from a request plus configured defaults.
    pub fn settings_for(&self, request: &DebateRequest) -> EngineResult<DebateSettings> {
        let rounds = request.rounds.unwrap_or(self.config.default_rounds);
        if rounds == 0 || rounds > self.config.max_rounds {
            return Err(EngineError::InvalidInput(format!(
                "rounds must be in 1..={}",
                self.config.max_rounds
            )));
        }
        let policy_name = request
            .policy
            .clone()
            .unwrap_or_else(|| self.config.default_consensus.clone());
        let policy = ConsensusPolicy::parse(&policy_name)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown policy '{policy_name}'")))?;
        Ok(DebateSettings {
            rounds_planned: rounds,
            consensus_policy: policy,
            consensus_threshold: self.config.consensus_threshold,
            convergence: ConvergenceSettings {
                similarity_threshold: self.config.convergence_similarity,
                ..ConvergenceSettings::default()
            },
            min_participants: self.config.min_participants,
            timeout_seconds: self.config.debate_timeout_seconds,
            domain: request.domain.clone().unwrap_or_else(|| "general".to_string()),
            ..DebateSettings::default()
        })
    }

    /// Admit a debate and run it on a background task. Returns
    /// immediately with the debate id.
    pub fn spawn_debate(self: &Arc<Self>, request: DebateRequest) -> EngineResult<DebateTicket> {
        if request.task.trim().is_empty() {
            return Err(EngineError::InvalidInput("task must not be empty".to_string()));
        }
        let agents = self.build_agents(&request.agents)?;
        let settings = self.settings_for(&request)?;
        let debate_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(debate_id.clone(), cancel.clone());

        let engine = self.clone();
        let id = debate_id.clone();
        let task_text = request.task.clone();
        tokio::spawn(async move {
            let _ = engine
                .run_debate_inner(&id, &task_text, &agents, &settings, &cancel)
                .await;
        });

        Ok(DebateTicket {
            slug_hint: crate::debate::orchestrator::make_slug(&request.task),
            debate_id,
        })
    }

    /// Run a debate to completion with prebuilt agents. The CLI and
    /// tests call this directly with scripted providers.
    pub async fn run_debate_with_agents(
        self: &Arc<Self>,
        debate_id: &str,
        task: &str,
        agents: &[DebateAgent],
        settings: &DebateSettings,
        cancel: &CancellationToken,
    ) -> EngineResult<DebateRecord> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(debate_id.to_string(), cancel.clone());
        self.run_debate_inner(debate_id, task, agents, settings, cancel)
            .await
    }

    async fn run_debate_inner(
        self: &Arc<Self>,
        debate_id: &str,
        task: &str,
        agents: &[DebateAgent],
        settings: &DebateSettings,
        cancel: &CancellationToken,
    ) -> EngineResult<DebateRecord> {
        self.metrics.debates_started.inc();
        let result = self
            .orchestrator
            .run(debate_id, task, agents, settings, cancel)
            .await;
        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(debate_id);
        match result {
            Ok(record) => {
                let outcome = record
                    .state
                    .outcome()
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                self.metrics
                    .debates_completed
                    .with_label_values(&[&outcome])
                    .inc();
                self.leaderboard_cache.clear();
                Ok(record)
            }
            Err(e) => {
                error!(debate_id, error = %e, "debate run failed");
                self.metrics
                    .debates_completed
                    .with_label_values(&["error"])
                    .inc();
                Err(EngineError::Debate(e.to_string()))
            }
        }
    }

    /// Cancel a running debate. Returns false when no such debate is
    /// active.
    pub fn cancel_debate(&self, debate_id: &str) -> bool {
        let active = self.active.lock().expect("active map lock poisoned");
        match active.get(debate_id) {
            Some(token) => {
                info!(debate_id, "debate cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of debates currently running.
    pub fn active_debates(&self) -> usize {
        self.active.lock().expect("active map lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<Engine> {
        let store = SqliteStore::open_in_memory().unwrap().shared();
        Engine::with_store(AragoraConfig::from_env(), store).unwrap()
    }

    #[test]
    fn test_agent_spec_aliases() {
        let spec = AgentSpec::parse("anthropic-api").unwrap();
        assert_eq!(spec.provider, "anthropic");
        assert_eq!(spec.name, "anthropic-api");

        let spec = AgentSpec::parse("critic=openai/gpt-4o-mini").unwrap();
        assert_eq!(spec.name, "critic");
        assert_eq!(spec.provider, "openai");
        assert_eq!(spec.model, "gpt-4o-mini");
    }

    #[test]
    fn test_agent_spec_rejects_garbage() {
        assert!(AgentSpec::parse("").is_err());
        assert!(AgentSpec::parse("justaname").is_err());
    }

    #[test]
    fn test_settings_validation() {
        let engine = engine();
        let mut request = DebateRequest {
            task: "pick".to_string(),
            agents: vec![],
            rounds: Some(0),
            policy: None,
            domain: None,
        };
        assert!(engine.settings_for(&request).is_err());

        request.rounds = Some(3);
        request.policy = Some("hybrid".to_string());
        assert!(engine.settings_for(&request).is_err());

        request.policy = Some("unanimous".to_string());
        let settings = engine.settings_for(&request).unwrap();
        assert_eq!(settings.consensus_policy, ConsensusPolicy::Unanimous);
        assert_eq!(settings.rounds_planned, 3);
    }

    #[test]
    fn test_provider_requires_key() {
        let engine = engine();
        // No keys in the test environment: building real agents fails
        // with a provider error, not a panic.
        if engine.config.openai_api_key.is_none() {
            let err = engine
                .build_agents(&["openai-api".to_string()])
                .unwrap_err();
            assert!(matches!(err, EngineError::NoProvider(_)));
        }
    }

    #[test]
    fn test_cancel_unknown_debate() {
        let engine = engine();
        assert!(!engine.cancel_debate("ghost"));
        assert_eq!(engine.active_debates(), 0);
    }
}
