//! Centralized configuration with environment variable overrides.
//!
//! Every knob the engine recognizes is enumerated here with its default.
//! Components receive the parts of the config they need at construction;
//! nothing reads the environment after startup.

use std::path::PathBuf;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Which embedding backend computes semantic similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAi,
    Gemini,
    /// OpenAI-compatible local endpoint (sentence-transformers server).
    SentenceTransformers,
    /// Pick a remote backend when a key is configured, else local lexical.
    Auto,
}

impl EmbeddingProvider {
    fn parse(value: &str) -> Self {
        match value {
            "openai" => Self::OpenAi,
            "gemini" => Self::Gemini,
            "sentence-transformers" => Self::SentenceTransformers,
            _ => Self::Auto,
        }
    }
}

/// How the WebSocket hub handles a full outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowClientPolicy {
    /// Close the connection with `error:slow_consumer`.
    DropOnFull,
    /// Coalesce adjacent `token_delta` frames for the same agent turn.
    Coalesce,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct AragoraConfig {
    // === Server ===
    pub port: u16,
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,

    // === Auth ===
    /// Enables bearer auth when set.
    pub auth_hmac_key: Option<String>,
    pub token_ttl_seconds: u64,

    // === Rate limiting ===
    pub rate_limit_per_minute: u32,
    pub ip_rate_limit_per_minute: u32,

    // === WebSocket ===
    pub ws_max_frame: usize,
    pub ws_heartbeat_seconds: u64,
    pub ws_pong_timeout_seconds: u64,
    pub ws_queue_size: usize,
    pub slow_client_policy: SlowClientPolicy,

    // === Providers (a key enables the provider) ===
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_url: Option<String>,

    // === Debate defaults ===
    pub default_rounds: u32,
    pub max_rounds: u32,
    pub default_consensus: String,
    pub consensus_threshold: f64,
    pub convergence_similarity: f64,
    pub min_participants: usize,
    pub debate_timeout_seconds: u64,

    // === Ranking ===
    pub elo_k_factor: f64,
    pub elo_initial: f64,

    // === Storage ===
    pub storage_path: PathBuf,

    // === API limits ===
    pub max_api_limit: u32,
    pub default_pagination: u32,

    // === Caching ===
    pub cache_ttl_leaderboard_seconds: u64,
}

impl AragoraConfig {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            port: env_u32("PORT", 8080) as u16,
            bind_addr: env_str("BIND_ADDR", "127.0.0.1"),
            allowed_origins: env_str("ALLOWED_ORIGINS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            auth_hmac_key: env_opt("AUTH_TOKEN_HMAC_KEY"),
            token_ttl_seconds: env_u64("TOKEN_TTL_SECONDS", 3600),
            rate_limit_per_minute: env_u32("RATE_LIMIT_PER_MINUTE", 60),
            ip_rate_limit_per_minute: env_u32("IP_RATE_LIMIT_PER_MINUTE", 120),
            ws_max_frame: env_u64("WS_MAX_FRAME", 64 * 1024) as usize,
            ws_heartbeat_seconds: env_u64("WS_HEARTBEAT_SECONDS", 30),
            ws_pong_timeout_seconds: env_u64("WS_PONG_TIMEOUT_SECONDS", 60),
            ws_queue_size: env_u64("WS_QUEUE_SIZE", 256) as usize,
            slow_client_policy: match env_str("WS_SLOW_CLIENT_POLICY", "drop").as_str() {
                "coalesce" => SlowClientPolicy::Coalesce,
                _ => SlowClientPolicy::DropOnFull,
            },
            openai_api_key: env_opt("OPENAI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            gemini_api_key: env_opt("GEMINI_API_KEY"),
            embedding_provider: EmbeddingProvider::parse(&env_str("EMBEDDING_PROVIDER", "auto")),
            embedding_url: env_opt("EMBEDDING_URL"),
            default_rounds: env_u32("DEBATE_DEFAULT_ROUNDS", 3),
            max_rounds: env_u32("DEBATE_MAX_ROUNDS", 10),
            default_consensus: env_str("DEBATE_DEFAULT_CONSENSUS", "majority"),
            consensus_threshold: env_f64("DEBATE_CONSENSUS_THRESHOLD", 0.66),
            convergence_similarity: env_f64("DEBATE_CONVERGENCE_SIMILARITY", 0.85),
            min_participants: env_u64("DEBATE_MIN_PARTICIPANTS", 2) as usize,
            debate_timeout_seconds: env_u64("DEBATE_TIMEOUT_SECONDS", 600),
            elo_k_factor: env_f64("ELO_K_FACTOR", 32.0),
            elo_initial: env_f64("ELO_INITIAL", 1500.0),
            storage_path: PathBuf::from(env_str("STORAGE_PATH", ".aragora/aragora.db")),
            max_api_limit: env_u32("MAX_API_LIMIT", 100),
            default_pagination: env_u32("DEFAULT_PAGINATION", 20),
            cache_ttl_leaderboard_seconds: env_u64("CACHE_TTL_LEADERBOARD", 300),
        }
    }

    /// Clamp a caller-supplied page size to the configured bounds.
    pub fn clamp_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_pagination)
            .clamp(1, self.max_api_limit)
    }
}

impl Default for AragoraConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        let config = AragoraConfig::from_env();
        assert_eq!(config.clamp_limit(None), config.default_pagination);
        assert_eq!(config.clamp_limit(Some(0)), 1);
        assert_eq!(config.clamp_limit(Some(10_000)), config.max_api_limit);
    }

    #[test]
    fn test_embedding_provider_parse() {
        assert_eq!(EmbeddingProvider::parse("openai"), EmbeddingProvider::OpenAi);
        assert_eq!(EmbeddingProvider::parse("gemini"), EmbeddingProvider::Gemini);
        assert_eq!(
            EmbeddingProvider::parse("sentence-transformers"),
            EmbeddingProvider::SentenceTransformers
        );
        assert_eq!(EmbeddingProvider::parse("anything"), EmbeddingProvider::Auto);
    }
}
