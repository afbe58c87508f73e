//! Semantic similarity backends and convergence detection.
//!
//! The default backend is a deterministic negation-aware lexical
//! embedding: text is tokenized, terms inside a negation scope are
//! marked so "use X" and "do not use X" land far apart, and vectors are
//! hashed into a fixed dimension for cosine comparison. Remote backends
//! (OpenAI, Gemini-compatible) swap in behind the same trait when a key
//! is configured.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AragoraConfig, EmbeddingProvider};
use crate::debate::state::ConvergenceSettings;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SimilarityError {
    #[error("embedding request failed: {0}")]
    Backend(String),
}

pub type SimilarityResult<T> = Result<T, SimilarityError>;

/// Computes embeddings for similarity comparison.
#[async_trait]
pub trait SimilarityBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> SimilarityResult<Vec<f32>>;

    /// Cosine similarity of two texts, clamped to [0, 1].
    async fn similarity(&self, a: &str, b: &str) -> SimilarityResult<f64> {
        let (va, vb) = (self.embed(a).await?, self.embed(b).await?);
        Ok(cosine(&va, &vb).max(0.0))
    }
}

pub type SharedSimilarity = Arc<dyn SimilarityBackend>;

/// Cosine similarity of two vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Dimension of the hashed lexical embedding.
const LEXICAL_DIM: usize = 256;

/// Words that open a negation scope.
const NEGATORS: &[&str] = &["not", "no", "never", "dont", "don't", "cannot", "can't", "avoid", "against", "without"];

/// How many following terms a negator flips.
const NEGATION_WINDOW: usize = 3;

/// Deterministic local embedding backend.
///
/// Hashed bag-of-words with negation scoping: a term within
/// `NEGATION_WINDOW` tokens of a negator hashes to a different bucket
/// than its plain form, so contradictory claims score near zero.
#[derive(Debug, Default)]
pub struct LexicalBackend;

impl LexicalBackend {
    pub fn shared() -> SharedSimilarity {
        Arc::new(Self)
    }

    /// Tokenize with negation scoping applied.
    pub fn tokens(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut negated = 0usize;
        for raw in text.split(|c: char| !c.is_alphanumeric() && c != '\'') {
            let word = raw.trim_matches('\'').to_lowercase();
            if word.is_empty() {
                continue;
            }
            if NEGATORS.contains(&word.as_str()) {
                negated = NEGATION_WINDOW;
                out.push(format!("neg<{word}>"));
                continue;
            }
            if negated > 0 {
                negated -= 1;
                out.push(format!("neg<{word}>"));
            } else {
                out.push(word);
            }
        }
        out
    }

    fn hash_bucket(token: &str) -> usize {
        // FNV-1a; stable across runs, which replay depends on.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % LEXICAL_DIM as u64) as usize
    }

    pub fn embed_sync(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; LEXICAL_DIM];
        for token in Self::tokens(text) {
            vector[Self::hash_bucket(&token)] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl SimilarityBackend for LexicalBackend {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn embed(&self, text: &str) -> SimilarityResult<Vec<f32>> {
        Ok(Self::embed_sync(text))
    }
}

/// Remote embedding backend over an OpenAI-compatible `/embeddings`
/// endpoint. Serves `openai`, `sentence-transformers` servers, and
/// Gemini's compatibility surface.
pub struct RemoteEmbeddingBackend {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    name: String,
}

impl RemoteEmbeddingBackend {
    pub fn new(name: &str, url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl SimilarityBackend for RemoteEmbeddingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, text: &str) -> SimilarityResult<Vec<f32>> {
        let body = serde_json::json!({"model": self.model, "input": text});
        let response = self
            .http
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SimilarityError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SimilarityError::Backend(format!(
                "status {}",
                response.status()
            )));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SimilarityError::Backend(e.to_string()))?;
        let vector = value["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| SimilarityError::Backend("missing embedding".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect();
        Ok(vector)
    }
}

/// Resolve the configured embedding backend. `auto` prefers a remote
/// backend when a key is present and falls back to the local lexical
/// one otherwise.
pub fn backend_from_config(config: &AragoraConfig) -> SharedSimilarity {
    let openai = |key: &str| -> SharedSimilarity {
        Arc::new(RemoteEmbeddingBackend::new(
            "openai-embeddings",
            "https://api.openai.com/v1",
            key,
            "text-embedding-3-small",
        ))
    };
    match config.embedding_provider {
        EmbeddingProvider::OpenAi => match &config.openai_api_key {
            Some(key) => openai(key),
            None => LexicalBackend::shared(),
        },
        EmbeddingProvider::Gemini => match &config.gemini_api_key {
            Some(key) => Arc::new(RemoteEmbeddingBackend::new(
                "gemini-embeddings",
                "https://generativelanguage.googleapis.com/v1beta/openai",
                key,
                "text-embedding-004",
            )),
            None => LexicalBackend::shared(),
        },
        EmbeddingProvider::SentenceTransformers => match &config.embedding_url {
            Some(url) => Arc::new(RemoteEmbeddingBackend::new(
                "sentence-transformers",
                url,
                "",
                "all-MiniLM-L6-v2",
            )),
            None => LexicalBackend::shared(),
        },
        EmbeddingProvider::Auto => match &config.openai_api_key {
            Some(key) => openai(key),
            None => LexicalBackend::shared(),
        },
    }
}

/// Mean pairwise similarity across a round's final messages.
pub async fn round_similarity(
    backend: &dyn SimilarityBackend,
    messages: &[&str],
) -> SimilarityResult<Option<f64>> {
    if messages.len() < 2 {
        return Ok(None);
    }
    let mut total = 0.0;
    let mut pairs = 0u32;
    for i in 0..messages.len() {
        for j in (i + 1)..messages.len() {
            total += backend.similarity(messages[i], messages[j]).await?;
            pairs += 1;
        }
    }
    Ok(Some(total / pairs as f64))
}

/// Tracks per-round similarity and decides when to stop early.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    settings: ConvergenceSettings,
    history: Vec<f64>,
}

impl ConvergenceTracker {
    pub fn new(settings: ConvergenceSettings) -> Self {
        Self {
            settings,
            history: Vec::new(),
        }
    }

    /// Record the similarity observed at the end of a round.
    pub fn observe(&mut self, similarity: Option<f64>) {
        self.history.push(similarity.unwrap_or(0.0));
    }

    /// Early stop fires when the last two rounds both met the threshold
    /// and the minimum round count has fully run.
    pub fn should_stop(&self, round: u32) -> bool {
        if !self.settings.enabled || round <= self.settings.min_rounds {
            return false;
        }
        let n = self.history.len();
        n >= 2
            && self.history[n - 1] >= self.settings.similarity_threshold
            && self.history[n - 2] >= self.settings.similarity_threshold
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }
}
