//! REST projection of the engine.
//!
//! Thin, stateless handlers: auth + rate limit at the boundary, bounded
//! reads from the store, JSON out. Error bodies carry a stable
//! machine-readable code and never leak internals.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::json;

use super::auth::{AuthError, Identity};
use super::ws;
use crate::engine::{DebateRequest, Engine, EngineError};

/// API failure with a stable wire code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    RateLimited(u64),
    NotFound(String),
    Internal,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited(_) => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            Self::RateLimited(retry) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("rate limited; retry after {retry}s"),
            ),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };
        let body = Json(json!({"error": self.code(), "message": message}));
        let mut response = (status, body).into_response();
        if let Self::RateLimited(retry) = self {
            if let Ok(value) = retry.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidInput(m) | EngineError::NoProvider(m) => Self::BadRequest(m),
            EngineError::Store(_) | EngineError::Metrics(_) | EngineError::Debate(_) => {
                Self::Internal
            }
        }
    }
}

fn bearer_token<'a>(headers: &'a HeaderMap, params: &'a HashMap<String, String>) -> Option<&'a str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| params.get("token").map(String::as_str))
}

/// Auth + rate limit at the boundary; returns the acting identity.
fn gate(
    engine: &Engine,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    addr: SocketAddr,
) -> Result<Identity, ApiError> {
    let identity = engine
        .auth
        .identify(bearer_token(headers, params), &addr.ip().to_string())
        .map_err(|e| match e {
            AuthError::Expired => ApiError::Unauthorized("token expired".to_string()),
            other => ApiError::Unauthorized(other.to_string()),
        })?;
    let limiter = if identity.is_authenticated() {
        &engine.token_limiter
    } else {
        &engine.ip_limiter
    };
    limiter.check(&identity.bucket_key()).map_err(|e| {
        engine.metrics.rate_limited.inc();
        ApiError::RateLimited(e.retry_after_secs)
    })?;
    Ok(identity)
}

fn parse_limit(engine: &Engine, params: &HashMap<String, String>) -> u32 {
    engine
        .config
        .clamp_limit(params.get("limit").and_then(|v| v.parse().ok()))
}

fn decode_cursor(params: &HashMap<String, String>) -> Result<Option<i64>, ApiError> {
    match params.get("cursor") {
        None => Ok(None),
        Some(cursor) => URL_SAFE_NO_PAD
            .decode(cursor)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest("malformed cursor".to_string())),
    }
}

fn encode_cursor(id: i64) -> String {
    URL_SAFE_NO_PAD.encode(id.to_string())
}

// ========================================================================
// Handlers
// ========================================================================

pub async fn health(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "storage": engine.store.health(),
            "auth": engine.auth.enabled(),
            "providers": {
                "openai": engine.config.openai_api_key.is_some(),
                "anthropic": engine.config.anthropic_api_key.is_some(),
                "gemini": engine.config.gemini_api_key.is_some(),
            },
            "active_debates": engine.active_debates(),
        },
    }))
}

pub async fn list_debates(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let limit = parse_limit(&engine, &params);
    let before = decode_cursor(&params)?;
    let (debates, next) = engine
        .store
        .list_debates(limit, before)
        .map_err(|_| ApiError::Internal)?;
    Ok(Json(json!({
        "debates": debates,
        "cursor": next.map(encode_cursor),
    })))
}

pub async fn get_debate(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let debate = engine
        .store
        .get_debate_by_slug(&slug)
        .map_err(|_| ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("no debate '{slug}'")))?;
    let messages = engine
        .store
        .messages_for(&debate.debate_id)
        .map_err(|_| ApiError::Internal)?;
    Ok(Json(json!({"debate": debate, "messages": messages})))
}

pub async fn start_debate(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<DebateRequest>,
) -> Result<Response, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let ticket = engine.spawn_debate(request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"debate": ticket}))).into_response())
}

pub async fn leaderboard(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let limit = parse_limit(&engine, &params);
    let domain = params.get("domain").cloned();
    // Optional blend of consistency into the ordering; 0 (the default)
    // ranks by ELO alone.
    let weight: f64 = params
        .get("consistency_weight")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let cache_key = format!("{}:{limit}:{weight}", domain.as_deref().unwrap_or("*"));

    if let Some(cached) = engine.leaderboard_cache.get(&cache_key) {
        return Ok(Json(cached));
    }
    let mut rows = engine
        .store
        .leaderboard(domain.as_deref(), limit)
        .map_err(|_| ApiError::Internal)?;
    if weight > 0.0 {
        rows.sort_by(|a, b| {
            let score = |r: &crate::ranking::AgentRating| r.elo * (1.0 - weight + weight * r.consistency);
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    let body = json!({"leaderboard": rows});
    engine.leaderboard_cache.put(cache_key, body.clone());
    Ok(Json(body))
}

pub async fn recent_matches(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let limit = parse_limit(&engine, &params);
    let matches = engine
        .store
        .recent_matches(limit)
        .map_err(|_| ApiError::Internal)?;
    Ok(Json(json!({"matches": matches})))
}

pub async fn recent_flips(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let limit = parse_limit(&engine, &params);
    let flips = engine
        .store
        .recent_flips(limit)
        .map_err(|_| ApiError::Internal)?;
    Ok(Json(json!({"flips": flips})))
}

pub async fn agent_consistency(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let report = engine
        .ranking
        .consistency(&name)
        .map_err(|_| ApiError::Internal)?;
    Ok(Json(json!({"consistency": report})))
}

pub async fn metrics(State(engine): State<Arc<Engine>>) -> Result<Response, ApiError> {
    let text = engine
        .metrics
        .encode_text()
        .map_err(|_| ApiError::Internal)?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

pub async fn ws_upgrade(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    gate(&engine, &headers, &params, addr)?;
    let max_frame = engine.config.ws_max_frame;
    Ok(upgrade
        .max_frame_size(max_frame)
        .max_message_size(max_frame)
        .on_upgrade(move |socket| ws::client_session(socket, engine)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let encoded = encode_cursor(42);
        let mut params = HashMap::new();
        params.insert("cursor".to_string(), encoded);
        assert_eq!(decode_cursor(&params).unwrap(), Some(42));
    }

    #[test]
    fn test_cursor_malformed() {
        let mut params = HashMap::new();
        params.insert("cursor".to_string(), "!!!not-base64!!!".to_string());
        assert!(decode_cursor(&params).is_err());
        assert_eq!(decode_cursor(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers, &HashMap::new()), Some("abc"));

        let mut params = HashMap::new();
        params.insert("token".to_string(), "xyz".to_string());
        assert_eq!(bearer_token(&HeaderMap::new(), &params), Some("xyz"));
        assert_eq!(bearer_token(&HeaderMap::new(), &HashMap::new()), None);
    }

    #[test]
    fn test_api_error_codes() {
        assert_eq!(ApiError::BadRequest(String::new()).code(), "bad_request");
        assert_eq!(ApiError::Unauthorized(String::new()).code(), "unauthorized");
        assert_eq!(ApiError::RateLimited(5).code(), "rate_limited");
        assert_eq!(ApiError::NotFound(String::new()).code(), "not_found");
        assert_eq!(ApiError::Internal.code(), "internal");
    }
}
