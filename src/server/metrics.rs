//! Prometheus metrics for the engine.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics registration failed: {0}")]
    Registration(String),
    #[error("metrics encoding failed: {0}")]
    Encoding(String),
}

/// Engine metrics, registered once at startup.
pub struct Metrics {
    registry: Registry,
    pub debates_started: IntCounter,
    pub debates_completed: IntCounterVec,
    pub events_published: IntCounter,
    pub ws_clients: IntGauge,
    pub ws_slow_drops: IntCounter,
    pub rate_limited: IntCounter,
    pub agent_turns: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let reg = |e: prometheus::Error| MetricsError::Registration(e.to_string());

        let debates_started = IntCounter::with_opts(Opts::new(
            "aragora_debates_started_total",
            "Debates admitted by the orchestrator",
        ))
        .map_err(reg)?;
        let debates_completed = IntCounterVec::new(
            Opts::new(
                "aragora_debates_completed_total",
                "Debates sealed, by outcome",
            ),
            &["outcome"],
        )
        .map_err(reg)?;
        let events_published = IntCounter::with_opts(Opts::new(
            "aragora_events_published_total",
            "Events durably appended and broadcast",
        ))
        .map_err(reg)?;
        let ws_clients = IntGauge::with_opts(Opts::new(
            "aragora_ws_clients",
            "Connected WebSocket subscribers",
        ))
        .map_err(reg)?;
        let ws_slow_drops = IntCounter::with_opts(Opts::new(
            "aragora_ws_slow_drops_total",
            "Subscribers dropped for not keeping up",
        ))
        .map_err(reg)?;
        let rate_limited = IntCounter::with_opts(Opts::new(
            "aragora_rate_limited_total",
            "Requests rejected by the rate limiter",
        ))
        .map_err(reg)?;
        let agent_turns = IntCounterVec::new(
            Opts::new("aragora_agent_turns_total", "Agent turns, by outcome"),
            &["outcome"],
        )
        .map_err(reg)?;

        for collector in [
            Box::new(debates_started.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(debates_completed.clone()),
            Box::new(events_published.clone()),
            Box::new(ws_clients.clone()),
            Box::new(ws_slow_drops.clone()),
            Box::new(rate_limited.clone()),
            Box::new(agent_turns.clone()),
        ] {
            registry.register(collector).map_err(reg)?;
        }

        Ok(Self {
            registry,
            debates_started,
            debates_completed,
            events_published,
            ws_clients,
            ws_slow_drops,
            rate_limited,
            agent_turns,
        })
    }

    /// Encode every metric in Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
