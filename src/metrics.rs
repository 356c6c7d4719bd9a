// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "ticks recorded by the session store").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "ticks recorded per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "fills applied (label: kind)"), &["kind"]).unwrap()
});

pub static INGEST_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ingest_rejects_total", "payloads rejected at the HTTP boundary"),
        &["route", "code"],
    )
    .unwrap()
});

// -------- Derived events --------
pub static GUARDRAILS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("guardrail_alerts_total", "guardrail alerts (labels: rule, severity)"),
        &["rule", "severity"],
    )
    .unwrap()
});

pub static MARKOV_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("markov_snapshots_total", "regime snapshots published").unwrap()
});

pub static SHADOW_FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("shadow_fills_total", "simulated queue-aware fills").unwrap());

// -------- Bus / stream --------
pub static BUS_SUBSCRIBERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("bus_subscribers", "live event bus subscribers").unwrap());

pub static BUS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("bus_events_total", "events published (label: type)"), &["type"])
        .unwrap()
});

pub static BUS_HANDLER_PANICS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_handler_panics_total", "subscriber handlers that panicked"),
        &["subscriber"],
    )
    .unwrap()
});

pub static STREAM_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("stream_clients", "connected SSE clients").unwrap());

// -------- Control --------
pub static CONTROL_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("control_commands_total", "control commands accepted (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static CONTROL_LINK_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("control_link_connected", "1 if the outbound control link is open").unwrap()
});

pub static CONTROL_LINK_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("control_link_reconnects_total", "failed control link connects").unwrap()
});

pub static CONTROL_LINK_QUEUED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("control_link_queued", "commands waiting for the control link").unwrap()
});

// -------- PnL --------
pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL across symbols").unwrap());

pub static PNL_NET: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_net", "realized + unrealized PnL at last tick prices").unwrap());

pub static POSITION_QTY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("position_qty_rounded", "net qty per symbol (rounded)"),
        &["symbol"],
    )
    .unwrap()
});

pub static MARK_LOOKUP_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("mark_lookup_errors_total", "mark-to-market lookups that gave up").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(INGEST_REJECTS.clone())),
        REGISTRY.register(Box::new(GUARDRAILS.clone())),
        REGISTRY.register(Box::new(MARKOV_PUBLISHED.clone())),
        REGISTRY.register(Box::new(SHADOW_FILLS.clone())),
        REGISTRY.register(Box::new(BUS_SUBSCRIBERS.clone())),
        REGISTRY.register(Box::new(BUS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(BUS_HANDLER_PANICS.clone())),
        REGISTRY.register(Box::new(STREAM_CLIENTS.clone())),
        REGISTRY.register(Box::new(CONTROL_COMMANDS.clone())),
        REGISTRY.register(Box::new(CONTROL_LINK_CONNECTED.clone())),
        REGISTRY.register(Box::new(CONTROL_LINK_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CONTROL_LINK_QUEUED.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_NET.clone())),
        REGISTRY.register(Box::new(POSITION_QTY.clone())),
        REGISTRY.register(Box::new(MARK_LOOKUP_ERRORS.clone())),
    ] {
        if let Err(e) = m {
            tracing::debug!(?e, "metric already registered");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
