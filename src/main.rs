// ===============================
// src/main.rs
// ===============================
/*
 # snapshot & stream
 curl -s localhost:9898/positions | jq
 curl -s 'localhost:9898/fills?limit=20' | jq
 curl -N localhost:9898/stream

 # ingest (tambahkan -H 'x-ingest-key: ...' kalau INGEST_KEY di-set)
 curl -s -XPOST localhost:9898/ingest/tick -d '{"symbol":"AAPL","price":100.5}'
 curl -s -XPOST localhost:9898/control -d '{"kind":"set_trading_mode","payload":{"enabled":true}}'

 # metrics
 curl -s localhost:9898/metrics | grep '^guardrail_alerts_total'
*/
/*
=============================================================================
Project : telemetry_core: live telemetry & risk-control core in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Ingests ticks/fills over HTTP, keeps per-symbol positions and PnL,
          fires price-spike guardrails, tracks a Markov regime per symbol,
          simulates queue-aware shadow fills, dispatches operator control
          commands, and broadcasts everything on an SSE stream.
=============================================================================
*/
use std::net::SocketAddr;

use telemetry_core::{config, feed, metrics, server, service};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cfg = config::load();
    let args = &cfg.args;
    let symbols = args.normalized_symbols();
    info!(
        http_port = args.http_port,
        state_dir = %args.state_dir.display(),
        bridge = args.bridge_url.as_deref().unwrap_or("-"),
        marks = args.mark_url.as_deref().unwrap_or("-"),
        dev_sim = args.dev_sim,
        symbols = ?symbols,
        guardrail = ?cfg.guardrail,
        limits = ?cfg.limits,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();

    // ---- Service ----
    let mut svc = match service::Service::new(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "service init failed");
            std::process::exit(2);
        }
    };
    svc.start();
    let core = svc.core();

    // ---- HTTP ----
    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let (local, http) = match server::bind(addr, core.clone(), core.shutdown.clone()) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, %addr, "http bind failed");
            std::process::exit(1);
        }
    };
    let http_task = tokio::spawn(async move {
        if let Err(e) = http.await {
            error!(error = %e, "http server error");
        }
    });
    info!(%local, "ready");

    // ---- Dev sim (optional) ----
    let sim = args
        .dev_sim
        .then(|| feed::start(core.clone(), symbols.clone(), feed::SimIntervals::default()));

    // ---- Tunggu Ctrl-C ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "ctrl_c listener failed, shutting down");
    }
    info!("shutdown requested");

    if let Some(sim) = sim {
        sim.stop().await;
    }
    drop(core);
    svc.shutdown().await;
    let _ = http_task.await;
}
