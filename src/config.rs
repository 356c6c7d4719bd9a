// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : telemetry_core: live telemetry & risk-control core in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Ingests ticks/fills over HTTP, keeps per-symbol positions and PnL,
          fires price-spike guardrails, tracks a Markov regime per symbol,
          simulates queue-aware shadow fills, dispatches operator control
          commands, and broadcasts everything on an SSE stream.
=============================================================================
*/
use std::env;
use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;

use crate::guardrail::GuardrailCfg;
use crate::session::StoreLimits;

/// Process options. Every flag can also come from env / `.env`.
#[derive(Parser, Clone, Debug)]
#[command(name = "telemetry_core", version, about = "live telemetry & risk-control core")]
pub struct Args {
    /// HTTP port (ingest, snapshots, /stream, /metrics)
    #[arg(long, env = "HTTP_PORT", default_value_t = 9898)]
    pub http_port: u16,

    /// Shared secret expected in `x-ingest-key`; empty = allow all
    #[arg(long, env = "INGEST_KEY")]
    pub ingest_key: Option<String>,

    /// Directory for last_command.json, trading.json and the audit journal
    #[arg(long, env = "STATE_DIR", default_value = "./state")]
    pub state_dir: PathBuf,

    /// ws:// or wss:// bridge that receives forwarded control commands
    #[arg(long, env = "BRIDGE_URL")]
    pub bridge_url: Option<String>,

    /// Base URL of the mark price service (`GET {url}/price?symbol=`)
    #[arg(long, env = "MARK_URL")]
    pub mark_url: Option<String>,

    /// Run the built-in random producers (ticks, fills, account, shadow prints)
    #[arg(long, env = "DEV_SIM", default_value_t = false)]
    pub dev_sim: bool,

    /// Symbols for the dev simulation, comma separated
    #[arg(long, env = "SYMBOLS", value_delimiter = ',', default_value = "AAPL,MSFT,ES")]
    pub symbols: Vec<String>,

    /// SSE keep-alive interval
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Shadow order latency before it may fill
    #[arg(long, env = "SHADOW_LATENCY_MS", default_value_t = 60)]
    pub shadow_latency_ms: i64,

    /// How often the shadow desk is polled for fills
    #[arg(long, env = "SHADOW_POLL_MS", default_value_t = 50)]
    pub shadow_poll_ms: u64,

    /// Minimum gap between `markov` publishes per symbol
    #[arg(long, env = "MARKOV_INTERVAL_MS", default_value_t = 1000)]
    pub markov_interval_ms: i64,
}

impl Args {
    /// Symbols trimmed, uppercased, blanks and repeats removed.
    pub fn normalized_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in self.symbols.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            let s = s.to_ascii_uppercase();
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }
}

/// Everything the service needs, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub args: Args,
    pub guardrail: GuardrailCfg,
    pub limits: StoreLimits,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|x| x.trim().parse().ok()).unwrap_or(default)
}

pub fn guardrail_from_env() -> GuardrailCfg {
    let d = GuardrailCfg::default();
    GuardrailCfg {
        spike_pct: env_or("GUARD_SPIKE_PCT", d.spike_pct),
        spike_window_ms: env_or("GUARD_SPIKE_WINDOW_MS", d.spike_window_ms),
        debounce_ms: env_or("GUARD_DEBOUNCE_MS", d.debounce_ms),
        escalation_window_ms: env_or("GUARD_ESCALATION_WINDOW_MS", d.escalation_window_ms),
        block_after: env_or("GUARD_BLOCK_AFTER", d.block_after),
    }
}

pub fn limits_from_env() -> StoreLimits {
    let d = StoreLimits::default();
    StoreLimits {
        max_fills: env_or("MAX_FILLS", d.max_fills),
        max_guardrails: env_or("MAX_GUARDRAILS", d.max_guardrails),
        max_ticks_per_symbol: env_or("MAX_TICKS_PER_SYMBOL", d.max_ticks_per_symbol),
    }
}

pub fn load() -> Config {
    // Pastikan .env dibaca sebelum clap melihat env
    let _ = dotenv();
    let args = Args::parse();
    Config { args, guardrail: guardrail_from_env(), limits: limits_from_env() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_flags() {
        let args = Args::try_parse_from(["telemetry_core", "--symbols", " aapl,,msft ,aapl"]).unwrap();
        assert_eq!(args.http_port, 9898);
        assert_eq!(args.heartbeat_secs, 15);
        assert_eq!(args.shadow_latency_ms, 60);
        assert_eq!(args.markov_interval_ms, 1000);
        assert_eq!(args.normalized_symbols(), vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn flags_override() {
        let args = Args::try_parse_from([
            "telemetry_core",
            "--http-port",
            "8080",
            "--dev-sim",
            "--ingest-key",
            "k",
            "--state-dir",
            "/tmp/x",
        ])
        .unwrap();
        assert_eq!(args.http_port, 8080);
        assert!(args.dev_sim);
        assert_eq!(args.ingest_key.as_deref(), Some("k"));
        assert_eq!(args.state_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn unparsable_env_falls_back() {
        assert_eq!(env_or("TELEMETRY_CORE_TEST_UNSET_KEY", 42u32), 42);
    }
}
