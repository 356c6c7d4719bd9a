// ===============================
// src/guardrail.rs
// ===============================
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriberHandle};
use crate::domain::{Event, GuardrailAlert, Severity, Tick};
use crate::metrics::GUARDRAILS;

pub const RULE_PRICE_SPIKE: &str = "PRICE_SPIKE";

#[derive(Clone, Debug)]
pub struct GuardrailCfg {
    /// |Δp / p| that counts as a spike (0.0025 = 0.25%)
    pub spike_pct: f64,
    /// max gap between the two ticks
    pub spike_window_ms: i64,
    /// per (symbol, rule) quiet period after a fire
    pub debounce_ms: i64,
    pub escalation_window_ms: i64,
    /// fire number (inside one window) that turns warn into block
    pub block_after: u32,
}

impl Default for GuardrailCfg {
    fn default() -> Self {
        Self {
            spike_pct: 0.0025,
            spike_window_ms: 3_000,
            debounce_ms: 1_500,
            escalation_window_ms: 10_000,
            block_after: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastTick { price: f64, ts_ms: i64 }

#[derive(Debug, Clone, Copy)]
struct BurstWindow { start_ms: i64, count: u32 }

#[derive(Debug, Default)]
struct GuardState {
    last_tick: HashMap<String, LastTick>,
    last_fire: HashMap<(String, &'static str), i64>,
    bursts: HashMap<String, BurstWindow>,
}

/// Reactive spike detector. It only raises alerts, blocking trading is up to
/// whoever consumes `block` alerts.
pub struct GuardrailEngine {
    cfg: GuardrailCfg,
    state: Mutex<GuardState>,
}

impl GuardrailEngine {
    pub fn new(cfg: GuardrailCfg) -> Self {
        Self { cfg, state: Mutex::new(GuardState::default()) }
    }

    pub fn on_tick(&self, tick: &Tick) -> Option<GuardrailAlert> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return None;
        }
        let mut st = self.state.lock();
        let prev = st
            .last_tick
            .insert(tick.symbol.clone(), LastTick { price: tick.price, ts_ms: tick.ts_ms })?;

        let pct = ((tick.price - prev.price) / prev.price).abs();
        let dt_ms = tick.ts_ms - prev.ts_ms;
        if pct < self.cfg.spike_pct || dt_ms < 0 || dt_ms > self.cfg.spike_window_ms {
            return None;
        }

        // 1) debounce per (symbol, rule)
        let key = (tick.symbol.clone(), RULE_PRICE_SPIKE);
        if let Some(last) = st.last_fire.get(&key) {
            if tick.ts_ms - last < self.cfg.debounce_ms {
                debug!(symbol = %tick.symbol, pct, "guardrail: spike debounced");
                return None;
            }
        }
        st.last_fire.insert(key, tick.ts_ms);

        // 2) escalation window per symbol
        let window_ms = self.cfg.escalation_window_ms;
        let burst = st
            .bursts
            .entry(tick.symbol.clone())
            .or_insert(BurstWindow { start_ms: tick.ts_ms, count: 0 });
        if tick.ts_ms - burst.start_ms > window_ms {
            *burst = BurstWindow { start_ms: tick.ts_ms, count: 0 };
        }
        burst.count += 1;
        let severity = if burst.count >= self.cfg.block_after { Severity::Block } else { Severity::Warn };

        let secs = dt_ms as f64 / 1000.0;
        Some(GuardrailAlert {
            id: format!("GR-{}-{:08x}", tick.ts_ms, rand::thread_rng().gen::<u32>()),
            ts_ms: tick.ts_ms,
            rule: RULE_PRICE_SPIKE.to_string(),
            message: format!("{} moved {:.2}% in {:.2}s", tick.symbol, pct * 100.0, secs),
            symbol: Some(tick.symbol.clone()),
            severity,
        })
    }

    /// Subscribe to ticks and publish alerts back onto the same bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriberHandle {
        let engine = Arc::clone(self);
        let out = bus.clone();
        bus.subscribe_fn("guardrail", move |ev| match ev {
            Event::Tick(tick) => {
                if let Some(alert) = engine.on_tick(tick) {
                    GUARDRAILS
                        .with_label_values(&[&alert.rule, alert.severity.as_str()])
                        .inc();
                    warn!(symbol = %tick.symbol, severity = alert.severity.as_str(), msg = %alert.message, "guardrail fired");
                    out.publish(Event::Guardrail(alert));
                }
            }
            Event::Fill(_) | Event::Guardrail(_) | Event::Account(_) | Event::Control(_) | Event::Markov(_) => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, price: f64) -> Tick {
        Tick { symbol: "AAPL".into(), price, ts_ms }
    }

    fn feed(engine: &GuardrailEngine, ticks: &[(i64, f64)]) -> Vec<GuardrailAlert> {
        ticks.iter().filter_map(|(ts, px)| engine.on_tick(&tick(*ts, *px))).collect()
    }

    #[test]
    fn half_percent_move_within_a_second_warns() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (800, 100.5)]);
        assert_eq!(alerts.len(), 1);
        let a = &alerts[0];
        assert_eq!(a.rule, RULE_PRICE_SPIKE);
        assert_eq!(a.severity, Severity::Warn);
        assert_eq!(a.symbol.as_deref(), Some("AAPL"));
        assert_eq!(a.ts_ms, 800);
        assert!(a.message.contains("0.50%"), "{}", a.message);
        assert!(a.message.contains("0.80s"), "{}", a.message);
    }

    #[test]
    fn slow_or_small_moves_are_ignored() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        // 1% but 4s apart
        assert!(feed(&engine, &[(0, 100.0), (4_000, 101.0)]).is_empty());
        // 0.1% quickly
        assert!(feed(&engine, &[(4_100, 101.1)]).is_empty());
        // first tick of a symbol never fires
        assert!(engine.on_tick(&Tick { symbol: "MSFT".into(), price: 1.0, ts_ms: 0 }).is_none());
    }

    #[test]
    fn debounce_suppresses_refire() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (500, 100.5), (1_000, 101.1)]);
        assert_eq!(alerts.len(), 1);

        // 1600ms after the fire the key is armed again
        let later = feed(&engine, &[(2_100, 101.8)]);
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn thresholds_are_inclusive() {
        // exactly 0.25%
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        assert_eq!(feed(&engine, &[(0, 100.0), (500, 100.25)]).len(), 1);

        // exactly 3000ms apart
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (3_000, 101.0)]);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("3.00s"), "{}", alerts[0].message);

        // 3001ms is outside the window
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        assert!(feed(&engine, &[(0, 100.0), (3_001, 101.0)]).is_empty());
    }

    #[test]
    fn refire_allowed_exactly_at_debounce_edge() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (1_000, 100.5), (2_500, 101.0)]);
        assert_eq!(alerts.iter().map(|a| a.ts_ms).collect::<Vec<_>>(), vec![1_000, 2_500]);

        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (1_000, 100.5), (2_499, 101.0)]);
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn debounce_is_per_symbol() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let mk = |s: &str, ts, px| Tick { symbol: s.into(), price: px, ts_ms: ts };
        engine.on_tick(&mk("AAPL", 0, 100.0));
        engine.on_tick(&mk("MSFT", 0, 200.0));
        assert!(engine.on_tick(&mk("AAPL", 200, 101.0)).is_some());
        assert!(engine.on_tick(&mk("MSFT", 300, 202.0)).is_some());
    }

    #[test]
    fn third_spike_in_window_blocks_then_resets() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(
            &engine,
            &[(0, 100.0), (1_000, 100.5), (3_000, 101.0), (5_000, 101.6), (10_000, 101.6), (12_000, 102.2)],
        );
        let sev: Vec<Severity> = alerts.iter().map(|a| a.severity).collect();
        assert_eq!(sev, vec![Severity::Warn, Severity::Warn, Severity::Block, Severity::Warn]);
    }

    #[test]
    fn ids_are_unique() {
        let engine = GuardrailEngine::new(GuardrailCfg::default());
        let alerts = feed(&engine, &[(0, 100.0), (1_000, 101.0), (3_000, 102.0)]);
        assert_eq!(alerts.len(), 2);
        assert_ne!(alerts[0].id, alerts[1].id);
    }

    #[tokio::test]
    async fn attached_engine_publishes_alerts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let engine = Arc::new(GuardrailEngine::new(GuardrailCfg::default()));
        let handle = engine.attach(&bus);

        bus.publish(Event::Tick(tick(0, 100.0)));
        bus.publish(Event::Tick(tick(900, 100.5)));

        let mut alert = None;
        while alert.is_none() {
            match tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv()).await {
                Ok(Some(Event::Guardrail(a))) => alert = Some(a),
                Ok(Some(_)) => continue,
                other => panic!("no guardrail event: {other:?}"),
            }
        }
        assert_eq!(alert.map(|a| a.severity), Some(Severity::Warn));
        handle.close().await;
    }
}
