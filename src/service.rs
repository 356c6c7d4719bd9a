// ===============================
// src/service.rs (wiring: components, subscribers, background loops)
// ===============================
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::backoff::Backoff;
use crate::bus::{EventBus, SubscriberHandle};
use crate::config::Config;
use crate::control::{ControlChannel, AUDIT_FILE};
use crate::domain::{now_ms, Event};
use crate::guardrail::GuardrailEngine;
use crate::ingest::IngestKey;
use crate::link::{ControlLink, LinkError, WsTransport};
use crate::marks::{MarkClient, RetryPolicy};
use crate::regime::RegimeTracker;
use crate::session::SessionStore;
use crate::shadow::ShadowDesk;

/// Shared state handed to the HTTP layer and the dev simulation.
pub struct Core {
    pub bus: EventBus,
    pub store: Arc<SessionStore>,
    pub regime: Arc<RegimeTracker>,
    pub guardrails: Arc<GuardrailEngine>,
    pub shadow: Arc<Mutex<ShadowDesk>>,
    pub control: Arc<ControlChannel>,
    pub marks: Option<MarkClient>,
    pub ingest_key: Option<IngestKey>,
    pub heartbeat: Duration,
    pub shutdown: watch::Receiver<bool>,
}

pub struct Service {
    core: Arc<Core>,
    shadow_poll: Duration,
    shutdown_tx: watch::Sender<bool>,
    subscribers: Vec<SubscriberHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Build every component. Must run inside the tokio runtime (the audit
    /// writer and control link are spawned here).
    pub fn new(cfg: &Config) -> Result<Self, LinkError> {
        let args = &cfg.args;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bus = EventBus::new();
        let mut tasks = Vec::new();

        let audit = AuditLog::spawn(args.state_dir.join(AUDIT_FILE).display().to_string());
        let link = match args.bridge_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => {
                let transport = WsTransport::new(url)?;
                let (link, task) = ControlLink::spawn(transport, Backoff::default(), shutdown_rx.clone());
                tasks.push(task);
                Some(link)
            }
            None => {
                info!("control link disabled (no BRIDGE_URL)");
                None
            }
        };

        let ingest_key = IngestKey::new(args.ingest_key.as_deref());
        match args.ingest_key.as_deref().filter(|_| ingest_key.is_some()) {
            Some(k) => info!(fingerprint = %IngestKey::fingerprint(k), "ingest key configured"),
            None => warn!("no ingest key configured, POST routes are open"),
        }

        let core = Core {
            control: Arc::new(ControlChannel::new(bus.clone(), &args.state_dir, audit, link)),
            store: Arc::new(SessionStore::new(cfg.limits.clone())),
            regime: Arc::new(RegimeTracker::new(args.markov_interval_ms)),
            guardrails: Arc::new(GuardrailEngine::new(cfg.guardrail.clone())),
            shadow: Arc::new(Mutex::new(ShadowDesk::new(args.shadow_latency_ms))),
            marks: args
                .mark_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .map(|u| MarkClient::new(u, RetryPolicy::default())),
            ingest_key,
            heartbeat: Duration::from_secs(args.heartbeat_secs.max(1)),
            shutdown: shutdown_rx,
            bus,
        };

        Ok(Self {
            core: Arc::new(core),
            shadow_poll: Duration::from_millis(args.shadow_poll_ms.max(1)),
            shutdown_tx,
            subscribers: Vec::new(),
            tasks,
        })
    }

    pub fn core(&self) -> Arc<Core> { Arc::clone(&self.core) }

    /// Attach the bus subscribers and start the shadow poller.
    pub fn start(&mut self) {
        let core = &self.core;
        self.subscribers.push(core.store.attach(&core.bus));
        self.subscribers.push(core.guardrails.attach(&core.bus));
        self.subscribers.push(core.regime.attach(&core.bus));
        self.tasks.push(tokio::spawn(run_shadow_poller(
            Arc::clone(&core.shadow),
            core.bus.clone(),
            self.shadow_poll,
            core.shutdown.clone(),
        )));
        info!(subscribers = core.bus.subscriber_count(), "service started");
    }

    /// Signal every task, drain the subscribers, wait for background loops.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for sub in self.subscribers {
            sub.close().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(?e, "service: task join failed");
            }
        }
        info!("service stopped");
    }
}

async fn run_shadow_poller(
    desk: Arc<Mutex<ShadowDesk>>,
    bus: EventBus,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let fills = desk.lock().poll(now_ms());
                for fill in fills {
                    debug!(order_id = %fill.order_id, symbol = %fill.symbol, qty = fill.qty, "shadow fill");
                    bus.publish(Event::Fill(fill));
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("shadow poller stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Args, Config};
    use crate::domain::{Fill, FillKind, Severity, ShadowOrder, Side, Tick};
    use crate::guardrail::GuardrailCfg;
    use crate::session::StoreLimits;
    use clap::Parser;

    pub(crate) fn test_config(state_dir: &std::path::Path, extra: &[&str]) -> Config {
        let dir = state_dir.display().to_string();
        let mut argv = vec!["telemetry_core", "--state-dir", dir.as_str()];
        argv.extend_from_slice(&["--shadow-poll-ms", "5"]);
        argv.extend_from_slice(extra);
        Config {
            args: Args::try_parse_from(argv).unwrap(),
            guardrail: GuardrailCfg::default(),
            limits: StoreLimits::default(),
        }
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn spike_alert_and_round_trip_pnl() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(&test_config(dir.path(), &[])).unwrap();
        svc.start();
        let core = svc.core();

        core.bus.publish(Event::Tick(Tick { symbol: "AAPL".into(), price: 100.0, ts_ms: 1_000 }));
        core.bus.publish(Event::Tick(Tick { symbol: "AAPL".into(), price: 100.5, ts_ms: 1_800 }));
        core.bus.publish(Event::Fill(Fill {
            order_id: "b1".into(),
            symbol: "AAPL".into(),
            qty: 10.0,
            price: 100.5,
            ts_ms: 1_900,
            kind: FillKind::Paper,
        }));
        core.bus.publish(Event::Fill(Fill {
            order_id: "s1".into(),
            symbol: "AAPL".into(),
            qty: -10.0,
            price: 102.0,
            ts_ms: 2_000,
            kind: FillKind::Paper,
        }));

        let store = Arc::clone(&core.store);
        settle(|| store.guardrails(10).len() == 1 && store.fills_snapshot(10).total == 2).await;

        let alerts = core.store.guardrails(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warn);
        assert!(alerts[0].message.contains("0.50%"), "{}", alerts[0].message);

        assert!((core.store.realized_pnl() - 15.0).abs() < 1e-9);
        let pos = core.store.position("AAPL").unwrap();
        assert_eq!(pos.qty, 0.0);
        assert_eq!(pos.avg_px, 0.0);

        drop(core);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn shadow_fills_reach_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = Service::new(&test_config(dir.path(), &["--shadow-latency-ms", "0"])).unwrap();
        svc.start();
        let core = svc.core();

        {
            let mut desk = core.shadow.lock();
            desk.on_book("ES", &crate::shadow::BookUpdate { bids: vec![[10.0, 5.0]], asks: vec![] });
            desk.place_limit(
                "ES",
                ShadowOrder { id: "sh1".into(), side: Side::Buy, price: 10.0, qty: 2.0, ts_ms: now_ms() - 1_000 },
            )
            .unwrap();
            desk.on_trade("ES", 10.0, 7.0, Side::Sell);
        }

        let store = Arc::clone(&core.store);
        settle(|| store.fills_snapshot(10).total == 1).await;
        let page = core.store.fills_snapshot(10);
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].kind, FillKind::Shadow);
        assert_eq!(page.items[0].qty, 2.0);
        assert_eq!(core.store.position("ES").unwrap().qty, 2.0);

        drop(core);
        svc.shutdown().await;
    }
}
