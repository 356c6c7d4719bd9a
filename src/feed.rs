// ===============================
// src/feed.rs (dev simulation producers)
// ===============================
//
// Produsen data palsu untuk development (--dev-sim):
// - ticks       : random walk per symbol
// - paper fills : buy/sell kecil di harga terakhir
// - account     : snapshot akun periodik
// - shadow      : book + trade print per symbol, sesekali pasang order shadow
//
// Tiap produsen adalah task sendiri dengan interval sendiri; semuanya
// berhenti lewat SimHandle::stop() atau saat handle di-drop.
//
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::domain::{now_ms, AccountSnapshot, Event, Fill, FillKind, ShadowOrder, Side, Tick};
use crate::service::Core;
use crate::shadow::BookUpdate;

#[derive(Clone, Debug)]
pub struct SimIntervals {
    pub tick: Duration,
    pub fill: Duration,
    pub account: Duration,
    pub shadow: Duration,
}

impl Default for SimIntervals {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            fill: Duration::from_secs(3),
            account: Duration::from_secs(5),
            shadow: Duration::from_millis(500),
        }
    }
}

pub struct SimHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimHandle {
    /// Signal every producer and wait for them to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("dev sim stopped");
    }

    pub fn producers(&self) -> usize { self.tasks.len() }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run `step` every `every` until stopped.
fn every<F>(every: Duration, mut stop: watch::Receiver<bool>, mut step: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut iv = tokio::time::interval(every);
        iv.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = iv.tick() => step(),
                _ = stop.changed() => break,
            }
        }
    })
}

fn mark(core: &Core, symbol: &str) -> f64 {
    core.store.last_price(symbol).unwrap_or(100.0)
}

pub fn start(core: Arc<Core>, symbols: Vec<String>, iv: SimIntervals) -> SimHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // ---- ticks: satu task per symbol ----
    for symbol in symbols.iter().cloned() {
        let bus = core.bus.clone();
        let mut px = 100.0_f64;
        tasks.push(every(iv.tick, stop_rx.clone(), move || {
            // jangan simpan ThreadRng melewati .await
            let step = rand::thread_rng().gen_range(-0.05..=0.05);
            px = (px + step).max(1.0);
            bus.publish(Event::Tick(Tick { symbol: symbol.clone(), price: (px * 100.0).round() / 100.0, ts_ms: now_ms() }));
        }));
    }

    // ---- paper fills ----
    if !symbols.is_empty() {
        let core_f = Arc::clone(&core);
        let syms = symbols.clone();
        let mut seq: u64 = 0;
        tasks.push(every(iv.fill, stop_rx.clone(), move || {
            let (idx, qty) = {
                let mut rng = rand::thread_rng();
                let qty = rng.gen_range(1..=5) as f64 * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                (rng.gen_range(0..syms.len()), qty)
            };
            seq += 1;
            let symbol = syms[idx].clone();
            let price = mark(&core_f, &symbol);
            core_f.bus.publish(Event::Fill(Fill {
                order_id: format!("SIM-{seq}"),
                symbol,
                qty,
                price,
                ts_ms: now_ms(),
                kind: FillKind::Paper,
            }));
        }));
    }

    // ---- account ----
    {
        let core_a = Arc::clone(&core);
        tasks.push(every(iv.account, stop_rx.clone(), move || {
            let cash = 100_000.0 + core_a.store.realized_pnl();
            let used = rand::thread_rng().gen_range(0.0..5_000.0);
            core_a.bus.publish(Event::Account(AccountSnapshot {
                ts_ms: now_ms(),
                cash,
                available_funds: cash - used,
                buying_power: (cash - used) * 4.0,
                margin_used: used,
                net_liquidation: 100_000.0 + core_a.store.net_pnl(),
                equity_with_loan: cash,
            }));
        }));
    }

    // ---- shadow book + prints ----
    for symbol in symbols.iter().cloned() {
        let core_s = Arc::clone(&core);
        let mut seq: u64 = 0;
        tasks.push(every(iv.shadow, stop_rx.clone(), move || {
            let mid = mark(&core_s, &symbol);
            let bid = (mid * 100.0).floor() / 100.0;
            let ask = bid + 0.01;
            let (bid_sz, ask_sz, print, aggressor, place) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(100.0..1_000.0),
                    rng.gen_range(100.0..1_000.0),
                    rng.gen_range(10.0..400.0),
                    if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
                    rng.gen_bool(0.1),
                )
            };
            let mut desk = core_s.shadow.lock();
            desk.on_book(&symbol, &BookUpdate { bids: vec![[bid, bid_sz]], asks: vec![[ask, ask_sz]] });
            if place {
                seq += 1;
                let order = ShadowOrder { id: format!("SIM-{symbol}-{seq}"), side: Side::Buy, price: bid, qty: 1.0, ts_ms: now_ms() };
                if let Err(e) = desk.place_limit(&symbol, order) {
                    debug!(%e, "dev sim: shadow order rejected");
                }
            }
            let px = match aggressor { Side::Sell => bid, Side::Buy => ask };
            desk.on_trade(&symbol, px, print, aggressor);
        }));
    }

    info!(symbols = ?symbols, producers = tasks.len(), "dev sim started");
    SimHandle { stop_tx, tasks }
}
