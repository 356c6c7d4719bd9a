// ===============================
// src/session.rs (session aggregates: ticks, fills, positions, alerts, account)
// ===============================
//
// Single writer untuk state sesi. Semua mutasi lewat satu Mutex sehingga
// reader tidak pernah melihat update setengah jadi; semua reader
// mengembalikan salinan.
//
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriberHandle};
use crate::domain::{AccountSnapshot, Event, Fill, GuardrailAlert, Tick};
use crate::metrics::{FILLS, PNL_NET, PNL_REALIZED, POSITION_QTY, TICKS, TICKS_BY_SYMBOL};
use crate::positions::{Position, PositionSnapshot, PositionsView};

pub const CSV_HEADER: [&str; 8] = ["timestamp", "orderId", "symbol", "side", "qty", "price", "kind", "notional"];

#[derive(Clone, Debug)]
pub struct StoreLimits {
    pub max_fills: usize,
    pub max_guardrails: usize,
    pub max_ticks_per_symbol: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self { max_fills: 5_000, max_guardrails: 2_000, max_ticks_per_symbol: 3_600 }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer flush failed: {0}")]
    Flush(String),
    #[error("csv output not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillsPage {
    pub total: usize,
    pub items: Vec<Fill>,
}

#[derive(Debug, Default)]
struct SessionState {
    last_price: HashMap<String, f64>,
    ticks: HashMap<String, VecDeque<Tick>>,
    // newest-first
    fills: VecDeque<Fill>,
    guardrails: VecDeque<GuardrailAlert>,
    positions: HashMap<String, Position>,
    account: Option<AccountSnapshot>,
}

fn net_of(st: &SessionState) -> f64 {
    st.positions
        .values()
        .map(|p| {
            let u = st.last_price.get(&p.symbol).map(|px| p.unrealized(*px)).unwrap_or(0.0);
            p.realized_pnl + u
        })
        .sum()
}

pub struct SessionStore {
    limits: StoreLimits,
    state: Mutex<SessionState>,
}

impl Default for SessionStore {
    fn default() -> Self { Self::new(StoreLimits::default()) }
}

impl SessionStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self { limits, state: Mutex::new(SessionState::default()) }
    }

    pub fn apply(&self, ev: &Event) {
        match ev {
            Event::Tick(t) => {
                self.record_tick(t.clone());
            }
            Event::Fill(f) => {
                self.record_fill(f.clone());
            }
            Event::Guardrail(g) => self.record_guardrail(g.clone()),
            Event::Account(a) => self.record_account(a.clone()),
            Event::Control(_) | Event::Markov(_) => {}
        }
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriberHandle {
        let store = Arc::clone(self);
        bus.subscribe_fn("session", move |ev| store.apply(ev))
    }

    /// Returns false when the tick was dropped (bad price).
    pub fn record_tick(&self, tick: Tick) -> bool {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            debug!(symbol = %tick.symbol, price = tick.price, "session: drop tick with bad price");
            return false;
        }
        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();

        let cap = self.limits.max_ticks_per_symbol;
        let mut st = self.state.lock();
        st.last_price.insert(tick.symbol.clone(), tick.price);
        let ring = st.ticks.entry(tick.symbol.clone()).or_default();
        ring.push_back(tick);
        while ring.len() > cap {
            ring.pop_front();
        }
        true
    }

    /// Log the fill and run it through position accounting; returns the PnL it realized.
    pub fn record_fill(&self, fill: Fill) -> f64 {
        if !fill.qty.is_finite() || !fill.price.is_finite() {
            warn!(order_id = %fill.order_id, "session: drop fill with non-finite qty/price");
            return 0.0;
        }
        FILLS.with_label_values(&[fill.kind.as_str()]).inc();

        let mut st = self.state.lock();
        let pos = st
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.symbol.clone()));
        let realized = pos.apply_fill(fill.qty, fill.price);
        POSITION_QTY.with_label_values(&[&fill.symbol]).set(pos.qty.round() as i64);
        debug!(
            symbol = %fill.symbol, qty = fill.qty, px = fill.price,
            pos_qty = pos.qty, avg_px = pos.avg_px, realized, "session: fill applied"
        );

        st.fills.push_front(fill);
        st.fills.truncate(self.limits.max_fills);

        PNL_REALIZED.set(st.positions.values().map(|p| p.realized_pnl).sum());
        PNL_NET.set(net_of(&st));
        realized
    }

    pub fn record_guardrail(&self, alert: GuardrailAlert) {
        let mut st = self.state.lock();
        st.guardrails.push_front(alert);
        st.guardrails.truncate(self.limits.max_guardrails);
    }

    pub fn record_account(&self, snap: AccountSnapshot) {
        self.state.lock().account = Some(snap);
    }

    /// Realized PnL only, summed over every symbol.
    pub fn realized_pnl(&self) -> f64 {
        self.state.lock().positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Realized plus mark-to-market of open positions that have a last price.
    pub fn net_pnl(&self) -> f64 {
        net_of(&self.state.lock())
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.state.lock().positions.get(symbol).cloned()
    }

    pub fn positions_snapshot(&self) -> PositionsView {
        self.positions_snapshot_with_marks(&HashMap::new())
    }

    /// Like `positions_snapshot`, with external marks filling in symbols
    /// that have no tick yet. A recorded last price always wins.
    pub fn positions_snapshot_with_marks(&self, marks: &HashMap<String, f64>) -> PositionsView {
        let st = self.state.lock();
        let rows = st
            .positions
            .values()
            .map(|p| {
                let mark = st.last_price.get(&p.symbol).or_else(|| marks.get(&p.symbol)).copied();
                PositionSnapshot::build(p, mark)
            })
            .collect();
        PositionsView::from_rows(rows)
    }

    pub fn open_symbols_without_price(&self) -> Vec<String> {
        let st = self.state.lock();
        let mut out: Vec<String> = st
            .positions
            .values()
            .filter(|p| !p.is_flat() && !st.last_price.contains_key(&p.symbol))
            .map(|p| p.symbol.clone())
            .collect();
        out.sort();
        out
    }

    pub fn fills_snapshot(&self, limit: usize) -> FillsPage {
        let st = self.state.lock();
        FillsPage { total: st.fills.len(), items: st.fills.iter().take(limit).cloned().collect() }
    }

    pub fn guardrails(&self, limit: usize) -> Vec<GuardrailAlert> {
        self.state.lock().guardrails.iter().take(limit).cloned().collect()
    }

    pub fn ticks(&self, symbol: &str) -> Vec<Tick> {
        self.state
            .lock()
            .ticks
            .get(symbol)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.state.lock().last_price.get(symbol).copied()
    }

    pub fn account(&self) -> Option<AccountSnapshot> {
        self.state.lock().account.clone()
    }

    /// Fixed 8-column export, oldest fill first.
    pub fn export_fills_csv(&self) -> Result<String, ExportError> {
        let fills: Vec<Fill> = {
            let st = self.state.lock();
            st.fills.iter().rev().cloned().collect()
        };

        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(CSV_HEADER)?;
        for f in &fills {
            wtr.write_record([
                iso_ts(f.ts_ms),
                f.order_id.clone(),
                f.symbol.clone(),
                f.side().as_str().to_string(),
                f.qty.to_string(),
                format!("{:.4}", f.price),
                f.kind.as_str().to_string(),
                format!("{:.2}", f.notional()),
            ])?;
        }
        let bytes = wtr.into_inner().map_err(|e| ExportError::Flush(e.to_string()))?;
        Ok(String::from_utf8(bytes)?)
    }
}

fn iso_ts(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ts_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FillKind, Severity};

    fn fill(id: &str, symbol: &str, qty: f64, price: f64, ts_ms: i64) -> Fill {
        Fill { order_id: id.into(), symbol: symbol.into(), qty, price, ts_ms, kind: FillKind::Paper }
    }

    fn tick(symbol: &str, price: f64, ts_ms: i64) -> Tick {
        Tick { symbol: symbol.into(), price, ts_ms }
    }

    #[test]
    fn round_trip_trade_realizes_fifteen() {
        let store = SessionStore::default();
        store.record_fill(fill("o1", "AAPL", 10.0, 100.5, 1_000));
        let realized = store.record_fill(fill("o2", "AAPL", -10.0, 102.0, 2_000));
        assert!((realized - 15.0).abs() < 1e-9);

        let pos = store.position("AAPL").unwrap();
        assert_eq!(pos.qty, 0.0);
        assert_eq!(pos.avg_px, 0.0);
        assert!((store.realized_pnl() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn flip_is_applied_through_the_store() {
        let store = SessionStore::default();
        store.record_fill(fill("o1", "AAPL", 10.0, 100.0, 0));
        store.record_fill(fill("o2", "AAPL", -15.0, 110.0, 1));
        let pos = store.position("AAPL").unwrap();
        assert_eq!(pos.realized_pnl, 100.0);
        assert_eq!(pos.qty, -5.0);
        assert_eq!(pos.avg_px, 110.0);
    }

    #[test]
    fn bad_ticks_are_dropped_silently() {
        let store = SessionStore::default();
        assert!(!store.record_tick(tick("AAPL", f64::NAN, 0)));
        assert!(!store.record_tick(tick("AAPL", f64::INFINITY, 0)));
        assert!(!store.record_tick(tick("AAPL", -1.0, 0)));
        assert_eq!(store.last_price("AAPL"), None);
        assert!(store.ticks("AAPL").is_empty());
    }

    #[test]
    fn tick_ring_evicts_oldest() {
        let store = SessionStore::new(StoreLimits { max_ticks_per_symbol: 3, ..Default::default() });
        for i in 0..5 {
            store.record_tick(tick("AAPL", 100.0 + i as f64, i));
        }
        let ticks = store.ticks("AAPL");
        assert_eq!(ticks.iter().map(|t| t.ts_ms).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(store.last_price("AAPL"), Some(104.0));
    }

    #[test]
    fn logs_are_newest_first_and_capped() {
        let store = SessionStore::new(StoreLimits { max_fills: 3, max_guardrails: 2, ..Default::default() });
        for i in 0..5 {
            store.record_fill(fill(&format!("o{i}"), "AAPL", 1.0, 10.0, i));
            store.record_guardrail(GuardrailAlert {
                id: format!("g{i}"),
                ts_ms: i,
                rule: "EXTERNAL".into(),
                message: "m".into(),
                symbol: None,
                severity: Severity::Info,
            });
        }
        let page = store.fills_snapshot(200);
        assert_eq!(page.total, 3);
        assert_eq!(page.items.iter().map(|f| f.order_id.as_str()).collect::<Vec<_>>(), vec!["o4", "o3", "o2"]);
        assert_eq!(store.fills_snapshot(1).items.len(), 1);

        let g = store.guardrails(10);
        assert_eq!(g.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["g4", "g3"]);
        // the position still saw every fill
        assert_eq!(store.position("AAPL").unwrap().qty, 5.0);
    }

    #[test]
    fn realized_and_net_pnl_are_distinct() {
        let store = SessionStore::default();
        store.record_fill(fill("o1", "AAPL", 10.0, 100.0, 0));
        store.record_fill(fill("o2", "AAPL", -5.0, 104.0, 1));
        store.record_fill(fill("o3", "MSFT", 2.0, 300.0, 2));
        store.record_tick(tick("AAPL", 106.0, 3));

        assert_eq!(store.realized_pnl(), 20.0);
        // AAPL: 5 open @100 marked 106 -> +30; MSFT has no price -> 0
        assert_eq!(store.net_pnl(), 50.0);

        let view = store.positions_snapshot();
        assert_eq!(view.totals.realized, 20.0);
        assert_eq!(view.totals.unrealized, 30.0);
        assert_eq!(view.totals.net_pnl, 50.0);
        assert_eq!(view.totals.net_exposure, 530.0);
        assert_eq!(store.open_symbols_without_price(), vec!["MSFT".to_string()]);

        let mut marks = HashMap::new();
        marks.insert("MSFT".to_string(), 310.0);
        marks.insert("AAPL".to_string(), 1.0);
        let marked = store.positions_snapshot_with_marks(&marks);
        assert_eq!(marked.totals.unrealized, 50.0);
    }

    #[test]
    fn snapshots_are_copies() {
        let store = SessionStore::default();
        store.record_fill(fill("o1", "AAPL", 1.0, 10.0, 0));
        let mut page = store.fills_snapshot(10);
        page.items[0].qty = 999.0;
        page.items.clear();
        assert_eq!(store.fills_snapshot(10).items[0].qty, 1.0);
    }

    #[test]
    fn account_is_overwritten() {
        let store = SessionStore::default();
        assert!(store.account().is_none());
        store.record_account(AccountSnapshot { ts_ms: 1, cash: 10.0, ..Default::default() });
        store.record_account(AccountSnapshot { ts_ms: 2, buying_power: 5.0, ..Default::default() });
        let acct = store.account().unwrap();
        assert_eq!(acct.ts_ms, 2);
        assert_eq!(acct.cash, 0.0);
        assert_eq!(acct.buying_power, 5.0);
    }

    #[test]
    fn csv_export_is_oldest_first_and_reparses() {
        let store = SessionStore::default();
        store.record_fill(fill("o1", "AAPL", 10.0, 100.5, 0));
        store.record_fill(fill("o2", "MSFT", -2.5, 301.12346, 1_500));
        store.record_fill(fill("o3", "AAPL", -10.0, 102.0, 61_000));

        let csv_text = store.export_fills_csv().unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(lines.next(), Some("timestamp,orderId,symbol,side,qty,price,kind,notional"));
        assert_eq!(lines.next(), Some("1970-01-01T00:00:00.000Z,o1,AAPL,BUY,10,100.5000,paper,1005.00"));

        let mut rdr = csv::Reader::from_reader(csv_text.as_bytes());
        let parsed: Vec<(String, String, f64, f64)> = rdr
            .records()
            .map(|r| {
                let r = r.unwrap();
                (r[2].to_string(), r[3].to_string(), r[4].parse().unwrap(), r[5].parse().unwrap())
            })
            .collect();

        let mut stored = store.fills_snapshot(10).items;
        stored.reverse();
        assert_eq!(parsed.len(), stored.len());
        for (row, f) in parsed.iter().zip(stored.iter()) {
            assert_eq!(row.0, f.symbol);
            assert_eq!(row.1, f.side().as_str());
            assert_eq!(row.2, f.qty);
            assert!((row.3 - f.price).abs() < 5e-5);
        }
        assert!(csv_text.contains("1970-01-01T00:00:01.500Z,o2,MSFT,SELL,-2.5,301.1235,paper,-752.81"));
    }

    #[test]
    fn empty_store_is_total() {
        let store = SessionStore::default();
        assert_eq!(store.realized_pnl(), 0.0);
        assert_eq!(store.net_pnl(), 0.0);
        assert_eq!(store.positions_snapshot(), PositionsView::default());
        assert_eq!(store.fills_snapshot(200), FillsPage { total: 0, items: vec![] });
        assert_eq!(store.export_fills_csv().unwrap().lines().count(), 1);
    }
}
