// ===============================
// src/shadow.rs (queue-aware shadow fills)
// ===============================
//
// Simulasi fill untuk order limit "bayangan" tanpa menyentuh exchange:
// - saat order dipasang, size yang tampil di level harga tsb dicatat
//   sebagai antrian di depan kita (queue ahead),
// - setiap trade print menambah volume tereksekusi untuk sisi pasif,
// - order baru bisa terisi setelah latency lewat DAN volume tereksekusi
//   melebihi antrian di depannya.
//
// Any positive available volume fills min(available, qty) and removes the
// order; the unfilled remainder is not left resting.
//
use ahash::AHashMap as HashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Fill, FillKind, ShadowFill, ShadowOrder, Side};
use crate::metrics::SHADOW_FILLS;

pub const DEFAULT_LATENCY_MS: i64 = 60;

/// Fixed-point price (1e-8) so f64 prices can key maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriceKey(i64);

impl PriceKey {
    pub fn from_price(px: f64) -> Self { PriceKey((px * 1e8).round() as i64) }
}

#[derive(Debug, Error, PartialEq)]
pub enum ShadowError {
    #[error("order {0}: price and qty must be finite and positive")]
    InvalidOrder(String),
    #[error("order {0} already resting")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookUpdate {
    #[serde(default)]
    pub bids: Vec<[f64; 2]>,
    #[serde(default)]
    pub asks: Vec<[f64; 2]>,
}

#[derive(Debug)]
pub struct QueueAwareFillSimulator {
    latency_ms: i64,
    bids: HashMap<PriceKey, f64>,
    asks: HashMap<PriceKey, f64>,
    // insertion order, so fills come out deterministically
    orders: Vec<ShadowOrder>,
    queue_ahead: HashMap<(Side, PriceKey), f64>,
    executed_since: HashMap<(Side, PriceKey), f64>,
    last_now_ms: i64,
}

impl Default for QueueAwareFillSimulator {
    fn default() -> Self { Self::new(DEFAULT_LATENCY_MS) }
}

fn depth(levels: &[[f64; 2]]) -> HashMap<PriceKey, f64> {
    let mut out = HashMap::new();
    for [px, size] in levels {
        if px.is_finite() && size.is_finite() && *size > 0.0 {
            *out.entry(PriceKey::from_price(*px)).or_insert(0.0) += size;
        }
    }
    out
}

impl QueueAwareFillSimulator {
    pub fn new(latency_ms: i64) -> Self {
        Self {
            latency_ms,
            bids: HashMap::new(),
            asks: HashMap::new(),
            orders: Vec::new(),
            queue_ahead: HashMap::new(),
            executed_since: HashMap::new(),
            last_now_ms: i64::MIN,
        }
    }

    /// Replace the observed depth. Only used to size the queue at placement.
    pub fn on_book(&mut self, bids: &[[f64; 2]], asks: &[[f64; 2]]) {
        self.bids = depth(bids);
        self.asks = depth(asks);
    }

    /// A print hits the resting side opposite to the aggressor.
    pub fn on_trade(&mut self, price: f64, size: f64, aggressor: Side) {
        if !price.is_finite() || !size.is_finite() || size <= 0.0 {
            return;
        }
        let key = (aggressor.opposite(), PriceKey::from_price(price));
        *self.executed_since.entry(key).or_insert(0.0) += size;
    }

    pub fn displayed_size_at(&self, side: Side, price: f64) -> f64 {
        let book = match side { Side::Buy => &self.bids, Side::Sell => &self.asks };
        book.get(&PriceKey::from_price(price)).copied().unwrap_or(0.0)
    }

    pub fn place_limit(&mut self, order: ShadowOrder) -> Result<(), ShadowError> {
        if !order.price.is_finite() || !order.qty.is_finite() || order.price <= 0.0 || order.qty <= 0.0 {
            return Err(ShadowError::InvalidOrder(order.id));
        }
        if self.orders.iter().any(|o| o.id == order.id) {
            return Err(ShadowError::DuplicateId(order.id));
        }
        let ahead = self.displayed_size_at(order.side, order.price);
        *self
            .queue_ahead
            .entry((order.side, PriceKey::from_price(order.price)))
            .or_insert(0.0) += ahead;
        debug!(id = %order.id, side = order.side.as_str(), px = order.price, ahead, "shadow: order placed");
        self.orders.push(order);
        Ok(())
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        let before = self.orders.len();
        self.orders.retain(|o| o.id != id);
        self.orders.len() != before
    }

    /// `now_ms` must not go backwards; an earlier value is treated as the
    /// latest one seen.
    pub fn try_fills(&mut self, now_ms: i64) -> Vec<ShadowFill> {
        let now_ms = now_ms.max(self.last_now_ms);
        self.last_now_ms = now_ms;

        let mut fills = Vec::new();
        let latency_ms = self.latency_ms;
        let queue_ahead = &self.queue_ahead;
        let executed = &self.executed_since;
        self.orders.retain(|o| {
            if now_ms - o.ts_ms <= latency_ms {
                return true;
            }
            let key = (o.side, PriceKey::from_price(o.price));
            let available = executed.get(&key).copied().unwrap_or(0.0)
                - queue_ahead.get(&key).copied().unwrap_or(0.0);
            if available <= 0.0 {
                return true;
            }
            fills.push(ShadowFill {
                order_id: o.id.clone(),
                side: o.side,
                ts_ms: now_ms,
                avg_px: o.price,
                qty: available.min(o.qty),
            });
            false
        });
        SHADOW_FILLS.inc_by(fills.len() as u64);
        fills
    }

    pub fn open_orders(&self) -> Vec<ShadowOrder> { self.orders.clone() }
}

/// One simulator per symbol.
#[derive(Debug)]
pub struct ShadowDesk {
    latency_ms: i64,
    books: HashMap<String, QueueAwareFillSimulator>,
}

impl ShadowDesk {
    pub fn new(latency_ms: i64) -> Self { Self { latency_ms, books: HashMap::new() } }

    fn book(&mut self, symbol: &str) -> &mut QueueAwareFillSimulator {
        let latency_ms = self.latency_ms;
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| QueueAwareFillSimulator::new(latency_ms))
    }

    pub fn on_book(&mut self, symbol: &str, update: &BookUpdate) {
        self.book(symbol).on_book(&update.bids, &update.asks);
    }

    pub fn on_trade(&mut self, symbol: &str, price: f64, size: f64, aggressor: Side) {
        self.book(symbol).on_trade(price, size, aggressor);
    }

    pub fn place_limit(&mut self, symbol: &str, order: ShadowOrder) -> Result<(), ShadowError> {
        self.book(symbol).place_limit(order)
    }

    pub fn cancel(&mut self, symbol: &str, id: &str) -> bool {
        self.books.get_mut(symbol).map(|b| b.cancel(id)).unwrap_or(false)
    }

    pub fn open_orders(&self, symbol: &str) -> Vec<ShadowOrder> {
        self.books.get(symbol).map(|b| b.open_orders()).unwrap_or_default()
    }

    /// Poll every symbol and turn shadow fills into signed `Fill`s.
    pub fn poll(&mut self, now_ms: i64) -> Vec<Fill> {
        let mut out = Vec::new();
        for (symbol, book) in self.books.iter_mut() {
            for sf in book.try_fills(now_ms) {
                out.push(Fill {
                    order_id: sf.order_id,
                    symbol: symbol.clone(),
                    qty: sf.side.sign() * sf.qty,
                    price: sf.avg_px,
                    ts_ms: sf.ts_ms,
                    kind: FillKind::Shadow,
                });
            }
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, side: Side, price: f64, qty: f64, ts_ms: i64) -> ShadowOrder {
        ShadowOrder { id: id.into(), side, price, qty, ts_ms }
    }

    #[test]
    fn fills_only_after_queue_ahead_is_consumed() {
        let mut sim = QueueAwareFillSimulator::default();
        sim.on_book(&[[100.0, 500.0], [99.9, 200.0]], &[[100.1, 300.0]]);
        sim.place_limit(order("b1", Side::Buy, 100.0, 10.0, 0)).unwrap();

        // sellers hit the bid: 500 executed, exactly the queue ahead
        sim.on_trade(100.0, 500.0, Side::Sell);
        assert!(sim.try_fills(1_000).is_empty());

        sim.on_trade(100.0, 1.0, Side::Sell);
        let fills = sim.try_fills(1_001);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, "b1");
        assert_eq!(fills[0].qty, 1.0);
        assert_eq!(fills[0].avg_px, 100.0);
        assert_eq!(fills[0].ts_ms, 1_001);
        // remainder is dropped, not left resting
        assert!(sim.open_orders().is_empty());
    }

    #[test]
    fn latency_gates_fills() {
        let mut sim = QueueAwareFillSimulator::new(60);
        sim.place_limit(order("s1", Side::Sell, 101.0, 5.0, 1_000)).unwrap();
        sim.on_trade(101.0, 50.0, Side::Buy);
        assert!(sim.try_fills(1_060).is_empty());
        let fills = sim.try_fills(1_061);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].qty, 5.0);
    }

    #[test]
    fn same_side_aggressor_does_not_fill() {
        let mut sim = QueueAwareFillSimulator::default();
        sim.place_limit(order("b1", Side::Buy, 100.0, 1.0, 0)).unwrap();
        // buyers lifting at 100 consume asks, not our bid
        sim.on_trade(100.0, 1_000.0, Side::Buy);
        assert!(sim.try_fills(10_000).is_empty());
        assert_eq!(sim.open_orders().len(), 1);
    }

    #[test]
    fn price_missing_from_book_has_no_queue() {
        let mut sim = QueueAwareFillSimulator::default();
        sim.on_book(&[[99.0, 10.0]], &[]);
        assert_eq!(sim.displayed_size_at(Side::Buy, 98.5), 0.0);
        sim.place_limit(order("b1", Side::Buy, 98.5, 3.0, 0)).unwrap();
        sim.on_trade(98.5, 0.5, Side::Sell);
        let fills = sim.try_fills(100);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].qty, 0.5);
    }

    #[test]
    fn cancel_removes_without_fill() {
        let mut sim = QueueAwareFillSimulator::default();
        sim.place_limit(order("b1", Side::Buy, 100.0, 1.0, 0)).unwrap();
        assert!(sim.cancel("b1"));
        assert!(!sim.cancel("b1"));
        sim.on_trade(100.0, 10.0, Side::Sell);
        assert!(sim.try_fills(1_000).is_empty());
    }

    #[test]
    fn rejects_bad_and_duplicate_orders() {
        let mut sim = QueueAwareFillSimulator::default();
        assert_eq!(
            sim.place_limit(order("x", Side::Buy, 100.0, 0.0, 0)),
            Err(ShadowError::InvalidOrder("x".into()))
        );
        assert!(sim.place_limit(order("x", Side::Buy, f64::NAN, 1.0, 0)).is_err());
        sim.place_limit(order("y", Side::Buy, 100.0, 1.0, 0)).unwrap();
        assert_eq!(
            sim.place_limit(order("y", Side::Sell, 101.0, 1.0, 0)),
            Err(ShadowError::DuplicateId("y".into()))
        );
    }

    #[test]
    fn now_going_backwards_is_clamped() {
        let mut sim = QueueAwareFillSimulator::new(60);
        assert!(sim.try_fills(5_000).is_empty());
        sim.place_limit(order("b1", Side::Buy, 100.0, 1.0, 4_900)).unwrap();
        sim.on_trade(100.0, 1.0, Side::Sell);
        // treated as 5_000, and 5_000 - 4_900 > 60
        assert_eq!(sim.try_fills(0).len(), 1);
    }

    #[test]
    fn desk_signs_fills_by_side() {
        let mut desk = ShadowDesk::new(0);
        desk.on_book("AAPL", &BookUpdate { bids: vec![[100.0, 5.0]], asks: vec![[100.2, 5.0]] });
        desk.place_limit("AAPL", order("b1", Side::Buy, 100.0, 2.0, 0)).unwrap();
        desk.place_limit("AAPL", order("s1", Side::Sell, 100.2, 2.0, 0)).unwrap();
        let resting: Vec<String> = desk.open_orders("AAPL").into_iter().map(|o| o.id).collect();
        assert_eq!(resting, vec!["b1".to_string(), "s1".to_string()]);
        assert!(desk.open_orders("MSFT").is_empty());
        desk.on_trade("AAPL", 100.0, 10.0, Side::Sell);
        desk.on_trade("AAPL", 100.2, 6.0, Side::Buy);

        let fills = desk.poll(10);
        assert_eq!(fills.len(), 2);
        let buy = fills.iter().find(|f| f.order_id == "b1").unwrap();
        let sell = fills.iter().find(|f| f.order_id == "s1").unwrap();
        assert_eq!(buy.qty, 2.0);
        assert_eq!(sell.qty, -1.0);
        assert!(fills.iter().all(|f| f.kind == FillKind::Shadow && f.symbol == "AAPL"));
        assert!(!desk.cancel("MSFT", "b1"));
        assert!(desk.open_orders("AAPL").is_empty());
    }
}
