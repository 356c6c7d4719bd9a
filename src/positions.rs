// ===============================
// src/positions.rs (weighted-average cost & PnL)
// ===============================
use serde::{Deserialize, Serialize};

/// Sisa qty di bawah ini dianggap flat (noise floating-point).
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub avg_px: f64,
    #[serde(rename = "realized")]
    pub realized_pnl: f64,
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), ..Default::default() }
    }

    pub fn is_flat(&self) -> bool { self.qty == 0.0 }

    /// Apply one signed fill and return the PnL it realized.
    ///
    /// Same direction (or from flat) moves the average price; the opposite
    /// direction realizes on the closed portion only. Crossing through zero
    /// re-opens the remainder at the fill price, landing on zero resets the
    /// average to 0.
    pub fn apply_fill(&mut self, fill_qty: f64, price: f64) -> f64 {
        if fill_qty == 0.0 || !fill_qty.is_finite() || !price.is_finite() {
            return 0.0;
        }
        let prev_qty = self.qty;

        if prev_qty == 0.0 || prev_qty.signum() == fill_qty.signum() {
            // arah sama -> update avg cost
            self.avg_px = if prev_qty == 0.0 {
                price
            } else {
                (self.avg_px * prev_qty + price * fill_qty) / (prev_qty + fill_qty)
            };
            self.qty = prev_qty + fill_qty;
            return 0.0;
        }

        // arah berlawanan -> realize PnL
        let qty_closed = fill_qty.abs().min(prev_qty.abs());
        let pnl = if prev_qty > 0.0 {
            (price - self.avg_px) * qty_closed
        } else {
            (self.avg_px - price) * qty_closed
        };
        self.realized_pnl += pnl;

        let new_qty = prev_qty + fill_qty;
        if new_qty.abs() <= QTY_EPSILON {
            self.qty = 0.0;
            self.avg_px = 0.0;
        } else {
            if new_qty.signum() != prev_qty.signum() {
                self.avg_px = price;
            }
            self.qty = new_qty;
        }
        pnl
    }

    pub fn unrealized(&self, mark: f64) -> f64 {
        if self.qty == 0.0 { 0.0 } else { (mark - self.avg_px) * self.qty }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub symbol: String,
    pub qty: f64,
    pub avg_px: f64,
    pub realized: f64,
    pub last_px: Option<f64>,
    pub notional: f64,
    pub unrealized: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub net_exposure: f64,
    pub realized: f64,
    pub unrealized: f64,
    pub net_pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionsView {
    pub positions: Vec<PositionSnapshot>,
    pub totals: Totals,
}

impl PositionSnapshot {
    /// Positions without a mark contribute zero notional/unrealized.
    pub fn build(pos: &Position, mark: Option<f64>) -> Self {
        let (notional, unrealized) = match mark {
            Some(px) => (px * pos.qty, pos.unrealized(px)),
            None => (0.0, 0.0),
        };
        Self {
            symbol: pos.symbol.clone(),
            qty: pos.qty,
            avg_px: pos.avg_px,
            realized: pos.realized_pnl,
            last_px: mark,
            notional,
            unrealized,
        }
    }
}

impl PositionsView {
    pub fn from_rows(mut positions: Vec<PositionSnapshot>) -> Self {
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut totals = Totals::default();
        for p in &positions {
            totals.net_exposure += p.notional;
            totals.realized += p.realized;
            totals.unrealized += p.unrealized;
        }
        totals.net_pnl = totals.realized + totals.unrealized;
        Self { positions, totals }
    }
}
