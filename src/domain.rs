// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "B" => Some(Side::Buy),
            "SELL" | "S" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillKind { Paper, Shadow, Broker }
impl FillKind {
    pub fn as_str(&self) -> &'static str {
        match self { FillKind::Paper => "paper", FillKind::Shadow => "shadow", FillKind::Broker => "broker" }
    }
    pub fn parse(s: &str) -> Option<FillKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Some(FillKind::Paper),
            "shadow" => Some(FillKind::Shadow),
            "broker" => Some(FillKind::Broker),
            _ => None,
        }
    }
}

/// Executed quantity; `qty` is signed (positive = buy, negative = sell).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub qty: f64,
    pub price: f64,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    pub kind: FillKind,
}
impl Fill {
    pub fn side(&self) -> Side { if self.qty >= 0.0 { Side::Buy } else { Side::Sell } }
    pub fn notional(&self) -> f64 { self.qty * self.price }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity { Info, Warn, Block }
impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self { Severity::Info => "info", Severity::Warn => "warn", Severity::Block => "block" }
    }
    pub fn parse(s: &str) -> Option<Severity> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "block" => Some(Severity::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailAlert {
    pub id: String,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    pub rule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeState { Down, Flat, Up }
impl RegimeState {
    pub const ALL: [RegimeState; 3] = [RegimeState::Down, RegimeState::Flat, RegimeState::Up];
    pub fn index(&self) -> usize { match self { RegimeState::Down => 0, RegimeState::Flat => 1, RegimeState::Up => 2 } }
}

/// Per-symbol Markov view: raw counts plus the row-normalized matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeSnapshot {
    pub symbol: String,
    #[serde(rename = "transitionCounts")]
    pub counts: [[u64; 3]; 3],
    #[serde(rename = "transitionProbs")]
    pub probs: [[f64; 3]; 3],
    pub last_state: Option<RegimeState>,
    #[serde(rename = "nextStateProbs")]
    pub next: Option<[f64; 3]>,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    pub cash: f64,
    pub available_funds: f64,
    pub buying_power: f64,
    pub margin_used: f64,
    pub net_liquidation: f64,
    pub equity_with_loan: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind { SetTradingMode, KillSwitch, FlattenAll, RebuildUniverse, Heartbeat }
impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::SetTradingMode => "set_trading_mode",
            CommandKind::KillSwitch => "kill_switch",
            CommandKind::FlattenAll => "flatten_all",
            CommandKind::RebuildUniverse => "rebuild_universe",
            CommandKind::Heartbeat => "heartbeat",
        }
    }
    pub fn parse(s: &str) -> Option<CommandKind> {
        match s.trim() {
            "set_trading_mode" => Some(CommandKind::SetTradingMode),
            "kill_switch" => Some(CommandKind::KillSwitch),
            "flatten_all" => Some(CommandKind::FlattenAll),
            "rebuild_universe" => Some(CommandKind::RebuildUniverse),
            "heartbeat" => Some(CommandKind::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub kind: CommandKind,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowOrder {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowFill {
    pub order_id: String,
    pub side: Side,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    pub avg_px: f64,
    pub qty: f64,
}

/// Everything that travels over the bus. Adding a variant forces every
/// subscriber's match to be revisited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Event {
    Tick(Tick),
    Fill(Fill),
    Guardrail(GuardrailAlert),
    Account(AccountSnapshot),
    Control(ControlCommand),
    Markov(RegimeSnapshot),
}
impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Tick(_) => "tick",
            Event::Fill(_) => "fill",
            Event::Guardrail(_) => "guardrail",
            Event::Account(_) => "account",
            Event::Control(_) => "control",
            Event::Markov(_) => "markov",
        }
    }
}
