// ===============================
// src/ingest.rs (HTTP boundary: raw JSON -> typed events)
// ===============================
//
// Aturan:
// - tick sampah di-drop diam-diam (feed boleh degradasi),
// - fill/guardrail/shadow yang salah ditolak dengan kode error,
// - account: angka boleh string atau number, gagal -> 0.
//
use hmac::{Hmac, Mac};
use hyper::StatusCode;
use rand::Rng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::control::ControlError;
use crate::domain::{
    now_ms, AccountSnapshot, Fill, FillKind, GuardrailAlert, Severity, ShadowOrder, Side, Tick,
};
use crate::session::ExportError;
use crate::shadow::{BookUpdate, ShadowError};

pub const DEFAULT_LIMIT: usize = 200;
pub const INGEST_KEY_HEADER: &str = "x-ingest-key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or wrong ingest key")]
    Unauthorized,
    #[error("body is not valid json: {0}")]
    BadJson(String),
    #[error("invalid field `{0}`")]
    BadField(&'static str),
    #[error("no such route")]
    NotFound,
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("request body: {0}")]
    Body(#[from] hyper::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadJson(_) => "bad-json",
            ApiError::BadField(_) => "bad-payload",
            ApiError::NotFound => "not-found",
            ApiError::Control(e) => e.code(),
            ApiError::Shadow(ShadowError::InvalidOrder(_)) => "invalid-order",
            ApiError::Shadow(ShadowError::DuplicateId(_)) => "duplicate-order",
            ApiError::Export(_) => "export-failed",
            ApiError::Body(_) => "bad-body",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Control(e) if !e.is_rejection() => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

// ---------------- shared secret ----------------

type HmacSha256 = Hmac<Sha256>;

/// Configured `x-ingest-key`. Comparison runs through HMAC tags so it is
/// constant-time regardless of where the presented key differs.
pub struct IngestKey {
    salt: [u8; 32],
    tag: Vec<u8>,
}

impl IngestKey {
    /// Blank key means "no key configured".
    pub fn new(key: Option<&str>) -> Option<Self> {
        let key = key.map(str::trim).filter(|k| !k.is_empty())?;
        let salt: [u8; 32] = rand::thread_rng().gen();
        let tag = Self::tag_with(&salt, key.as_bytes());
        Some(Self { salt, tag })
    }

    fn tag_with(salt: &[u8], data: &[u8]) -> Vec<u8> {
        // HMAC menerima key dengan panjang berapa pun
        let mut mac = match HmacSha256::new_from_slice(salt) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn verify(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else { return false };
        match HmacSha256::new_from_slice(&self.salt) {
            Ok(mut mac) => {
                mac.update(presented.trim().as_bytes());
                mac.verify_slice(&self.tag).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Short, log-safe identifier of a key.
    pub fn fingerprint(key: &str) -> String {
        let digest = Sha256::digest(key.trim().as_bytes());
        hex::encode(&digest[..4])
    }
}

/// `None` key allows everything.
pub fn authorize(key: Option<&IngestKey>, presented: Option<&str>) -> Result<(), ApiError> {
    match key {
        None => Ok(()),
        Some(k) if k.verify(presented) => Ok(()),
        Some(_) => Err(ApiError::Unauthorized),
    }
}

// ---------------- field helpers ----------------

pub fn parse_body(raw: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(raw).map_err(|e| ApiError::BadJson(e.to_string()))
}

fn as_object(v: &Value) -> Result<&Map<String, Value>, ApiError> {
    v.as_object().ok_or(ApiError::BadJson("expected a json object".into()))
}

fn symbol_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("symbol")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
}

fn text_of(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Number, or a string holding one. Non-finite is treated as missing.
fn num_of(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    let x = match obj.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    x.is_finite().then_some(x)
}

fn ts_of(obj: &Map<String, Value>) -> i64 {
    num_of(obj, "ts").filter(|t| *t > 0.0).map(|t| t as i64).unwrap_or_else(now_ms)
}

fn first_num(obj: &Map<String, Value>, keys: &[&str]) -> f64 {
    keys.iter().find_map(|k| num_of(obj, k)).unwrap_or(0.0)
}

// ---------------- payloads ----------------

/// `Ok(None)` means "drop it quietly".
pub fn parse_tick(v: &Value) -> Result<Option<Tick>, ApiError> {
    let obj = as_object(v)?;
    let (Some(symbol), Some(price)) = (symbol_of(obj), num_of(obj, "price")) else {
        return Ok(None);
    };
    if price <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Tick { symbol, price, ts_ms: ts_of(obj) }))
}

pub fn parse_fill(v: &Value) -> Result<Fill, ApiError> {
    let obj = as_object(v)?;
    let order_id = text_of(obj, "orderId")
        .or_else(|| text_of(obj, "order_id"))
        .ok_or(ApiError::BadField("orderId"))?;
    let symbol = symbol_of(obj).ok_or(ApiError::BadField("symbol"))?;
    let qty = num_of(obj, "qty").filter(|q| *q != 0.0).ok_or(ApiError::BadField("qty"))?;
    let price = num_of(obj, "price").filter(|p| *p > 0.0).ok_or(ApiError::BadField("price"))?;
    let kind = match obj.get("kind").and_then(Value::as_str) {
        None => FillKind::Paper,
        Some(k) => FillKind::parse(k).ok_or(ApiError::BadField("kind"))?,
    };
    Ok(Fill { order_id, symbol, qty, price, ts_ms: ts_of(obj), kind })
}

pub fn parse_guardrail(v: &Value) -> Result<GuardrailAlert, ApiError> {
    let obj = as_object(v)?;
    let rule = text_of(obj, "rule").ok_or(ApiError::BadField("rule"))?;
    let message = text_of(obj, "message").ok_or(ApiError::BadField("message"))?;
    let severity = match obj.get("severity").and_then(Value::as_str) {
        None => Severity::Warn,
        Some(s) => Severity::parse(s).ok_or(ApiError::BadField("severity"))?,
    };
    let ts_ms = ts_of(obj);
    let id = text_of(obj, "id")
        .unwrap_or_else(|| format!("GR-{}-{:08x}", ts_ms, rand::thread_rng().gen::<u32>()));
    Ok(GuardrailAlert { id, ts_ms, rule, message, symbol: symbol_of(obj), severity })
}

pub fn parse_account(v: &Value) -> Result<AccountSnapshot, ApiError> {
    let obj = as_object(v)?;
    Ok(AccountSnapshot {
        ts_ms: ts_of(obj),
        cash: first_num(obj, &["cash"]),
        available_funds: first_num(obj, &["availableFunds", "available_funds"]),
        buying_power: first_num(obj, &["buyingPower", "buying_power"]),
        margin_used: first_num(obj, &["marginUsed", "margin_used"]),
        net_liquidation: first_num(obj, &["netLiquidation", "net_liquidation"]),
        equity_with_loan: first_num(obj, &["equityWithLoan", "equity_with_loan"]),
    })
}

pub struct BookReq {
    pub symbol: String,
    pub book: BookUpdate,
}

pub fn parse_book(v: &Value) -> Result<BookReq, ApiError> {
    let symbol = symbol_of(as_object(v)?).ok_or(ApiError::BadField("symbol"))?;
    let book: BookUpdate = serde_json::from_value(v.clone()).map_err(|_| ApiError::BadField("bids/asks"))?;
    Ok(BookReq { symbol, book })
}

pub struct TradeReq {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub aggressor: Side,
}

pub fn parse_trade(v: &Value) -> Result<TradeReq, ApiError> {
    let obj = as_object(v)?;
    Ok(TradeReq {
        symbol: symbol_of(obj).ok_or(ApiError::BadField("symbol"))?,
        price: num_of(obj, "price").filter(|p| *p > 0.0).ok_or(ApiError::BadField("price"))?,
        size: num_of(obj, "size").filter(|s| *s > 0.0).ok_or(ApiError::BadField("size"))?,
        aggressor: obj
            .get("aggressor")
            .and_then(Value::as_str)
            .and_then(Side::parse)
            .ok_or(ApiError::BadField("aggressor"))?,
    })
}

pub struct OrderReq {
    pub symbol: String,
    pub order: ShadowOrder,
}

pub fn parse_order(v: &Value) -> Result<OrderReq, ApiError> {
    let obj = as_object(v)?;
    let symbol = symbol_of(obj).ok_or(ApiError::BadField("symbol"))?;
    let side = obj.get("side").and_then(Value::as_str).and_then(Side::parse).ok_or(ApiError::BadField("side"))?;
    let ts_ms = ts_of(obj);
    let id = text_of(obj, "id").unwrap_or_else(|| format!("SH-{}-{:08x}", ts_ms, rand::thread_rng().gen::<u32>()));
    // validasi harga/qty dilakukan simulator (InvalidOrder)
    let price = num_of(obj, "price").unwrap_or(f64::NAN);
    let qty = num_of(obj, "qty").unwrap_or(f64::NAN);
    Ok(OrderReq { symbol, order: ShadowOrder { id, side, price, qty, ts_ms } })
}

pub struct CancelReq {
    pub symbol: String,
    pub id: String,
}

pub fn parse_cancel(v: &Value) -> Result<CancelReq, ApiError> {
    let obj = as_object(v)?;
    Ok(CancelReq {
        symbol: symbol_of(obj).ok_or(ApiError::BadField("symbol"))?,
        id: text_of(obj, "id").ok_or(ApiError::BadField("id"))?,
    })
}

/// `?limit=` must be a positive finite number, else the default.
pub fn parse_limit(query: Option<&str>) -> usize {
    query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "limit")
                .and_then(|(_, v)| v.trim().parse::<f64>().ok())
        })
        .filter(|n| n.is_finite() && *n >= 1.0)
        .map(|n| n.floor() as usize)
        .unwrap_or(DEFAULT_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn garbage_ticks_are_dropped_not_rejected() {
        assert!(parse_tick(&json!({"symbol": "aapl", "price": "abc"})).unwrap().is_none());
        assert!(parse_tick(&json!({"symbol": "", "price": 10})).unwrap().is_none());
        assert!(parse_tick(&json!({"symbol": "X", "price": -1})).unwrap().is_none());
        let t = parse_tick(&json!({"symbol": " aapl ", "price": 100.5, "ts": 1000})).unwrap().unwrap();
        assert_eq!((t.symbol.as_str(), t.price, t.ts_ms), ("AAPL", 100.5, 1000));
        assert!(parse_tick(&json!("nope")).is_err());
    }

    #[test]
    fn fill_requires_fields_and_defaults_kind() {
        let f = parse_fill(&json!({"orderId": "o1", "symbol": "msft", "qty": -3, "price": 410.2})).unwrap();
        assert_eq!(f.kind, FillKind::Paper);
        assert_eq!(f.qty, -3.0);
        assert!(f.ts_ms > 0);

        let err = parse_fill(&json!({"orderId": "o1", "symbol": "msft", "qty": 0, "price": 1})).unwrap_err();
        assert_eq!(err.code(), "bad-payload");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(parse_fill(&json!({"orderId": "o1", "symbol": "m", "qty": 1, "price": 1, "kind": "dark"})).is_err());
    }

    #[test]
    fn guardrail_defaults_to_warn() {
        let g = parse_guardrail(&json!({"rule": "max_dd", "message": "drawdown 3%"})).unwrap();
        assert_eq!(g.severity, Severity::Warn);
        assert!(g.id.starts_with("GR-"));
        assert_eq!(g.symbol, None);
        assert!(parse_guardrail(&json!({"rule": "x"})).is_err());
    }

    #[test]
    fn account_coerces_strings_and_defaults_zero() {
        let a = parse_account(&json!({"cash": "1500.5", "buyingPower": 3000, "marginUsed": "n/a", "ts": 5})).unwrap();
        assert_eq!(a.cash, 1500.5);
        assert_eq!(a.buying_power, 3000.0);
        assert_eq!(a.margin_used, 0.0);
        assert_eq!(a.net_liquidation, 0.0);
        assert_eq!(a.ts_ms, 5);
    }

    #[test]
    fn limit_falls_back_to_default() {
        assert_eq!(parse_limit(None), 200);
        assert_eq!(parse_limit(Some("limit=50")), 50);
        assert_eq!(parse_limit(Some("foo=1&limit=7.9")), 7);
        assert_eq!(parse_limit(Some("limit=-3")), 200);
        assert_eq!(parse_limit(Some("limit=0")), 200);
        assert_eq!(parse_limit(Some("limit=NaN")), 200);
        assert_eq!(parse_limit(Some("limit=inf")), 200);
    }

    #[test]
    fn ingest_key_check() {
        assert!(authorize(None, None).is_ok());
        assert!(IngestKey::new(Some("   ")).is_none());

        let key = IngestKey::new(Some("s3cret")).unwrap();
        assert!(authorize(Some(&key), Some("s3cret")).is_ok());
        assert!(matches!(authorize(Some(&key), Some("s3cre")), Err(ApiError::Unauthorized)));
        assert!(matches!(authorize(Some(&key), None), Err(ApiError::Unauthorized)));
        assert_eq!(IngestKey::fingerprint("s3cret").len(), 8);
    }

    #[test]
    fn shadow_payloads() {
        let o = parse_order(&json!({"symbol": "es", "side": "buy", "price": 10.5, "qty": 2})).unwrap();
        assert_eq!(o.symbol, "ES");
        assert_eq!(o.order.side, Side::Buy);
        assert!(o.order.id.starts_with("SH-"));

        let b = parse_book(&json!({"symbol": "es", "bids": [[10.5, 500]], "asks": []})).unwrap();
        assert_eq!(b.book.bids, vec![[10.5, 500.0]]);

        assert!(parse_trade(&json!({"symbol": "es", "price": 10.5, "size": 1, "aggressor": "up"})).is_err());
        assert!(parse_cancel(&json!({"symbol": "es"})).is_err());
    }
}
