// ===============================
// src/marks.rs (mark-to-market lookups for open positions)
// ===============================
use std::future::Future;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::metrics::MARK_LOOKUP_ERRORS;

#[derive(Debug, Error)]
pub enum MarkError {
    #[error("mark request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mark request timed out after {0:?}")]
    Timeout(Duration),
    #[error("mark service replied {0}")]
    Status(u16),
    #[error("no usable price in reply")]
    NoPrice,
    #[error("{what}: gave up after {attempts} attempts: {last}")]
    Exhausted { what: String, attempts: u32, last: Box<MarkError> },
}

impl MarkError {
    fn retryable(&self) -> bool {
        match self {
            MarkError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            MarkError::Timeout(_) => true,
            MarkError::Status(s) => matches!(s, 408 | 429 | 500 | 502 | 503 | 504),
            MarkError::NoPrice | MarkError::Exhausted { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra tries after the first one; 5 means up to 6 requests.
    pub retries: u32,
    pub initial: Duration,
    pub per_attempt: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 5, initial: Duration::from_secs(1), per_attempt: Duration::from_secs(10) }
    }
}

/// Run `op` until it succeeds, a non-retryable error comes back, or the
/// retries run out. Every attempt gets its own timeout.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, MarkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MarkError>>,
{
    let mut backoff = Backoff::new(policy.initial, Duration::from_secs(30), 2.0);
    let mut tried = 0;
    loop {
        tried += 1;
        let err = match timeout(policy.per_attempt, op()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => e,
            Err(_) => MarkError::Timeout(policy.per_attempt),
        };
        if tried > policy.retries || !err.retryable() {
            return Err(MarkError::Exhausted { what: what.to_string(), attempts: tried, last: Box::new(err) });
        }
        let delay = backoff.next_delay();
        debug!(%what, attempt = tried, ?delay, error = %err, "retrying");
        sleep(delay).await;
    }
}

/// `{price}` as a number or numeric string.
fn price_from(v: &Value) -> Option<f64> {
    let raw = v.get("price")?;
    let px = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (px.is_finite() && px > 0.0).then_some(px)
}

#[derive(Clone)]
pub struct MarkClient {
    http: reqwest::Client,
    base: String,
    policy: RetryPolicy,
}

impl MarkClient {
    pub fn new(base: &str, policy: RetryPolicy) -> Self {
        Self { http: reqwest::Client::new(), base: base.trim_end_matches('/').to_string(), policy }
    }

    async fn fetch_once(&self, symbol: &str) -> Result<f64, MarkError> {
        let url = format!("{}/price?symbol={}", self.base, urlencoding::encode(symbol));
        let rsp = self.http.get(url).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(MarkError::Status(status.as_u16()));
        }
        let v = rsp.json::<Value>().await?;
        price_from(&v).ok_or(MarkError::NoPrice)
    }

    pub async fn price(&self, symbol: &str) -> Result<f64, MarkError> {
        retry(&self.policy, symbol, || self.fetch_once(symbol)).await
    }

    /// Lookups run concurrently; failed symbols are simply absent.
    pub async fn resolve(&self, symbols: &[String]) -> HashMap<String, f64> {
        let results = join_all(symbols.iter().map(|s| async move { (s, self.price(s).await) })).await;
        let mut marks = HashMap::new();
        for (symbol, res) in results {
            match res {
                Ok(px) => {
                    marks.insert(symbol.clone(), px);
                }
                Err(e) => {
                    MARK_LOOKUP_ERRORS.inc();
                    warn!(%symbol, error = %e, "mark lookup failed");
                }
            }
        }
        marks
    }
}
