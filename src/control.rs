// ===============================
// src/control.rs (operator commands: validate, side effects, memoize)
// ===============================
//
// Alur dispatch:
//   parse -> side effect (trading flag / audit) -> simpan last command
//   -> publish `control` ke bus -> antrikan ke control link.
// Command operator gagal dengan error eksplisit, tidak pernah di-drop diam-diam.
//
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::bus::EventBus;
use crate::domain::{now_ms, CommandKind, ControlCommand, Event};
use crate::link::ControlLink;
use crate::metrics::CONTROL_COMMANDS;
use crate::persist::{JsonFile, PersistError, TradingState};

pub const LAST_COMMAND_FILE: &str = "last_command.json";
pub const TRADING_FILE: &str = "trading.json";
pub const AUDIT_FILE: &str = "control_audit.jsonl";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unsupported command kind {0:?}")]
    Unsupported(String),
    #[error("set_trading_mode requires a boolean `enabled`")]
    MissingEnabled,
    #[error("bad payload: {0}")]
    BadPayload(&'static str),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("audit journal: {0}")]
    Audit(#[from] std::io::Error),
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Unsupported(_) => "unsupported-command",
            ControlError::MissingEnabled => "missing-enabled",
            ControlError::BadPayload(_) => "bad-payload",
            ControlError::Persist(_) => "persist-failed",
            ControlError::Audit(_) => "audit-failed",
        }
    }

    /// Caller's fault (400) vs ours (500).
    pub fn is_rejection(&self) -> bool {
        matches!(self, ControlError::Unsupported(_) | ControlError::MissingEnabled | ControlError::BadPayload(_))
    }
}

/// `true`/`false` as JSON bools or as strings in any case.
fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Validate and normalize a raw `{kind, payload?, source?, ts?}` body.
pub fn parse(body: &Value) -> Result<ControlCommand, ControlError> {
    let obj = body.as_object().ok_or(ControlError::BadPayload("body must be a json object"))?;

    let kind_raw = match obj.get("kind") {
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(ControlError::BadPayload("kind must be a string")),
        None => return Err(ControlError::BadPayload("missing kind")),
    };
    let kind = CommandKind::parse(kind_raw).ok_or_else(|| ControlError::Unsupported(kind_raw.to_string()))?;

    let mut payload: Option<Map<String, Value>> = match obj.get("payload") {
        None | Some(Value::Null) => None,
        Some(Value::Object(m)) => Some(m.clone()),
        Some(_) => return Err(ControlError::BadPayload("payload must be an object")),
    };

    let source = match obj.get("source") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(_) => return Err(ControlError::BadPayload("source must be a string")),
    };

    let ts_ms = obj
        .get("ts")
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite() && *t > 0.0)
        .map(|t| t as i64)
        .unwrap_or_else(now_ms);

    if kind == CommandKind::SetTradingMode {
        // `enabled` boleh di dalam payload atau di top-level
        let raw = payload
            .as_ref()
            .and_then(|p| p.get("enabled"))
            .or_else(|| obj.get("enabled"));
        let enabled = raw.and_then(coerce_bool).ok_or(ControlError::MissingEnabled)?;
        payload.get_or_insert_with(Map::new).insert("enabled".into(), Value::Bool(enabled));
    }

    Ok(ControlCommand { kind, ts_ms, payload, source })
}

fn enabled_flag(cmd: &ControlCommand) -> bool {
    cmd.payload
        .as_ref()
        .and_then(|p| p.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub struct ControlChannel {
    bus: EventBus,
    audit: AuditLog,
    link: Option<ControlLink>,
    last_file: JsonFile<ControlCommand>,
    trading_file: JsonFile<TradingState>,
    last: Mutex<Option<ControlCommand>>,
    last_loaded: AtomicBool,
    trading: Mutex<Option<TradingState>>,
    // satu dispatch pada satu waktu supaya urutan file == urutan broadcast
    dispatch_lock: tokio::sync::Mutex<()>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl ControlChannel {
    pub fn new(bus: EventBus, state_dir: &Path, audit: AuditLog, link: Option<ControlLink>) -> Self {
        Self {
            bus,
            audit,
            link,
            last_file: JsonFile::new(state_dir.join(LAST_COMMAND_FILE)),
            trading_file: JsonFile::new(state_dir.join(TRADING_FILE)),
            last: Mutex::new(None),
            last_loaded: AtomicBool::new(false),
            trading: Mutex::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn dispatch(&self, body: &Value) -> Result<ControlCommand, ControlError> {
        let cmd = match parse(body) {
            Ok(c) => c,
            Err(e) => {
                warn!(code = e.code(), error = %e, "control: rejected");
                return Err(e);
            }
        };
        let _guard = self.dispatch_lock.lock().await;

        match cmd.kind {
            CommandKind::SetTradingMode => self.set_trading(enabled_flag(&cmd), cmd.ts_ms).await?,
            CommandKind::KillSwitch => {
                self.set_trading(false, cmd.ts_ms).await?;
                self.audit.record(&cmd).await?;
            }
            CommandKind::FlattenAll => self.audit.record(&cmd).await?,
            CommandKind::RebuildUniverse | CommandKind::Heartbeat => {}
        }

        self.set_last_command(&cmd).await?;
        self.bus.publish(Event::Control(cmd.clone()));

        if let Some(link) = &self.link {
            if !link.send(&cmd) {
                warn!(kind = cmd.kind.as_str(), "control: link task gone, command not forwarded");
            }
        }

        CONTROL_COMMANDS.with_label_values(&[cmd.kind.as_str()]).inc();
        info!(kind = cmd.kind.as_str(), source = cmd.source.as_deref().unwrap_or("-"), "control: dispatched");
        Ok(cmd)
    }

    async fn set_last_command(&self, cmd: &ControlCommand) -> Result<(), PersistError> {
        self.last_file.save(cmd).await?;
        *self.last.lock() = Some(cmd.clone());
        self.last_loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Memoized; after a restart the first read reloads from the state file.
    /// Concurrent first readers wait for that one reload; a failed reload is
    /// retried on the next read.
    pub async fn last_command(&self) -> Option<ControlCommand> {
        let cached = self.last.lock().clone();
        if cached.is_some() || self.last_loaded.load(Ordering::Acquire) {
            return cached;
        }

        let _reload = self.reload_lock.lock().await;
        // reader lain mungkin sudah selesai reload selama kita menunggu
        let cached = self.last.lock().clone();
        if cached.is_some() || self.last_loaded.load(Ordering::Acquire) {
            return cached;
        }
        match self.last_file.load().await {
            Ok(found) => {
                let mut slot = self.last.lock();
                // dispatch bisa menang balapan selama load
                if slot.is_none() {
                    *slot = found;
                }
                self.last_loaded.store(true, Ordering::Release);
                slot.clone()
            }
            Err(e) => {
                warn!(error = %e, "control: last command reload failed");
                None
            }
        }
    }

    async fn set_trading(&self, enabled: bool, ts_ms: i64) -> Result<(), PersistError> {
        let st = TradingState { enabled, ts_ms };
        self.trading_file.save(&st).await?;
        *self.trading.lock() = Some(st);
        info!(enabled, "control: trading flag updated");
        Ok(())
    }

    /// Persisted trading flag; disabled when nothing was ever written.
    pub async fn trading_enabled(&self) -> bool {
        let cached = *self.trading.lock();
        if let Some(st) = cached {
            return st.enabled;
        }
        match self.trading_file.load().await {
            Ok(found) => {
                let st = found.unwrap_or_default();
                self.trading.lock().get_or_insert(st).enabled
            }
            Err(e) => {
                warn!(error = %e, "control: trading flag unreadable, treating as disabled");
                false
            }
        }
    }
}
