// ===============================
// src/persist.rs (whole-object JSON state files)
// ===============================
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not valid json: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One JSON document per file, always read and written whole.
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _doc: PhantomData }
    }

    fn io_err(&self, source: std::io::Error) -> PersistError {
        PersistError::Io { path: self.path.display().to_string(), source }
    }

    /// Missing file reads as `None`.
    pub async fn load(&self) -> Result<Option<T>, PersistError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| PersistError::Json { path: self.path.display().to_string(), source })
    }

    /// Write to a sibling temp file, then rename over the target.
    pub async fn save(&self, value: &T) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
            }
        }
        let body = serde_json::to_vec_pretty(value)
            .map_err(|source| PersistError::Json { path: self.path.display().to_string(), source })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await.map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingState {
    pub enabled: bool,
    #[serde(rename = "ts")]
    pub ts_ms: i64,
}
