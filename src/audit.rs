// ===============================
// src/audit.rs
// ===============================
//
// JSONL audit journal untuk command operator:
// - Setiap entry ditulis ke file .jsonl (append) lalu di-flush.
// - Pengirim menunggu ack, jadi command dianggap tercatat setelah flush.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file sekali dan ulangi.
//
use std::path::Path;

use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
};
use tracing::{error, info};

use crate::domain::{now_ms, ControlCommand};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditLine<'a> {
    recorded_at: i64,
    command: &'a ControlCommand,
}

type Ack = oneshot::Sender<std::io::Result<()>>;

/// Cheap cloneable handle to the journal writer task.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<(ControlCommand, Ack)>,
}

impl AuditLog {
    /// Spawn the writer task for `path`.
    pub fn spawn(path: String) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx, path));
        Self { tx }
    }

    /// Resolves once the line is flushed to disk.
    pub async fn record(&self, cmd: &ControlCommand) -> std::io::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let closed = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "audit writer stopped");
        self.tx.send((cmd.clone(), ack_tx)).await.map_err(|_| closed())?;
        ack_rx.await.map_err(|_| closed())?
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

pub async fn run(mut rx: mpsc::Receiver<(ControlCommand, Ack)>, path: String) {
    info!(%path, "audit: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(?e, %path, "audit: open failed, will retry on first entry");
            None
        }
    };

    while let Some((cmd, ack)) = rx.recv().await {
        let line = match serde_json::to_vec(&AuditLine { recorded_at: now_ms(), command: &cmd }) {
            Ok(l) => l,
            Err(e) => {
                let _ = ack.send(Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)));
                continue;
            }
        };

        let first = match writer.as_mut() {
            Some(w) => write_line(w, &line).await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "audit file not open")),
        };
        let result = match first {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(?e, "audit: write failed, attempting reopen");
                match open_writer(&path).await {
                    Ok(mut w) => {
                        let retry = write_line(&mut w, &line).await;
                        writer = Some(w);
                        retry
                    }
                    Err(e2) => Err(e2),
                }
            }
        };
        if let Err(e) = &result {
            error!(?e, kind = cmd.kind.as_str(), "audit: entry not recorded");
        }
        let _ = ack.send(result);
    }
    info!("audit: channel closed, stopped");
}
