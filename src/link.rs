// ===============================
// src/link.rs (outbound control link: queue + reconnect)
// ===============================
//
// Command operator diteruskan ke bridge eksternal (mis. broker bridge) lewat
// satu koneksi. Selama koneksi belum open, command diantrikan di memori dan
// di-flush FIFO begitu tersambung lagi. Command baru keluar dari antrian
// setelah send sukses (at-least-once).
//
// connecting -> open -> {closed, error} -> (backoff) -> connecting ...
//
use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::domain::ControlCommand;
use crate::metrics::{CONTROL_LINK_CONNECTED, CONTROL_LINK_QUEUED, CONTROL_LINK_RECONNECTS};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("bad control link url {0}")]
    Url(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState { Connecting, Open, Closed, Error }

#[async_trait]
pub trait ControlTransport: Send + 'static {
    async fn connect(&mut self) -> Result<Box<dyn ControlConnection>, LinkError>;
}

#[async_trait]
pub trait ControlConnection: Send {
    async fn send(&mut self, line: String) -> Result<(), LinkError>;
    /// Resolves when the peer goes away. Must be cancel-safe.
    async fn closed(&mut self);
}

// ---------------- WebSocket transport ----------------

pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: &str) -> Result<Self, LinkError> {
        let url = Url::parse(url).map_err(|e| LinkError::Url(format!("{url}: {e}")))?;
        Ok(Self { url })
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ControlTransport for WsTransport {
    async fn connect(&mut self) -> Result<Box<dyn ControlConnection>, LinkError> {
        info!(url = %self.url, "control link: connecting");
        let (ws, _resp) = connect_async(self.url.clone())
            .await
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        Ok(Box::new(WsConnection { ws }))
    }
}

#[async_trait]
impl ControlConnection for WsConnection {
    async fn send(&mut self, line: String) -> Result<(), LinkError> {
        self.ws.send(Message::Text(line)).await.map_err(|e| LinkError::Send(e.to_string()))
    }

    async fn closed(&mut self) {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Close(_)) => return,
                Ok(_) => {
                    // ack/pong dari bridge diabaikan
                }
                Err(e) => {
                    error!(?e, "control link: ws read error");
                    return;
                }
            }
        }
    }
}

// ---------------- link task ----------------

/// Handle used by the control channel to forward commands.
#[derive(Clone)]
pub struct ControlLink {
    tx: mpsc::UnboundedSender<String>,
    state: watch::Receiver<LinkState>,
}

impl ControlLink {
    pub fn spawn<T: ControlTransport>(
        transport: T,
        backoff: Backoff,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::Connecting);
        let task = tokio::spawn(run(transport, backoff, rx, state_tx, shutdown));
        (Self { tx, state }, task)
    }

    /// Queue a command; false if the link task is gone.
    pub fn send(&self, cmd: &ControlCommand) -> bool {
        match serde_json::to_string(cmd) {
            Ok(line) => self.tx.send(line).is_ok(),
            Err(e) => {
                error!(?e, "control link: serialize failed");
                false
            }
        }
    }

    pub fn state(&self) -> LinkState { *self.state.borrow() }
}

enum Wake { Retry, Stop }

/// Sleep through the backoff while still accepting new commands.
async fn wait_backoff(
    backoff: &mut Backoff,
    rx: &mut mpsc::UnboundedReceiver<String>,
    queue: &mut VecDeque<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Wake {
    let delay = backoff.next_delay();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Wake::Retry,
            msg = rx.recv() => match msg {
                Some(line) => {
                    queue.push_back(line);
                    CONTROL_LINK_QUEUED.set(queue.len() as i64);
                }
                None => return Wake::Stop,
            },
            _ = shutdown.changed() => return Wake::Stop,
        }
    }
}

async fn run<T: ControlTransport>(
    mut transport: T,
    mut backoff: Backoff,
    mut rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<LinkState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut queue: VecDeque<String> = VecDeque::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        state_tx.send_replace(LinkState::Connecting);
        let connected = tokio::select! {
            r = transport.connect() => r,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(mut conn) => {
                state_tx.send_replace(LinkState::Open);
                CONTROL_LINK_CONNECTED.set(1);
                backoff.reset();
                info!(queued = queue.len(), "control link: open");

                let stop = 'open: loop {
                    while let Ok(line) = rx.try_recv() {
                        queue.push_back(line);
                    }
                    // flush FIFO
                    while let Some(line) = queue.front() {
                        match conn.send(line.clone()).await {
                            Ok(()) => {
                                queue.pop_front();
                            }
                            Err(e) => {
                                warn!(?e, queued = queue.len(), "control link: send failed");
                                state_tx.send_replace(LinkState::Error);
                                break 'open false;
                            }
                        }
                    }
                    CONTROL_LINK_QUEUED.set(queue.len() as i64);

                    tokio::select! {
                        msg = rx.recv() => match msg {
                            Some(line) => queue.push_back(line),
                            None => break 'open true,
                        },
                        _ = conn.closed() => {
                            warn!("control link: peer closed");
                            state_tx.send_replace(LinkState::Closed);
                            break 'open false;
                        }
                        _ = shutdown.changed() => break 'open true,
                    }
                };
                CONTROL_LINK_CONNECTED.set(0);
                if stop {
                    break;
                }
            }
            Err(e) => {
                CONTROL_LINK_RECONNECTS.inc();
                warn!(?e, attempt = backoff.attempt(), queued = queue.len(), "control link: connect failed");
                state_tx.send_replace(LinkState::Error);
            }
        }

        if let Wake::Stop = wait_backoff(&mut backoff, &mut rx, &mut queue, &mut shutdown).await {
            break;
        }
    }

    state_tx.send_replace(LinkState::Closed);
    if !queue.is_empty() {
        warn!(dropped = queue.len(), "control link: stopped with undelivered commands");
    }
    info!("control link: stopped");
}
