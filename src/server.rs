// ===============================
// src/server.rs (HTTP: ingest, snapshots, SSE stream, /metrics)
// ===============================
//
// Semua POST dicek x-ingest-key (kalau key dikonfigurasi).
// Error selalu dibalas {ok:false, error:<code>} dengan status 400/401/404/500.
//
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{
    body::Bytes,
    header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Event};
use crate::ingest::{
    authorize, parse_account, parse_body, parse_book, parse_cancel, parse_fill, parse_guardrail,
    parse_limit, parse_order, parse_tick, parse_trade, ApiError, INGEST_KEY_HEADER,
};
use crate::metrics::{encode_metrics, INGEST_REJECTS, STREAM_CLIENTS};
use crate::service::Core;

const JSON: &str = "application/json";

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut rsp = Response::new(body);
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    rsp
}

fn json_ok<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(buf) => respond(StatusCode::OK, JSON, Body::from(buf)),
        Err(e) => {
            warn!(?e, "http: response serialize failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, JSON, Body::from(r#"{"ok":false,"error":"serialize"}"#))
        }
    }
}

fn error_response(e: &ApiError) -> Response<Body> {
    let body = json!({ "ok": false, "error": e.code() }).to_string();
    respond(e.status(), JSON, Body::from(body))
}

/// Bind and return the local address plus the server future. The server
/// stops gracefully once `shutdown` flips.
pub fn bind(
    addr: SocketAddr,
    core: Arc<Core>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make = make_service_fn(move |_conn| {
        let core = Arc::clone(&core);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&core), req))) }
    });
    let server = Server::try_bind(&addr)?.serve(make);
    let local = server.local_addr();
    info!(%local, "http listening (ingest, /stream, /metrics)");
    let fut = server.with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    Ok((local, fut))
}

async fn handle(core: Arc<Core>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    Ok(match route(core, req).await {
        Ok(rsp) => rsp,
        Err(e) => {
            INGEST_REJECTS.with_label_values(&[route_label(&path), e.code()]).inc();
            if e.status().is_server_error() {
                warn!(%method, %path, error = %e, "http: request failed");
            } else {
                debug!(%method, %path, error = %e, "http: request rejected");
            }
            error_response(&e)
        }
    })
}

/// Bounded label set for metrics.
fn route_label(path: &str) -> &'static str {
    match path {
        "/ingest/tick" => "tick",
        "/ingest/fill" => "fill",
        "/ingest/guardrail" => "guardrail",
        "/ingest/account" => "account",
        "/control" | "/control/last" => "control",
        p if p.starts_with("/shadow/") => "shadow",
        p if p.starts_with("/regime/") => "regime",
        "/positions" | "/fills" | "/fills.csv" | "/guardrails" | "/account" => "snapshot",
        _ => "other",
    }
}

async fn route(core: Arc<Core>, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path();
    let query = parts.uri.query();

    if parts.method == Method::POST {
        let presented = parts.headers.get(INGEST_KEY_HEADER).and_then(|v| v.to_str().ok());
        authorize(core.ingest_key.as_ref(), presented)?;
        let raw = hyper::body::to_bytes(body).await?;
        let v = parse_body(&raw)?;

        return match path {
            "/ingest/tick" => match parse_tick(&v)? {
                Some(tick) => {
                    core.bus.publish(Event::Tick(tick));
                    Ok(json_ok(&json!({ "ok": true })))
                }
                // feed sampah: diterima, tidak diproses
                None => Ok(json_ok(&json!({ "ok": true, "dropped": true }))),
            },
            "/ingest/fill" => {
                core.bus.publish(Event::Fill(parse_fill(&v)?));
                Ok(json_ok(&json!({ "ok": true })))
            }
            "/ingest/guardrail" => {
                let alert = parse_guardrail(&v)?;
                let id = alert.id.clone();
                core.bus.publish(Event::Guardrail(alert));
                Ok(json_ok(&json!({ "ok": true, "id": id })))
            }
            "/ingest/account" => {
                core.bus.publish(Event::Account(parse_account(&v)?));
                Ok(json_ok(&json!({ "ok": true })))
            }
            "/control" => {
                let cmd = core.control.dispatch(&v).await?;
                Ok(json_ok(&json!({ "ok": true, "command": cmd })))
            }
            "/shadow/book" => {
                let req = parse_book(&v)?;
                core.shadow.lock().on_book(&req.symbol, &req.book);
                Ok(json_ok(&json!({ "ok": true })))
            }
            "/shadow/trade" => {
                let t = parse_trade(&v)?;
                core.shadow.lock().on_trade(&t.symbol, t.price, t.size, t.aggressor);
                Ok(json_ok(&json!({ "ok": true })))
            }
            "/shadow/order" => {
                let o = parse_order(&v)?;
                let id = o.order.id.clone();
                core.shadow.lock().place_limit(&o.symbol, o.order)?;
                Ok(json_ok(&json!({ "ok": true, "id": id })))
            }
            "/shadow/cancel" => {
                let c = parse_cancel(&v)?;
                let cancelled = core.shadow.lock().cancel(&c.symbol, &c.id);
                Ok(json_ok(&json!({ "ok": true, "cancelled": cancelled })))
            }
            _ => Err(ApiError::NotFound),
        };
    }

    if parts.method != Method::GET {
        return Err(ApiError::NotFound);
    }

    match path {
        "/" | "/health" => Ok(json_ok(&json!({ "ok": true, "ts": now_ms() }))),
        "/metrics" => Ok(respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", Body::from(encode_metrics()))),
        "/stream" => Ok(open_stream(&core)),
        "/control/last" => Ok(json_ok(&core.control.last_command().await)),
        "/positions" => {
            let view = match &core.marks {
                Some(client) => {
                    let missing = core.store.open_symbols_without_price();
                    let marks = client.resolve(&missing).await;
                    core.store.positions_snapshot_with_marks(&marks)
                }
                None => core.store.positions_snapshot(),
            };
            Ok(json_ok(&view))
        }
        "/fills" => Ok(json_ok(&core.store.fills_snapshot(parse_limit(query)))),
        "/fills.csv" => {
            let csv = core.store.export_fills_csv()?;
            let mut rsp = respond(StatusCode::OK, "text/csv; charset=utf-8", Body::from(csv));
            rsp.headers_mut()
                .insert("content-disposition", HeaderValue::from_static("attachment; filename=\"fills.csv\""));
            Ok(rsp)
        }
        "/guardrails" => Ok(json_ok(&core.store.guardrails(parse_limit(query)))),
        "/account" => Ok(json_ok(&core.store.account())),
        p => match p.strip_prefix("/regime/") {
            Some(sym) if !sym.trim().is_empty() => {
                let symbol = sym.trim().to_ascii_uppercase();
                Ok(json_ok(&core.regime.snapshot(&symbol, now_ms())))
            }
            _ => Err(ApiError::NotFound),
        },
    }
}

/// SSE: satu baris `data:` per event bus, komentar keep-alive periodik.
fn open_stream(core: &Core) -> Response<Body> {
    let (mut tx, body) = Body::channel();
    let mut sub = core.bus.subscribe();
    let mut shutdown = core.shutdown.clone();
    let every = core.heartbeat;

    tokio::spawn(async move {
        STREAM_CLIENTS.inc();
        let mut beat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        // komentar awal supaya proxy langsung flush header
        let mut pending = Some(": connected\n\n".to_string());
        loop {
            if let Some(chunk) = pending.take() {
                if tx.send_data(Bytes::from(chunk)).await.is_err() {
                    break;
                }
            }
            let chunk = tokio::select! {
                ev = sub.recv() => match ev {
                    Some(ev) => match serde_json::to_string(&ev) {
                        Ok(line) => format!("data: {line}\n\n"),
                        Err(e) => {
                            warn!(?e, kind = ev.kind(), "stream: serialize failed");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = beat.tick() => ": keep-alive\n\n".to_string(),
                _ = shutdown.changed() => break,
            };
            pending = Some(chunk);
        }
        STREAM_CLIENTS.dec();
        debug!("stream: client closed");
    });

    let mut rsp = respond(StatusCode::OK, "text/event-stream", body);
    rsp.headers_mut().insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    rsp
}
