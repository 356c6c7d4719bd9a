// ===============================
// src/lib.rs
// ===============================
pub mod audit;            // JSONL journal untuk command operator
pub mod backoff;
pub mod bus;
pub mod config;
pub mod control;
pub mod domain;
pub mod feed;             // dev simulation (--dev-sim)
pub mod guardrail;
pub mod ingest;
pub mod link;             // outbound control link (WebSocket bridge)
pub mod marks;
pub mod metrics;
pub mod persist;
pub mod positions;
pub mod regime;
pub mod server;
pub mod service;
pub mod session;
pub mod shadow;
