//! pgcheckup-core: PostgreSQL checkup report engine.
//!
//! Provides:
//! - `prom`: Prometheus-compatible metric source client (instant/range queries, SigV4)
//! - `window`: counter deltas and rates over a fixed window
//! - `topk`: hourly top-K attribution with a reconciled "other" residual
//! - `settings`: GUC value parsing, pretty printing, memory estimates
//! - `fmt`: shared formatting helpers (bytes, durations)
//! - `qid`: injection-safe query id matcher
//! - `report`: report envelope, check catalogue, schema validation, generators
//! - `perquery`: query id extraction and per-query documents
//! - `sink`: side-channel store for query texts and index definitions
//! - `upload`: report ingestion API client

pub mod fmt;
pub mod perquery;
pub mod prom;
pub mod qid;
pub mod report;
pub mod settings;
pub mod sink;
pub mod topk;
pub mod upload;
pub mod window;

#[cfg(test)]
pub(crate) mod testutil;

/// Crate version including git SHA (e.g. "0.1.0-abc1234").
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_SHA"));

/// Build time as epoch seconds, embedded by `build.rs`.
pub const BUILD_EPOCH: &str = env!("BUILD_EPOCH");
