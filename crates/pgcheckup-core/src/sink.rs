//! Side-channel sink store lookups.
//!
//! The sink is a PostgreSQL database fed by the metrics exporter with raw
//! query texts and index definitions that are too large for labels:
//!
//! - `public.pg_stat_statements(datname, queryid, query)`
//! - `public.index_definitions(data_dir, datname, indexrelname, index_definition)`
//!
//! Lookups never fail report generation: when the sink is unreachable or a
//! query errors, the lookup yields `None` and a warning is logged once.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use postgres::{Client, NoTls};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fmt::truncate_chars;

const QUERY_TEXT_SQL: &str =
    "SELECT query FROM public.pg_stat_statements WHERE datname = $1 AND queryid = $2 LIMIT 1";
const INDEX_DEFINITION_SQL: &str = "SELECT index_definition FROM public.index_definitions \
     WHERE datname = $1 AND indexrelname = $2 ORDER BY data_dir LIMIT 1";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink connection failed: {0}")]
    Connect(String),
    #[error("sink query failed: {0}")]
    Query(String),
    #[error("sink worker failed: {0}")]
    Worker(String),
}

/// Read-only lookups against the sink store.
#[async_trait]
pub trait SinkStore: Send + Sync {
    /// SQL text of `queryid` in `datname`, truncated to `max_chars` when given.
    async fn query_text(
        &self,
        datname: &str,
        queryid: &str,
        max_chars: Option<usize>,
    ) -> Option<String>;

    /// `CREATE INDEX` statement of `index_name` in `datname`.
    async fn index_definition(&self, datname: &str, index_name: &str) -> Option<String>;
}

/// Sink that knows nothing; used when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSink;

#[async_trait]
impl SinkStore for NoSink {
    async fn query_text(&self, _: &str, _: &str, _: Option<usize>) -> Option<String> {
        None
    }

    async fn index_definition(&self, _: &str, _: &str) -> Option<String> {
        None
    }
}

/// Sink connection settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// libpq-style connection string or `postgres://` URL.
    pub connection_string: String,
}

enum SinkState {
    Idle,
    Connected(Client),
    /// Connecting failed once; further lookups return nothing.
    Unavailable,
}

/// PostgreSQL-backed sink.
///
/// Holds a single lazily established connection behind a mutex; every lookup
/// runs on the blocking pool.
pub struct PostgresSink {
    connection_string: String,
    state: Arc<Mutex<SinkState>>,
}

impl PostgresSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            connection_string: config.connection_string.clone(),
            state: Arc::new(Mutex::new(SinkState::Idle)),
        }
    }

    /// Drops the connection, if any. A later lookup reconnects.
    ///
    /// The synchronous client owns its own runtime, so it is dropped on the
    /// blocking pool.
    pub async fn close(&self) {
        let state = Arc::clone(&self.state);
        let closed = tokio::task::spawn_blocking(move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let was_connected = matches!(*state, SinkState::Connected(_));
            *state = SinkState::Idle;
            was_connected
        })
        .await;
        if let Ok(true) = closed {
            debug!("sink connection closed");
        }
    }

    async fn lookup(&self, sql: &'static str, datname: String, key: Key) -> Option<String> {
        let state = Arc::clone(&self.state);
        let connection_string = self.connection_string.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            run_lookup(&mut state, &connection_string, sql, &datname, &key)
        })
        .await
        .map_err(|e| SinkError::Worker(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "sink lookup failed");
                None
            }
        }
    }
}

enum Key {
    QueryId(i64),
    IndexName(String),
}

fn run_lookup(
    state: &mut SinkState,
    connection_string: &str,
    sql: &str,
    datname: &str,
    key: &Key,
) -> Result<Option<String>, SinkError> {
    if matches!(state, SinkState::Idle) {
        match Client::connect(connection_string, NoTls) {
            Ok(client) => {
                info!("connected to sink store");
                *state = SinkState::Connected(client);
            }
            Err(e) => {
                *state = SinkState::Unavailable;
                return Err(SinkError::Connect(format_postgres_error(&e)));
            }
        }
    }
    let SinkState::Connected(client) = state else {
        return Ok(None);
    };

    let rows = match key {
        Key::QueryId(id) => client.query(sql, &[&datname, id]),
        Key::IndexName(name) => client.query(sql, &[&datname, name]),
    };
    match rows {
        Ok(rows) => Ok(rows
            .first()
            .and_then(|row| row.try_get::<_, Option<String>>(0).ok().flatten())),
        Err(e) => {
            let msg = format_postgres_error(&e);
            if client.is_closed() {
                *state = SinkState::Idle;
            }
            Err(SinkError::Query(msg))
        }
    }
}

#[async_trait]
impl SinkStore for PostgresSink {
    async fn query_text(
        &self,
        datname: &str,
        queryid: &str,
        max_chars: Option<usize>,
    ) -> Option<String> {
        let id = queryid.parse::<i64>().ok()?;
        let text = self
            .lookup(QUERY_TEXT_SQL, datname.to_string(), Key::QueryId(id))
            .await?;
        Some(limit_text(text, max_chars))
    }

    async fn index_definition(&self, datname: &str, index_name: &str) -> Option<String> {
        self.lookup(
            INDEX_DEFINITION_SQL,
            datname.to_string(),
            Key::IndexName(index_name.to_string()),
        )
        .await
    }
}

fn limit_text(text: String, max_chars: Option<usize>) -> String {
    match max_chars {
        Some(max) => truncate_chars(&text, max),
        None => text,
    }
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
