//! # Sink
//!
//! Durable storage for sanitized login events. Writes are append-only inserts
//! into a single table: redelivering a message appends a second row.
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::event::SanitizedEvent;

/// Enumeration of errors for writes to a sink.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("sink is unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected the record: {0}")]
    Rejected(String),
}

impl WriteError {
    /// Whether writing the same record again later could succeed.
    ///
    /// Data exceptions (SQLSTATE class 22) and integrity constraint violations
    /// (class 23) will fail the same way on every attempt. Everything else, from
    /// dropped connections to exhausted pools, is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            WriteError::ConnectionError { .. } | WriteError::Unavailable(_) => true,
            WriteError::Rejected(_) => false,
            WriteError::QueryError { error, .. } => match error {
                sqlx::Error::Database(db_error) => !db_error
                    .code()
                    .map(|code| code.starts_with("22") || code.starts_with("23"))
                    .unwrap_or(false),
                sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::Encode(_)
                | sqlx::Error::TypeNotFound { .. } => false,
                _ => true,
            },
        }
    }
}

/// The date stamped in `create_date`: when the event was processed, in UTC.
/// Events carry no timestamp of their own.
pub fn processing_date() -> NaiveDate {
    Utc::now().date_naive()
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Append one event, stamping `create_date` with the processing date.
    async fn persist(&self, event: &SanitizedEvent) -> Result<(), WriteError>;

    /// Release connections held by the sink.
    async fn close(&self) {}
}

/// A `Sink` appending to a PostgreSQL table shaped like `user_logins`.
pub struct PgSink {
    table: String,
    pool: PgPool,
}

impl PgSink {
    /// Connect a new pool to the database at `url`.
    pub async fn new(table: &str, url: &str, max_connections: u32) -> Result<Self, WriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| WriteError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool))
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn persist(&self, event: &SanitizedEvent) -> Result<(), WriteError> {
        let query = format!(
            r#"
INSERT INTO "{}"
    (user_id, device_type, masked_ip, masked_device_id, locale, app_version, create_date)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &self.table
        );

        sqlx::query(&query)
            .bind(&event.user_id)
            .bind(&event.device_type)
            .bind(&event.masked_ip)
            .bind(&event.masked_device_id)
            .bind(&event.locale)
            .bind(&event.app_version)
            .bind(processing_date())
            .execute(&self.pool)
            .await
            .map_err(|error| WriteError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A row as stored by `MemorySink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLogin {
    pub event: SanitizedEvent,
    pub create_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    /// Fail writes as an unreachable database would.
    Unavailable,
    /// Fail writes as a constraint violation would.
    Rejecting,
}

#[derive(Default)]
struct MemorySinkState {
    rows: Vec<StoredLogin>,
    failure: Option<SinkFailure>,
    closed: bool,
}

/// An in-process `Sink` recording rows in insertion order.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_with(&self, failure: Option<SinkFailure>) {
        self.state().failure = failure;
    }

    pub fn rows(&self) -> Vec<StoredLogin> {
        self.state().rows.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn persist(&self, event: &SanitizedEvent) -> Result<(), WriteError> {
        let mut state = self.state();
        let failure = state.failure;
        match failure {
            Some(SinkFailure::Unavailable) => {
                Err(WriteError::Unavailable("connection refused".to_owned()))
            }
            Some(SinkFailure::Rejecting) => {
                Err(WriteError::Rejected("value too long for column".to_owned()))
            }
            None => {
                state.rows.push(StoredLogin {
                    event: event.clone(),
                    create_date: processing_date(),
                });
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}
