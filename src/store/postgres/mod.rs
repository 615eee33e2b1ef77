//! PostgreSQL-backed [`LedgerStore`].
//!
//! Each unit runs in its own database transaction on a pooled connection. Balance rows
//! are locked with `SELECT ... FOR UPDATE`; serialization failures, deadlocks and lock
//! timeouts re-run the unit up to `max_conflict_retries` times with linear backoff.

pub mod connection;
pub mod executor;
pub mod pool;
pub mod queries;
pub mod rows;
pub mod schema;
pub mod transaction;
pub mod unit;

pub use transaction::IsolationLevel;

use crate::config::{DatabaseSettings, LedgerSettings};
use crate::error::{ConflictError, LedgerError, StorageError};
use crate::store::{LedgerStore, UnitOfWork};
use connection::validate_connection_string;
use pool::ConnectionPool;
use schema::SchemaReport;
use std::time::Duration;
use transaction::Transaction;
use unit::PgUnit;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

pub struct PgStore {
    pool: ConnectionPool,
    isolation: IsolationLevel,
    max_retries: u32,
    backoff: Duration,
}

impl PgStore {
    /// Validates the connection string and prepares the pool; connections open lazily
    pub fn connect(database: &DatabaseSettings, ledger: &LedgerSettings) -> Result<Self, LedgerError> {
        validate_connection_string(&database.url)
            .map_err(|e| LedgerError::Storage(StorageError::Connection(e.to_string())))?;
        Ok(Self {
            pool: ConnectionPool::new(database),
            isolation: database.isolation_level,
            max_retries: ledger.max_conflict_retries,
            backoff: ledger.retry_backoff(),
        })
    }

    /// Creates or upgrades the ledger tables
    pub fn install_schema(&self) -> Result<SchemaReport, LedgerError> {
        let conn = self.pool.acquire()?;
        let tx = Transaction::begin(conn.client()?, IsolationLevel::ReadCommitted)?;
        let report = schema::install(&tx, schema::STEPS)?;
        tx.commit()?;
        Ok(report)
    }

    pub fn check_health(&self) -> bool {
        match self.pool.acquire() {
            Ok(conn) => conn.is_healthy(),
            Err(e) => {
                log::warn!("health check could not acquire a connection: {e}");
                false
            }
        }
    }

    pub fn open_connections(&self) -> usize {
        self.pool.opened()
    }

    fn run_once<T, F>(&self, work: &mut F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::store_unit_span("postgres").entered();

        let mut conn = {
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::acquire_connection_span().entered();
            self.pool.acquire()?
        };

        let (outcome, broken) = {
            let tx = Transaction::begin(conn.client()?, self.isolation)?;
            let result = work(&mut PgUnit::new(&tx));
            match result {
                Ok(value) => match tx.commit() {
                    Ok(()) => (Ok(value), false),
                    Err(e) => (Err(LedgerError::from(e)), false),
                },
                Err(e) => match tx.rollback() {
                    Ok(()) => (Err(e), false),
                    Err(rollback) => {
                        log::warn!("rollback failed, discarding connection: {rollback}");
                        (Err(e), true)
                    }
                },
            }
        };

        if broken {
            conn.discard();
        }
        outcome
    }
}

impl LedgerStore for PgStore {
    fn atomically<T, F>(&self, mut work: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        retry_contended(self.max_retries, self.backoff, || self.run_once(&mut work))
    }
}

/// Re-runs `attempt_unit` while it fails with a retryable conflict.
///
/// Makes at most `max_retries + 1` attempts, sleeping `backoff * n` before retry `n`.
fn retry_contended<T>(
    max_retries: u32,
    backoff: Duration,
    mut attempt_unit: impl FnMut() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let mut attempt = 0;
    loop {
        match attempt_unit() {
            Err(e) if e.is_retryable() => {
                if attempt >= max_retries {
                    log::warn!("giving up after {max_retries} conflict retries");
                    return Err(ConflictError::RetryExhausted(max_retries).into());
                }
                attempt += 1;
                #[cfg(feature = "metrics")]
                METRICS.record_conflict_retry();
                log::debug!("unit hit contention, retry {attempt}/{max_retries}");
                may::coroutine::sleep(backoff * attempt);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_malformed_url() {
        let database = DatabaseSettings {
            url: "mysql://localhost/countersign".to_string(),
            ..DatabaseSettings::default()
        };
        let err = PgStore::connect(&database, &LedgerSettings::default()).err();
        assert!(matches!(
            err,
            Some(LedgerError::Storage(StorageError::Connection(_)))
        ));
    }

    #[test]
    fn test_connect_is_lazy() {
        let store = PgStore::connect(&DatabaseSettings::default(), &LedgerSettings::default())
            .expect("valid url");
        assert_eq!(store.open_connections(), 0);
    }

    #[test]
    fn test_retry_contended_succeeds_after_contention() {
        let mut calls = 0;
        let outcome = retry_contended(3, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(ConflictError::Contention.into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(outcome.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_contended_gives_up_after_max_retries() {
        let mut calls = 0;
        let outcome: Result<(), LedgerError> = retry_contended(2, Duration::ZERO, || {
            calls += 1;
            Err(ConflictError::Contention.into())
        });
        assert!(matches!(
            outcome,
            Err(LedgerError::Conflict(ConflictError::RetryExhausted(2)))
        ));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_contended_passes_other_errors_through() {
        let mut calls = 0;
        let outcome: Result<(), LedgerError> = retry_contended(5, Duration::ZERO, || {
            calls += 1;
            Err(ConflictError::InsufficientQuantity {
                available: "0".to_string(),
                requested: "1".to_string(),
            }
            .into())
        });
        assert!(matches!(
            outcome,
            Err(LedgerError::Conflict(ConflictError::InsufficientQuantity { .. }))
        ));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_contended_without_retries_tries_once() {
        let mut calls = 0;
        let outcome: Result<(), LedgerError> = retry_contended(0, Duration::ZERO, || {
            calls += 1;
            Err(ConflictError::Contention.into())
        });
        assert!(matches!(
            outcome,
            Err(LedgerError::Conflict(ConflictError::RetryExhausted(0)))
        ));
        assert_eq!(calls, 1);
    }
}
