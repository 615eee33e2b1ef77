//! SQL execution over `may_postgres`.
//!
//! [`SqlExecutor`] is the narrow surface the unit-of-work code is written against. Every
//! statement goes through [`instrumented`] so spans and error accounting stay uniform.

use crate::error::{ConflictError, LedgerError, StorageError};
use may_postgres::types::ToSql;
use may_postgres::{Error as PostgresError, Row};
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Serialization failure, deadlock, lock not available
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

#[derive(Debug)]
pub enum SqlError {
    /// `PostgreSQL` error from `may_postgres`
    Postgres(PostgresError),
    /// Row parsing/conversion error
    Decode(String),
    /// Statement could not be prepared from a builder
    Build(String),
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            SqlError::Decode(s) => write!(f, "Decode error: {s}"),
            SqlError::Build(s) => write!(f, "Query build error: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

impl From<PostgresError> for SqlError {
    fn from(err: PostgresError) -> Self {
        SqlError::Postgres(err)
    }
}

impl SqlError {
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            SqlError::Postgres(e) => e.code().map(|state| state.code()),
            _ => None,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.sqlstate()
            .is_some_and(|state| RETRYABLE_SQLSTATES.contains(&state))
    }
}

impl From<SqlError> for LedgerError {
    fn from(err: SqlError) -> Self {
        if err.is_contention() {
            return LedgerError::Conflict(ConflictError::Contention);
        }
        match err {
            SqlError::Decode(s) => LedgerError::Storage(StorageError::Decode(s)),
            other => LedgerError::Storage(StorageError::Database(other.to_string())),
        }
    }
}

/// Executes SQL inside whatever scope the implementor represents
pub trait SqlExecutor {
    /// Execute a statement and return the number of rows affected
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, SqlError>;

    /// Execute a query and return every row
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, SqlError>;

    /// Execute a query expected to return at most one row
    fn query_opt(&self, query: &str, params: &[&dyn ToSql]) -> Result<Option<Row>, SqlError> {
        let mut rows = self.query_all(query, params)?;
        if rows.len() > 1 {
            return Err(SqlError::Decode(format!(
                "expected at most one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }

    /// Execute a query that must return exactly one row
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, SqlError> {
        self.query_opt(query, params)?
            .ok_or_else(|| SqlError::Decode("query returned no rows".to_string()))
    }
}

/// Runs `call` for `query` inside a query span
pub(crate) fn instrumented<T>(
    query: &str,
    call: impl FnOnce() -> Result<T, PostgresError>,
) -> Result<T, SqlError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(query).entered();

    call().map_err(|e| {
        log::debug!("statement failed: {query}: {e}");
        SqlError::Postgres(e)
    })
}
