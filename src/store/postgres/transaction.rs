//! Database transaction scoping one unit of work.
//!
//! A [`Transaction`] that is dropped without `commit` or `rollback` rolls back, so an
//! early return or a panic inside a unit cannot leave a transaction open on a pooled
//! connection.

use super::executor::{instrumented, SqlError, SqlExecutor};
use may_postgres::types::ToSql;
use may_postgres::{Client, Row};
use serde::Deserialize;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Isolation for ledger units; `read_committed` relies on row locks alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    /// Conflicts surface as 40001 and the unit is re-run
    Serializable,
}

impl IsolationLevel {
    pub fn keyword(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

pub struct Transaction<'c> {
    client: &'c Client,
    closed: bool,
}

impl<'c> Transaction<'c> {
    pub fn begin(client: &'c Client, isolation: IsolationLevel) -> Result<Self, SqlError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        let begin = format!("BEGIN ISOLATION LEVEL {}", isolation.keyword());
        instrumented(&begin, || client.execute(begin.as_str(), &[]))?;

        Ok(Self {
            client,
            closed: false,
        })
    }

    pub fn commit(mut self) -> Result<(), SqlError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        // Closed before the statement runs: a failed COMMIT has already ended the transaction
        self.closed = true;
        instrumented("COMMIT", || self.client.execute("COMMIT", &[]))?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), SqlError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.closed = true;
        instrumented("ROLLBACK", || self.client.execute("ROLLBACK", &[]))?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.client.execute("ROLLBACK", &[]) {
                log::warn!("ledger unit left open and its rollback failed: {e}");
            }
        }
    }
}

impl SqlExecutor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, SqlError> {
        instrumented(query, || self.client.execute(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, SqlError> {
        instrumented(query, || self.client.query(query, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_keywords() {
        assert_eq!(IsolationLevel::ReadCommitted.keyword(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.keyword(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.keyword(), "SERIALIZABLE");
    }

    #[test]
    fn test_isolation_defaults_to_read_committed() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_isolation_deserializes_from_config_names() {
        let level: IsolationLevel = serde_json::from_str("\"serializable\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
