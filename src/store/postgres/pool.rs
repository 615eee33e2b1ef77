//! Bounded connection pool.
//!
//! Idle clients wait in a `crossbeam-channel` queue. Connections are opened lazily up to
//! `max_connections`; once the pool is full, callers wait up to `pool_timeout_seconds`
//! for a connection to come back.

use super::connection::{check_connection_health, connect};
use crate::config::DatabaseSettings;
use crate::error::{LedgerError, StorageError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use may_postgres::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

pub struct ConnectionPool {
    url: String,
    max_connections: usize,
    timeout: Duration,
    opened: AtomicUsize,
    idle_tx: Sender<Client>,
    idle_rx: Receiver<Client>,
}

impl ConnectionPool {
    pub fn new(settings: &DatabaseSettings) -> Self {
        let max_connections = settings.max_connections.max(1);
        let (idle_tx, idle_rx) = bounded(max_connections);
        Self {
            url: settings.url.clone(),
            max_connections,
            timeout: settings.pool_timeout(),
            opened: AtomicUsize::new(0),
            idle_tx,
            idle_rx,
        }
    }

    pub fn acquire(&self) -> Result<PooledConnection<'_>, LedgerError> {
        if let Ok(client) = self.idle_rx.try_recv() {
            return Ok(PooledConnection::new(self, client));
        }

        if self.opened.fetch_add(1, Ordering::SeqCst) < self.max_connections {
            return match connect(&self.url) {
                Ok(client) => {
                    log::debug!("opened pooled connection");
                    Ok(PooledConnection::new(self, client))
                }
                Err(e) => {
                    self.opened.fetch_sub(1, Ordering::SeqCst);
                    Err(StorageError::Connection(e.to_string()).into())
                }
            };
        }
        self.opened.fetch_sub(1, Ordering::SeqCst);

        match self.idle_rx.recv_timeout(self.timeout) {
            Ok(client) => Ok(PooledConnection::new(self, client)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                log::warn!("no pooled connection available after {:?}", self.timeout);
                Err(StorageError::PoolTimeout.into())
            }
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn release(&self, client: Client, discard: bool) {
        if discard {
            self.opened.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if self.idle_tx.try_send(client).is_err() {
            self.opened.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Client on loan from the pool; returned on drop
pub struct PooledConnection<'p> {
    pool: &'p ConnectionPool,
    client: Option<Client>,
    discard: bool,
}

impl<'p> PooledConnection<'p> {
    fn new(pool: &'p ConnectionPool, client: Client) -> Self {
        #[cfg(feature = "metrics")]
        METRICS.connection_acquired();
        Self {
            pool,
            client: Some(client),
            discard: false,
        }
    }

    pub fn client(&self) -> Result<&Client, LedgerError> {
        self.client
            .as_ref()
            .ok_or_else(|| StorageError::Connection("connection already released".to_string()).into())
    }

    /// Drops the connection instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_healthy(&self) -> bool {
        self.client.as_ref().is_some_and(check_connection_health)
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "metrics")]
        METRICS.connection_released();
        if let Some(client) = self.client.take() {
            self.pool.release(client, self.discard);
        }
    }
}
