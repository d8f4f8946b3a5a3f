//! Connection and pool interfaces consumed by the execution core.
//!
//! The core never talks to a concrete driver. It borrows a connection through
//! [`ConnectionPool::acquire`], runs every statement (including BEGIN, COMMIT,
//! ROLLBACK and the isolation statement) through
//! [`TenantConnection::execute`], and hands the connection back through
//! [`ConnectionPool::release`].

use crate::error::DbResult;
use crate::models::QueryParam;
use async_trait::async_trait;

/// A single physical connection borrowed from a pool.
#[async_trait]
pub trait TenantConnection: Send {
    /// Execute one statement and return the number of rows affected.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Read a configuration value as the row-security policy sees it.
    ///
    /// Returns `None` when the key has never been set on this connection.
    async fn current_setting(&mut self, key: &str) -> DbResult<Option<String>>;
}

/// What the pool should do with a connection being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    /// All cleanup succeeded; the connection may serve the next caller.
    Reuse,
    /// Cleanup failed or could not run; close the physical connection.
    Discard,
}

/// Supplies and reclaims connections.
///
/// `release` is synchronous so it can be called from `Drop`.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: TenantConnection + 'static;

    /// Borrow a connection, waiting per the pool's own policy.
    async fn acquire(&self) -> DbResult<Self::Connection>;

    /// Return a connection. Called exactly once per acquired connection.
    fn release(&self, connection: Self::Connection, disposition: ReleaseDisposition);
}
