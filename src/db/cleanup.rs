//! Guaranteed cleanup for borrowed connections.
//!
//! A [`ConnectionGuard`] owns the borrowed connection for the whole life of an
//! execution context. However the context ends, the guard terminates any open
//! transaction, clears any session-scoped isolation stamp, and then releases
//! the connection exactly once.
//!
//! # Exit paths
//!
//! - Normal and error paths call [`ConnectionGuard::finish`], which runs the
//!   cleanup inline.
//! - If the guard is dropped before it has released (the unit of work
//!   panicked, or the caller dropped the future, possibly while `finish` was
//!   itself awaiting a cleanup statement), `Drop` spawns whatever cleanup is
//!   still outstanding onto the current tokio runtime. Without a runtime the connection is released with
//!   [`ReleaseDisposition::Discard`] so it can never be reused dirty.
//!
//! Cleanup statements are secondary operations: they go through
//! [`best_effort`], which logs failures and reports them as a boolean, so they
//! can never replace the result the caller is waiting for.

use crate::db::connection::{ConnectionPool, ReleaseDisposition, TenantConnection};
use crate::db::isolation;
use crate::db::transaction::TransactionController;
use crate::error::{DbResult, TenancyError};
use crate::models::{IsolationPayload, IsolationScope};
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, debug, error, warn};
use uuid::Uuid;

/// Run a secondary operation whose failure must not surface.
///
/// Returns `true` if it succeeded. Failures are logged and swallowed.
pub async fn best_effort<F>(operation: &'static str, fut: F) -> bool
where
    F: Future<Output = DbResult<()>>,
{
    match fut.await {
        Ok(()) => true,
        Err(e @ TenancyError::Transaction { .. }) => {
            error!(operation, kind = e.kind(), error = %e, "Cleanup step failed during unwind");
            false
        }
        Err(e) => {
            warn!(operation, kind = e.kind(), error = %e, "Cleanup step failed");
            false
        }
    }
}

/// Exclusive owner of one borrowed connection.
///
/// The connection stays inside the guard until the final release, so a guard
/// dropped halfway through its own cleanup still knows what is left to undo.
pub struct ConnectionGuard<P: ConnectionPool> {
    pool: Arc<P>,
    connection: Option<P::Connection>,
    transaction: TransactionController,
    session_stamp: Option<IsolationPayload>,
    disposition: ReleaseDisposition,
    /// Set on the copy that `Drop` hands to a background task.
    detached: bool,
    context_id: Uuid,
}

impl<P: ConnectionPool> std::fmt::Debug for ConnectionGuard<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("context_id", &self.context_id)
            .field("transaction", &self.transaction.state())
            .field("session_stamp", &self.session_stamp)
            .field("disposition", &self.disposition)
            .field("released", &self.connection.is_none())
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionPool> ConnectionGuard<P> {
    pub fn new(pool: Arc<P>, connection: P::Connection, context_id: Uuid) -> Self {
        Self {
            pool,
            connection: Some(connection),
            transaction: TransactionController::new(),
            session_stamp: None,
            disposition: ReleaseDisposition::Reuse,
            detached: false,
            context_id,
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    /// The live connection, for the unit of work.
    pub fn connection_mut(&mut self) -> DbResult<&mut P::Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| TenancyError::internal("connection already released"))
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction.is_active()
    }

    /// Whether releasing right now would hand back a dirty session.
    fn needs_cleanup(&self) -> bool {
        self.transaction.needs_rollback() || self.session_stamp.is_some()
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TenancyError::internal("connection already released"))?;
        self.transaction.begin(conn).await
    }

    /// Stamp the connection, at local scope if a transaction is active and at
    /// session scope otherwise.
    pub async fn configure(&mut self, payload: IsolationPayload) -> DbResult<()> {
        let scope = IsolationScope::for_transaction(self.transaction.is_active());
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TenancyError::internal("connection already released"))?;
        if scope == IsolationScope::Session {
            // Recorded before the statement runs: a failed SET may still have applied.
            self.session_stamp = Some(payload);
        }
        isolation::apply(conn, payload, scope).await
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TenancyError::internal("connection already released"))?;
        self.transaction.commit(conn).await
    }

    /// Terminate, reset, and release. Consumes the guard.
    pub async fn finish(mut self) {
        self.unwind().await;
    }

    /// Roll back an open transaction, clear a session stamp, then release.
    ///
    /// Each step is marked done only after the server answers, and release
    /// always happens last. A connection whose cleanup failed is discarded
    /// rather than reused.
    async fn unwind(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        if self.transaction.needs_rollback()
            && !best_effort("rollback", self.transaction.rollback(&mut *conn)).await
        {
            self.disposition = ReleaseDisposition::Discard;
        }

        if let Some(payload) = self.session_stamp {
            if !best_effort("session reset", isolation::reset(conn, payload)).await {
                self.disposition = ReleaseDisposition::Discard;
            }
            self.session_stamp = None;
        }

        self.release();
    }

    fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            let disposition = self.disposition;
            self.pool.release(connection, disposition);
            debug!(context_id = %self.context_id, ?disposition, "Connection released");
        }
    }

    fn discard(&mut self) {
        self.disposition = ReleaseDisposition::Discard;
        self.release();
    }
}

impl<P: ConnectionPool> Drop for ConnectionGuard<P> {
    fn drop(&mut self) {
        if self.connection.is_none() {
            return;
        }
        if !self.needs_cleanup() {
            self.release();
            return;
        }
        if self.detached {
            // The background unwind was itself cut short, e.g. by runtime shutdown
            error!(
                context_id = %self.context_id,
                transaction = %self.transaction.state(),
                "Background cleanup interrupted; discarding connection"
            );
            self.discard();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    context_id = %self.context_id,
                    transaction = %self.transaction.state(),
                    session_stamped = self.session_stamp.is_some(),
                    "Context dropped before cleanup; unwinding in background"
                );
                let mut remaining = ConnectionGuard {
                    pool: Arc::clone(&self.pool),
                    connection: self.connection.take(),
                    transaction: std::mem::take(&mut self.transaction),
                    session_stamp: self.session_stamp.take(),
                    disposition: self.disposition,
                    detached: true,
                    context_id: self.context_id,
                };
                let span = tracing::Span::current();
                handle.spawn(async move { remaining.unwind().await }.instrument(span));
            }
            Err(_) => {
                error!(
                    context_id = %self.context_id,
                    "Context dropped outside a runtime; discarding connection"
                );
                self.discard();
            }
        }
    }
}
