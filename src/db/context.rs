//! Tenant-scoped execution contexts.
//!
//! [`TenantExecutor`] is the single funnel for data access. Each call borrows
//! one connection, optionally opens a transaction, stamps the connection with
//! the caller's tenant (or the bypass flag), runs the unit of work, commits,
//! and hands the connection back clean. The three public entry points differ
//! only in the [`ExecutionMode`] they feed into the shared pipeline.
//!
//! # Errors
//!
//! Exactly one error reaches the caller: the first of validation, acquisition,
//! BEGIN, isolation configuration, unit of work, or COMMIT. Unit-of-work
//! errors are returned unchanged. Anything that fails while unwinding after
//! that is logged and dropped.
//!
//! # Example
//!
//! ```ignore
//! let executor = TenantExecutor::new(PgTenantPool::connect(&config).await?);
//!
//! let names: Vec<String> = executor
//!     .run_isolated(42, |conn| {
//!         Box::pin(async move {
//!             sqlx::query_scalar("SELECT name FROM clients")
//!                 .fetch_all(&mut **conn)
//!                 .await
//!                 .map_err(TenancyError::from)
//!         })
//!     })
//!     .await?;
//! ```

use crate::db::cleanup::ConnectionGuard;
use crate::db::connection::ConnectionPool;
use crate::error::TenancyError;
use crate::models::{ExecutionMode, IntoTenantId};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Runs units of work under tenant isolation.
pub struct TenantExecutor<P> {
    pool: Arc<P>,
}

impl<P> Clone for TenantExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<P> std::fmt::Debug for TenantExecutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantExecutor").finish_non_exhaustive()
    }
}

impl<P: ConnectionPool> TenantExecutor<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Share an existing pool handle.
    pub fn from_arc(pool: Arc<P>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Plain-query mode: no transaction, tenant stamped at session scope and
    /// reset before the connection is released.
    pub async fn run_isolated<T, E, F>(&self, tenant: impl IntoTenantId, uow: F) -> Result<T, E>
    where
        T: Send,
        E: From<TenancyError> + Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let mode = ExecutionMode::simple(tenant)?;
        self.run(mode, uow).await
    }

    /// Atomic mode: BEGIN, tenant stamped transaction-local, COMMIT on
    /// success, ROLLBACK on any failure.
    pub async fn run_transaction<T, E, F>(
        &self,
        tenant: impl IntoTenantId,
        uow: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<TenancyError> + Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let mode = ExecutionMode::transactional(tenant)?;
        self.run(mode, uow).await
    }

    /// Administrative cross-tenant mode. Sets the bypass flag instead of a
    /// tenant id; no tenant id is required or read.
    pub async fn run_privileged<T, E, F>(&self, uow: F, use_transaction: bool) -> Result<T, E>
    where
        T: Send,
        E: From<TenancyError> + Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        self.run(ExecutionMode::privileged(use_transaction), uow)
            .await
    }

    /// Shared pipeline behind every entry point.
    pub async fn run<T, E, F>(&self, mode: ExecutionMode, uow: F) -> Result<T, E>
    where
        T: Send,
        E: From<TenancyError> + Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let context_id = Uuid::new_v4();
        let span = match mode.tenant() {
            Some(tenant) => info_span!(
                "tenant_context",
                %context_id,
                mode = mode.label(),
                tenant = tenant.get(),
                bypass = false,
            ),
            None => info_span!(
                "tenant_context",
                %context_id,
                mode = mode.label(),
                bypass = true,
            ),
        };
        self.execute(mode, context_id, uow).instrument(span).await
    }

    async fn execute<T, E, F>(&self, mode: ExecutionMode, context_id: Uuid, uow: F) -> Result<T, E>
    where
        T: Send,
        E: From<TenancyError> + Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let start = Instant::now();
        if mode.is_privileged() {
            info!(
                use_transaction = mode.uses_transaction(),
                "Privileged context opened with tenant isolation bypassed"
            );
        } else {
            debug!("Tenant context opened");
        }

        let connection = self.pool.acquire().await.map_err(step_failed::<E>)?;
        let mut guard = ConnectionGuard::new(Arc::clone(&self.pool), connection, context_id);

        let outcome = drive(&mut guard, mode, uow).await;
        guard.finish().await;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            success = outcome.is_ok(),
            "Context closed"
        );
        outcome
    }
}

/// Steps between acquisition and release. Cleanup is the caller's job.
async fn drive<P, T, E, F>(
    guard: &mut ConnectionGuard<P>,
    mode: ExecutionMode,
    uow: F,
) -> Result<T, E>
where
    P: ConnectionPool,
    T: Send,
    E: From<TenancyError> + Send,
    F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
{
    if mode.uses_transaction() {
        guard.begin().await.map_err(step_failed::<E>)?;
    }
    guard.configure(mode.payload()).await.map_err(step_failed::<E>)?;

    let conn = guard.connection_mut().map_err(step_failed::<E>)?;
    let value = uow(conn).await?;

    if guard.transaction_active() {
        guard.commit().await.map_err(step_failed::<E>)?;
    }
    Ok(value)
}

fn step_failed<E: From<TenancyError>>(err: TenancyError) -> E {
    warn!(kind = err.kind(), error = %err, "Execution context step failed");
    E::from(err)
}
