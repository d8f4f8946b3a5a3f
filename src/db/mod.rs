//! Database layer.
//!
//! This module provides tenant-scoped data access:
//! - Connection and pool interfaces the execution core is written against
//! - Isolation configuration and transaction sequencing
//! - Guaranteed cleanup and release of borrowed connections
//! - The execution context entry points
//! - PostgreSQL and in-memory pool implementations
//! - Ad-hoc statement execution and row decoding for the CLI

pub mod cleanup;
pub mod connection;
pub mod context;
pub mod isolation;
pub mod memory;
pub mod pool;
pub mod query;
pub mod transaction;
pub mod types;

pub use cleanup::{ConnectionGuard, best_effort};
pub use connection::{ConnectionPool, ReleaseDisposition, TenantConnection};
pub use context::TenantExecutor;
pub use isolation::{BYPASS_SETTING_KEY, TENANT_SETTING_KEY};
pub use memory::{MemoryConnection, MemoryPool};
pub use pool::PgTenantPool;
pub use query::QueryRunner;
pub use transaction::{TransactionController, TransactionState};
