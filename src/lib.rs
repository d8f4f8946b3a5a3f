//! Tenant-scoped execution contexts over pooled PostgreSQL connections.
//!
//! Every data access goes through a [`TenantExecutor`], which borrows one
//! connection, stamps it with the caller's tenant (or an audited bypass flag)
//! for the row-security policy to read, optionally wraps the work in a
//! transaction, and always returns the connection to the pool clean.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{MemoryPool, PgTenantPool, TenantExecutor};
pub use error::{DbResult, TenancyError};
pub use models::{ExecutionMode, IntoTenantId, TenantId};
