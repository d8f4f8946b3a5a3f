//! Data models for tenant-scoped execution.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod tenant;

// Re-export commonly used types
pub use query::{
    ColumnMetadata, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, MAX_QUERY_TIMEOUT_SECS,
    MAX_ROW_LIMIT, QueryParam, QueryRequest, QueryResult,
};
pub use tenant::{ExecutionMode, IntoTenantId, IsolationPayload, IsolationScope, TenantId};
