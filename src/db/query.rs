//! Ad-hoc statements run through an execution context.
//!
//! [`QueryRunner`] is the CLI's unit of work: it streams at most `limit + 1`
//! rows under a timeout on the context's connection, and converts them to
//! JSON once the context has closed.

use crate::db::context::TenantExecutor;
use crate::db::pool::{PgTenantPool, bind_postgres_param};
use crate::db::types::JsonRow;
use crate::error::{DbResult, TenancyError};
use crate::models::{
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, ExecutionMode, MAX_ROW_LIMIT, QueryParam,
    QueryRequest, QueryResult,
};
use futures_util::StreamExt;
use sqlx::PgConnection;
use sqlx::postgres::PgRow;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs statements under a tenant context and shapes the rows.
#[derive(Debug, Clone)]
pub struct QueryRunner {
    default_timeout: Duration,
    default_limit: u32,
}

impl QueryRunner {
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS as u64),
            default_limit: DEFAULT_ROW_LIMIT,
        }
    }

    pub fn with_defaults(timeout_secs: u64, row_limit: u32) -> Self {
        Self {
            default_timeout: Duration::from_secs(timeout_secs),
            default_limit: row_limit.clamp(1, MAX_ROW_LIMIT),
        }
    }

    /// Run `request` under `mode` and return at most `limit` rows.
    pub async fn run(
        &self,
        executor: &TenantExecutor<PgTenantPool>,
        mode: ExecutionMode,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        let row_limit = request
            .limit
            .map(|_| request.effective_limit())
            .unwrap_or(self.default_limit);
        let query_timeout = request
            .timeout_secs
            .map(|_| Duration::from_secs(request.effective_timeout() as u64))
            .unwrap_or(self.default_timeout);

        debug!(
            mode = mode.label(),
            limit = row_limit,
            timeout_secs = query_timeout.as_secs(),
            params = request.params.len(),
            "Running statement"
        );

        let sql = request.sql.clone();
        let params = request.params.clone();
        let rows = executor
            .run(mode, move |conn| {
                Box::pin(async move {
                    fetch_rows(&mut **conn, &sql, &params, row_limit, query_timeout).await
                })
            })
            .await?;

        Ok(process_rows(
            rows,
            mode.label(),
            row_limit,
            start,
            request.decode_binary,
        ))
    }
}

impl Default for QueryRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_rows(
    conn: &mut PgConnection,
    sql: &str,
    params: &[QueryParam],
    row_limit: u32,
    query_timeout: Duration,
) -> DbResult<Vec<PgRow>> {
    let fetch_limit = row_limit as usize + 1;
    let rows_future = if params.is_empty() {
        use sqlx::Executor;
        let stream = conn.fetch(sql);
        stream.take(fetch_limit).collect::<Vec<_>>()
    } else {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        let stream = query.fetch(conn);
        stream.take(fetch_limit).collect::<Vec<_>>()
    };

    match timeout(query_timeout, rows_future).await {
        Ok(results) => results
            .into_iter()
            .map(|r| r.map_err(TenancyError::from))
            .collect(),
        Err(_) => Err(TenancyError::timeout(
            "query execution",
            query_timeout.as_secs() as u32,
        )),
    }
}

fn process_rows<R: JsonRow>(
    rows: Vec<R>,
    mode: &str,
    row_limit: u32,
    start: Instant,
    decode_binary: bool,
) -> QueryResult {
    let execution_time_ms = start.elapsed().as_millis() as u64;
    let Some(first) = rows.first() else {
        return QueryResult::empty(mode, execution_time_ms);
    };

    let columns = first.column_metadata();
    let total_rows = rows.len();
    let truncated = total_rows > row_limit as usize;

    let json_rows = rows
        .iter()
        .take(row_limit as usize)
        .map(|r| r.to_json(decode_binary))
        .collect();

    if truncated {
        warn!(limit = row_limit, "Query result truncated");
    }

    QueryResult {
        mode: mode.to_string(),
        columns,
        rows: json_rows,
        truncated,
        execution_time_ms,
    }
}
