//! In-memory connection pool.
//!
//! [`MemoryPool`] models the parts of PostgreSQL the execution core depends
//! on: transaction blocks, `set_config` with session and transaction-local
//! scope, aborted transactions, and a bounded set of physical sessions that
//! carry their settings from one borrower to the next. Every statement is
//! journaled, and failures or lost replies can be injected by matching the
//! rendered statement text, which makes it the backing store for the crate's
//! integration tests and for embedding the executor in downstream tests.
//!
//! ```ignore
//! let pool = MemoryPool::new(1);
//! pool.fail_statements_matching("COMMIT", "40001");
//! let executor = TenantExecutor::new(pool);
//! ```

use crate::db::connection::{ConnectionPool, ReleaseDisposition, TenantConnection};
use crate::db::isolation::SET_CONFIG_SQL;
use crate::error::{DbResult, TenancyError};
use crate::models::QueryParam;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLSTATE for statements issued inside an aborted transaction block.
const IN_FAILED_TRANSACTION: &str = "25P02";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Substitute `$n` placeholders with literals, highest index first so `$1`
/// never clobbers `$10`.
pub fn render_statement(sql: &str, params: &[QueryParam]) -> String {
    let mut rendered = sql.to_string();
    for (idx, param) in params.iter().enumerate().rev() {
        rendered = rendered.replace(&format!("${}", idx + 1), &param.to_sql_literal());
    }
    rendered
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    sql_state: String,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Journal {
    statements: Vec<String>,
    committed: Vec<String>,
    failures: Vec<FailureRule>,
    /// One-shot patterns whose statement applies but never answers.
    stalls: Vec<String>,
}

impl Journal {
    /// Consume a matching failure rule, if any.
    fn take_failure(&mut self, rendered: &str) -> Option<String> {
        let idx = self
            .failures
            .iter()
            .position(|rule| rendered.contains(&rule.pattern))?;
        let rule = &mut self.failures[idx];
        let sql_state = rule.sql_state.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(idx);
            }
        }
        Some(sql_state)
    }

    fn take_stall(&mut self, rendered: &str) -> bool {
        match self.stalls.iter().position(|p| rendered.contains(p.as_str())) {
            Some(idx) => {
                self.stalls.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// State a physical session carries between borrowers.
#[derive(Debug, Clone, Default)]
struct Session {
    id: usize,
    settings: HashMap<String, String>,
    local: HashMap<String, String>,
    /// Session settings as of BEGIN, restored by ROLLBACK.
    snapshot: Option<HashMap<String, String>>,
    aborted: bool,
    pending: Vec<String>,
}

impl Session {
    fn new(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn setting(&self, key: &str) -> Option<&str> {
        self.local
            .get(key)
            .or_else(|| self.settings.get(key))
            .map(String::as_str)
    }

    fn end_transaction(&mut self, commit: bool) -> Vec<String> {
        let snapshot = self.snapshot.take();
        if !commit {
            if let Some(settings) = snapshot {
                self.settings = settings;
            }
        }
        self.local.clear();
        self.aborted = false;
        let pending = std::mem::take(&mut self.pending);
        if commit { pending } else { Vec::new() }
    }
}

/// Point-in-time view of an idle session, for leak assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: usize,
    pub settings: HashMap<String, String>,
    pub in_transaction: bool,
}

impl SessionSnapshot {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

enum Statement {
    Begin,
    Commit,
    Rollback,
    SetConfig {
        key: String,
        value: String,
        is_local: bool,
    },
    Other,
}

impl Statement {
    fn classify(sql: &str, params: &[QueryParam]) -> Self {
        let keyword = sql.trim().trim_end_matches(';').to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" | "START TRANSACTION" => return Self::Begin,
            "COMMIT" | "END" => return Self::Commit,
            "ROLLBACK" | "ABORT" => return Self::Rollback,
            _ => {}
        }
        if sql == SET_CONFIG_SQL {
            if let [
                QueryParam::String(key),
                QueryParam::String(value),
                QueryParam::Bool(is_local),
            ] = params
            {
                return Self::SetConfig {
                    key: key.clone(),
                    value: value.clone(),
                    is_local: *is_local,
                };
            }
        }
        Self::Other
    }
}

#[derive(Debug, Default)]
struct Shared {
    journal: Mutex<Journal>,
}

/// A borrowed in-memory session.
#[derive(Debug)]
pub struct MemoryConnection {
    session: Session,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.session.id
    }

    /// Value the row-security policy would read for `key` right now.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.session.setting(key)
    }

    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    fn apply(&mut self, statement: Statement, rendered: String) {
        let session = &mut self.session;
        match statement {
            Statement::Begin => {
                if !session.in_transaction() {
                    session.snapshot = Some(session.settings.clone());
                }
            }
            Statement::Commit => {
                // COMMIT of an aborted block rolls back, as the server does
                let commit = !session.aborted;
                let committed = session.end_transaction(commit);
                lock(&self.shared.journal).committed.extend(committed);
            }
            Statement::Rollback => {
                session.end_transaction(false);
            }
            Statement::SetConfig {
                key,
                value,
                is_local,
            } => {
                if is_local {
                    // Outside a block a local setting lasts for this statement only
                    if session.in_transaction() {
                        session.local.insert(key, value);
                    }
                } else {
                    session.local.remove(&key);
                    session.settings.insert(key, value);
                }
            }
            Statement::Other => {
                if session.in_transaction() {
                    session.pending.push(rendered);
                } else {
                    lock(&self.shared.journal).committed.push(rendered);
                }
            }
        }
    }
}

#[async_trait]
impl TenantConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        // Give other contexts a chance to interleave, as a network round trip would
        tokio::task::yield_now().await;

        let rendered = render_statement(sql, params);
        let statement = Statement::classify(sql, params);
        let ends_block = matches!(statement, Statement::Commit | Statement::Rollback);

        let (failure, stall) = {
            let mut journal = lock(&self.shared.journal);
            let failure = if self.session.aborted && !ends_block {
                Some(IN_FAILED_TRANSACTION.to_string())
            } else {
                journal.take_failure(&rendered)
            };
            let stall = failure.is_none() && journal.take_stall(&rendered);
            journal.statements.push(rendered.clone());
            (failure, stall)
        };

        if let Some(sql_state) = failure {
            trace!(connection_id = self.session.id, statement = %rendered, %sql_state, "Statement failed");
            if self.session.in_transaction() && !ends_block {
                self.session.aborted = true;
            }
            return Err(TenancyError::database(
                format!("statement failed: {}", rendered),
                Some(sql_state),
                "Injected failure",
            ));
        }

        self.apply(statement, rendered);
        if stall {
            trace!(connection_id = self.session.id, "Statement applied; reply withheld");
            std::future::pending::<()>().await;
        }
        Ok(0)
    }

    async fn current_setting(&mut self, key: &str) -> DbResult<Option<String>> {
        Ok(self.session.setting(key).map(String::from))
    }
}

/// Bounded pool of in-memory sessions.
#[derive(Debug)]
pub struct MemoryPool {
    max_connections: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Session>>,
    shared: Arc<Shared>,
    next_id: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    fail_acquire: AtomicBool,
    acquire_timeout: Duration,
}

impl MemoryPool {
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            max_connections,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::new()),
            shared: Arc::new(Shared::default()),
            next_id: AtomicUsize::new(1),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            fail_acquire: AtomicBool::new(false),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Fail every statement whose rendered text contains `pattern`.
    pub fn fail_statements_matching(&self, pattern: impl Into<String>, sql_state: impl Into<String>) {
        self.push_failure(pattern.into(), sql_state.into(), None);
    }

    /// Fail only the next statement whose rendered text contains `pattern`.
    pub fn fail_next_statement_matching(
        &self,
        pattern: impl Into<String>,
        sql_state: impl Into<String>,
    ) {
        self.push_failure(pattern.into(), sql_state.into(), Some(1));
    }

    fn push_failure(&self, pattern: String, sql_state: String, remaining: Option<usize>) {
        lock(&self.shared.journal).failures.push(FailureRule {
            pattern,
            sql_state,
            remaining,
        });
    }

    /// Apply the next statement matching `pattern`, then never answer, like
    /// a server whose reply is lost on the way back.
    pub fn stall_next_statement_matching(&self, pattern: impl Into<String>) {
        lock(&self.shared.journal).stalls.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        let mut journal = lock(&self.shared.journal);
        journal.failures.clear();
        journal.stalls.clear();
    }

    /// Make every subsequent `acquire` fail until turned off.
    pub fn set_acquire_failure(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Every statement issued, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.shared.journal).statements.clone()
    }

    /// Data statements that took durable effect.
    pub fn committed_statements(&self) -> Vec<String> {
        lock(&self.shared.journal).committed.clone()
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn discarded_count(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Connections currently borrowed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of connections borrowed at once.
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    pub fn idle_sessions(&self) -> Vec<SessionSnapshot> {
        lock(&self.idle)
            .iter()
            .map(|s| SessionSnapshot {
                id: s.id,
                settings: s.settings.clone(),
                in_transaction: s.in_transaction(),
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> DbResult<Self::Connection> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(TenancyError::acquisition(
                "connection refused",
                "Check that the database server is reachable",
            ));
        }

        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            TenancyError::acquisition(
                format!(
                    "Timed out after {:?} waiting for one of {} connections",
                    self.acquire_timeout, self.max_connections
                ),
                "Increase max_connections or reduce concurrent callers",
            )
        })?
        .map_err(|_| TenancyError::acquisition("Connection pool is closed", "Recreate the pool"))?;

        let session = lock(&self.idle)
            .pop_front()
            .unwrap_or_else(|| Session::new(self.next_id.fetch_add(1, Ordering::SeqCst)));

        self.acquired.fetch_add(1, Ordering::SeqCst);
        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(in_use, Ordering::SeqCst);
        debug!(connection_id = session.id, in_use, "Acquired memory connection");

        Ok(MemoryConnection {
            session,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    fn release(&self, connection: Self::Connection, disposition: ReleaseDisposition) {
        let MemoryConnection {
            session, _permit, ..
        } = connection;
        self.released.fetch_add(1, Ordering::SeqCst);
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        match disposition {
            ReleaseDisposition::Reuse => lock(&self.idle).push_back(session),
            ReleaseDisposition::Discard => {
                self.discarded.fetch_add(1, Ordering::SeqCst);
                debug!(connection_id = session.id, "Discarded memory connection");
            }
        }
        // The permit is returned only once the session is parked
        drop(_permit);
    }
}
