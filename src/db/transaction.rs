//! Transaction sequencing for a single execution context.
//!
//! BEGIN, COMMIT and ROLLBACK are issued as ordinary statements on the
//! borrowed connection. The controller tracks where the context is in the
//! `None -> Active -> {Committed, RolledBack}` lifecycle and refuses any
//! statement that the current state does not permit. While BEGIN is in flight
//! the state is `Beginning`: the server may already have opened the block, so
//! a context dropped at that point still owes a ROLLBACK.

use crate::db::connection::TenantConnection;
use crate::error::{DbResult, TenancyError, TransactionPhase};
use tracing::debug;

const BEGIN_SQL: &str = "BEGIN";
const COMMIT_SQL: &str = "COMMIT";
const ROLLBACK_SQL: &str = "ROLLBACK";

/// Lifecycle of the transaction owned by one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    None,
    Beginning,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Beginning => write!(f, "beginning"),
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransactionController {
    state: TransactionState,
}

impl TransactionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// A block may be open on the server: either active, or BEGIN was sent
    /// and its outcome never observed.
    pub fn needs_rollback(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Active | TransactionState::Beginning
        )
    }

    /// `None -> Active`. A failed BEGIN leaves the state at `None`.
    pub async fn begin<C: TenantConnection + ?Sized>(&mut self, conn: &mut C) -> DbResult<()> {
        self.require_state(TransactionState::None, TransactionPhase::Begin)?;
        self.state = TransactionState::Beginning;
        if let Err(e) = conn.execute(BEGIN_SQL, &[]).await {
            self.state = TransactionState::None;
            return Err(TenancyError::transaction(TransactionPhase::Begin, e));
        }
        self.state = TransactionState::Active;
        debug!("Transaction started");
        Ok(())
    }

    /// `Active -> Committed`.
    ///
    /// A failed COMMIT leaves the state `Active` so the caller can still roll
    /// back; the store may or may not have ended the transaction already.
    pub async fn commit<C: TenantConnection + ?Sized>(&mut self, conn: &mut C) -> DbResult<()> {
        self.require_state(TransactionState::Active, TransactionPhase::Commit)?;
        conn.execute(COMMIT_SQL, &[])
            .await
            .map_err(|e| TenancyError::transaction(TransactionPhase::Commit, e))?;
        self.state = TransactionState::Committed;
        debug!("Transaction committed");
        Ok(())
    }

    /// `Active | Beginning -> RolledBack`, whether or not the statement
    /// succeeds. The state only moves once the server has answered.
    pub async fn rollback<C: TenantConnection + ?Sized>(&mut self, conn: &mut C) -> DbResult<()> {
        if !self.needs_rollback() {
            return Err(self.refused(TransactionPhase::Rollback));
        }
        let result = conn.execute(ROLLBACK_SQL, &[]).await;
        self.state = TransactionState::RolledBack;
        result.map_err(|e| TenancyError::transaction(TransactionPhase::Rollback, e))?;
        debug!("Transaction rolled back");
        Ok(())
    }

    fn require_state(&self, required: TransactionState, phase: TransactionPhase) -> DbResult<()> {
        if self.state == required {
            Ok(())
        } else {
            Err(self.refused(phase))
        }
    }

    fn refused(&self, phase: TransactionPhase) -> TenancyError {
        TenancyError::internal(format!(
            "{} is not permitted while the transaction is {}",
            phase, self.state
        ))
    }
}
