//! Tenant identity and execution mode models.
//!
//! An [`ExecutionMode`] is the closed set of ways a caller can borrow a
//! connection: a plain tenant-scoped query, a tenant-scoped transaction, or a
//! privileged cross-tenant bypass. The mode alone decides whether a
//! transaction is opened and what gets written to the isolation channel.

use crate::error::{DbResult, TenancyError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;

/// An isolation boundary in the shared schema. Always a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TenantId(NonZeroU64);

impl TenantId {
    /// Largest accepted identifier; the row-security policy casts to bigint.
    pub const MAX: i64 = i64::MAX;

    /// Validate a raw identifier.
    pub fn new(value: i64) -> DbResult<Self> {
        if value <= 0 {
            return Err(TenancyError::invalid_tenant(format!(
                "tenant id must be a positive integer, got {}",
                value
            )));
        }
        NonZeroU64::new(value as u64)
            .map(Self)
            .ok_or_else(|| TenancyError::invalid_tenant("tenant id must not be zero"))
    }

    /// The raw integer value.
    pub fn get(self) -> i64 {
        self.0.get() as i64
    }

    /// Text form written to the isolation channel.
    pub fn as_setting_value(self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TenantId {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TenancyError::invalid_tenant("tenant id is empty"));
        }
        let value = trimmed.parse::<i64>().map_err(|_| {
            TenancyError::invalid_tenant(format!("tenant id '{}' is not an integer", trimmed))
        })?;
        Self::new(value)
    }
}

impl TryFrom<i64> for TenantId {
    type Error = TenancyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for i64 {
    fn from(value: TenantId) -> Self {
        value.get()
    }
}

/// Anything a caller may pass where a tenant identifier is required.
///
/// Validation happens here, before any connection is touched.
pub trait IntoTenantId {
    fn into_tenant_id(self) -> DbResult<TenantId>;
}

impl IntoTenantId for TenantId {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        Ok(self)
    }
}

impl IntoTenantId for i64 {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        TenantId::new(self)
    }
}

impl IntoTenantId for i32 {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        TenantId::new(i64::from(self))
    }
}

impl IntoTenantId for u32 {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        TenantId::new(i64::from(self))
    }
}

impl IntoTenantId for u64 {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        let value = i64::try_from(self).map_err(|_| {
            TenancyError::invalid_tenant(format!("tenant id {} exceeds {}", self, TenantId::MAX))
        })?;
        TenantId::new(value)
    }
}

impl IntoTenantId for &str {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        self.parse()
    }
}

impl IntoTenantId for String {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        self.parse()
    }
}

impl IntoTenantId for &String {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        self.parse()
    }
}

impl<T: IntoTenantId> IntoTenantId for Option<T> {
    fn into_tenant_id(self) -> DbResult<TenantId> {
        match self {
            Some(value) => value.into_tenant_id(),
            None => Err(TenancyError::invalid_tenant("tenant id is missing")),
        }
    }
}

/// Scope of the isolation setting on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationScope {
    /// Persists on the physical connection until explicitly reset.
    Session,
    /// Discarded by the store when the enclosing transaction ends.
    Local,
}

impl IsolationScope {
    /// Local if and only if a transaction is active.
    pub fn for_transaction(transaction_active: bool) -> Self {
        if transaction_active {
            Self::Local
        } else {
            Self::Session
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for IsolationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// What gets written to the isolation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationPayload {
    Tenant(TenantId),
    Bypass,
}

impl IsolationPayload {
    pub fn tenant(self) -> Option<TenantId> {
        match self {
            Self::Tenant(id) => Some(id),
            Self::Bypass => None,
        }
    }

    pub fn is_bypass(self) -> bool {
        matches!(self, Self::Bypass)
    }
}

/// How a unit of work is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// No transaction; tenant stamped at session scope and reset before release.
    Simple { tenant: TenantId },
    /// BEGIN/COMMIT around the unit of work; tenant stamped transaction-local.
    Transactional { tenant: TenantId },
    /// Cross-tenant bypass, optionally inside a transaction.
    Privileged { use_transaction: bool },
}

impl ExecutionMode {
    /// Plain tenant-scoped mode, validating the identifier.
    pub fn simple(tenant: impl IntoTenantId) -> DbResult<Self> {
        Ok(Self::Simple {
            tenant: tenant.into_tenant_id()?,
        })
    }

    /// Transactional tenant-scoped mode, validating the identifier.
    pub fn transactional(tenant: impl IntoTenantId) -> DbResult<Self> {
        Ok(Self::Transactional {
            tenant: tenant.into_tenant_id()?,
        })
    }

    /// Privileged bypass mode. Never reads a tenant identifier.
    pub fn privileged(use_transaction: bool) -> Self {
        Self::Privileged { use_transaction }
    }

    pub fn uses_transaction(&self) -> bool {
        match self {
            Self::Simple { .. } => false,
            Self::Transactional { .. } => true,
            Self::Privileged { use_transaction } => *use_transaction,
        }
    }

    pub fn payload(&self) -> IsolationPayload {
        match self {
            Self::Simple { tenant } | Self::Transactional { tenant } => {
                IsolationPayload::Tenant(*tenant)
            }
            Self::Privileged { .. } => IsolationPayload::Bypass,
        }
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.payload().tenant()
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Privileged { .. })
    }

    /// Scope the isolation setting will be written at.
    pub fn isolation_scope(&self) -> IsolationScope {
        IsolationScope::for_transaction(self.uses_transaction())
    }

    /// Stable label for logs and results.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Transactional { .. } => "transactional",
            Self::Privileged {
                use_transaction: false,
            } => "privileged",
            Self::Privileged {
                use_transaction: true,
            } => "privileged_transactional",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant() {
            Some(tenant) => write!(f, "{} (tenant {})", self.label(), tenant),
            None => write!(f, "{} (bypass)", self.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_accepts_positive_integers() {
        assert_eq!(TenantId::new(42).unwrap().get(), 42);
        assert_eq!(42i32.into_tenant_id().unwrap().as_setting_value(), "42");
        assert_eq!(7u64.into_tenant_id().unwrap().get(), 7);
        assert_eq!(TenantId::new(i64::MAX).unwrap().get(), i64::MAX);
    }

    #[test]
    fn test_tenant_id_rejects_non_positive() {
        for value in [0i64, -1, i64::MIN] {
            let err = TenantId::new(value).unwrap_err();
            assert!(matches!(err, TenancyError::InvalidTenant { .. }), "{value}");
        }
    }

    #[test]
    fn test_tenant_id_rejects_out_of_range_unsigned() {
        let err = u64::MAX.into_tenant_id().unwrap_err();
        assert!(matches!(err, TenancyError::InvalidTenant { .. }));
    }

    #[test]
    fn test_tenant_id_from_text() {
        assert_eq!(" 42 ".into_tenant_id().unwrap().get(), 42);
        assert_eq!(String::from("9").into_tenant_id().unwrap().get(), 9);

        for bad in ["", "   ", "abc", "4.2", "1e3", "NaN", "-3", "0", "99999999999999999999"] {
            assert!(
                matches!(bad.into_tenant_id(), Err(TenancyError::InvalidTenant { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let missing: Option<i64> = None;
        let err = missing.into_tenant_id().unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert_eq!(Some(5i64).into_tenant_id().unwrap().get(), 5);
    }

    #[test]
    fn test_tenant_id_serde() {
        let id: TenantId = serde_json::from_str("12").unwrap();
        assert_eq!(id.get(), 12);
        assert_eq!(serde_json::to_string(&id).unwrap(), "12");
        assert!(serde_json::from_str::<TenantId>("0").is_err());
    }

    #[test]
    fn test_scope_follows_transaction() {
        assert_eq!(IsolationScope::for_transaction(true), IsolationScope::Local);
        assert_eq!(IsolationScope::for_transaction(false), IsolationScope::Session);
    }

    #[test]
    fn test_execution_modes() {
        let simple = ExecutionMode::simple(3).unwrap();
        assert!(!simple.uses_transaction());
        assert_eq!(simple.isolation_scope(), IsolationScope::Session);
        assert_eq!(simple.tenant().map(TenantId::get), Some(3));

        let tx = ExecutionMode::transactional("8").unwrap();
        assert!(tx.uses_transaction());
        assert_eq!(tx.isolation_scope(), IsolationScope::Local);

        let admin = ExecutionMode::privileged(false);
        assert!(admin.payload().is_bypass());
        assert!(admin.tenant().is_none());
        assert_eq!(admin.isolation_scope(), IsolationScope::Session);
        assert_eq!(
            ExecutionMode::privileged(true).isolation_scope(),
            IsolationScope::Local
        );
    }

    #[test]
    fn test_mode_display_distinguishes_bypass() {
        assert_eq!(
            ExecutionMode::simple(42).unwrap().to_string(),
            "simple (tenant 42)"
        );
        assert_eq!(
            ExecutionMode::privileged(true).to_string(),
            "privileged_transactional (bypass)"
        );
    }
}
