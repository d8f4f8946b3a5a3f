//! Isolation configuration on a borrowed connection.
//!
//! The row-security policy reads two configuration keys. This module is the
//! only writer of those keys: it stamps a connection with a tenant id or the
//! bypass flag before the unit of work runs, and clears session-scoped stamps
//! before the connection goes back to the pool.

use crate::db::connection::TenantConnection;
use crate::error::{DbResult, TenancyError};
use crate::models::{IsolationPayload, IsolationScope, QueryParam};
use tracing::debug;

/// Configuration key holding the active tenant id as text.
pub const TENANT_SETTING_KEY: &str = "app.current_tenant_id";

/// Configuration key holding the cross-tenant bypass flag.
pub const BYPASS_SETTING_KEY: &str = "app.bypass_rls";

/// Value written to [`BYPASS_SETTING_KEY`] in privileged mode.
pub const BYPASS_ENABLED_VALUE: &str = "true";

/// Value written by a session reset.
pub const RESET_VALUE: &str = "";

/// `set_config(key, value, is_local)`; parameters are always bound.
pub const SET_CONFIG_SQL: &str = "SELECT set_config($1, $2, $3)";

/// Key that carries the given payload.
pub fn setting_key(payload: IsolationPayload) -> &'static str {
    match payload {
        IsolationPayload::Tenant(_) => TENANT_SETTING_KEY,
        IsolationPayload::Bypass => BYPASS_SETTING_KEY,
    }
}

/// Value written for the given payload.
pub fn setting_value(payload: IsolationPayload) -> String {
    match payload {
        IsolationPayload::Tenant(tenant) => tenant.as_setting_value(),
        IsolationPayload::Bypass => BYPASS_ENABLED_VALUE.to_string(),
    }
}

fn set_config_params(key: &str, value: String, scope: IsolationScope) -> [QueryParam; 3] {
    [
        QueryParam::from(key),
        QueryParam::String(value),
        QueryParam::Bool(scope.is_local()),
    ]
}

/// Issue the single statement that stamps the connection.
///
/// Failures come back as [`TenancyError::IsolationConfig`].
pub async fn apply<C: TenantConnection + ?Sized>(
    conn: &mut C,
    payload: IsolationPayload,
    scope: IsolationScope,
) -> DbResult<()> {
    let key = setting_key(payload);
    debug!(key, %scope, bypass = payload.is_bypass(), "Applying isolation setting");

    let params = set_config_params(key, setting_value(payload), scope);
    conn.execute(SET_CONFIG_SQL, &params)
        .await
        .map(|_| ())
        .map_err(|e| TenancyError::isolation_config(scope, e))
}

/// Clear a session-scoped stamp so the physical connection carries nothing
/// into its next borrower.
///
/// Failures come back as [`TenancyError::Cleanup`].
pub async fn reset<C: TenantConnection + ?Sized>(
    conn: &mut C,
    payload: IsolationPayload,
) -> DbResult<()> {
    let key = setting_key(payload);
    debug!(key, "Resetting session isolation setting");

    let params = set_config_params(key, RESET_VALUE.to_string(), IsolationScope::Session);
    conn.execute(SET_CONFIG_SQL, &params)
        .await
        .map(|_| ())
        .map_err(TenancyError::cleanup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantId;

    #[test]
    fn test_tenant_payload_uses_tenant_key() {
        let payload = IsolationPayload::Tenant(TenantId::new(42).unwrap());
        assert_eq!(setting_key(payload), TENANT_SETTING_KEY);
        assert_eq!(setting_value(payload), "42");
    }

    #[test]
    fn test_bypass_payload_uses_bypass_key() {
        assert_eq!(setting_key(IsolationPayload::Bypass), BYPASS_SETTING_KEY);
        assert_eq!(setting_value(IsolationPayload::Bypass), "true");
    }

    #[test]
    fn test_set_config_params_carry_scope() {
        let params = set_config_params(TENANT_SETTING_KEY, "7".into(), IsolationScope::Local);
        assert_eq!(params[0].as_str(), Some(TENANT_SETTING_KEY));
        assert_eq!(params[1].as_str(), Some("7"));
        assert_eq!(params[2], QueryParam::Bool(true));

        let params = set_config_params(TENANT_SETTING_KEY, "7".into(), IsolationScope::Session);
        assert_eq!(params[2], QueryParam::Bool(false));
    }

    #[test]
    fn test_reset_value_never_parses_as_tenant() {
        assert!(RESET_VALUE.parse::<TenantId>().is_err());
    }
}
