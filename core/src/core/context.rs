//! Tenant context
//!
//! Every call into and out of the core carries the `(tenant_id,
//! business_unit_id)` pair as an explicit value. No function reads tenant
//! identity from ambient state; stores check the pair on every row access.
//!
//! Cross-tenant access is a fatal defect, so the guard helpers return
//! `Authorization` errors rather than filtering silently.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Explicit tenant identity threaded through every operation.
///
/// # Example
/// ```
/// use payment_orchestration_core::core::TenantContext;
///
/// let ctx = TenantContext::new("T1", "B1");
/// assert!(ctx.owns_row("T1", "B1"));
/// assert!(!ctx.owns_row("T2", "B1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: String,
    business_unit_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            business_unit_id: business_unit_id.into(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn business_unit_id(&self) -> &str {
        &self.business_unit_id
    }

    /// Row-level ownership check.
    pub fn owns_row(&self, tenant_id: &str, business_unit_id: &str) -> bool {
        self.tenant_id == tenant_id && self.business_unit_id == business_unit_id
    }

    /// Tenant-only ownership check, for rows scoped to a tenant but shared
    /// across business units (routing rules with a null business unit).
    pub fn owns_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Guard a row access, failing with `Authorization` on mismatch.
    pub fn guard_row(&self, tenant_id: &str, business_unit_id: &str) -> Result<(), CoreError> {
        if self.owns_row(tenant_id, business_unit_id) {
            Ok(())
        } else {
            Err(CoreError::Authorization(format!(
                "row owned by ({}, {}) accessed under ({}, {})",
                tenant_id, business_unit_id, self.tenant_id, self.business_unit_id
            )))
        }
    }

    /// Guard a tenant-scoped access.
    pub fn guard_tenant(&self, tenant_id: &str) -> Result<(), CoreError> {
        if self.owns_tenant(tenant_id) {
            Ok(())
        } else {
            Err(CoreError::Authorization(format!(
                "row owned by tenant {} accessed under tenant {}",
                tenant_id, self.tenant_id
            )))
        }
    }
}
