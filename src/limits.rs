//! Per-tenant ingestion limits.

use crate::types::TenantId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Limits applied to one tenant. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    /// Series a tenant may hold in memory.
    pub max_series_per_tenant: Option<usize>,
    /// Samples accepted in one push request.
    pub max_samples_per_push: Option<usize>,
}

impl Limits {
    /// No limits.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Set the series limit.
    pub fn with_max_series_per_tenant(mut self, n: usize) -> Self {
        self.max_series_per_tenant = Some(n);
        self
    }

    /// Set the push size limit.
    pub fn with_max_samples_per_push(mut self, n: usize) -> Self {
        self.max_samples_per_push = Some(n);
        self
    }
}

/// Source of per-tenant limits.
pub trait LimitsProvider: Send + Sync + std::fmt::Debug {
    /// Limits for `tenant`.
    fn limits(&self, tenant: &str) -> Limits;
}

impl LimitsProvider for Limits {
    fn limits(&self, _tenant: &str) -> Limits {
        *self
    }
}

/// Default limits with per-tenant overrides that can change at runtime.
#[derive(Debug, Default)]
pub struct Overrides {
    defaults: Limits,
    tenants: RwLock<HashMap<TenantId, Limits>>,
}

impl Overrides {
    /// Create overrides falling back to `defaults`.
    pub fn new(defaults: Limits) -> Self {
        Self {
            defaults,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the limits of one tenant.
    pub fn set(&self, tenant: impl Into<TenantId>, limits: Limits) {
        self.tenants.write().insert(tenant.into(), limits);
    }

    /// Drop the override of one tenant.
    pub fn remove(&self, tenant: &str) {
        self.tenants.write().remove(tenant);
    }
}

impl LimitsProvider for Overrides {
    fn limits(&self, tenant: &str) -> Limits {
        self.tenants
            .read()
            .get(tenant)
            .copied()
            .unwrap_or(self.defaults)
    }
}
