//! Identity (profile) types.

use avy_core::{IdentityCategory, new_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative per-identity metrics driving category evolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityMetrics {
    pub visits: u64,
    pub successes: u64,
    /// Rolling success rate; recomputed on every recorded outcome.
    pub evolution_score: f64,
}

impl IdentityMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.visits == 0 {
            return 0.0;
        }
        self.successes as f64 / self.visits as f64
    }
}

/// One resource swap, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationRecord {
    pub at: DateTime<Utc>,
    pub from_resource: String,
    pub to_resource: String,
}

/// A simulated independent actor bound to exactly one egress resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    /// Stable per-country sequence number (first us identity is us-1).
    pub sequence: u32,
    pub country: String,
    pub category: IdentityCategory,
    /// Bound resource id; `None` only transiently during rotation
    /// failure handling, never for a pool-resident identity at rest.
    pub resource_id: Option<String>,
    #[serde(default)]
    pub metrics: IdentityMetrics,
    /// Whether the identity is currently checked out for a session.
    #[serde(default)]
    pub active: bool,
    /// Per-identity isolated storage key (fingerprint profile, cookie jar
    /// directory); reused across this identity's sessions, never shared.
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rotations: Vec<RotationRecord>,
}

impl Identity {
    pub fn new(country: &str, sequence: u32, category: IdentityCategory) -> Self {
        let id = new_id();
        Self {
            storage_key: format!("{country}-{sequence}-{id}"),
            id,
            sequence,
            country: country.to_string(),
            category,
            resource_id: None,
            metrics: IdentityMetrics::default(),
            active: false,
            created_at: Utc::now(),
            rotations: Vec::new(),
        }
    }

    /// Short human label, e.g. `us-3`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.country, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_identity_defaults() {
        let identity = Identity::new("us", 1, IdentityCategory::New);
        assert_eq!(identity.label(), "us-1");
        assert_eq!(identity.category, IdentityCategory::New);
        assert!(identity.resource_id.is_none());
        assert!(!identity.active);
        assert_eq!(identity.metrics.visits, 0);
        assert!(identity.storage_key.starts_with("us-1-"));
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = IdentityMetrics::default();
        assert_eq!(metrics.success_rate(), 0.0);
        metrics.visits = 4;
        metrics.successes = 3;
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}
