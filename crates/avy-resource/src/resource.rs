//! Egress resource types.

use avy_core::{ProxyProtocol, ResourceStatus, new_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignment state of a resource. Mutated only as a whole (bind/unbind),
/// never partially; at most one identity owns a resource at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "identity_id", rename_all = "lowercase")]
pub enum Assignment {
    #[default]
    Free,
    Bound(String),
}

impl Assignment {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// The owning identity id, if bound.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Free => None,
            Self::Bound(id) => Some(id.as_str()),
        }
    }
}

/// Registration input for one egress endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub protocol: ProxyProtocol,
    /// Country the supplier claims; confirmed or corrected by geolocation.
    pub country_hint: String,
}

/// One egress endpoint with its health counters and assignment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub protocol: ProxyProtocol,
    pub country: String,
    pub timezone: String,
    #[serde(default)]
    pub isp: Option<String>,
    pub registered_at: DateTime<Utc>,

    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Failures since the last successful probe.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Rolling average latency, `new = (old + sample) / 2`.
    #[serde(default)]
    pub avg_latency_ms: f64,

    #[serde(default)]
    pub assignment: Assignment,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    pub fn from_spec(spec: &ResourceSpec, country: String, timezone: String, isp: Option<String>) -> Self {
        Self {
            id: new_id(),
            host: spec.host.clone(),
            port: spec.port,
            username: spec.username.clone(),
            password: spec.password.clone(),
            protocol: spec.protocol,
            country,
            timezone,
            isp,
            registered_at: Utc::now(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            assignment: Assignment::Free,
            status: ResourceStatus::Active,
        }
    }

    /// Fraction of probes that succeeded; 1.0 for a never-probed resource
    /// so fresh registrations rank ahead of known-flaky ones.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Proxy URL for building an HTTP client through this resource.
    pub fn proxy_url(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}",
            self.protocol, self.username, self.password, self.host, self.port
        )
    }
}
