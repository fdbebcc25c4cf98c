//! Id helpers and status enums shared by every crate in the workspace.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Generate a new ULID id (26 characters, Crockford Base32).
///
/// Used for jobs, resources, identities, sessions, and isolation groups
/// alike; the id alone never says what kind of record it names.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Validate that a string is a well-formed ULID.
pub fn validate_id(id: &str) -> Result<()> {
    if id.len() != 26 {
        bail!("Invalid id '{}': expected 26 characters, got {}", id, id.len());
    }
    ulid::Ulid::from_string(id)
        .with_context(|| format!("Invalid id '{}': not a valid ULID", id))?;
    Ok(())
}

/// Lifecycle of a queued job.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal: the engine never
/// transitions a job out of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Behavioral category of an identity. Advances monotonically
/// (new → returning → loyal) via the evolution rule; never regresses
/// without an explicit reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityCategory {
    #[default]
    New,
    Returning,
    Loyal,
}

impl IdentityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Returning => "returning",
            Self::Loyal => "loyal",
        }
    }

    /// The category reached by one evolution step, if any.
    pub fn next(&self) -> Option<IdentityCategory> {
        match self {
            Self::New => Some(Self::Returning),
            Self::Returning => Some(Self::Loyal),
            Self::Loyal => None,
        }
    }
}

impl std::fmt::Display for IdentityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health status of an egress resource as maintained by the sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Active,
    Degraded,
    Error,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire protocol of an egress resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }

    /// Parse a protocol label as it appears in supplier lists.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" | "socks" => Ok(Self::Socks5),
            other => bail!("Unknown proxy protocol '{}'", other),
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_valid_ulid() {
        let id = new_id();
        assert_eq!(id.len(), 26);
        validate_id(&id).unwrap();
    }

    #[test]
    fn test_validate_id_rejects_wrong_length() {
        let err = validate_id("too-short").unwrap_err();
        assert!(err.to_string().contains("expected 26 characters"));
    }

    #[test]
    fn test_validate_id_rejects_non_ulid() {
        // Right length, but 'U' is not in Crockford Base32.
        let err = validate_id("UUUUUUUUUUUUUUUUUUUUUUUUUU").unwrap_err();
        assert!(err.to_string().contains("not a valid ULID"));
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_category_progression() {
        assert_eq!(IdentityCategory::New.next(), Some(IdentityCategory::Returning));
        assert_eq!(
            IdentityCategory::Returning.next(),
            Some(IdentityCategory::Loyal)
        );
        assert_eq!(IdentityCategory::Loyal.next(), None);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(ProxyProtocol::parse("http").unwrap(), ProxyProtocol::Http);
        assert_eq!(ProxyProtocol::parse("SOCKS5").unwrap(), ProxyProtocol::Socks5);
        assert_eq!(ProxyProtocol::parse("socks").unwrap(), ProxyProtocol::Socks5);
        assert!(ProxyProtocol::parse("gopher").is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
        let parsed: IdentityCategory = serde_json::from_str("\"loyal\"").unwrap();
        assert_eq!(parsed, IdentityCategory::Loyal);
    }
}
