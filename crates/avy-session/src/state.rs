//! Session state types.

use avy_core::new_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// How strictly co-located sessions are partitioned from one another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Separate storage, cookies, and fingerprint per session.
    #[default]
    Strict,
    /// Shared infrastructure, separate cookie/storage maps only.
    Relaxed,
}

/// One recorded action inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// What the session visited or did (a URL or an action label).
    pub label: String,
    /// Fingerprint id observed during this activity, if the automation
    /// layer reported one.
    #[serde(default)]
    pub fingerprint_id: Option<String>,
    /// Explicit leakage signal from the caller: state from another
    /// session was observed here.
    #[serde(default)]
    pub leakage_detected: bool,
    /// Cookie/storage writes made during this activity, merged into the
    /// session's per-session maps.
    #[serde(default)]
    pub set_cookies: HashMap<String, String>,
    #[serde(default)]
    pub set_storage: HashMap<String, String>,
    pub at: DateTime<Utc>,
}

impl Activity {
    pub fn visit(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fingerprint_id: None,
            leakage_detected: false,
            set_cookies: HashMap::new(),
            set_storage: HashMap::new(),
            at: Utc::now(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint_id: impl Into<String>) -> Self {
        self.fingerprint_id = Some(fingerprint_id.into());
        self
    }
}

/// Why a session was terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    DurationBudget,
    VisitBudget,
    Contaminated,
    Requested,
}

/// A live session scoped to one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub identity_id: String,
    pub group_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,

    /// Duration budget, seconds.
    pub max_duration_secs: u64,
    pub visit_count: u32,
    /// Visit budget.
    pub max_visits: u32,

    /// Per-session cookie/storage maps; never shared across sessions.
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub storage: HashMap<String, String>,

    /// Distinct fingerprint ids observed. More than one is drift.
    #[serde(default)]
    pub fingerprints: BTreeSet<String>,
    #[serde(default)]
    pub contaminated: bool,
    #[serde(default)]
    pub contamination_signals: Vec<String>,

    #[serde(default)]
    pub history: Vec<Activity>,
}

impl SessionState {
    pub fn new(identity_id: &str, group_id: &str, max_duration_secs: u64, max_visits: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            identity_id: identity_id.to_string(),
            group_id: group_id.to_string(),
            started_at: now,
            last_activity: now,
            max_duration_secs,
            visit_count: 0,
            max_visits,
            cookies: HashMap::new(),
            storage: HashMap::new(),
            fingerprints: BTreeSet::new(),
            contaminated: false,
            contamination_signals: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }
}

/// Sessions created together under one isolation boundary. Shrinks as
/// members terminate; deleted when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationGroup {
    pub id: String,
    pub level: IsolationLevel,
    pub session_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl IsolationGroup {
    pub fn new(level: IsolationLevel) -> Self {
        Self {
            id: new_id(),
            level,
            session_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Audit record written when a session terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub session: SessionState,
    pub reason: TerminationReason,
    pub terminated_at: DateTime<Utc>,
}
