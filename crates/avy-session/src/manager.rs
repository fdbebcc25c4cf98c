//! Session lifecycle: open, activity recording with contamination
//! checks, and idempotent termination.

use crate::state::{
    Activity, HistoryRecord, IsolationGroup, IsolationLevel, SessionState, TerminationReason,
};
use anyhow::Result;
use avy_config::SessionConfig;
use avy_core::AppError;
use avy_store::{RecordStore, collections};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ManagerInner {
    sessions: HashMap<String, SessionState>,
    groups: HashMap<String, IsolationGroup>,
    /// Live session per identity; enforces one open session per identity.
    by_identity: HashMap<String, String>,
}

/// Owns every live session and its isolation group.
pub struct SessionManager {
    inner: Mutex<ManagerInner>,
    store: RecordStore,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: RecordStore, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManagerInner {
                sessions: HashMap::new(),
                groups: HashMap::new(),
                by_identity: HashMap::new(),
            }),
            store,
            config,
        })
    }

    /// Open a session for an identity. Fails with `AlreadyActive` if the
    /// identity already has a live session. The session joins a
    /// compatible isolation group or starts a new one.
    pub async fn open(&self, identity_id: &str, level: IsolationLevel) -> Result<SessionState> {
        let mut inner = self.inner.lock().await;
        if inner.by_identity.contains_key(identity_id) {
            return Err(AppError::AlreadyActive(identity_id.to_string()).into());
        }

        let existing = inner
            .groups
            .values()
            .find(|g| g.level == level && g.session_ids.len() < self.config.group_capacity)
            .map(|g| g.id.clone());
        let group_id = match existing {
            Some(id) => id,
            None => {
                let group = IsolationGroup::new(level);
                let id = group.id.clone();
                inner.groups.insert(id.clone(), group);
                debug!(group = %id, ?level, "Created isolation group");
                id
            }
        };

        let session = SessionState::new(
            identity_id,
            &group_id,
            self.config.max_duration_secs,
            self.config.max_visits,
        );
        inner
            .groups
            .get_mut(&group_id)
            .expect("group inserted above")
            .session_ids
            .push(session.id.clone());
        inner
            .by_identity
            .insert(identity_id.to_string(), session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        debug!(session = %session.id, identity = %identity_id, group = %group_id, "Opened session");
        Ok(session)
    }

    /// Record one activity: budgets advance and contamination checks run.
    ///
    /// A second distinct fingerprint id inside one session is drift; an
    /// explicit leakage signal is contamination outright. Either sets the
    /// contaminated flag, which `should_terminate` picks up.
    pub async fn record_activity(&self, session_id: &str, activity: Activity) -> Result<SessionState> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::not_found("session", session_id))?;

        session.visit_count += 1;
        session.last_activity = activity.at;
        session.cookies.extend(activity.set_cookies.clone());
        session.storage.extend(activity.set_storage.clone());

        if let Some(fingerprint) = &activity.fingerprint_id {
            session.fingerprints.insert(fingerprint.clone());
            if session.fingerprints.len() > 1 && !session.contaminated {
                session.contaminated = true;
                let signal = format!(
                    "fingerprint drift: {} distinct ids observed",
                    session.fingerprints.len()
                );
                warn!(session = %session_id, %signal, "Contamination detected");
                session.contamination_signals.push(signal);
            }
        }

        if activity.leakage_detected && !session.contaminated {
            session.contaminated = true;
            let signal = format!("state leakage reported during '{}'", activity.label);
            warn!(session = %session_id, %signal, "Contamination detected");
            session.contamination_signals.push(signal);
        }

        session.history.push(activity);
        Ok(session.clone())
    }

    /// True when a budget is exhausted or the session is contaminated.
    pub async fn should_terminate(&self, session_id: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| AppError::not_found("session", session_id))?;
        Ok(termination_reason(session).is_some())
    }

    /// Terminate a session: move it to durable history and release it
    /// from its group (deleting the group if it became empty).
    ///
    /// Idempotent: terminating an unknown or already-terminated session
    /// returns `Ok(false)` with no duplicate history entry, because
    /// shutdown paths may race the sweep.
    pub async fn terminate(&self, session_id: &str, reason: TerminationReason) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.remove(session_id) else {
            return Ok(false);
        };

        inner.by_identity.remove(&session.identity_id);

        if let Some(group) = inner.groups.get_mut(&session.group_id) {
            group.session_ids.retain(|id| id != session_id);
            if group.session_ids.is_empty() {
                let group_id = session.group_id.clone();
                inner.groups.remove(&group_id);
                debug!(group = %group_id, "Deleted empty isolation group");
            }
        }

        let record = HistoryRecord {
            session,
            reason: reason.clone(),
            terminated_at: Utc::now(),
        };
        self.store
            .put(collections::SESSION_HISTORY, session_id, &record)?;
        info!(session = %session_id, ?reason, "Terminated session");
        Ok(true)
    }

    /// Terminate everything that `should_terminate` flags.
    pub async fn sweep_once(&self) -> Result<usize> {
        let due: Vec<(String, TerminationReason)> = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .values()
                .filter_map(|s| termination_reason(s).map(|r| (s.id.clone(), r)))
                .collect()
        };

        let mut terminated = 0;
        for (session_id, reason) in due {
            if self.terminate(&session_id, reason).await? {
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    /// Start the periodic termination sweep; cancel the token to stop.
    pub fn start_sweep(self: &Arc<Self>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.sweep_once().await {
                            warn!(%err, "Session sweep failed");
                        }
                    }
                }
            }
        });
        cancel
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        let inner = self.inner.lock().await;
        inner.sessions.get(session_id).cloned()
    }

    /// The live session for an identity, if any.
    pub async fn session_for_identity(&self, identity_id: &str) -> Option<SessionState> {
        let inner = self.inner.lock().await;
        let session_id = inner.by_identity.get(identity_id)?;
        inner.sessions.get(session_id).cloned()
    }

    /// Read back a terminated session's audit record.
    pub fn history(&self, session_id: &str) -> Result<Option<HistoryRecord>> {
        self.store.get(collections::SESSION_HISTORY, session_id)
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.len()
    }

    pub async fn group_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.groups.len()
    }
}

fn termination_reason(session: &SessionState) -> Option<TerminationReason> {
    if session.contaminated {
        return Some(TerminationReason::Contaminated);
    }
    if session.elapsed_secs(Utc::now()) >= session.max_duration_secs {
        return Some(TerminationReason::DurationBudget);
    }
    if session.visit_count >= session.max_visits {
        return Some(TerminationReason::VisitBudget);
    }
    None
}
