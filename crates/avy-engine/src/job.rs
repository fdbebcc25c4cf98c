//! Durable job records and the status transition guard.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use avy_core::types::{new_id, JobStatus};

/// One unit of work flowing through the engine. Flushed to the record
/// store on every status transition so a restart can report history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workflow: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Executions started so far, including the one in flight.
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        workflow: &str,
        payload: serde_json::Value,
        max_retries: u32,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            id: new_id(),
            workflow: workflow.to_string(),
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_retries,
            retry_delay_ms,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves the job to `next`. Terminal states are final: any attempt
    /// to leave completed, failed or cancelled is rejected.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "job {} is already {} and cannot become {}",
                self.id,
                self.status,
                next
            );
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Backoff before the next execution: linear in the attempt count.
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms * u64::from(self.attempts.max(1)))
    }
}
