//! Batch launching. Small launches run the batch loop inline and block
//! until every batch settles; launches whose batch count exceeds the
//! configured threshold become a single delegated engine job so the
//! caller gets a job id back immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use avy_config::config::BatchConfig;
use avy_core::error::AppError;
use avy_core::types::JobStatus;
use avy_engine::{Job, JobEngine};

use crate::visit::{CAMPAIGN_WORKFLOW, VISIT_BATCH_WORKFLOW};

/// Result of a fully-run batch loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batches: usize,
    pub succeeded: u64,
    pub failed: u64,
    /// Set when a batch job was cancelled and the loop stopped early.
    pub stopped_early: bool,
}

/// What a launch turned into.
#[derive(Debug, Clone)]
pub enum BatchLaunch {
    /// Large launch: one engine job now owns the whole loop.
    Delegated { job_id: String },
    /// Small launch, run to completion inline.
    Completed(BatchOutcome),
}

/// Cumulative progress after each settled batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub index: usize,
    pub total_batches: usize,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct BatchOrchestrator {
    engine: Arc<JobEngine>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(engine: Arc<JobEngine>, config: BatchConfig) -> Self {
        Self { engine, config }
    }

    /// Splits `total` visit units for `url` into batches and either runs
    /// them inline or delegates to the engine.
    pub async fn launch(
        &self,
        campaign_id: &str,
        url: &str,
        total: u64,
        on_batch: impl FnMut(BatchProgress),
    ) -> Result<BatchLaunch> {
        if total == 0 {
            return Err(AppError::Validation("batch launch needs at least one unit".into()).into());
        }
        let batch_size = u64::from(self.config.batch_size.max(1));
        let batches = total.div_ceil(batch_size);
        if batches > u64::from(self.config.large_threshold) {
            let job_id = self
                .engine
                .trigger(
                    CAMPAIGN_WORKFLOW,
                    json!({ "campaign_id": campaign_id, "url": url, "total": total }),
                )
                .await?;
            info!(campaign_id, total, batches, job_id = %job_id, "launch delegated to engine");
            return Ok(BatchLaunch::Delegated { job_id });
        }
        let outcome = self.run_batches(url, total, on_batch).await?;
        Ok(BatchLaunch::Completed(outcome))
    }

    /// The batch loop: trigger one `visit-batch` job per slice, wait for
    /// it to settle, pause, repeat. A timed-out or failed batch counts
    /// its units as failed and the loop moves on; a cancelled batch job
    /// stops the whole launch.
    pub async fn run_batches(
        &self,
        url: &str,
        total: u64,
        mut on_batch: impl FnMut(BatchProgress),
    ) -> Result<BatchOutcome> {
        let batch_size = u64::from(self.config.batch_size.max(1));
        let total_batches = total.div_ceil(batch_size) as usize;
        let mut outcome = BatchOutcome::default();
        let mut remaining = total;
        let mut index = 0usize;
        while remaining > 0 {
            index += 1;
            let size = remaining.min(batch_size);
            let job_id = self
                .engine
                .trigger(VISIT_BATCH_WORKFLOW, json!({ "url": url, "count": size }))
                .await?;
            match self.await_batch(&job_id).await {
                Ok(job) => match job.status {
                    JobStatus::Completed => {
                        let result = job.result.unwrap_or(Value::Null);
                        outcome.succeeded += result["succeeded"].as_u64().unwrap_or(0);
                        outcome.failed += result["failed"].as_u64().unwrap_or(0);
                    }
                    JobStatus::Cancelled => {
                        warn!(job_id = %job_id, batch = index, "batch cancelled, stopping launch");
                        outcome.batches += 1;
                        outcome.stopped_early = true;
                        break;
                    }
                    _ => {
                        warn!(
                            job_id = %job_id,
                            batch = index,
                            error = job.last_error.as_deref().unwrap_or("unknown"),
                            "batch failed"
                        );
                        outcome.failed += size;
                    }
                },
                Err(err) => {
                    // The batch ran out its wait budget. Cancel it and
                    // write the whole slice off, but keep going.
                    warn!(job_id = %job_id, batch = index, error = %err, "batch timed out");
                    if let Err(err) = self.engine.cancel_job(&job_id).await {
                        warn!(job_id = %job_id, error = %err, "failed to cancel timed-out batch");
                    }
                    outcome.failed += size;
                }
            }
            outcome.batches += 1;
            remaining -= size;
            on_batch(BatchProgress {
                index,
                total_batches,
                succeeded: outcome.succeeded,
                failed: outcome.failed,
            });
            if remaining > 0 && self.config.inter_batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.inter_batch_delay_ms)).await;
            }
        }
        info!(
            batches = outcome.batches,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "batch loop finished"
        );
        Ok(outcome)
    }

    /// Polls one batch job until it settles or the per-batch wait budget
    /// runs out.
    async fn await_batch(&self, job_id: &str) -> Result<Job> {
        let deadline = Instant::now() + Duration::from_secs(self.config.batch_timeout_secs.max(1));
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if let Some(job) = self.engine.get_job(job_id).await {
                if job.status.is_terminal() {
                    return Ok(job);
                }
            }
            if Instant::now() >= deadline {
                return Err(AppError::JobTimeout {
                    job_id: job_id.to_string(),
                    timeout_secs: self.config.batch_timeout_secs.max(1),
                }
                .into());
            }
            tokio::time::sleep(poll).await;
        }
    }
}
