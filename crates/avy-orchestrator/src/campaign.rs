//! Campaign tracking over batch launches. A campaign is one launch plus
//! its progress counters; delegated launches are kept current by a
//! listener on the engine event stream and by pulling the delegated
//! job's final result on demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avy_core::error::AppError;
use avy_core::types::{new_id, JobStatus};
use avy_engine::{EngineEvent, JobEngine};
use avy_store::{collections, RecordStore};

use crate::batch::{BatchLaunch, BatchOrchestrator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub url: String,
    pub total: u64,
    pub started_at: DateTime<Utc>,
    /// Engine job owning the loop, for delegated launches only.
    pub job_id: Option<String>,
    pub succeeded: u64,
    pub failed: u64,
    pub finished: bool,
}

/// Point-in-time view of a campaign, with a naive linear completion
/// estimate while it is still running.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub percent: f64,
    pub finished: bool,
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub struct CampaignManager {
    engine: Arc<JobEngine>,
    batches: BatchOrchestrator,
    store: RecordStore,
    // Sync mutex: every critical section is a short map access.
    inner: Mutex<HashMap<String, Campaign>>,
}

impl CampaignManager {
    pub fn open(
        engine: Arc<JobEngine>,
        store: RecordStore,
        config: avy_config::config::BatchConfig,
    ) -> Result<Arc<Self>> {
        let mut campaigns = HashMap::new();
        for campaign in store.list::<Campaign>(collections::CAMPAIGNS)? {
            campaigns.insert(campaign.id.clone(), campaign);
        }
        if !campaigns.is_empty() {
            info!(count = campaigns.len(), "Restored campaigns from store");
        }
        Ok(Arc::new(Self {
            batches: BatchOrchestrator::new(engine.clone(), config),
            engine,
            store,
            inner: Mutex::new(campaigns),
        }))
    }

    /// Launches `total` visit units against `url` and returns the
    /// campaign record. Small launches block until done; large ones
    /// return as soon as the engine owns the loop.
    pub async fn launch(&self, url: &str, total: u64) -> Result<Campaign> {
        let mut campaign = Campaign {
            id: new_id(),
            url: url.to_string(),
            total,
            started_at: Utc::now(),
            job_id: None,
            succeeded: 0,
            failed: 0,
            finished: false,
        };
        self.upsert(campaign.clone())?;
        let launched = {
            let inner = &self.inner;
            let id = campaign.id.clone();
            self.batches
                .launch(&campaign.id, url, total, move |progress| {
                    if let Ok(mut map) = inner.lock() {
                        if let Some(c) = map.get_mut(&id) {
                            c.succeeded = progress.succeeded;
                            c.failed = progress.failed;
                        }
                    }
                })
                .await
        };
        match launched {
            Ok(BatchLaunch::Delegated { job_id }) => {
                campaign.job_id = Some(job_id);
            }
            Ok(BatchLaunch::Completed(outcome)) => {
                campaign.succeeded = outcome.succeeded;
                campaign.failed = outcome.failed;
                campaign.finished = true;
            }
            Err(err) => {
                // The launch never got going; drop the record again.
                self.inner
                    .lock()
                    .map(|mut map| map.remove(&campaign.id))
                    .ok();
                let _ = self.store.remove(collections::CAMPAIGNS, &campaign.id);
                return Err(err);
            }
        }
        self.upsert(campaign.clone())?;
        info!(
            campaign_id = %campaign.id,
            total,
            delegated = campaign.job_id.is_some(),
            "campaign launched"
        );
        Ok(campaign)
    }

    /// Progress snapshot. For a running delegated campaign this also
    /// pulls the delegated job in case it settled since the last look.
    pub async fn progress(&self, campaign_id: &str) -> Result<CampaignProgress> {
        let campaign = self
            .get(campaign_id)
            .ok_or_else(|| AppError::not_found("campaign", campaign_id))?;
        let campaign = if !campaign.finished && campaign.job_id.is_some() {
            self.refresh_delegated(campaign).await?
        } else {
            campaign
        };
        let processed = campaign.succeeded + campaign.failed;
        let percent = if campaign.total == 0 {
            100.0
        } else {
            (processed as f64 / campaign.total as f64 * 100.0).min(100.0)
        };
        let estimated_completion = if campaign.finished || processed == 0 {
            None
        } else {
            let elapsed_ms = (Utc::now() - campaign.started_at).num_milliseconds().max(1);
            let projected_ms =
                (elapsed_ms as f64 * campaign.total as f64 / processed as f64) as i64;
            Some(campaign.started_at + ChronoDuration::milliseconds(projected_ms))
        };
        Ok(CampaignProgress {
            campaign_id: campaign.id.clone(),
            total: campaign.total,
            processed,
            succeeded: campaign.succeeded,
            failed: campaign.failed,
            percent,
            finished: campaign.finished,
            estimated_completion,
        })
    }

    pub fn get(&self, campaign_id: &str) -> Option<Campaign> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(campaign_id).cloned())
    }

    pub fn list(&self) -> Vec<Campaign> {
        self.inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Folds `batch` progress events from delegated campaign jobs back
    /// into the campaign records. Runs until cancelled.
    pub fn start_progress_listener(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let stop = token.clone();
        let mut events = self.engine.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("campaign progress listener stopping");
                        return;
                    }
                    event = events.recv() => match event {
                        Ok(EngineEvent::Custom { name, data, .. }) if name == "batch" => {
                            manager.apply_batch_event(&data);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "campaign progress listener lagged");
                        }
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        });
        token
    }

    fn apply_batch_event(&self, data: &serde_json::Value) {
        let Some(campaign_id) = data["campaign_id"].as_str() else {
            return;
        };
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        if let Some(campaign) = map.get_mut(campaign_id) {
            // Progress events carry cumulative counts.
            campaign.succeeded = data["succeeded"].as_u64().unwrap_or(campaign.succeeded);
            campaign.failed = data["failed"].as_u64().unwrap_or(campaign.failed);
        }
    }

    async fn refresh_delegated(&self, mut campaign: Campaign) -> Result<Campaign> {
        let Some(job_id) = campaign.job_id.clone() else {
            return Ok(campaign);
        };
        let Some(job) = self.engine.get_job(&job_id).await else {
            return Ok(campaign);
        };
        if !job.status.is_terminal() {
            return Ok(campaign);
        }
        campaign.finished = true;
        match job.status {
            JobStatus::Completed => {
                if let Some(result) = &job.result {
                    campaign.succeeded = result["succeeded"].as_u64().unwrap_or(campaign.succeeded);
                    campaign.failed = result["failed"].as_u64().unwrap_or(campaign.failed);
                }
            }
            _ => {
                // Failed or cancelled mid-loop: whatever was not
                // processed never will be.
                let processed = campaign.succeeded + campaign.failed;
                campaign.failed += campaign.total.saturating_sub(processed);
            }
        }
        self.upsert(campaign.clone())?;
        Ok(campaign)
    }

    fn upsert(&self, campaign: Campaign) -> Result<()> {
        self.store
            .put(collections::CAMPAIGNS, &campaign.id, &campaign)?;
        if let Ok(mut map) = self.inner.lock() {
            map.insert(campaign.id.clone(), campaign);
        }
        Ok(())
    }
}
