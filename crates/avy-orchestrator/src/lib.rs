//! Composition root: wires the record store, pools, session manager and
//! job engine together, registers the built-in workflows, and starts the
//! background workers (health sweep, session sweep, rotation worker,
//! campaign progress listener).

pub mod batch;
pub mod campaign;
pub mod visit;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use avy_config::config::OrchestratorConfig;
use avy_config::paths::state_root;
use avy_engine::JobEngine;
use avy_identity::IdentityPool;
use avy_resource::{FallbackGeoLookup, GeoLookup, HttpGeoLookup, ResourcePool};
use avy_session::SessionManager;
use avy_store::RecordStore;

pub use batch::{BatchLaunch, BatchOrchestrator, BatchOutcome, BatchProgress};
pub use campaign::{Campaign, CampaignManager, CampaignProgress};
pub use visit::{register_workflows, CAMPAIGN_WORKFLOW, VISIT_BATCH_WORKFLOW, VISIT_WORKFLOW};

pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub store: RecordStore,
    pub engine: Arc<JobEngine>,
    pub resources: Arc<ResourcePool>,
    pub identities: Arc<IdentityPool>,
    pub sessions: Arc<SessionManager>,
    pub campaigns: Arc<CampaignManager>,
    workers: Vec<CancellationToken>,
}

impl Orchestrator {
    /// Opens all services under the default state directory.
    pub async fn open(config: OrchestratorConfig) -> Result<Self> {
        let root = state_root()
            .ok_or_else(|| anyhow::anyhow!("could not resolve a state directory"))?;
        Self::open_in(root, config).await
    }

    /// Same, rooted at an explicit directory (tests use a tempdir).
    pub async fn open_in(root: impl Into<PathBuf>, config: OrchestratorConfig) -> Result<Self> {
        let store = RecordStore::open(root)?;
        let geo: Arc<dyn GeoLookup> = match &config.resources.geo_endpoint {
            Some(endpoint) => Arc::new(HttpGeoLookup::new(
                endpoint.clone(),
                std::time::Duration::from_secs(config.resources.probe_timeout_secs),
            )?),
            None => Arc::new(FallbackGeoLookup),
        };
        let (resources, rotation_rx) =
            ResourcePool::open(store.clone(), config.resources.clone(), geo)?;
        let identities =
            IdentityPool::open(store.clone(), config.identities.clone(), resources.clone())?;
        let sessions = SessionManager::new(store.clone(), config.sessions.clone());
        let engine = JobEngine::open(store.clone(), config.engine.clone())?;
        register_workflows(
            &engine,
            identities.clone(),
            sessions.clone(),
            config.batch.clone(),
        )
        .await?;
        let campaigns = CampaignManager::open(engine.clone(), store.clone(), config.batch.clone())?;

        let workers = vec![
            resources.start_sweep(),
            sessions.start_sweep(),
            identities.start_rotation_worker(rotation_rx),
            campaigns.start_progress_listener(),
        ];
        info!("orchestrator ready");
        Ok(Self {
            config,
            store,
            engine,
            resources,
            identities,
            sessions,
            campaigns,
            workers,
        })
    }

    /// Stops the engine and every background worker. In-flight jobs are
    /// not interrupted.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        for worker in &self.workers {
            worker.cancel();
        }
        info!("orchestrator shut down");
    }
}
