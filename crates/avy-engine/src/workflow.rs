//! Workflow registry entries. A workflow pairs a name with an async body
//! and default retry settings. Bodies are process-local closures and are
//! never persisted; only the metadata survives a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::JobContext;

/// Async workflow body. Receives the job context and yields the job result.
pub type WorkflowBody =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Wrap an async fn or closure into a [`WorkflowBody`].
pub fn workflow_fn<F, Fut>(f: F) -> WorkflowBody
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-workflow overrides for the engine-wide retry defaults, plus an
/// optional cap on how many jobs of the workflow run at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// Upper bound on concurrently running jobs of this workflow. `None`
    /// leaves the worker pool as the only limit.
    pub concurrency_hint: Option<usize>,
}

/// The persisted part of a registration. Restored on startup so the
/// engine knows which workflows existed, but a restored entry has no
/// body and cannot run until re-registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default)]
    pub options: WorkflowOptions,
    pub registered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub(crate) struct RegisteredWorkflow {
    pub metadata: WorkflowMetadata,
    pub body: Option<WorkflowBody>,
}

impl RegisteredWorkflow {
    pub fn restored(metadata: WorkflowMetadata) -> Self {
        Self {
            metadata,
            body: None,
        }
    }
}
