//! The built-in workflows: a single `visit`, a `visit-batch` that runs
//! many visits inside one job, and the `campaign` workflow that large
//! launches delegate to.
//!
//! A visit walks the full identity lifecycle: acquire an identity,
//! open an isolated session, record the activity, terminate, feed the
//! outcome back into category evolution, release the identity. The
//! identity is released on every path, success or not.

use std::sync::{Arc, Weak};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use avy_config::config::BatchConfig;
use avy_core::error::AppError;
use avy_core::types::IdentityCategory;
use avy_engine::{workflow_fn, JobContext, JobEngine, WorkflowOptions};
use avy_identity::IdentityPool;
use avy_session::{Activity, IsolationLevel, SessionManager, TerminationReason};

use crate::batch::{BatchOrchestrator, BatchProgress};

pub const VISIT_WORKFLOW: &str = "visit";
pub const VISIT_BATCH_WORKFLOW: &str = "visit-batch";
pub const CAMPAIGN_WORKFLOW: &str = "campaign";

/// Registers the three built-in workflows on the engine. The campaign
/// body holds a weak engine handle so registration does not create a
/// reference cycle through the registry.
pub async fn register_workflows(
    engine: &Arc<JobEngine>,
    identities: Arc<IdentityPool>,
    sessions: Arc<SessionManager>,
    batch_config: BatchConfig,
) -> Result<()> {
    {
        let identities = identities.clone();
        let sessions = sessions.clone();
        engine
            .register(
                VISIT_WORKFLOW,
                workflow_fn(move |ctx: JobContext| {
                    let identities = identities.clone();
                    let sessions = sessions.clone();
                    async move {
                        let (url, category) = parse_visit_payload(&ctx.payload)?;
                        run_visit(&ctx, &identities, &sessions, &url, category).await
                    }
                }),
                WorkflowOptions::default(),
            )
            .await?;
    }

    {
        let identities = identities.clone();
        let sessions = sessions.clone();
        engine
            .register(
                VISIT_BATCH_WORKFLOW,
                workflow_fn(move |ctx: JobContext| {
                    let identities = identities.clone();
                    let sessions = sessions.clone();
                    async move { run_visit_batch(&ctx, &identities, &sessions).await }
                }),
                WorkflowOptions::default(),
            )
            .await?;
    }

    {
        let weak: Weak<JobEngine> = Arc::downgrade(engine);
        engine
            .register(
                CAMPAIGN_WORKFLOW,
                workflow_fn(move |ctx: JobContext| {
                    let weak = weak.clone();
                    let config = batch_config.clone();
                    async move { run_campaign(&ctx, weak, config).await }
                }),
                WorkflowOptions::default(),
            )
            .await?;
    }
    Ok(())
}

fn parse_visit_payload(payload: &Value) -> Result<(String, Option<IdentityCategory>)> {
    let url = payload
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("visit payload requires a 'url' string".into()))?
        .to_string();
    let category = match payload.get("category") {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::from_value(value.clone()).map_err(|_| {
            AppError::Validation(format!("unknown identity category: {value}"))
        })?),
    };
    Ok((url, category))
}

/// One visit unit. Acquires, visits under an isolated session, and
/// always records the outcome and releases before returning.
async fn run_visit(
    ctx: &JobContext,
    identities: &Arc<IdentityPool>,
    sessions: &Arc<SessionManager>,
    url: &str,
    category: Option<IdentityCategory>,
) -> Result<Value> {
    let identity = identities.acquire(category).await?;
    debug!(identity = %identity.label(), url, "visit started");
    let result = visit_in_session(ctx, sessions, &identity.id, url).await;
    let success = result.is_ok();
    if let Err(err) = identities.record_outcome(&identity.id, success).await {
        warn!(identity_id = %identity.id, error = %err, "failed to record visit outcome");
    }
    if let Err(err) = identities.release(&identity.id).await {
        warn!(identity_id = %identity.id, error = %err, "failed to release identity");
    }
    result.map(|session_id| {
        json!({
            "identity": identity.label(),
            "session": session_id,
            "url": url,
        })
    })
}

async fn visit_in_session(
    ctx: &JobContext,
    sessions: &Arc<SessionManager>,
    identity_id: &str,
    url: &str,
) -> Result<String> {
    let session = sessions.open(identity_id, IsolationLevel::Strict).await?;
    let visited = ctx
        .run_step("visit", async {
            sessions
                .record_activity(&session.id, Activity::visit(url))
                .await
        })
        .await;
    if let Err(err) = sessions
        .terminate(&session.id, TerminationReason::Requested)
        .await
    {
        warn!(session_id = %session.id, error = %err, "failed to terminate session");
    }
    visited.map(|_| session.id)
}

/// Runs `count` visits sequentially inside one job. Unit failures are
/// counted, not fatal; cancellation stops between units.
async fn run_visit_batch(
    ctx: &JobContext,
    identities: &Arc<IdentityPool>,
    sessions: &Arc<SessionManager>,
) -> Result<Value> {
    let (url, category) = parse_visit_payload(&ctx.payload)?;
    let count = ctx
        .payload
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            AppError::Validation("visit-batch payload requires a 'count' integer".into())
        })?;
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut last_error = None;
    for _ in 0..count {
        if ctx.is_cancelled() {
            break;
        }
        match run_visit(ctx, identities, sessions, &url, category).await {
            Ok(_) => succeeded += 1,
            Err(err) => {
                failed += 1;
                last_error = Some(format!("{err:#}"));
            }
        }
    }
    Ok(json!({
        "succeeded": succeeded,
        "failed": failed,
        "last_error": last_error,
    }))
}

/// Body of a delegated launch: the same batch loop a small launch runs
/// inline, reporting cumulative progress as custom events.
async fn run_campaign(ctx: &JobContext, weak: Weak<JobEngine>, config: BatchConfig) -> Result<Value> {
    let engine = weak
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("engine shut down"))?;
    let campaign_id = ctx
        .payload
        .get("campaign_id")
        .and_then(Value::as_str)
        .unwrap_or(&ctx.job_id)
        .to_string();
    let url = ctx
        .payload
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("campaign payload requires a 'url' string".into()))?
        .to_string();
    let total = ctx
        .payload
        .get("total")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            AppError::Validation("campaign payload requires a 'total' integer".into())
        })?;
    let batches = BatchOrchestrator::new(engine, config);
    let outcome = batches
        .run_batches(&url, total, |progress: BatchProgress| {
            ctx.emit(
                "batch",
                json!({
                    "campaign_id": campaign_id,
                    "batch": progress.index,
                    "total_batches": progress.total_batches,
                    "succeeded": progress.succeeded,
                    "failed": progress.failed,
                }),
            );
        })
        .await?;
    Ok(serde_json::to_value(outcome)?)
}
