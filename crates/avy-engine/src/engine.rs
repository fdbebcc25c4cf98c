//! The job engine proper: a workflow registry, a FIFO queue drained by a
//! fixed worker pool, linear-backoff retries, cancellation, and a ticker
//! that promotes due scheduled jobs.
//!
//! All mutable state lives behind a single mutex; workers are parked on a
//! [`Notify`] while the queue is empty. Job records are flushed to the
//! store on every status transition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avy_config::config::EngineConfig;
use avy_core::error::AppError;
use avy_core::types::JobStatus;
use avy_store::store::{collections, RecordStore};

use crate::context::{EngineEvent, JobContext};
use crate::job::Job;
use crate::schedule::{Schedule, ScheduledJob};
use crate::workflow::{RegisteredWorkflow, WorkflowBody, WorkflowMetadata, WorkflowOptions};

const EVENT_CAPACITY: usize = 256;

/// Point-in-time counters, mostly for operator reporting and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatistics {
    pub queued: usize,
    pub running: usize,
    pub scheduled: usize,
    pub workflows: usize,
    pub triggered: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<String, RegisteredWorkflow>,
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
    scheduled: Vec<ScheduledJob>,
    running_tokens: HashMap<String, CancellationToken>,
    running_per_workflow: HashMap<String, usize>,
    workers_started: bool,
    triggered: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
}

pub struct JobEngine {
    inner: Mutex<EngineState>,
    notify: Notify,
    events: broadcast::Sender<EngineEvent>,
    store: RecordStore,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl JobEngine {
    /// Opens the engine over a record store, restoring job history and
    /// workflow metadata. Restored workflows have no body and must be
    /// re-registered before they can run; jobs interrupted mid-flight
    /// by the previous shutdown are marked failed.
    pub fn open(store: RecordStore, config: EngineConfig) -> Result<Arc<Self>> {
        let mut state = EngineState::default();
        for meta in store.list::<WorkflowMetadata>(collections::WORKFLOWS)? {
            state
                .workflows
                .insert(meta.name.clone(), RegisteredWorkflow::restored(meta));
        }
        for mut job in store.list::<Job>(collections::JOBS)? {
            if !job.status.is_terminal() {
                job.last_error = Some("interrupted by restart".to_string());
                job.transition(JobStatus::Failed)?;
                store.put(collections::JOBS, &job.id, &job)?;
            }
            state.jobs.insert(job.id.clone(), job);
        }
        info!(
            workflows = state.workflows.len(),
            jobs = state.jobs.len(),
            "job engine opened"
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new(Self {
            inner: Mutex::new(state),
            notify: Notify::new(),
            events,
            store,
            config,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Registers (or replaces) a workflow body under `name`.
    pub async fn register(
        &self,
        name: &str,
        body: WorkflowBody,
        options: WorkflowOptions,
    ) -> Result<()> {
        let metadata = WorkflowMetadata {
            name: name.to_string(),
            options,
            registered_at: Utc::now(),
        };
        self.store.put(collections::WORKFLOWS, name, &metadata)?;
        let mut inner = self.inner.lock().await;
        inner.workflows.insert(
            name.to_string(),
            RegisteredWorkflow {
                metadata,
                body: Some(body),
            },
        );
        debug!(workflow = name, "workflow registered");
        Ok(())
    }

    /// Queues one job for `workflow` and returns its id. Starts the
    /// worker pool on first use.
    pub async fn trigger(
        self: &Arc<Self>,
        workflow: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        self.trigger_with(workflow, payload, WorkflowOptions::default())
            .await
    }

    /// Like [`Self::trigger`] with per-job retry overrides.
    pub async fn trigger_with(
        self: &Arc<Self>,
        workflow: &str,
        payload: serde_json::Value,
        overrides: WorkflowOptions,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let id = self.enqueue_locked(&mut inner, workflow, payload, &overrides)?;
        self.spawn_workers(&mut inner);
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    /// Arms a timer for `workflow`. The expression is a recurrence
    /// keyword or an RFC 3339 timestamp; bad expressions and unknown
    /// workflows are rejected synchronously.
    pub async fn schedule(
        self: &Arc<Self>,
        workflow: &str,
        payload: serde_json::Value,
        expression: &str,
        options: WorkflowOptions,
    ) -> Result<String> {
        let schedule = Schedule::parse(expression)?;
        let mut inner = self.inner.lock().await;
        if !inner
            .workflows
            .get(workflow)
            .is_some_and(|wf| wf.body.is_some())
        {
            return Err(AppError::UnknownWorkflow(workflow.to_string()).into());
        }
        let entry = ScheduledJob::new(workflow, payload, schedule, options);
        let id = entry.id.clone();
        debug!(
            schedule_id = %id,
            workflow,
            fire_at = %entry.fire_at,
            "schedule armed"
        );
        inner.scheduled.push(entry);
        self.spawn_workers(&mut inner);
        Ok(id)
    }

    /// Converts every schedule entry due at `now` into a queued job.
    /// Recurring entries re-arm; one-shot entries are consumed. Returns
    /// the ids of the jobs created. The ticker calls this once per
    /// interval; tests call it directly.
    pub async fn promote_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let mut inner = self.inner.lock().await;
        let pending = std::mem::take(&mut inner.scheduled);
        for mut entry in pending {
            if entry.fire_at > now {
                inner.scheduled.push(entry);
                continue;
            }
            let options = entry.options.clone();
            match self.enqueue_locked(&mut inner, &entry.workflow, entry.payload.clone(), &options)
            {
                Ok(id) => created.push(id),
                Err(err) => {
                    warn!(
                        workflow = %entry.workflow,
                        error = %err,
                        "dropping schedule for unrunnable workflow"
                    );
                    continue;
                }
            }
            if entry.schedule.is_recurring() {
                entry.fire_at = entry.schedule.next_fire(now);
                inner.scheduled.push(entry);
            }
        }
        drop(inner);
        for _ in &created {
            self.notify.notify_one();
        }
        Ok(created)
    }

    /// Cancels a job. Queued and retrying jobs are removed before they
    /// run; running jobs have their token cancelled. Terminal jobs are
    /// left untouched.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Err(AppError::not_found("job", job_id).into());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        job.transition(JobStatus::Cancelled)?;
        let job = job.clone();
        inner.queue.retain(|id| id != job_id);
        if let Some(token) = inner.running_tokens.get(job_id) {
            token.cancel();
        }
        inner.cancelled += 1;
        self.persist(&job);
        drop(inner);
        info!(job_id, "job cancelled");
        let _ = self.events.send(EngineEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    pub async fn statistics(&self) -> JobStatistics {
        let inner = self.inner.lock().await;
        JobStatistics {
            queued: inner.queue.len(),
            running: inner.running_tokens.len(),
            scheduled: inner.scheduled.len(),
            workflows: inner.workflows.len(),
            triggered: inner.triggered,
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
            retried: inner.retried,
        }
    }

    /// Stops the worker pool and the ticker. In-flight bodies observe
    /// their own cancellation tokens and are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn enqueue_locked(
        &self,
        inner: &mut EngineState,
        workflow: &str,
        payload: serde_json::Value,
        overrides: &WorkflowOptions,
    ) -> Result<String> {
        let Some(registered) = inner.workflows.get(workflow) else {
            return Err(AppError::UnknownWorkflow(workflow.to_string()).into());
        };
        if registered.body.is_none() {
            return Err(AppError::UnknownWorkflow(workflow.to_string()).into());
        }
        let defaults = &registered.metadata.options;
        let max_retries = overrides
            .max_retries
            .or(defaults.max_retries)
            .unwrap_or(self.config.max_retries);
        let retry_delay_ms = overrides
            .retry_delay_ms
            .or(defaults.retry_delay_ms)
            .unwrap_or(self.config.retry_delay_ms);
        let job = Job::new(workflow, payload, max_retries, retry_delay_ms);
        let id = job.id.clone();
        self.persist(&job);
        debug!(job_id = %id, workflow, "job queued");
        inner.jobs.insert(id.clone(), job);
        inner.queue.push_back(id.clone());
        inner.triggered += 1;
        Ok(id)
    }

    fn spawn_workers(self: &Arc<Self>, inner: &mut EngineState) {
        if inner.workers_started {
            return;
        }
        inner.workers_started = true;
        info!(workers = self.config.worker_count, "starting worker pool");
        for worker in 0..self.config.worker_count {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.worker_loop(worker).await });
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.ticker_loop().await });
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            match self.claim_next().await {
                Some((job, body, token)) => self.execute(job, body, token).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            debug!(worker, "worker stopping");
                            return;
                        }
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn ticker_loop(self: Arc<Self>) {
        let period = std::time::Duration::from_millis(self.config.ticker_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("ticker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.promote_due(Utc::now()).await {
                        warn!(error = %err, "schedule promotion failed");
                    }
                }
            }
        }
    }

    /// Takes the first runnable queue entry, moving it to running and
    /// minting its cancellation token in the same critical section.
    /// Entries whose workflow is at its concurrency cap are left in
    /// place so later jobs of other workflows still dispatch.
    async fn claim_next(&self) -> Option<(Job, WorkflowBody, CancellationToken)> {
        let mut inner = self.inner.lock().await;
        loop {
            let pos = inner.queue.iter().position(|id| match inner.jobs.get(id) {
                Some(job) if job.status == JobStatus::Queued => {
                    let cap = inner
                        .workflows
                        .get(&job.workflow)
                        .and_then(|wf| wf.metadata.options.concurrency_hint);
                    let running = inner
                        .running_per_workflow
                        .get(&job.workflow)
                        .copied()
                        .unwrap_or(0);
                    cap.is_none_or(|cap| running < cap)
                }
                // Stale entry (cancelled or gone): claim it for removal.
                _ => true,
            })?;
            let id = inner.queue.remove(pos)?;
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            if job.transition(JobStatus::Running).is_err() {
                continue;
            }
            job.attempts += 1;
            job.started_at = Some(Utc::now());
            let job = job.clone();
            let Some(body) = inner
                .workflows
                .get(&job.workflow)
                .and_then(|wf| wf.body.clone())
            else {
                self.fail_locked(&mut inner, &id, "workflow body unavailable");
                continue;
            };
            let token = CancellationToken::new();
            inner.running_tokens.insert(id.clone(), token.clone());
            *inner
                .running_per_workflow
                .entry(job.workflow.clone())
                .or_default() += 1;
            self.persist(&job);
            return Some((job, body, token));
        }
    }

    async fn execute(self: &Arc<Self>, job: Job, body: WorkflowBody, token: CancellationToken) {
        let job_id = job.id.clone();
        let _ = self.events.send(EngineEvent::JobStarted {
            job_id: job_id.clone(),
            workflow: job.workflow.clone(),
            attempt: job.attempts,
        });
        debug!(job_id = %job_id, workflow = %job.workflow, attempt = job.attempts, "job started");
        let ctx = JobContext::new(
            job_id.clone(),
            job.workflow.clone(),
            job.payload.clone(),
            self.events.clone(),
            token.clone(),
        );
        let result = tokio::select! {
            res = (body)(ctx) => res,
            _ = token.cancelled() => Err(anyhow::anyhow!("job cancelled")),
        };
        self.finish(&job_id, result).await;
    }

    async fn finish(self: &Arc<Self>, job_id: &str, result: Result<serde_json::Value>) {
        let mut retry_after = None;
        let mut inner = self.inner.lock().await;
        inner.running_tokens.remove(job_id);
        if let Some(workflow) = inner.jobs.get(job_id).map(|j| j.workflow.clone()) {
            if let Some(count) = inner.running_per_workflow.get_mut(&workflow) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.running_per_workflow.remove(&workflow);
                }
            }
        }
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            // Cancelled while the body was still unwinding. The freed
            // slot may unblock a capped workflow.
            drop(inner);
            self.notify.notify_one();
            return;
        }
        match result {
            Ok(value) => {
                job.result = Some(value);
                if job.transition(JobStatus::Completed).is_ok() {
                    let job = job.clone();
                    inner.completed += 1;
                    self.persist(&job);
                    debug!(job_id, "job completed");
                    let _ = self.events.send(EngineEvent::JobCompleted {
                        job_id: job_id.to_string(),
                    });
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                job.last_error = Some(message.clone());
                if job.attempts < job.max_retries {
                    if job.transition(JobStatus::Retrying).is_err() {
                        return;
                    }
                    let delay = job.retry_delay();
                    let attempt = job.attempts;
                    let job = job.clone();
                    inner.retried += 1;
                    self.persist(&job);
                    warn!(
                        job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "job attempt failed, retrying"
                    );
                    let _ = self.events.send(EngineEvent::JobRetrying {
                        job_id: job_id.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: message,
                    });
                    retry_after = Some(delay);
                } else if job.transition(JobStatus::Failed).is_ok() {
                    let job = job.clone();
                    inner.failed += 1;
                    self.persist(&job);
                    warn!(job_id, error = %message, "job failed permanently");
                    let _ = self.events.send(EngineEvent::JobFailed {
                        job_id: job_id.to_string(),
                        error: message,
                    });
                }
            }
        }
        drop(inner);
        // The freed slot may unblock a capped workflow.
        self.notify.notify_one();
        if let Some(delay) = retry_after {
            self.requeue_after(job_id.to_string(), delay);
        }
    }

    /// Requeues a retrying job after its backoff. Runs on its own task
    /// so workers stay free during the delay.
    fn requeue_after(self: &Arc<Self>, job_id: String, delay: std::time::Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = engine.inner.lock().await;
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                return;
            };
            // Cancellation may have landed during the backoff.
            if job.status != JobStatus::Retrying || job.transition(JobStatus::Queued).is_err() {
                return;
            }
            let job = job.clone();
            engine.persist(&job);
            inner.queue.push_back(job_id);
            drop(inner);
            engine.notify.notify_one();
        });
    }

    fn fail_locked(&self, inner: &mut MutexGuard<'_, EngineState>, job_id: &str, reason: &str) {
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.last_error = Some(reason.to_string());
            if job.transition(JobStatus::Failed).is_ok() {
                let job = job.clone();
                inner.failed += 1;
                self.persist(&job);
                let _ = self.events.send(EngineEvent::JobFailed {
                    job_id: job_id.to_string(),
                    error: reason.to_string(),
                });
            }
        }
    }

    fn persist(&self, job: &Job) {
        if let Err(err) = self.store.put(collections::JOBS, &job.id, job) {
            warn!(job_id = %job.id, error = %err, "failed to flush job record");
        }
    }
}
