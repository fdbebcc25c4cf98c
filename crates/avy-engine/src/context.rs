//! Execution context handed to workflow bodies, plus the engine event
//! stream. Events go over a broadcast channel; a lagging or absent
//! subscriber never blocks execution.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Events published while jobs execute. Subscribe via
/// [`crate::JobEngine::subscribe`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    JobStarted {
        job_id: String,
        workflow: String,
        attempt: u32,
    },
    JobCompleted {
        job_id: String,
    },
    JobRetrying {
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
    StepStarted {
        job_id: String,
        step: String,
    },
    StepCompleted {
        job_id: String,
        step: String,
    },
    StepFailed {
        job_id: String,
        step: String,
        error: String,
    },
    Custom {
        job_id: String,
        name: String,
        data: serde_json::Value,
    },
}

/// Handed to a workflow body for the duration of one execution.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub workflow: String,
    pub payload: serde_json::Value,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        workflow: String,
        payload: serde_json::Value,
        events: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            workflow,
            payload,
            events,
            cancel,
        }
    }

    /// True once the job has been cancelled. Long-running bodies should
    /// check this between steps, or await [`Self::cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Runs one named step, bracketing it with start/complete/fail events.
    pub async fn run_step<T, Fut>(&self, step: &str, fut: Fut) -> anyhow::Result<T>
    where
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.send(EngineEvent::StepStarted {
            job_id: self.job_id.clone(),
            step: step.to_string(),
        });
        match fut.await {
            Ok(value) => {
                self.send(EngineEvent::StepCompleted {
                    job_id: self.job_id.clone(),
                    step: step.to_string(),
                });
                Ok(value)
            }
            Err(err) => {
                self.send(EngineEvent::StepFailed {
                    job_id: self.job_id.clone(),
                    step: step.to_string(),
                    error: format!("{err:#}"),
                });
                Err(err)
            }
        }
    }

    /// Fire-and-forget custom event from inside a body.
    pub fn emit(&self, name: &str, data: serde_json::Value) {
        self.send(EngineEvent::Custom {
            job_id: self.job_id.clone(),
            name: name.to_string(),
            data,
        });
    }

    fn send(&self, event: EngineEvent) {
        // A closed channel just means nobody is listening.
        let _ = self.events.send(event);
    }
}
