#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Unknown workflow '{0}': not registered or registered without a live body")]
    UnknownWorkflow(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No free healthy resource available for country '{0}'")]
    NoResourceAvailable(String),

    #[error("Identity pool exhausted{}", category.as_ref().map(|c| format!(" for category '{c}'")).unwrap_or_default())]
    PoolExhausted {
        /// Requested category, if the caller asked for one.
        category: Option<String>,
    },

    #[error("Identity '{0}' already has an active session")]
    AlreadyActive(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Job '{job_id}' did not reach a terminal status within {timeout_secs}s")]
    JobTimeout { job_id: String, timeout_secs: u64 },

    #[error("Contamination detected in session '{session_id}': {signal}")]
    ContaminationDetected { session_id: String, signal: String },
}

impl AppError {
    /// Shorthand for `NotFound` so call sites stay one line.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
