//! Job scheduling engine: workflow registry, durable job records, a
//! worker pool draining a FIFO queue, and time-based scheduling.

pub mod context;
pub mod engine;
pub mod job;
pub mod schedule;
pub mod workflow;

pub use context::{EngineEvent, JobContext};
pub use engine::{JobEngine, JobStatistics};
pub use job::Job;
pub use schedule::{Schedule, ScheduledJob};
pub use workflow::{workflow_fn, WorkflowBody, WorkflowMetadata, WorkflowOptions};
