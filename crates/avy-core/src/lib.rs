//! Shared vocabulary for the aviary orchestration core: typed ids,
//! status enums, and the error taxonomy used across all pool managers.

pub mod error;
pub mod types;

pub use error::AppError;
pub use types::{
    IdentityCategory, JobStatus, ProxyProtocol, ResourceStatus, new_id, validate_id,
};
