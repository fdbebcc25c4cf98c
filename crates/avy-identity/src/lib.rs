//! Identity Pool Manager: binds each identity to exactly one egress
//! resource, applies weighted geographic distribution on creation, and
//! evolves identities between behavioral categories.

pub mod distribution;
pub mod identity;
pub mod pool;

pub use distribution::{country_distribution, draw_country};
pub use identity::{Identity, IdentityMetrics, RotationRecord};
pub use pool::{CategoryCounts, IdentityPool};
