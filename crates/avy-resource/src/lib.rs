//! Resource Pool Manager: owns the finite set of egress endpoints,
//! probes their health on a periodic sweep, and serializes every
//! bind/unbind so no two identities ever share a live resource.

pub mod geo;
pub mod health;
pub mod pool;
pub mod resource;
pub mod supplier;

pub use geo::{FallbackGeoLookup, GeoLookup, GeoProfile, HttpGeoLookup};
pub use health::{ProbeOutcome, probe_resource};
pub use pool::{ResourcePool, RotationRequest};
pub use resource::{Assignment, Resource, ResourceSpec};
pub use supplier::parse_supplier_list;
