//! Configuration for the orchestration core: pool sizing, health policy,
//! country weights, session budgets, and batch parameters.

pub mod config;
pub mod paths;

pub use config::{
    BatchConfig, CountryWeight, CURRENT_SCHEMA_VERSION, EngineConfig, EvolutionThresholds,
    IdentityPoolConfig, OrchestratorConfig, ResourcePoolConfig, SessionConfig,
};
pub use paths::state_root;
