//! Engine module - sandbox lifecycle and isolation backends
//!
//! Leaves first: the lifecycle state machine, the environment instance, the
//! engine contract with its built-in backends, the registry that owns engine
//! singletons, and the manager that sits on top.

pub mod backends;
pub mod environment;
pub mod isolation;
pub mod manager;
pub mod registry;
pub mod state;

pub use environment::{
    EnvironmentConfig, EnvironmentEvent, IsolatedEnvironment, ResourceUsage, SnapshotInfo,
};
pub use isolation::{Capability, DriverEngine, EngineHealth, EngineKind, IsolationEngine};
pub use manager::{
    BulkCleanupReport, EnvironmentSummary, HealthReport, IsolationManager, IsolationRequirements,
    ManagerStatus, MigrationOptions, MigrationReport, SecurityTier,
};
pub use registry::{EngineFactory, EngineInfo, EngineRegistry};
pub use state::EnvironmentStatus;
