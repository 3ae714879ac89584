//! Testbox Core - Ephemeral Isolated Test Sandboxes
//!
//! Provisions sandboxes (plain directory, Python virtualenv or container)
//! for test workloads and installs packages into them concurrently, with
//! dependency resolution and conflict detection up front.
//!
//! # Layout:
//! - [`engine`]: lifecycle state machine, environments, isolation engines,
//!   the engine registry and the [`IsolationManager`]
//! - [`installer`]: resolver, conflict detector, package cache and the
//!   [`ParallelInstaller`] worker pool
//! - [`executor`]: the backend driver contract and process helpers

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod installer;
pub mod metrics;
pub(crate) mod util;

pub use config::{CacheConfig, Config, InstallerConfig, ManagerConfig};
pub use engine::{
    EngineKind, EngineRegistry, EnvironmentConfig, EnvironmentStatus, IsolatedEnvironment,
    IsolationEngine, IsolationManager, IsolationRequirements,
};
pub use error::{Error, ErrorKind, Result};
pub use executor::{EnvironmentDriver, ExecutionOutput, PackageSpec};
pub use installer::{
    ConflictDetector, DependencyResolver, InstallRequest, PackageCache, ParallelInstaller,
    StaticIndex, TaskPriority,
};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber.  The filter comes from `TESTBOX_LOG`
/// (default `info`).  Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_env("TESTBOX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        info!("Initializing testbox v{}", env!("CARGO_PKG_VERSION"));
    }
}
