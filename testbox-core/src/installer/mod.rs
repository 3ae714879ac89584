//! Installer module - concurrent, conflict-aware package installation
//!
//! Leaves first: version and specifier handling, the package-index
//! contract, the dependency resolver and conflict detector that read it, the
//! artifact cache, and the worker pool that drives installs into
//! environments.

pub mod cache;
pub mod conflict;
pub mod index;
pub mod monitor;
pub mod package_manager;
pub mod parallel;
pub mod queue;
pub mod resolver;
pub mod task;
pub mod version;

pub use cache::{CacheEntry, CacheStats, PackageCache};
pub use conflict::{
    ConflictDetector, ConflictKind, ConflictRecord, IncompatibilityRule, Severity, Suggestion,
};
pub use index::{PackageIndex, PackageMetadata, StaticIndex};
pub use monitor::{
    Admission, FixedSampler, HostSampler, ResourceLimits, ResourceMonitor, ResourceSample,
    SystemSampler,
};
pub use parallel::{InstallerBuilder, InstallerStats, ParallelInstaller};
pub use resolver::{DependencyEdge, DependencyNode, DependencyResolver, DependencyTree};
pub use task::{
    InstallRequest, InstallationResult, PackageOutcome, TaskFindings, TaskPriority, TaskStatus,
};
pub use version::{Requirement, Version, VersionSpec};
