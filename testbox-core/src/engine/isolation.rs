//! Isolation Engines
//!
//! An isolation engine creates, tracks and destroys one kind of sandbox.  The
//! set of kinds is closed ([`EngineKind`]); what varies between them is the
//! [`EnvironmentDriver`] they hand to each environment.  [`DriverEngine`] is
//! the shared implementation: an exclusive `env_id → environment` map plus a
//! driver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::engine::environment::{EnvironmentConfig, IsolatedEnvironment};
use crate::error::{Error, Result};
use crate::executor::EnvironmentDriver;
use crate::util::{read, write};

/// The closed set of isolation backends, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Plain directory on the host.
    Basic,
    /// Python virtual environment.
    Virtualenv,
    /// Container driven through a container CLI.
    Container,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [Self::Basic, Self::Virtualenv, Self::Container];

    /// Canonical registry name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Virtualenv => "virtualenv",
            Self::Container => "container",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(Self::Basic),
            "virtualenv" | "venv" => Some(Self::Virtualenv),
            "container" | "docker" => Some(Self::Container),
            _ => None,
        }
    }

    /// Capabilities every engine of this kind provides.
    pub fn capabilities(self) -> BTreeSet<Capability> {
        use Capability::*;
        let mut caps = BTreeSet::from([
            Lifecycle,
            Execute,
            PackageManagement,
            PortAllocation,
            Snapshots,
        ]);
        match self {
            Self::Basic => {}
            Self::Virtualenv => {
                caps.insert(InterpreterIsolation);
            }
            Self::Container => {
                caps.extend([
                    InterpreterIsolation,
                    NetworkIsolation,
                    ResourceLimits,
                    CustomImage,
                ]);
            }
        }
        caps
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Something an engine can do for its environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Lifecycle,
    Execute,
    PackageManagement,
    PortAllocation,
    Snapshots,
    InterpreterIsolation,
    NetworkIsolation,
    ResourceLimits,
    CustomImage,
}

/// Capabilities every registered engine must declare.
pub const REQUIRED_CAPABILITIES: [Capability; 2] = [Capability::Lifecycle, Capability::Execute];

/// Result of an engine health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub engine: String,
    pub healthy: bool,
    pub message: String,
    pub environments: usize,
}

/// The engine contract the registry and manager work against.
#[async_trait]
pub trait IsolationEngine: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    fn capabilities(&self) -> &BTreeSet<Capability>;

    /// Effective configuration (schema defaults merged with overrides).
    fn config(&self) -> &Map<String, Value>;

    /// Create a new environment.  Fails if `env_id` already exists here.
    async fn create_isolation(
        &self,
        env_id: &str,
        config: EnvironmentConfig,
    ) -> Result<Arc<IsolatedEnvironment>>;

    fn get_environment(&self, env_id: &str) -> Option<Arc<IsolatedEnvironment>>;

    fn list_environments(&self) -> Vec<Arc<IsolatedEnvironment>>;

    /// Clean up and forget an environment.
    async fn cleanup_isolation(&self, env_id: &str, force: bool) -> Result<()>;

    /// Check the backend.  Never fails; problems are reported in the result.
    async fn health_check(&self) -> EngineHealth;

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Readiness test used by [`DriverEngine::health_check`].
pub type ReadinessCheck = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

/// Engine backed by one shared driver.
pub struct DriverEngine {
    name: String,
    kind: EngineKind,
    capabilities: BTreeSet<Capability>,
    config: Map<String, Value>,
    base_dir: PathBuf,
    driver: Arc<dyn EnvironmentDriver>,
    readiness_check: Option<ReadinessCheck>,
    environments: RwLock<HashMap<String, Arc<IsolatedEnvironment>>>,
}

impl DriverEngine {
    pub fn new(
        name: impl Into<String>,
        kind: EngineKind,
        config: Map<String, Value>,
        base_dir: impl Into<PathBuf>,
        driver: Arc<dyn EnvironmentDriver>,
    ) -> Self {
        let name = name.into();
        let base_dir = base_dir.into();
        info!(engine = %name, kind = %kind, base_dir = ?base_dir, "Creating isolation engine");
        Self {
            name,
            kind,
            capabilities: kind.capabilities(),
            config,
            base_dir,
            driver,
            readiness_check: None,
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a synchronous readiness test (e.g. "is the container CLI on PATH").
    pub fn with_readiness_check(mut self, check: ReadinessCheck) -> Self {
        self.readiness_check = Some(check);
        self
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    fn ensure_unique(&self, env_id: &str) -> Result<()> {
        if read(&self.environments).contains_key(env_id) {
            return Err(Error::state_conflict(
                format!("create environment '{env_id}' on engine '{}'", self.name),
                "an environment with that id exists",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IsolationEngine for DriverEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn create_isolation(
        &self,
        env_id: &str,
        config: EnvironmentConfig,
    ) -> Result<Arc<IsolatedEnvironment>> {
        if env_id.trim().is_empty() || env_id.contains(['/', '\\']) || env_id.contains("..") {
            return Err(Error::InvalidInput(format!("invalid environment id '{env_id}'")));
        }
        self.ensure_unique(env_id)?;

        let path = self.base_dir.join(env_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::external(format!("create directory {:?}", path), e))?;

        let env = Arc::new(IsolatedEnvironment::new(
            env_id,
            path,
            self.name.clone(),
            config,
            self.driver.clone(),
        ));

        {
            let mut envs = write(&self.environments);
            if envs.contains_key(env_id) {
                return Err(Error::state_conflict(
                    format!("create environment '{env_id}' on engine '{}'", self.name),
                    "an environment with that id exists",
                ));
            }
            envs.insert(env_id.to_string(), env.clone());
        }

        info!(engine = %self.name, env_id, "Environment created");
        Ok(env)
    }

    fn get_environment(&self, env_id: &str) -> Option<Arc<IsolatedEnvironment>> {
        read(&self.environments).get(env_id).cloned()
    }

    fn list_environments(&self) -> Vec<Arc<IsolatedEnvironment>> {
        let mut envs: Vec<_> = read(&self.environments).values().cloned().collect();
        envs.sort_by(|a, b| a.id().cmp(b.id()));
        envs
    }

    async fn cleanup_isolation(&self, env_id: &str, force: bool) -> Result<()> {
        let env = self
            .get_environment(env_id)
            .ok_or_else(|| Error::not_found("environment", env_id))?;

        let result = env.cleanup(force).await;
        // The manager forgets the id either way; the engine must agree so the
        // id can be reused.  Only the exact instance we cleaned is dropped, a
        // migration may have re-registered the id in the meantime.
        {
            let mut envs = write(&self.environments);
            if envs.get(env_id).is_some_and(|e| Arc::ptr_eq(e, &env)) {
                envs.remove(env_id);
            }
        }
        match &result {
            Ok(()) => debug!(engine = %self.name, env_id, "Environment forgotten"),
            Err(e) => warn!(engine = %self.name, env_id, error = %e, "Cleanup failed; environment forgotten"),
        }
        result
    }

    async fn health_check(&self) -> EngineHealth {
        let environments = read(&self.environments).len();
        let (healthy, message) = match &self.readiness_check {
            None => (true, "ok".to_string()),
            Some(check) => match check() {
                Ok(()) => (true, "ok".to_string()),
                Err(msg) => (false, msg),
            },
        };
        if !healthy {
            warn!(engine = %self.name, message = %message, "Engine health check failed");
        }
        EngineHealth {
            engine: self.name.clone(),
            healthy,
            message,
            environments,
        }
    }
}
