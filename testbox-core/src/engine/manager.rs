//! Isolation Manager
//!
//! The fleet-level entry point: turns an isolation level plus an
//! [`EnvironmentConfig`] into a live environment, caps how many exist at
//! once, and owns the bookkeeping for cleanup, migration and snapshots.
//!
//! The manager's map is authoritative.  An environment removed from it is
//! unreachable through the manager even if its backend resource lingers, so
//! one stuck engine cannot block teardown of the rest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::environment::{EnvironmentConfig, IsolatedEnvironment, SnapshotInfo};
use crate::engine::isolation::{EngineHealth, EngineKind, IsolationEngine};
use crate::engine::registry::EngineRegistry;
use crate::engine::state::EnvironmentStatus;
use crate::error::{Error, Result};
use crate::executor::PackageSpec;
use crate::metrics::{ManagerMetrics, ManagerMetricsSnapshot};
use crate::util::{copy_dir, lock};

/// Coarse security requirement used by auto-selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityTier {
    #[default]
    Low,
    Medium,
    High,
}

/// Declared needs of a workload, input to [`IsolationManager::auto_select_isolation_level`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationRequirements {
    pub container_required: bool,
    pub network_isolation: bool,
    pub custom_image: Option<String>,
    pub resource_limits: bool,
    pub python_version: Option<String>,
    pub package_isolation: bool,
    pub security_tier: SecurityTier,
    /// Needs this manager does not recognise
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub id: String,
    pub engine: String,
    pub status: EnvironmentStatus,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkCleanupReport {
    pub cleaned: Vec<String>,
    /// `(env_id, error message)`
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Reinstall the source's installed packages on the target
    pub carry_packages: bool,
    /// Paths relative to the environment directory to copy across
    pub data_files: Vec<PathBuf>,
    /// Per-call timeout for package listing and reinstalls
    pub timeout: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            carry_packages: true,
            data_files: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    pub env_id: String,
    pub source_engine: String,
    pub target_engine: String,
    /// `name==version` of every package reinstalled on the target
    pub packages_carried: Vec<String>,
    pub packages_failed: Vec<String>,
    pub data_files_copied: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub engines: Vec<EngineHealth>,
    pub environments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub counters: ManagerMetricsSnapshot,
    pub active_environments: usize,
    /// Environment count per lifecycle status name
    pub by_status: BTreeMap<String, usize>,
}

pub struct IsolationManager {
    registry: Arc<EngineRegistry>,
    max_environments: usize,
    base_dir: PathBuf,
    default_level: String,
    engine_overrides: HashMap<String, Map<String, Value>>,
    environments: RwLock<HashMap<String, Arc<IsolatedEnvironment>>>,
    /// snapshot_id → env_id
    snapshot_index: Mutex<HashMap<String, String>>,
    metrics: ManagerMetrics,
}

impl IsolationManager {
    pub fn new(registry: Arc<EngineRegistry>, config: &Config) -> Self {
        info!(
            max_environments = config.manager.max_concurrent_environments,
            base_dir = ?config.manager.base_dir,
            "Creating isolation manager"
        );
        let manager = Self {
            registry,
            max_environments: config.manager.max_concurrent_environments,
            base_dir: config.manager.base_dir.clone(),
            default_level: config.manager.default_level.clone(),
            engine_overrides: config.engines.clone(),
            environments: RwLock::new(HashMap::new()),
            snapshot_index: Mutex::new(HashMap::new()),
            metrics: ManagerMetrics::default(),
        };
        for name in manager.registry.list_engines() {
            manager.registry.configure(&name, manager.overrides_for(&name));
        }
        manager
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Engine config the manager layers over schema defaults: a per-engine
    /// directory under `base_dir`, then the `engines.<name>` config section.
    fn overrides_for(&self, name: &str) -> Map<String, Value> {
        let mut overrides = Map::new();
        overrides.insert(
            "base_dir".into(),
            Value::from(self.base_dir.join(name).display().to_string()),
        );
        if let Some(section) = self.engine_overrides.get(name) {
            overrides.extend(section.clone());
        }
        overrides
    }

    /// Map a level (registry name or kind alias) to a registered engine name.
    fn resolve_level(&self, level: &str) -> Result<String> {
        if self.registry.is_registered(level) {
            return Ok(level.to_string());
        }
        if let Some(kind) = EngineKind::from_name(level) {
            if let Some((name, _, _)) = self
                .registry
                .registered_kinds()
                .into_iter()
                .filter(|(_, k, _)| *k == kind)
                .min_by_key(|(name, _, priority)| (*priority, name.clone()))
            {
                return Ok(name);
            }
        }
        Err(Error::not_found("engine", level))
    }

    fn engine_for(&self, level: &str) -> Result<Arc<dyn IsolationEngine>> {
        let name = self.resolve_level(level)?;
        if let Some(engine) = self.registry.get(&name) {
            return Ok(engine);
        }
        if let Some(info) = self.registry.engine_info(&name) {
            for dependency in &info.dependencies {
                if self.registry.get(dependency).is_none() {
                    self.registry
                        .configure(dependency, self.overrides_for(dependency));
                }
            }
        }
        self.registry.create(&name, &self.overrides_for(&name), false)
    }

    // ── create / lookup ──────────────────────────────────────────────

    /// Create an environment with a generated `env-<12 hex>` id.
    pub async fn create_environment(
        &self,
        level: Option<&str>,
        config: EnvironmentConfig,
    ) -> Result<Arc<IsolatedEnvironment>> {
        let id = format!("env-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.create_environment_with_id(level, &id, config).await
    }

    pub async fn create_environment_with_id(
        &self,
        level: Option<&str>,
        env_id: &str,
        config: EnvironmentConfig,
    ) -> Result<Arc<IsolatedEnvironment>> {
        let level = level.unwrap_or(&self.default_level);
        let start = Instant::now();

        // Held across engine creation so the cap and id uniqueness are
        // checked and claimed atomically.
        let mut environments = self.environments.write().await;
        if environments.len() >= self.max_environments {
            return Err(Error::CapacityExceeded {
                resource: "environments".into(),
                limit: self.max_environments,
            });
        }
        if environments.contains_key(env_id) {
            return Err(Error::state_conflict(
                format!("create environment '{env_id}'"),
                "an environment with that id is active",
            ));
        }

        let engine = self.engine_for(level)?;
        let env = engine.create_isolation(env_id, config).await?;
        environments.insert(env_id.to_string(), env.clone());
        drop(environments);

        self.metrics.record_create(start.elapsed());
        info!(env_id, engine = %engine.name(), "Environment registered with manager");
        Ok(env)
    }

    pub async fn get_environment(&self, env_id: &str) -> Result<Arc<IsolatedEnvironment>> {
        self.environments
            .read()
            .await
            .get(env_id)
            .cloned()
            .ok_or_else(|| Error::not_found("environment", env_id))
    }

    pub async fn list_environments(&self) -> Vec<EnvironmentSummary> {
        let mut summaries: Vec<EnvironmentSummary> = self
            .environments
            .read()
            .await
            .values()
            .map(|env| EnvironmentSummary {
                id: env.id().to_string(),
                engine: env.engine_name().to_string(),
                status: env.status(),
                path: env.path().to_path_buf(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn active_count(&self) -> usize {
        self.environments.read().await.len()
    }

    // ── cleanup ──────────────────────────────────────────────────────

    /// Clean up one environment.
    ///
    /// The manager forgets the id before the engine is asked to clean, so
    /// the id is gone even when the engine call fails.
    pub async fn cleanup_environment(&self, env_id: &str, force: bool) -> Result<()> {
        let env = {
            let mut environments = self.environments.write().await;
            let env = environments
                .get(env_id)
                .cloned()
                .ok_or_else(|| Error::not_found("environment", env_id))?;
            if !force && env.status() == EnvironmentStatus::Error {
                return Err(Error::state_conflict(
                    format!("clean up environment '{env_id}' without force"),
                    EnvironmentStatus::Error,
                ));
            }
            environments.remove(env_id);
            env
        };
        lock(&self.snapshot_index).retain(|_, owner| owner != env_id);

        let result = match self.registry.get(env.engine_name()) {
            Some(engine) => engine.cleanup_isolation(env_id, force).await,
            None => {
                warn!(env_id, engine = %env.engine_name(), "Engine gone; cleaning environment directly");
                env.cleanup(force).await
            }
        };

        self.metrics.record_cleanup(result.is_ok());
        match &result {
            Ok(()) => info!(env_id, force, "Environment cleaned up"),
            Err(e) => warn!(env_id, force, error = %e, "Environment cleanup failed; bookkeeping already released"),
        }
        result
    }

    pub async fn cleanup_all(&self, force: bool) -> BulkCleanupReport {
        let mut ids: Vec<String> = self.environments.read().await.keys().cloned().collect();
        ids.sort();

        let mut report = BulkCleanupReport::default();
        for id in ids {
            match self.cleanup_environment(&id, force).await {
                Ok(()) => report.cleaned.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        info!(
            cleaned = report.cleaned.len(),
            failed = report.failed.len(),
            "Bulk cleanup finished"
        );
        report
    }

    // ── migration ────────────────────────────────────────────────────

    /// Move an environment's identity onto another engine.
    ///
    /// The source is only decommissioned once the target is active; if the
    /// target cannot be brought up the source is left untouched.
    pub async fn migrate_environment(
        &self,
        env_id: &str,
        target_level: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        let source = self.get_environment(env_id).await?;
        let source_engine = source.engine_name().to_string();
        let target_engine = self.engine_for(target_level)?;
        if target_engine.name() == source_engine {
            return Err(Error::InvalidInput(format!(
                "environment '{env_id}' already runs on engine '{source_engine}'"
            )));
        }
        for rel in &options.data_files {
            if !is_relative_inside(rel) {
                return Err(Error::InvalidInput(format!(
                    "data file {:?} must be relative to the environment directory",
                    rel
                )));
            }
        }

        let packages = if options.carry_packages && source.is_active() {
            source.list_installed_packages(options.timeout).await?
        } else {
            if options.carry_packages {
                debug!(env_id, status = %source.status(), "Source not active; no packages to carry");
            }
            BTreeMap::new()
        };

        info!(env_id, from = %source_engine, to = %target_engine.name(), "Migrating environment");
        let target = target_engine
            .create_isolation(env_id, source.config().clone())
            .await?;
        if let Err(e) = target.activate().await {
            if let Err(cleanup_err) = target_engine.cleanup_isolation(env_id, true).await {
                warn!(env_id, error = %cleanup_err, "Failed to discard migration target");
            }
            return Err(e);
        }

        let mut report = MigrationReport {
            env_id: env_id.to_string(),
            source_engine: source_engine.clone(),
            target_engine: target_engine.name().to_string(),
            ..Default::default()
        };

        for (name, version) in &packages {
            let spec = PackageSpec::new(name.clone()).with_version(version.clone());
            match target.install_package(&spec, options.timeout).await {
                Ok(()) => report.packages_carried.push(format!("{name}=={version}")),
                Err(e) => {
                    warn!(env_id, package = %name, error = %e, "Package did not carry over");
                    report.packages_failed.push(format!("{name}=={version}"));
                }
            }
        }

        for rel in &options.data_files {
            match copy_data_file(&source.path().join(rel), &target.path().join(rel)).await {
                Ok(()) => report.data_files_copied.push(rel.clone()),
                Err(e) => warn!(env_id, file = ?rel, error = %e, "Data file not copied"),
            }
        }

        self.environments
            .write()
            .await
            .insert(env_id.to_string(), target.clone());
        lock(&self.snapshot_index).retain(|_, owner| owner != env_id);

        let decommission = match self.registry.get(&source_engine) {
            Some(engine) => engine.cleanup_isolation(env_id, true).await,
            None => source.cleanup(true).await,
        };
        if let Err(e) = decommission {
            warn!(env_id, engine = %source_engine, error = %e, "Source decommission failed");
        }

        self.metrics.record_migration();
        info!(
            env_id,
            carried = report.packages_carried.len(),
            failed = report.packages_failed.len(),
            files = report.data_files_copied.len(),
            "Migration complete"
        );
        Ok(report)
    }

    // ── snapshots ────────────────────────────────────────────────────

    pub async fn create_snapshot(
        &self,
        env_id: &str,
        description: Option<String>,
    ) -> Result<SnapshotInfo> {
        let env = self.get_environment(env_id).await?;
        let info = env.create_snapshot(description).await?;
        lock(&self.snapshot_index).insert(info.snapshot_id.clone(), env_id.to_string());
        self.metrics.record_snapshot();
        Ok(info)
    }

    async fn snapshot_owner(&self, snapshot_id: &str) -> Result<Arc<IsolatedEnvironment>> {
        let env_id = lock(&self.snapshot_index)
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        self.get_environment(&env_id).await
    }

    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let env = self.snapshot_owner(snapshot_id).await?;
        env.restore_from_snapshot(snapshot_id).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let env = self.snapshot_owner(snapshot_id).await?;
        env.delete_snapshot(snapshot_id).await?;
        lock(&self.snapshot_index).remove(snapshot_id);
        Ok(())
    }

    /// Snapshots of one environment, or of all when `env_id` is `None`,
    /// oldest first.
    pub async fn list_snapshots(&self, env_id: Option<&str>) -> Vec<SnapshotInfo> {
        let mut snapshots: Vec<SnapshotInfo> = self
            .environments
            .read()
            .await
            .values()
            .filter(|env| env_id.map_or(true, |id| env.id() == id))
            .flat_map(|env| env.list_snapshots())
            .collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        snapshots
    }

    // ── selection / health ───────────────────────────────────────────

    /// Least-capable registered engine that satisfies `requirements`.
    pub fn auto_select_isolation_level(&self, requirements: &IsolationRequirements) -> Result<String> {
        let registered = self.registry.registered_kinds();
        let most_capable = registered
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)))
            .map(|(name, _, _)| name.clone())
            .ok_or_else(|| Error::Configuration("no isolation engines registered".into()))?;

        let minimum = if !requirements.extra.is_empty() {
            None
        } else if requirements.container_required
            || requirements.custom_image.is_some()
            || requirements.network_isolation
            || requirements.resource_limits
            || requirements.security_tier == SecurityTier::High
        {
            Some(EngineKind::Container)
        } else if requirements.python_version.is_some()
            || requirements.package_isolation
            || requirements.security_tier == SecurityTier::Medium
        {
            Some(EngineKind::Virtualenv)
        } else {
            Some(EngineKind::Basic)
        };

        let chosen = minimum
            .and_then(|min| {
                registered
                    .iter()
                    .filter(|(_, kind, _)| *kind >= min)
                    .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)))
                    .map(|(name, _, _)| name.clone())
            })
            .unwrap_or(most_capable);
        debug!(?minimum, chosen = %chosen, "Isolation level selected");
        Ok(chosen)
    }

    /// Health-check every instantiated engine.  Never fails and never mutates.
    pub async fn health_check(&self) -> HealthReport {
        let mut engines = Vec::new();
        for engine in self.registry.instantiated_engines() {
            engines.push(engine.health_check().await);
        }
        HealthReport {
            healthy: engines.iter().all(|h| h.healthy),
            engines,
            environments: self.active_count().await,
        }
    }

    pub async fn metrics(&self) -> ManagerStatus {
        let environments = self.environments.read().await;
        let mut by_status = BTreeMap::new();
        for env in environments.values() {
            *by_status.entry(env.status().to_string()).or_insert(0) += 1;
        }
        ManagerStatus {
            counters: self.metrics.snapshot(),
            active_environments: environments.len(),
            by_status,
        }
    }

    /// Force-clean everything, then drop the engine singletons.
    pub async fn shutdown(&self) -> BulkCleanupReport {
        let report = self.cleanup_all(true).await;
        self.registry.shutdown();
        info!("Isolation manager shut down");
        report
    }
}

fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn copy_data_file(src: &Path, dst: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(src).await?;
    if metadata.is_dir() {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
            .await
            .map_err(|e| Error::external("copy data directory", e))??;
    } else {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dst).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::environment::tests::MockDriver;
    use crate::engine::isolation::DriverEngine;
    use crate::engine::registry::{EngineFactory, EngineInfo};
    use std::sync::atomic::Ordering;

    fn mock_engine(
        name: &str,
        kind: EngineKind,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn IsolationEngine>> {
        let driver = MockDriver::default();
        if config.get("fail_release") == Some(&Value::Bool(true)) {
            driver.fail_release.store(true, Ordering::SeqCst);
        }
        if config.get("fail_activate") == Some(&Value::Bool(true)) {
            driver.fail_activate.store(true, Ordering::SeqCst);
        }
        let base_dir = config
            .get("base_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| Error::Configuration("base_dir missing".into()))?;
        Ok(Arc::new(DriverEngine::new(
            name,
            kind,
            config.clone(),
            base_dir,
            Arc::new(driver),
        )))
    }

    fn mock_basic(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
        mock_engine(name, EngineKind::Basic, config)
    }

    fn mock_venv(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
        mock_engine(name, EngineKind::Virtualenv, config)
    }

    fn mock_container(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
        mock_engine(name, EngineKind::Container, config)
    }

    fn mock_registry() -> Arc<EngineRegistry> {
        let registry = EngineRegistry::new();
        registry
            .register(
                EngineInfo::new("basic", EngineFactory::new(EngineKind::Basic, mock_basic)),
                false,
            )
            .unwrap();
        registry
            .register(
                EngineInfo::new("virtualenv", EngineFactory::new(EngineKind::Virtualenv, mock_venv))
                    .priority(10)
                    .depends_on("basic"),
                false,
            )
            .unwrap();
        registry
            .register(
                EngineInfo::new(
                    "container",
                    EngineFactory::new(EngineKind::Container, mock_container),
                )
                .priority(20),
                false,
            )
            .unwrap();
        Arc::new(registry)
    }

    fn config(dir: &Path, max: usize) -> Config {
        let mut config = Config::default();
        config.manager.base_dir = dir.to_path_buf();
        config.manager.max_concurrent_environments = max;
        config
    }

    #[tokio::test]
    async fn test_create_uses_engine_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let env = manager
            .create_environment(None, EnvironmentConfig::default())
            .await
            .unwrap();
        assert!(env.id().starts_with("env-"));
        assert_eq!(env.id().len(), 16);
        assert!(env.path().starts_with(dir.path().join("basic")));
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 2));
        for _ in 0..2 {
            manager
                .create_environment(Some("basic"), EnvironmentConfig::default())
                .await
                .unwrap();
        }
        let err = manager
            .create_environment(Some("basic"), EnvironmentConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_id_and_unknown_level() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        manager
            .create_environment_with_id(Some("basic"), "env-x", EnvironmentConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            manager
                .create_environment_with_id(Some("container"), "env-x", EnvironmentConfig::default())
                .await,
            Err(Error::StateConflict { .. })
        ));
        assert!(matches!(
            manager
                .create_environment(Some("quantum"), EnvironmentConfig::default())
                .await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_venv_alias_and_dependency_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let env = manager
            .create_environment(Some("venv"), EnvironmentConfig::default())
            .await
            .unwrap();
        assert_eq!(env.engine_name(), "virtualenv");
        // The dependency was instantiated with the manager's directory layout.
        let basic = manager.registry().get("basic").unwrap();
        assert_eq!(
            basic.config()["base_dir"],
            Value::from(dir.path().join("basic").display().to_string())
        );
    }

    #[tokio::test]
    async fn test_cleanup_bookkeeping_survives_failing_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 4);
        let mut overrides = Map::new();
        overrides.insert("fail_release".into(), Value::Bool(true));
        cfg.engines.insert("basic".into(), overrides);
        let manager = IsolationManager::new(mock_registry(), &cfg);

        let env = manager
            .create_environment_with_id(Some("basic"), "env-stuck", EnvironmentConfig::default())
            .await
            .unwrap();
        let err = manager.cleanup_environment("env-stuck", false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExternalFailure);
        assert!(matches!(
            manager.get_environment("env-stuck").await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(env.status(), EnvironmentStatus::Error);
        assert_eq!(manager.metrics().await.counters.cleanup_failures, 1);

        // Manager and engine agree the id is free again.
        let again = manager
            .create_environment_with_id(Some("basic"), "env-stuck", EnvironmentConfig::default())
            .await
            .unwrap();
        assert_eq!(again.status(), EnvironmentStatus::Created);
        assert!(!Arc::ptr_eq(&again, &env));
    }

    #[tokio::test]
    async fn test_non_forced_cleanup_of_errored_env_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 4);
        let mut overrides = Map::new();
        overrides.insert("fail_activate".into(), Value::Bool(true));
        cfg.engines.insert("basic".into(), overrides);
        let manager = IsolationManager::new(mock_registry(), &cfg);

        let env = manager
            .create_environment_with_id(Some("basic"), "env-err", EnvironmentConfig::default())
            .await
            .unwrap();
        assert!(env.activate().await.is_err());
        assert_eq!(env.status(), EnvironmentStatus::Error);

        assert!(matches!(
            manager.cleanup_environment("env-err", false).await,
            Err(Error::StateConflict { .. })
        ));
        assert_eq!(manager.active_count().await, 1);
        manager.cleanup_environment("env-err", true).await.unwrap();
        assert_eq!(env.status(), EnvironmentStatus::CleanupComplete);
    }

    #[tokio::test]
    async fn test_cleanup_all_reports_each_environment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 8));
        for level in ["basic", "virtualenv", "container"] {
            let env = manager
                .create_environment(Some(level), EnvironmentConfig::default())
                .await
                .unwrap();
            env.activate().await.unwrap();
        }
        let report = manager.shutdown().await;
        assert_eq!(report.cleaned.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.registry().instantiated_engines().is_empty());
    }

    #[tokio::test]
    async fn test_migration_carries_packages_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let source = manager
            .create_environment_with_id(Some("basic"), "env-move", EnvironmentConfig::default())
            .await
            .unwrap();
        source.activate().await.unwrap();
        source
            .install_package(
                &PackageSpec::new("requests").with_version("2.31.0"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        std::fs::create_dir_all(source.path().join("data")).unwrap();
        std::fs::write(source.path().join("data/fixture.json"), b"{}").unwrap();

        let report = manager
            .migrate_environment(
                "env-move",
                "container",
                MigrationOptions {
                    data_files: vec![PathBuf::from("data/fixture.json")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.source_engine, "basic");
        assert_eq!(report.target_engine, "container");
        assert_eq!(report.packages_carried, vec!["requests==2.31.0"]);
        assert_eq!(report.data_files_copied, vec![PathBuf::from("data/fixture.json")]);

        let target = manager.get_environment("env-move").await.unwrap();
        assert_eq!(target.engine_name(), "container");
        assert!(target.is_active());
        assert!(target.path().join("data/fixture.json").exists());
        let packages = target
            .list_installed_packages(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(packages.get("requests").map(String::as_str), Some("2.31.0"));
        assert_eq!(source.status(), EnvironmentStatus::CleanupComplete);
        assert!(manager.registry().get("basic").unwrap().get_environment("env-move").is_none());
    }

    #[tokio::test]
    async fn test_failed_migration_leaves_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 4);
        let mut overrides = Map::new();
        overrides.insert("fail_activate".into(), Value::Bool(true));
        cfg.engines.insert("container".into(), overrides);
        let manager = IsolationManager::new(mock_registry(), &cfg);

        let source = manager
            .create_environment_with_id(Some("basic"), "env-stay", EnvironmentConfig::default())
            .await
            .unwrap();
        source.activate().await.unwrap();

        assert!(manager
            .migrate_environment("env-stay", "container", MigrationOptions::default())
            .await
            .is_err());
        assert!(source.is_active());
        let current = manager.get_environment("env-stay").await.unwrap();
        assert!(Arc::ptr_eq(&current, &source));
        assert!(manager
            .registry()
            .get("container")
            .unwrap()
            .get_environment("env-stay")
            .is_none());
    }

    #[tokio::test]
    async fn test_migration_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        manager
            .create_environment_with_id(Some("basic"), "env-p", EnvironmentConfig::default())
            .await
            .unwrap();
        let result = manager
            .migrate_environment(
                "env-p",
                "container",
                MigrationOptions {
                    data_files: vec![PathBuf::from("../secrets")],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_snapshot_index_follows_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let env = manager
            .create_environment_with_id(Some("basic"), "env-snap", EnvironmentConfig::default())
            .await
            .unwrap();
        env.activate().await.unwrap();

        let snap = manager
            .create_snapshot("env-snap", Some("clean".into()))
            .await
            .unwrap();
        env.install_package(&PackageSpec::new("six"), Duration::from_secs(5))
            .await
            .unwrap();
        manager.restore_snapshot(&snap.snapshot_id).await.unwrap();
        assert!(env
            .list_installed_packages(Duration::from_secs(5))
            .await
            .unwrap()
            .is_empty());

        assert_eq!(manager.list_snapshots(Some("env-snap")).await.len(), 1);
        assert!(manager.list_snapshots(Some("other")).await.is_empty());

        manager.cleanup_environment("env-snap", false).await.unwrap();
        assert!(matches!(
            manager.restore_snapshot(&snap.snapshot_id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(manager.list_snapshots(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        manager
            .create_environment_with_id(Some("basic"), "env-d", EnvironmentConfig::default())
            .await
            .unwrap();
        let snap = manager.create_snapshot("env-d", None).await.unwrap();
        manager.delete_snapshot(&snap.snapshot_id).await.unwrap();
        assert!(manager.list_snapshots(None).await.is_empty());
        assert!(matches!(
            manager.delete_snapshot(&snap.snapshot_id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_auto_selection_table() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let pick = |r: IsolationRequirements| manager.auto_select_isolation_level(&r).unwrap();

        assert_eq!(pick(IsolationRequirements::default()), "basic");
        assert_eq!(
            pick(IsolationRequirements {
                python_version: Some("3.11".into()),
                ..Default::default()
            }),
            "virtualenv"
        );
        assert_eq!(
            pick(IsolationRequirements {
                security_tier: SecurityTier::Medium,
                ..Default::default()
            }),
            "virtualenv"
        );
        assert_eq!(
            pick(IsolationRequirements {
                network_isolation: true,
                ..Default::default()
            }),
            "container"
        );
        assert_eq!(
            pick(IsolationRequirements {
                custom_image: Some("python:3.12".into()),
                ..Default::default()
            }),
            "container"
        );
        let mut extra = Map::new();
        extra.insert("gpu".into(), Value::Bool(true));
        assert_eq!(
            pick(IsolationRequirements {
                extra,
                ..Default::default()
            }),
            "container"
        );
    }

    #[test]
    fn test_auto_selection_raises_to_registered() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EngineRegistry::new();
        registry
            .register(
                EngineInfo::new(
                    "container",
                    EngineFactory::new(EngineKind::Container, mock_container),
                ),
                false,
            )
            .unwrap();
        let manager = IsolationManager::new(Arc::new(registry), &config(dir.path(), 4));
        assert_eq!(
            manager
                .auto_select_isolation_level(&IsolationRequirements::default())
                .unwrap(),
            "container"
        );

        let empty = IsolationManager::new(Arc::new(EngineRegistry::new()), &config(dir.path(), 4));
        assert!(matches!(
            empty.auto_select_isolation_level(&IsolationRequirements::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_health_and_metrics_are_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(mock_registry(), &config(dir.path(), 4));
        let env = manager
            .create_environment(Some("basic"), EnvironmentConfig::default())
            .await
            .unwrap();
        env.activate().await.unwrap();

        let health = manager.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.environments, 1);
        assert_eq!(health.engines.len(), 1);

        let status = manager.metrics().await;
        assert_eq!(status.counters.environments_created, 1);
        assert_eq!(status.by_status.get("active"), Some(&1));
        assert!(env.is_active());
    }
}
