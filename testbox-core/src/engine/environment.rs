//! Isolated Environments
//!
//! [`IsolatedEnvironment`] is one sandbox instance.  It owns the lifecycle
//! state machine, the per-environment port set, snapshot records and event
//! listeners, and delegates the backend work to an [`EnvironmentDriver`].
//!
//! # Concurrency Model:
//! - Lifecycle operations (activate/deactivate/cleanup/snapshot) are
//!   serialized by an async `op_lock`
//! - Status, ports and listeners sit behind short `std::sync::Mutex`
//!   sections that are never held across an `.await`
//! - Forced cleanup waits only briefly for `op_lock`, so a hung driver call
//!   cannot block teardown

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::state::EnvironmentStatus;
use crate::error::{Error, Result};
use crate::executor::{DriverContext, EnvironmentDriver, ExecutionOutput, PackageSpec};
use crate::util::{dir_size, lock};

/// How long forced cleanup waits for an in-flight lifecycle operation.
const FORCE_LOCK_WAIT: Duration = Duration::from_secs(5);
/// Upper bound on the driver's resource release during forced cleanup.
const FORCE_RELEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller-supplied configuration for a new environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Interpreter used to build/run the environment (default: engine's)
    pub python: Option<String>,
    /// Container image (container engine only)
    pub image: Option<String>,
    /// Cut the environment off from the network where the backend can
    pub network_isolation: bool,
    /// CPU cores (fractional, e.g. 0.5 for half a core)
    pub cpu_cores: Option<f64>,
    /// Memory limit in bytes
    pub memory_bytes: Option<u64>,
    /// Environment variables applied to every command
    pub env_vars: HashMap<String, String>,
    /// First port handed out by `allocate_port`
    pub port_range_start: u16,
    /// Last port (inclusive) handed out by `allocate_port`
    pub port_range_end: u16,
    /// Backend-specific settings
    pub extra: Map<String, Value>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            python: None,
            image: None,
            network_isolation: false,
            cpu_cores: None,
            memory_bytes: None,
            env_vars: HashMap::new(),
            port_range_start: 20000,
            port_range_end: 29999,
            extra: Map::new(),
        }
    }
}

/// A status change, delivered to every listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentEvent {
    pub env_id: String,
    pub previous: EnvironmentStatus,
    pub current: EnvironmentStatus,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

pub type EventListener = Arc<dyn Fn(&EnvironmentEvent) + Send + Sync>;

/// Point-in-time resource usage of an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub disk_bytes: u64,
    pub allocated_ports: usize,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Record of one snapshot taken of an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub env_id: String,
    pub engine: String,
    /// Driver-specific backing location (directory, image tag, ...)
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
}

/// One sandbox instance with its own lifecycle.
pub struct IsolatedEnvironment {
    id: String,
    path: PathBuf,
    engine: String,
    config: EnvironmentConfig,
    driver: Arc<dyn EnvironmentDriver>,
    created_at: DateTime<Utc>,
    status: Mutex<EnvironmentStatus>,
    ports: Mutex<BTreeSet<u16>>,
    usage: Mutex<ResourceUsage>,
    listeners: Mutex<Vec<EventListener>>,
    snapshots: Mutex<BTreeMap<String, SnapshotInfo>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for IsolatedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedEnvironment")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

impl IsolatedEnvironment {
    /// Create a new environment in the `Created` state.
    ///
    /// Only engines call this; the engine owns the instance from here on.
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        engine: impl Into<String>,
        config: EnvironmentConfig,
        driver: Arc<dyn EnvironmentDriver>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            engine: engine.into(),
            config,
            driver,
            created_at: Utc::now(),
            status: Mutex::new(EnvironmentStatus::Created),
            ports: Mutex::new(BTreeSet::new()),
            usage: Mutex::new(ResourceUsage::default()),
            listeners: Mutex::new(Vec::new()),
            snapshots: Mutex::new(BTreeMap::new()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the engine that created this environment.
    pub fn engine_name(&self) -> &str {
        &self.engine
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn driver_type(&self) -> &str {
        self.driver.driver_type()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> EnvironmentStatus {
        *lock(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == EnvironmentStatus::Active
    }

    /// Register a listener for status changes.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&EnvironmentEvent) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    fn context(&self) -> DriverContext {
        DriverContext {
            env_id: self.id.clone(),
            path: self.path.clone(),
            config: self.config.clone(),
        }
    }

    // ── state machine ─────────────────────────────────────────────────

    fn transition(
        &self,
        next: EnvironmentStatus,
        forced: bool,
        message: Option<String>,
    ) -> Result<()> {
        let previous = {
            let mut status = lock(&self.status);
            let previous = *status;
            if !previous.can_transition_to(next, forced) {
                return Err(Error::state_conflict(
                    format!("move environment '{}' to {next}", self.id),
                    previous,
                ));
            }
            *status = next;
            previous
        };

        debug!(env_id = %self.id, from = %previous, to = %next, "Environment status changed");
        self.emit(EnvironmentEvent {
            env_id: self.id.clone(),
            previous,
            current: next,
            timestamp: Utc::now(),
            message,
        });
        Ok(())
    }

    fn emit(&self, event: EnvironmentEvent) {
        let listeners: Vec<EventListener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Move to `Error` unless already terminal.
    fn fail(&self, message: String) {
        if !self.status().is_terminal() {
            let _ = self.transition(EnvironmentStatus::Error, false, Some(message));
        }
    }

    fn require_active(&self, operation: &str) -> Result<()> {
        let status = self.status();
        if status != EnvironmentStatus::Active {
            return Err(Error::state_conflict(
                format!("{operation} in environment '{}'", self.id),
                status,
            ));
        }
        Ok(())
    }

    // ── lifecycle ─────────────────────────────────────────────────────

    /// Bring the environment to `Active`.
    ///
    /// Idempotent: activating an active environment succeeds without
    /// touching the driver.
    pub async fn activate(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.activate_locked().await
    }

    async fn activate_locked(&self) -> Result<()> {
        match self.status() {
            EnvironmentStatus::Active => {
                debug!(env_id = %self.id, "Already active");
                return Ok(());
            }
            EnvironmentStatus::Created | EnvironmentStatus::Inactive => {}
            other => {
                return Err(Error::state_conflict(
                    format!("activate environment '{}'", self.id),
                    other,
                ))
            }
        }

        self.transition(EnvironmentStatus::Activating, false, None)?;
        if let Err(e) = self.driver.activate(&self.context()).await {
            let err = Error::external("activate", e);
            self.fail(err.to_string());
            return Err(err);
        }
        self.transition(EnvironmentStatus::Active, false, None)?;
        info!(env_id = %self.id, engine = %self.engine, "Environment active");
        Ok(())
    }

    /// Bring the environment to `Inactive`.  Idempotent.
    pub async fn deactivate(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.deactivate_locked().await
    }

    async fn deactivate_locked(&self) -> Result<()> {
        match self.status() {
            EnvironmentStatus::Inactive => {
                debug!(env_id = %self.id, "Already inactive");
                return Ok(());
            }
            EnvironmentStatus::Active => {}
            other => {
                return Err(Error::state_conflict(
                    format!("deactivate environment '{}'", self.id),
                    other,
                ))
            }
        }

        self.transition(EnvironmentStatus::Deactivating, false, None)?;
        if let Err(e) = self.driver.deactivate(&self.context()).await {
            let err = Error::external("deactivate", e);
            self.fail(err.to_string());
            return Err(err);
        }
        self.transition(EnvironmentStatus::Inactive, false, None)?;
        info!(env_id = %self.id, "Environment inactive");
        Ok(())
    }

    /// Tear the environment down.
    ///
    /// With `force`, the environment always ends in `CleanupComplete`, even
    /// if it was in `Error` or the driver's release call failed.  Without
    /// `force`, an active environment is deactivated first and any driver
    /// failure moves it to `Error`.
    pub async fn cleanup(&self, force: bool) -> Result<()> {
        if force {
            let guard = tokio::time::timeout(FORCE_LOCK_WAIT, self.op_lock.lock())
                .await
                .ok();
            if guard.is_none() {
                warn!(env_id = %self.id, "Lifecycle lock busy, forcing cleanup anyway");
            }
            self.force_cleanup_locked().await;
            return Ok(());
        }

        let _guard = self.op_lock.lock().await;
        match self.status() {
            EnvironmentStatus::CleanupComplete => return Ok(()),
            EnvironmentStatus::Active => self.deactivate_locked().await?,
            EnvironmentStatus::Created | EnvironmentStatus::Inactive => {}
            other => {
                return Err(Error::state_conflict(
                    format!("clean up environment '{}'", self.id),
                    other,
                ))
            }
        }

        self.transition(EnvironmentStatus::CleanupStart, false, None)?;
        self.transition(EnvironmentStatus::Cleaning, false, None)?;
        self.release_all_ports();
        self.drop_snapshots().await;
        if let Err(e) = self.driver.release(&self.context()).await {
            let err = Error::external("cleanup", e);
            self.fail(err.to_string());
            return Err(err);
        }
        self.transition(EnvironmentStatus::CleanupComplete, false, None)?;
        info!(env_id = %self.id, "Environment cleaned up");
        Ok(())
    }

    async fn force_cleanup_locked(&self) {
        if self.status() == EnvironmentStatus::CleanupComplete {
            return;
        }

        let _ = self.transition(
            EnvironmentStatus::CleanupStart,
            true,
            Some("forced cleanup".to_string()),
        );
        let _ = self.transition(EnvironmentStatus::Cleaning, false, None);
        self.release_all_ports();
        self.drop_snapshots().await;

        match tokio::time::timeout(FORCE_RELEASE_TIMEOUT, self.driver.release(&self.context())).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(env_id = %self.id, error = %format!("{e:#}"), "Resource release failed during forced cleanup")
            }
            Err(_) => {
                warn!(env_id = %self.id, "Resource release timed out during forced cleanup")
            }
        }

        // Terminal guarantee: land in CleanupComplete no matter where the
        // status ended up.
        let previous = {
            let mut status = lock(&self.status);
            std::mem::replace(&mut *status, EnvironmentStatus::CleanupComplete)
        };
        if previous != EnvironmentStatus::CleanupComplete {
            self.emit(EnvironmentEvent {
                env_id: self.id.clone(),
                previous,
                current: EnvironmentStatus::CleanupComplete,
                timestamp: Utc::now(),
                message: Some("forced cleanup".to_string()),
            });
        }
        info!(env_id = %self.id, "Environment force-cleaned");
    }

    // ── commands & packages ───────────────────────────────────────────

    /// Run `argv` inside the environment with a deadline.
    pub async fn execute(
        &self,
        argv: &[String],
        timeout: Duration,
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<ExecutionOutput> {
        self.require_active("execute")?;
        if argv.is_empty() {
            return Err(Error::InvalidInput("empty command".into()));
        }

        let mut merged = self.config.env_vars.clone();
        merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        debug!(env_id = %self.id, command = ?argv, "Executing command");
        let ctx = self.context();
        match tokio::time::timeout(timeout, self.driver.execute(&ctx, argv, &merged, cwd)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::external("execute", e)),
            Err(_) => Err(Error::timeout("execute", timeout)),
        }
    }

    pub async fn install_package(&self, spec: &PackageSpec, timeout: Duration) -> Result<()> {
        self.require_active("install package")?;
        debug!(env_id = %self.id, package = %spec.name, version = ?spec.version, "Installing package");
        let ctx = self.context();
        match tokio::time::timeout(timeout, self.driver.install_package(&ctx, spec)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::external(format!("install {}", spec.name), e)),
            Err(_) => Err(Error::timeout(format!("install {}", spec.name), timeout)),
        }
    }

    pub async fn uninstall_package(&self, name: &str, timeout: Duration) -> Result<()> {
        self.require_active("uninstall package")?;
        let ctx = self.context();
        match tokio::time::timeout(timeout, self.driver.uninstall_package(&ctx, name)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::external(format!("uninstall {name}"), e)),
            Err(_) => Err(Error::timeout(format!("uninstall {name}"), timeout)),
        }
    }

    pub async fn list_installed_packages(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, String>> {
        self.require_active("list packages")?;
        let ctx = self.context();
        match tokio::time::timeout(timeout, self.driver.list_installed_packages(&ctx)).await {
            Ok(Ok(packages)) => Ok(packages),
            Ok(Err(e)) => Err(Error::external("list packages", e)),
            Err(_) => Err(Error::timeout("list packages", timeout)),
        }
    }

    // ── ports ─────────────────────────────────────────────────────────

    /// Reserve a free TCP port for this environment.
    ///
    /// Never returns a port already allocated here; candidates are tried
    /// with a loopback bind so ports busy on the host are skipped too.
    pub fn allocate_port(&self) -> Result<u16> {
        let status = self.status();
        if status.is_terminal() {
            return Err(Error::state_conflict(
                format!("allocate a port in environment '{}'", self.id),
                status,
            ));
        }

        let (start, end) = (self.config.port_range_start, self.config.port_range_end);
        if start == 0 || start > end {
            return Err(Error::Configuration(format!(
                "invalid port range {start}-{end}"
            )));
        }

        let mut ports = lock(&self.ports);
        for port in start..=end {
            if ports.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                ports.insert(port);
                debug!(env_id = %self.id, port, "Port allocated");
                return Ok(port);
            }
        }
        Err(Error::CapacityExceeded {
            resource: format!("ports in {start}-{end}"),
            limit: usize::from(end - start) + 1,
        })
    }

    /// Release a port.  Returns `false` if the port was not allocated here.
    pub fn release_port(&self, port: u16) -> bool {
        let released = lock(&self.ports).remove(&port);
        if released {
            debug!(env_id = %self.id, port, "Port released");
        }
        released
    }

    pub fn allocated_ports(&self) -> Vec<u16> {
        lock(&self.ports).iter().copied().collect()
    }

    fn release_all_ports(&self) {
        let released = std::mem::take(&mut *lock(&self.ports));
        if !released.is_empty() {
            debug!(env_id = %self.id, count = released.len(), "Released all ports");
        }
    }

    // ── resource usage ────────────────────────────────────────────────

    /// Re-sample resource usage and return the new snapshot.
    pub async fn refresh_resource_usage(&self) -> ResourceUsage {
        let path = self.path.clone();
        let disk_bytes = tokio::task::spawn_blocking(move || dir_size(&path))
            .await
            .unwrap_or(0);
        let usage = ResourceUsage {
            disk_bytes,
            allocated_ports: lock(&self.ports).len(),
            sampled_at: Some(Utc::now()),
        };
        *lock(&self.usage) = usage.clone();
        usage
    }

    /// Last sampled resource usage.
    pub fn resource_usage(&self) -> ResourceUsage {
        lock(&self.usage).clone()
    }

    // ── snapshots ─────────────────────────────────────────────────────

    pub fn supports_snapshots(&self) -> bool {
        self.driver.supports_snapshots()
    }

    fn require_snapshot_state(&self, operation: &str) -> Result<()> {
        if !self.driver.supports_snapshots() {
            return Err(Error::external(
                operation,
                format!("driver '{}' does not support snapshots", self.driver_type()),
            ));
        }
        match self.status() {
            EnvironmentStatus::Created | EnvironmentStatus::Active | EnvironmentStatus::Inactive => {
                Ok(())
            }
            other => Err(Error::state_conflict(
                format!("{operation} for environment '{}'", self.id),
                other,
            )),
        }
    }

    pub async fn create_snapshot(&self, description: Option<String>) -> Result<SnapshotInfo> {
        let _guard = self.op_lock.lock().await;
        self.require_snapshot_state("create snapshot")?;

        let snapshot_id = format!("snap-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let location = self
            .driver
            .create_snapshot(&self.context(), &snapshot_id)
            .await
            .map_err(|e| Error::external("create snapshot", e))?;

        let info = SnapshotInfo {
            snapshot_id: snapshot_id.clone(),
            env_id: self.id.clone(),
            engine: self.engine.clone(),
            location,
            created_at: Utc::now(),
            description,
        };
        lock(&self.snapshots).insert(snapshot_id.clone(), info.clone());
        info!(env_id = %self.id, snapshot_id = %snapshot_id, "Snapshot created");
        Ok(info)
    }

    pub async fn restore_from_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.require_snapshot_state("restore snapshot")?;

        let info = lock(&self.snapshots)
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        self.driver
            .restore_snapshot(&self.context(), &info.location)
            .await
            .map_err(|e| Error::external("restore snapshot", e))?;
        info!(env_id = %self.id, snapshot_id, "Snapshot restored");
        Ok(())
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let info = lock(&self.snapshots)
            .remove(snapshot_id)
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        self.driver
            .delete_snapshot(&self.context(), &info.location)
            .await
            .map_err(|e| Error::external("delete snapshot", e))?;
        debug!(env_id = %self.id, snapshot_id, "Snapshot deleted");
        Ok(())
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        lock(&self.snapshots).values().cloned().collect()
    }

    /// Best-effort removal of every snapshot during cleanup.
    async fn drop_snapshots(&self) {
        let snapshots = std::mem::take(&mut *lock(&self.snapshots));
        if snapshots.is_empty() || !self.driver.supports_snapshots() {
            return;
        }
        let ctx = self.context();
        for info in snapshots.values() {
            if let Err(e) = self.driver.delete_snapshot(&ctx, &info.location).await {
                warn!(env_id = %self.id, snapshot_id = %info.snapshot_id, error = %e, "Failed to delete snapshot");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory driver that records calls and can be told to fail.
    #[derive(Default)]
    pub(crate) struct MockDriver {
        pub activations: AtomicUsize,
        pub releases: AtomicUsize,
        pub fail_activate: AtomicBool,
        pub fail_release: AtomicBool,
        pub packages: Mutex<BTreeMap<String, String>>,
        pub snapshots: Mutex<HashMap<String, BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl EnvironmentDriver for MockDriver {
        fn driver_type(&self) -> &str {
            "mock"
        }

        async fn activate(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
            if self.fail_activate.load(Ordering::SeqCst) {
                bail!("activation refused");
            }
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn release(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_release.load(Ordering::SeqCst) {
                bail!("resource stuck");
            }
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &DriverContext,
            argv: &[String],
            env: &HashMap<String, String>,
            _cwd: Option<&Path>,
        ) -> anyhow::Result<ExecutionOutput> {
            if argv[0] == "sleep" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(ExecutionOutput {
                exit_code: 0,
                stdout: format!("{} {}", argv.join(" "), env.get("MODE").cloned().unwrap_or_default()),
                stderr: String::new(),
                duration_ms: 0,
            })
        }

        async fn install_package(&self, _ctx: &DriverContext, spec: &PackageSpec) -> anyhow::Result<()> {
            lock(&self.packages).insert(
                spec.name.clone(),
                spec.version.clone().unwrap_or_else(|| "0.0.0".into()),
            );
            Ok(())
        }

        async fn uninstall_package(&self, _ctx: &DriverContext, name: &str) -> anyhow::Result<()> {
            lock(&self.packages).remove(name);
            Ok(())
        }

        async fn list_installed_packages(
            &self,
            _ctx: &DriverContext,
        ) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(lock(&self.packages).clone())
        }

        fn supports_snapshots(&self) -> bool {
            true
        }

        async fn create_snapshot(&self, _ctx: &DriverContext, snapshot_id: &str) -> anyhow::Result<String> {
            let state = lock(&self.packages).clone();
            lock(&self.snapshots).insert(snapshot_id.to_string(), state);
            Ok(format!("mem://{snapshot_id}"))
        }

        async fn restore_snapshot(&self, _ctx: &DriverContext, location: &str) -> anyhow::Result<()> {
            let id = location.trim_start_matches("mem://");
            let state = lock(&self.snapshots)
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no snapshot {id}"))?;
            *lock(&self.packages) = state;
            Ok(())
        }

        async fn delete_snapshot(&self, _ctx: &DriverContext, location: &str) -> anyhow::Result<()> {
            lock(&self.snapshots).remove(location.trim_start_matches("mem://"));
            Ok(())
        }
    }

    pub(crate) fn mock_env(id: &str) -> (IsolatedEnvironment, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::default());
        let env = IsolatedEnvironment::new(
            id,
            std::env::temp_dir().join("testbox-unit").join(id),
            "mock",
            EnvironmentConfig::default(),
            driver.clone(),
        );
        (env, driver)
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let (env, driver) = mock_env("env-idem");
        assert_eq!(env.status(), EnvironmentStatus::Created);

        env.activate().await.unwrap();
        env.activate().await.unwrap();
        assert_eq!(env.status(), EnvironmentStatus::Active);
        assert_eq!(driver.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deactivate_then_activate() {
        let (env, _) = mock_env("env-cycle");
        env.activate().await.unwrap();
        env.deactivate().await.unwrap();
        env.deactivate().await.unwrap();
        assert_eq!(env.status(), EnvironmentStatus::Inactive);
        env.activate().await.unwrap();
        assert_eq!(env.status(), EnvironmentStatus::Active);
    }

    #[tokio::test]
    async fn test_invalid_operation_is_state_conflict() {
        let (env, _) = mock_env("env-conflict");
        let err = env.deactivate().await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
        // No side effects.
        assert_eq!(env.status(), EnvironmentStatus::Created);

        let err = env
            .execute(&["echo".into()], Duration::from_secs(1), &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_failed_activation_moves_to_error() {
        let (env, driver) = mock_env("env-fail");
        driver.fail_activate.store(true, Ordering::SeqCst);

        let err = env.activate().await.unwrap_err();
        assert!(matches!(err, Error::External { .. }));
        assert!(err.to_string().starts_with("activate failed"));
        assert_eq!(env.status(), EnvironmentStatus::Error);

        // Non-forced cleanup refuses, forced cleanup completes.
        assert!(matches!(
            env.cleanup(false).await,
            Err(Error::StateConflict { .. })
        ));
        env.cleanup(true).await.unwrap();
        assert_eq!(env.status(), EnvironmentStatus::CleanupComplete);
    }

    #[tokio::test]
    async fn test_forced_cleanup_from_every_state() {
        for start in [
            EnvironmentStatus::Created,
            EnvironmentStatus::Active,
            EnvironmentStatus::Inactive,
            EnvironmentStatus::Error,
            EnvironmentStatus::CleanupComplete,
        ] {
            let (env, driver) = mock_env("env-force");
            driver.fail_release.store(true, Ordering::SeqCst);
            match start {
                EnvironmentStatus::Active => env.activate().await.unwrap(),
                EnvironmentStatus::Inactive => {
                    env.activate().await.unwrap();
                    env.deactivate().await.unwrap();
                }
                EnvironmentStatus::Error => env.fail("boom".into()),
                EnvironmentStatus::CleanupComplete => env.cleanup(true).await.unwrap(),
                _ => {}
            }
            env.cleanup(true).await.unwrap();
            assert_eq!(env.status(), EnvironmentStatus::CleanupComplete, "from {start}");
        }
    }

    #[tokio::test]
    async fn test_non_forced_cleanup_release_failure() {
        let (env, driver) = mock_env("env-release");
        driver.fail_release.store(true, Ordering::SeqCst);
        env.activate().await.unwrap();

        let err = env.cleanup(false).await.unwrap_err();
        assert!(matches!(err, Error::External { .. }));
        assert_eq!(env.status(), EnvironmentStatus::Error);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (env, driver) = mock_env("env-clean");
        env.activate().await.unwrap();
        env.cleanup(false).await.unwrap();
        env.cleanup(false).await.unwrap();
        env.cleanup(true).await.unwrap();
        assert_eq!(driver.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_follow_transitions() {
        let (env, _) = mock_env("env-events");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        env.add_listener(move |event| lock(&sink).push(event.current));

        env.activate().await.unwrap();
        env.cleanup(false).await.unwrap();

        let seen = lock(&seen).clone();
        assert_eq!(
            seen,
            vec![
                EnvironmentStatus::Activating,
                EnvironmentStatus::Active,
                EnvironmentStatus::Deactivating,
                EnvironmentStatus::Inactive,
                EnvironmentStatus::CleanupStart,
                EnvironmentStatus::Cleaning,
                EnvironmentStatus::CleanupComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_ports_unique_and_reusable() {
        let (env, _) = mock_env("env-ports");
        let a = env.allocate_port().unwrap();
        let b = env.allocate_port().unwrap();
        assert_ne!(a, b);
        assert_eq!(env.allocated_ports().len(), 2);

        assert!(env.release_port(a));
        assert!(!env.release_port(a), "released exactly once");

        let c = env.allocate_port().unwrap();
        assert_ne!(c, b);
        assert_eq!(env.allocated_ports().iter().filter(|p| **p == c).count(), 1);
    }

    #[tokio::test]
    async fn test_execute_timeout_and_env_merge() {
        let driver = Arc::new(MockDriver::default());
        let mut config = EnvironmentConfig::default();
        config.env_vars.insert("MODE".into(), "base".into());
        let env = IsolatedEnvironment::new("env-exec", "/tmp/env-exec", "mock", config, driver);
        env.activate().await.unwrap();

        let out = env
            .execute(&["echo".into(), "hi".into()], Duration::from_secs(1), &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "echo hi base");

        let overrides = HashMap::from([("MODE".to_string(), "override".to_string())]);
        let out = env
            .execute(&["echo".into()], Duration::from_secs(1), &overrides, None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "echo override");

        let err = env
            .execute(&["sleep".into()], Duration::from_millis(20), &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (env, _) = mock_env("env-snap");
        env.activate().await.unwrap();
        env.install_package(&PackageSpec::new("six").with_version("1.16.0"), Duration::from_secs(1))
            .await
            .unwrap();

        let snap = env.create_snapshot(Some("before".into())).await.unwrap();
        env.uninstall_package("six", Duration::from_secs(1)).await.unwrap();
        assert!(env
            .list_installed_packages(Duration::from_secs(1))
            .await
            .unwrap()
            .is_empty());

        env.restore_from_snapshot(&snap.snapshot_id).await.unwrap();
        let packages = env.list_installed_packages(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packages.get("six").map(String::as_str), Some("1.16.0"));

        env.delete_snapshot(&snap.snapshot_id).await.unwrap();
        assert!(matches!(
            env.delete_snapshot(&snap.snapshot_id).await,
            Err(Error::NotFound { .. })
        ));
    }
}
