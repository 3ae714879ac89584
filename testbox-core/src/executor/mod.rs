//! Environment Driver Contract
//!
//! A driver is the thin, backend-specific half of an isolated environment: it
//! knows how to turn "activate" into a `docker start` or how to run pip inside
//! a venv, and nothing else.  Lifecycle bookkeeping, port allocation, timeouts
//! and events live in [`IsolatedEnvironment`](crate::IsolatedEnvironment), which
//! wraps exactly one driver.
//!
//! Drivers report failures as `anyhow::Error`; the environment converts them
//! into typed [`Error::External`](crate::Error::External) values carrying the
//! operation name.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::Instant;

use crate::engine::environment::EnvironmentConfig;

/// Everything a driver needs to know about the environment it is serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverContext {
    /// Unique environment id
    pub env_id: String,
    /// Root directory of the environment on the host
    pub path: PathBuf,
    /// Caller-supplied configuration
    pub config: EnvironmentConfig,
}

/// Output of a command run inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Exit code (-1 when the process was killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Execution time in milliseconds
    pub duration_ms: u64,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single package install request handed to a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// Exact version to install; `None` lets the backend pick.
    pub version: Option<String>,
    pub upgrade: bool,
    /// Pre-downloaded artifact (from the package cache) to install from.
    pub artifact: Option<PathBuf>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            upgrade: false,
            artifact: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The argument a pip-style installer expects for this spec.
    pub fn install_target(&self) -> String {
        match (&self.artifact, &self.version) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(v)) => format!("{}=={}", self.name, v),
            (None, None) => self.name.clone(),
        }
    }
}

/// The capability contract every backend driver satisfies.
///
/// # Implementations:
/// - **Directory**: plain directory, host interpreter, `pip --target`
/// - **Virtualenv**: `python -m venv` plus the venv's own pip
/// - **Container**: a container CLI (`docker`/`podman`) driving one container
///
/// Every method should be idempotent where the lifecycle allows a retry.
#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    /// Return the driver type identifier
    fn driver_type(&self) -> &str;

    /// Bring the backend resource up (create venv, start container, ...).
    async fn activate(&self, ctx: &DriverContext) -> Result<()>;

    /// Pause the backend resource without destroying it.
    async fn deactivate(&self, ctx: &DriverContext) -> Result<()>;

    /// Destroy the backend resource.
    ///
    /// Called during cleanup; a failure here is tolerated by forced cleanup.
    async fn release(&self, ctx: &DriverContext) -> Result<()>;

    /// Run `argv` inside the environment.
    async fn execute(
        &self,
        ctx: &DriverContext,
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<ExecutionOutput>;

    async fn install_package(&self, ctx: &DriverContext, spec: &PackageSpec) -> Result<()>;

    async fn uninstall_package(&self, ctx: &DriverContext, name: &str) -> Result<()>;

    /// Installed packages as `name → version`.
    async fn list_installed_packages(&self, ctx: &DriverContext) -> Result<BTreeMap<String, String>>;

    /// Check if this driver can snapshot and restore environment state
    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Capture the environment state; returns the backing location.
    async fn create_snapshot(&self, _ctx: &DriverContext, _snapshot_id: &str) -> Result<String> {
        bail!("snapshots not supported by this driver")
    }

    async fn restore_snapshot(&self, _ctx: &DriverContext, _location: &str) -> Result<()> {
        bail!("snapshots not supported by this driver")
    }

    async fn delete_snapshot(&self, _ctx: &DriverContext, _location: &str) -> Result<()> {
        bail!("snapshots not supported by this driver")
    }
}

/// Run a host command and capture its output.
///
/// The child is killed if the returned future is dropped, so wrapping this in
/// `tokio::time::timeout` really stops the process.
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<ExecutionOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn '{program}'"))?;

    Ok(ExecutionOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Like [`run_command`], but a non-zero exit code becomes an error that
/// carries the tail of stderr.
pub async fn run_checked(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<ExecutionOutput> {
    let output = run_command(program, args, cwd, env).await?;
    if !output.success() {
        let tail: String = output
            .stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        bail!("'{program}' exited with {}: {tail}", output.exit_code);
    }
    Ok(output)
}

/// Parse `pip list --format=freeze` style output into `name → version`.
pub fn parse_freeze_output(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, version) = line.split_once("==")?;
            Some((name.trim().to_lowercase(), version.trim().to_string()))
        })
        .collect()
}
