//! Container sandbox driven through a container CLI (`docker` by default).
//!
//! One long-lived container per environment, named `testbox-<env_id>`, with
//! the environment directory bind-mounted at `/workspace`.  Commands and pip
//! run through `exec`; snapshots are `commit`ted images.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::executor::{
    parse_freeze_output, run_checked, run_command, DriverContext, EnvironmentDriver,
    ExecutionOutput, PackageSpec,
};

const WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerEngineConfig {
    pub base_dir: PathBuf,
    /// Container CLI binary
    pub cli: String,
    /// Image used when the environment does not name one
    pub image: String,
    /// Repository used for committed snapshot images
    pub snapshot_repository: String,
}

impl Default for ContainerEngineConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("testbox").join("container"),
            cli: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
            snapshot_repository: "testbox-snapshot".to_string(),
        }
    }
}

pub struct ContainerDriver {
    cli: String,
    image: String,
    snapshot_repository: String,
}

impl ContainerDriver {
    pub fn new(config: &ContainerEngineConfig) -> Self {
        Self {
            cli: config.cli.clone(),
            image: config.image.clone(),
            snapshot_repository: config.snapshot_repository.clone(),
        }
    }

    pub fn container_name(env_id: &str) -> String {
        format!("testbox-{env_id}")
    }

    async fn cli(&self, args: &[String]) -> Result<ExecutionOutput> {
        run_checked(&self.cli, args, None, &HashMap::new()).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let out = run_command(
            &self.cli,
            &["container".into(), "inspect".into(), name.to_string()],
            None,
            &HashMap::new(),
        )
        .await?;
        Ok(out.success())
    }

    /// `run -d` arguments for a fresh container from `image`.
    fn run_args(&self, ctx: &DriverContext, image: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(&ctx.env_id),
            "-v".to_string(),
            format!("{}:{WORKSPACE}", ctx.path.display()),
            "-w".to_string(),
            WORKSPACE.to_string(),
        ];
        if ctx.config.network_isolation {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if let Some(cpus) = ctx.config.cpu_cores {
            args.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        if let Some(memory) = ctx.config.memory_bytes {
            args.extend(["--memory".to_string(), memory.to_string()]);
        }
        for (key, value) in &ctx.config.env_vars {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        args.extend([
            image.to_string(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }

    async fn pip(&self, ctx: &DriverContext, pip_args: &[String]) -> Result<ExecutionOutput> {
        let mut args = vec![
            "exec".to_string(),
            Self::container_name(&ctx.env_id),
            "python".to_string(),
            "-m".to_string(),
            "pip".to_string(),
        ];
        args.extend_from_slice(pip_args);
        self.cli(&args).await
    }

    /// Copy a cached artifact into the mounted workspace; returns the in-container path.
    async fn stage_artifact(&self, ctx: &DriverContext, artifact: &Path) -> Result<String> {
        let file_name = artifact
            .file_name()
            .context("artifact path has no file name")?
            .to_string_lossy()
            .to_string();
        let staging = ctx.path.join(".artifacts");
        tokio::fs::create_dir_all(&staging).await?;
        tokio::fs::copy(artifact, staging.join(&file_name))
            .await
            .with_context(|| format!("cannot stage {:?}", artifact))?;
        Ok(format!("{WORKSPACE}/.artifacts/{file_name}"))
    }
}

#[async_trait]
impl EnvironmentDriver for ContainerDriver {
    fn driver_type(&self) -> &str {
        "container"
    }

    async fn activate(&self, ctx: &DriverContext) -> Result<()> {
        let name = Self::container_name(&ctx.env_id);
        if self.exists(&name).await? {
            self.cli(&["start".into(), name]).await?;
            return Ok(());
        }
        let image = ctx.config.image.as_deref().unwrap_or(&self.image);
        debug!(env_id = %ctx.env_id, image, "Starting container");
        self.cli(&self.run_args(ctx, image))
            .await
            .context("container start failed")?;
        Ok(())
    }

    async fn deactivate(&self, ctx: &DriverContext) -> Result<()> {
        self.cli(&["stop".into(), Self::container_name(&ctx.env_id)])
            .await?;
        Ok(())
    }

    async fn release(&self, ctx: &DriverContext) -> Result<()> {
        let name = Self::container_name(&ctx.env_id);
        let out = run_command(
            &self.cli,
            &["rm".into(), "-f".into(), name.clone()],
            None,
            &HashMap::new(),
        )
        .await?;
        if !out.success() && !out.stderr.contains("No such container") {
            anyhow::bail!("rm -f {name} failed: {}", out.stderr.trim());
        }
        if ctx.path.exists() {
            tokio::fs::remove_dir_all(&ctx.path).await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &DriverContext,
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<ExecutionOutput> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        if let Some(cwd) = cwd {
            args.extend(["-w".to_string(), cwd.display().to_string()]);
        }
        args.push(Self::container_name(&ctx.env_id));
        args.extend_from_slice(argv);
        run_command(&self.cli, &args, None, &HashMap::new()).await
    }

    async fn install_package(&self, ctx: &DriverContext, spec: &PackageSpec) -> Result<()> {
        let target = match &spec.artifact {
            Some(artifact) => self.stage_artifact(ctx, artifact).await?,
            None => spec.install_target(),
        };
        let mut args = vec!["install".to_string(), "--no-input".to_string()];
        if spec.upgrade {
            args.push("--upgrade".to_string());
        }
        args.push(target);
        self.pip(ctx, &args).await?;
        Ok(())
    }

    async fn uninstall_package(&self, ctx: &DriverContext, name: &str) -> Result<()> {
        self.pip(ctx, &["uninstall".into(), "-y".into(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn list_installed_packages(&self, ctx: &DriverContext) -> Result<BTreeMap<String, String>> {
        let out = self
            .pip(ctx, &["list".into(), "--format=freeze".into()])
            .await?;
        Ok(parse_freeze_output(&out.stdout))
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn create_snapshot(&self, ctx: &DriverContext, snapshot_id: &str) -> Result<String> {
        let tag = format!("{}:{}-{}", self.snapshot_repository, ctx.env_id, snapshot_id);
        self.cli(&["commit".into(), Self::container_name(&ctx.env_id), tag.clone()])
            .await?;
        Ok(tag)
    }

    async fn restore_snapshot(&self, ctx: &DriverContext, location: &str) -> Result<()> {
        let name = Self::container_name(&ctx.env_id);
        if let Err(e) = self.cli(&["rm".into(), "-f".into(), name]).await {
            warn!(env_id = %ctx.env_id, error = %e, "Removing container before restore failed");
        }
        self.cli(&self.run_args(ctx, location)).await?;
        Ok(())
    }

    async fn delete_snapshot(&self, _ctx: &DriverContext, location: &str) -> Result<()> {
        self.cli(&["rmi".into(), location.to_string()]).await?;
        Ok(())
    }
}

/// Is `cli` resolvable through `PATH` (or an existing path itself)?
pub fn cli_available(cli: &str) -> bool {
    let candidate = Path::new(cli);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(cli).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::environment::EnvironmentConfig;

    fn ctx(config: EnvironmentConfig) -> DriverContext {
        DriverContext {
            env_id: "env-c1".into(),
            path: PathBuf::from("/tmp/testbox/container/env-c1"),
            config,
        }
    }

    #[test]
    fn test_run_args_carry_limits() {
        let driver = ContainerDriver::new(&ContainerEngineConfig::default());
        let args = driver.run_args(
            &ctx(EnvironmentConfig {
                network_isolation: true,
                cpu_cores: Some(0.5),
                memory_bytes: Some(268_435_456),
                ..Default::default()
            }),
            "python:3.12-slim",
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name testbox-env-c1"));
        assert!(joined.contains("-v /tmp/testbox/container/env-c1:/workspace"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--memory 268435456"));
        assert!(joined.ends_with("python:3.12-slim sleep infinity"));
    }

    #[test]
    fn test_default_run_has_no_limits() {
        let driver = ContainerDriver::new(&ContainerEngineConfig::default());
        let joined = driver.run_args(&ctx(EnvironmentConfig::default()), "img").join(" ");
        assert!(!joined.contains("--network"));
        assert!(!joined.contains("--cpus"));
    }

    #[test]
    fn test_cli_available() {
        assert!(cli_available("sh"));
        assert!(!cli_available("definitely-not-a-container-cli"));
        assert!(!cli_available("/nonexistent/docker"));
    }
}
