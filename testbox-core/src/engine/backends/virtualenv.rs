//! Virtualenv sandbox: `python -m venv` plus the venv's own pip.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::executor::{
    parse_freeze_output, run_checked, run_command, DriverContext, EnvironmentDriver,
    ExecutionOutput, PackageSpec,
};
use crate::util::{copy_dir, replace_dir};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualenvEngineConfig {
    pub base_dir: PathBuf,
    /// Interpreter used to create the venv
    pub python: String,
    pub system_site_packages: bool,
}

impl Default for VirtualenvEngineConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("testbox").join("virtualenv"),
            python: "python3".to_string(),
            system_site_packages: false,
        }
    }
}

pub struct VirtualenvDriver {
    python: String,
    system_site_packages: bool,
    snapshot_root: PathBuf,
}

impl VirtualenvDriver {
    pub fn new(config: &VirtualenvEngineConfig) -> Self {
        Self {
            python: config.python.clone(),
            system_site_packages: config.system_site_packages,
            snapshot_root: config.base_dir.join(".snapshots"),
        }
    }

    fn bin_dir(path: &Path) -> PathBuf {
        if cfg!(windows) {
            path.join("venv").join("Scripts")
        } else {
            path.join("venv").join("bin")
        }
    }

    fn venv_python(path: &Path) -> String {
        Self::bin_dir(path).join("python").display().to_string()
    }

    async fn pip(&self, ctx: &DriverContext, args: &[&str]) -> Result<ExecutionOutput> {
        let mut argv = vec!["-m".to_string(), "pip".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_checked(&Self::venv_python(&ctx.path), &argv, Some(&ctx.path), &HashMap::new()).await
    }
}

#[async_trait]
impl EnvironmentDriver for VirtualenvDriver {
    fn driver_type(&self) -> &str {
        "virtualenv"
    }

    async fn activate(&self, ctx: &DriverContext) -> Result<()> {
        if Self::bin_dir(&ctx.path).join("python").exists() {
            debug!(env_id = %ctx.env_id, "Virtualenv already built");
            return Ok(());
        }
        let python = ctx.config.python.as_deref().unwrap_or(&self.python);
        let mut args = vec!["-m".to_string(), "venv".to_string()];
        if self.system_site_packages {
            args.push("--system-site-packages".to_string());
        }
        args.push(ctx.path.join("venv").display().to_string());
        run_checked(python, &args, Some(&ctx.path), &HashMap::new())
            .await
            .context("virtualenv creation failed")?;
        Ok(())
    }

    async fn deactivate(&self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }

    async fn release(&self, ctx: &DriverContext) -> Result<()> {
        if ctx.path.exists() {
            tokio::fs::remove_dir_all(&ctx.path)
                .await
                .with_context(|| format!("cannot remove {:?}", ctx.path))?;
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
        let bin = Self::bin_dir(&ctx.path);
        let mut env = env.clone();
        let host_path = std::env::var("PATH").unwrap_or_default();
        env.insert("PATH".to_string(), format!("{}:{host_path}", bin.display()));
        env.insert(
            "VIRTUAL_ENV".to_string(),
            ctx.path.join("venv").display().to_string(),
        );
        let cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| ctx.path.clone());
        run_command(&argv[0], &argv[1..], Some(&cwd), &env).await
    }

    async fn install_package(&self, ctx: &DriverContext, spec: &PackageSpec) -> Result<()> {
        let target = spec.install_target();
        let mut args = vec!["install", "--no-input"];
        if spec.upgrade {
            args.push("--upgrade");
        }
        args.push(&target);
        self.pip(ctx, &args).await?;
        Ok(())
    }

    async fn uninstall_package(&self, ctx: &DriverContext, name: &str) -> Result<()> {
        self.pip(ctx, &["uninstall", "-y", name]).await?;
        Ok(())
    }

    async fn list_installed_packages(&self, ctx: &DriverContext) -> Result<BTreeMap<String, String>> {
        let output = self.pip(ctx, &["list", "--format=freeze"]).await?;
        Ok(parse_freeze_output(&output.stdout))
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn create_snapshot(&self, ctx: &DriverContext, snapshot_id: &str) -> Result<String> {
        let target = self.snapshot_root.join(&ctx.env_id).join(snapshot_id);
        let (source, dest) = (ctx.path.clone(), target.clone());
        tokio::task::spawn_blocking(move || copy_dir(&source, &dest)).await??;
        Ok(target.display().to_string())
    }

    async fn restore_snapshot(&self, ctx: &DriverContext, location: &str) -> Result<()> {
        let source = PathBuf::from(location);
        anyhow::ensure!(source.is_dir(), "snapshot directory {location} is missing");
        let dest = ctx.path.clone();
        tokio::task::spawn_blocking(move || replace_dir(&source, &dest)).await??;
        Ok(())
    }

    async fn delete_snapshot(&self, _ctx: &DriverContext, location: &str) -> Result<()> {
        let path = PathBuf::from(location);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venv_layout() {
        let python = VirtualenvDriver::venv_python(Path::new("/sandboxes/env-1"));
        if cfg!(windows) {
            assert!(python.ends_with("Scripts/python") || python.ends_with("Scripts\\python"));
        } else {
            assert_eq!(python, "/sandboxes/env-1/venv/bin/python");
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = VirtualenvEngineConfig::default();
        assert_eq!(config.python, "python3");
        assert!(!config.system_site_packages);
        let driver = VirtualenvDriver::new(&config);
        assert_eq!(driver.driver_type(), "virtualenv");
        assert!(driver.supports_snapshots());
    }
}
