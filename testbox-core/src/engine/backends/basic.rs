//! Directory sandbox: a plain directory with a private `site-packages`.
//!
//! Packages go in with `pip install --target`, commands run with the
//! directory as working dir and `PYTHONPATH` pointing at the private
//! `site-packages`.  The cheapest engine, and the least isolated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::executor::{run_checked, run_command, DriverContext, EnvironmentDriver, ExecutionOutput, PackageSpec};
use crate::util::{copy_dir, replace_dir};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicEngineConfig {
    pub base_dir: PathBuf,
    /// Host interpreter used for pip
    pub python: String,
}

impl Default for BasicEngineConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("testbox").join("basic"),
            python: "python3".to_string(),
        }
    }
}

pub struct DirectoryDriver {
    python: String,
    snapshot_root: PathBuf,
}

impl DirectoryDriver {
    pub fn new(config: &BasicEngineConfig) -> Self {
        Self {
            python: config.python.clone(),
            snapshot_root: config.base_dir.join(".snapshots"),
        }
    }

    fn site_packages(path: &Path) -> PathBuf {
        path.join("site-packages")
    }

    fn python<'a>(&'a self, ctx: &'a DriverContext) -> &'a str {
        ctx.config.python.as_deref().unwrap_or(&self.python)
    }
}

#[async_trait]
impl EnvironmentDriver for DirectoryDriver {
    fn driver_type(&self) -> &str {
        "directory"
    }

    async fn activate(&self, ctx: &DriverContext) -> Result<()> {
        tokio::fs::create_dir_all(Self::site_packages(&ctx.path))
            .await
            .with_context(|| format!("cannot create site-packages in {:?}", ctx.path))
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
        let mut env = env.clone();
        env.insert(
            "PYTHONPATH".to_string(),
            Self::site_packages(&ctx.path).display().to_string(),
        );
        let cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| ctx.path.clone());
        run_command(&argv[0], &argv[1..], Some(&cwd), &env).await
    }

    async fn install_package(&self, ctx: &DriverContext, spec: &PackageSpec) -> Result<()> {
        let mut args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--no-input".to_string(),
            "--target".to_string(),
            Self::site_packages(&ctx.path).display().to_string(),
        ];
        if spec.upgrade {
            args.push("--upgrade".to_string());
        }
        args.push(spec.install_target());
        run_checked(self.python(ctx), &args, Some(&ctx.path), &HashMap::new()).await?;
        Ok(())
    }

    async fn uninstall_package(&self, ctx: &DriverContext, name: &str) -> Result<()> {
        // `pip --target` has no uninstall; drop the package and its metadata.
        let site = Self::site_packages(&ctx.path);
        let normalized = name.to_lowercase().replace('-', "_");
        let mut entries = tokio::fs::read_dir(&site)
            .await
            .with_context(|| format!("cannot read {:?}", site))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_lowercase();
            let matches_pkg = file_name == normalized
                || file_name == format!("{normalized}.py")
                || (file_name.starts_with(&format!("{normalized}-"))
                    && (file_name.ends_with(".dist-info") || file_name.ends_with(".egg-info")));
            if !matches_pkg {
                continue;
            }
            let path = entry.path();
            debug!(path = ?path, "Removing package files");
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn list_installed_packages(&self, ctx: &DriverContext) -> Result<BTreeMap<String, String>> {
        let site = Self::site_packages(&ctx.path);
        let mut packages = BTreeMap::new();
        if !site.exists() {
            return Ok(packages);
        }
        let mut entries = tokio::fs::read_dir(&site).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some((name, version)) = parse_dist_info(&file_name) {
                packages.insert(name, version);
            }
        }
        Ok(packages)
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn create_snapshot(&self, ctx: &DriverContext, snapshot_id: &str) -> Result<String> {
        let target = self.snapshot_root.join(&ctx.env_id).join(snapshot_id);
        let source = ctx.path.clone();
        let dest = target.clone();
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

/// `requests-2.31.0.dist-info` → `("requests", "2.31.0")`.
pub(crate) fn parse_dist_info(file_name: &str) -> Option<(String, String)> {
    let stem = file_name
        .strip_suffix(".dist-info")
        .or_else(|| file_name.strip_suffix(".egg-info"))?;
    let (name, version) = stem.rsplit_once('-')?;
    Some((name.to_lowercase().replace('_', "-"), version.to_string()))
}
