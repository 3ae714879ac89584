//! Package index contract
//!
//! The resolver and the conflict detector only ever ask one question: "what
//! does `name` (at `version`, or its newest release) require, and which
//! versions exist?".  [`StaticIndex`] answers it from memory or a JSON file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::installer::version::{normalize_name, Requirement, Version, VersionSpec};

/// Everything the installer needs to know about one release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: Version,
    pub requirements: Vec<Requirement>,
    /// Every published version of the package, ascending
    pub available_versions: Vec<Version>,
    pub requires_python: Option<VersionSpec>,
    pub artifact_url: Option<String>,
}

#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Metadata for `name` at `version`, or at its newest final release when
    /// `version` is `None`.  Unknown packages are `NotFound`.
    async fn lookup(&self, name: &str, version: Option<&Version>) -> Result<PackageMetadata>;
}

/// One release as stored in a [`StaticIndex`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Release {
    pub requires: Vec<Requirement>,
    pub requires_python: Option<VersionSpec>,
    pub artifact_url: Option<String>,
}

/// In-memory index, loadable from JSON of the shape
/// `{"packages": {"name": {"1.0": {"requires": ["dep>=2"]}}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticIndex {
    packages: BTreeMap<String, BTreeMap<String, Release>>,
}

impl StaticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let parsed: StaticIndex = serde_json::from_str(&raw)?;
        // Re-key through `add_release` so names and versions are validated
        // and normalized.
        let mut index = StaticIndex::new();
        for (name, releases) in parsed.packages {
            for (version, release) in releases {
                index.add_release(&name, &version, release)?;
            }
        }
        debug!(path = ?path, packages = index.packages.len(), "Loaded static package index");
        Ok(index)
    }

    pub fn add_release(&mut self, name: &str, version: &str, release: Release) -> Result<()> {
        let version = Version::parse(version)?;
        self.packages
            .entry(normalize_name(name))
            .or_default()
            .insert(version.to_string(), release);
        Ok(())
    }

    /// Add `name==version` requiring each entry of `requires`.
    pub fn add_package(&mut self, name: &str, version: &str, requires: &[&str]) -> Result<()> {
        let requires = requires
            .iter()
            .map(|r| Requirement::parse(r))
            .collect::<Result<Vec<_>>>()?;
        self.add_release(
            name,
            version,
            Release {
                requires,
                ..Default::default()
            },
        )
    }

    /// Builder form of [`add_package`](Self::add_package).
    pub fn with_package(mut self, name: &str, version: &str, requires: &[&str]) -> Result<Self> {
        self.add_package(name, version, requires)?;
        Ok(self)
    }

    fn release_mut(&mut self, name: &str, version: &str) -> Result<&mut Release> {
        let key = Version::parse(version)?.to_string();
        let name = normalize_name(name);
        self.packages
            .get_mut(&name)
            .and_then(|r| r.get_mut(&key))
            .ok_or_else(|| Error::not_found("package release", format!("{name}=={key}")))
    }

    pub fn set_requires_python(&mut self, name: &str, version: &str, spec: &str) -> Result<()> {
        let spec = VersionSpec::parse(spec)?;
        self.release_mut(name, version)?.requires_python = Some(spec);
        Ok(())
    }

    pub fn set_artifact_url(&mut self, name: &str, version: &str, url: &str) -> Result<()> {
        self.release_mut(name, version)?.artifact_url = Some(url.to_string());
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn versions_of(releases: &BTreeMap<String, Release>) -> Vec<Version> {
        let mut versions: Vec<Version> = releases
            .keys()
            .filter_map(|v| Version::parse(v).ok())
            .collect();
        versions.sort();
        versions
    }
}

#[async_trait]
impl PackageIndex for StaticIndex {
    async fn lookup(&self, name: &str, version: Option<&Version>) -> Result<PackageMetadata> {
        let name = normalize_name(name);
        let releases = self
            .packages
            .get(&name)
            .ok_or_else(|| Error::not_found("package", name.clone()))?;
        let available = Self::versions_of(releases);

        let chosen = match version {
            Some(v) => available
                .iter()
                .find(|a| *a == v)
                .cloned()
                .ok_or_else(|| Error::not_found("package release", format!("{name}=={v}")))?,
            None => VersionSpec::any()
                .best_match(&available)
                .ok_or_else(|| Error::not_found("package release", name.clone()))?,
        };
        let release = releases
            .get(&chosen.to_string())
            .cloned()
            .unwrap_or_default();

        Ok(PackageMetadata {
            name,
            version: chosen,
            requirements: release.requires,
            available_versions: available,
            requires_python: release.requires_python,
            artifact_url: release.artifact_url,
        })
    }
}
