//! Version conflict detection
//!
//! Classifies conflicts over a flat `name → version` map of installed
//! packages:
//!
//! - **direct**: an installed package's declared range is violated by the
//!   version installed next to it
//! - **transitive**: the same check along the edges of a resolved
//!   [`DependencyTree`]
//! - **incompatible**: interpreter mismatches and configured bad pairs
//!
//! Each record may carry a suggested version.  Suggestions are the newest
//! available version inside the intersection of every applicable range, and
//! are re-checked once against the installed set; the outcome of that check
//! is the confidence.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::installer::index::PackageIndex;
use crate::installer::resolver::DependencyTree;
use crate::installer::version::{normalize_name, Requirement, Version, VersionSpec};

/// Suggestion re-checked with no new violations.
pub const CONFIDENCE_VERIFIED: f64 = 0.9;
/// Suggestion whose own metadata could not be fetched.
pub const CONFIDENCE_UNVERIFIED: f64 = 0.7;
/// Suggestion that would itself violate an installed package.
pub const CONFIDENCE_NEW_VIOLATIONS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Direct,
    Transitive,
    Incompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub version: Version,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub package: String,
    pub kind: ConflictKind,
    /// Human-readable requirement strings, e.g. `a==1.0 requires b>=2.0`
    pub requirements: Vec<String>,
    pub severity: Severity,
    pub installed_version: Option<Version>,
    pub suggestion: Option<Suggestion>,
}

impl ConflictRecord {
    pub fn confidence(&self) -> f64 {
        self.suggestion.as_ref().map_or(0.0, |s| s.confidence)
    }
}

/// `package` in `spec` must not be installed alongside `other` in `other_spec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncompatibilityRule {
    pub package: String,
    pub spec: VersionSpec,
    pub other: String,
    pub other_spec: VersionSpec,
}

impl IncompatibilityRule {
    pub fn new(package: &str, spec: &str, other: &str, other_spec: &str) -> Result<Self> {
        Ok(Self {
            package: normalize_name(package),
            spec: VersionSpec::parse(spec)?,
            other: normalize_name(other),
            other_spec: VersionSpec::parse(other_spec)?,
        })
    }
}

/// Turn a driver's `name → version` listing into comparable versions.
/// Entries with unparseable versions are skipped.
pub fn parse_installed(raw: &BTreeMap<String, String>) -> BTreeMap<String, Version> {
    raw.iter()
        .filter_map(|(name, version)| match Version::parse(version) {
            Ok(v) => Some((normalize_name(name), v)),
            Err(e) => {
                debug!(package = %name, version = %version, error = %e, "Skipping unparseable installed version");
                None
            }
        })
        .collect()
}

pub struct ConflictDetector {
    index: Arc<dyn PackageIndex>,
    rules: Vec<IncompatibilityRule>,
}

impl ConflictDetector {
    pub fn new(index: Arc<dyn PackageIndex>) -> Self {
        Self {
            index,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<IncompatibilityRule>) -> Self {
        self.rules = rules;
        self
    }

    // ── direct ──

    /// Check every installed package's declared requirements against the
    /// versions installed next to it.  One record per violated package.
    pub async fn detect_version_conflicts(
        &self,
        installed: &BTreeMap<String, Version>,
    ) -> Result<Vec<ConflictRecord>> {
        // target -> (requirer strings that violate, every spec on the target)
        let mut violated: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut specs: BTreeMap<String, Vec<VersionSpec>> = BTreeMap::new();

        for (name, version) in installed {
            let Some(requirements) = self.requirements_of(name, version).await else {
                continue;
            };
            for req in requirements {
                let Some(current) = installed.get(&req.name) else {
                    continue;
                };
                specs.entry(req.name.clone()).or_default().push(req.spec.clone());
                if !req.spec.matches(current) {
                    violated
                        .entry(req.name.clone())
                        .or_default()
                        .push(format!("{name}=={version} requires {req}"));
                }
            }
        }

        let mut records = Vec::with_capacity(violated.len());
        for (package, requirements) in violated {
            let applicable = specs.remove(&package).unwrap_or_default();
            let suggestion = self.suggest(&package, &applicable, installed).await;
            records.push(ConflictRecord {
                installed_version: installed.get(&package).cloned(),
                package,
                kind: ConflictKind::Direct,
                requirements,
                severity: Severity::Error,
                suggestion,
            });
        }
        Ok(records)
    }

    /// Check raw requirement strings declared by `requirer` against the
    /// installed set.  Unparseable lines are reported at `info`.
    pub async fn check_declared(
        &self,
        requirer: &str,
        declared: &[String],
        installed: &BTreeMap<String, Version>,
    ) -> Vec<ConflictRecord> {
        let mut records = Vec::new();
        for raw in declared {
            let req = match Requirement::parse(raw) {
                Ok(req) => req,
                Err(e) => {
                    records.push(ConflictRecord {
                        package: raw.trim().to_string(),
                        kind: ConflictKind::Direct,
                        requirements: vec![format!("{requirer} declares unparseable '{raw}': {e}")],
                        severity: Severity::Info,
                        installed_version: None,
                        suggestion: None,
                    });
                    continue;
                }
            };
            let Some(current) = installed.get(&req.name) else {
                continue;
            };
            if req.spec.matches(current) {
                continue;
            }
            let suggestion = self
                .suggest(&req.name, std::slice::from_ref(&req.spec), installed)
                .await;
            records.push(ConflictRecord {
                package: req.name.clone(),
                kind: ConflictKind::Direct,
                requirements: vec![format!("{requirer} requires {req}")],
                severity: Severity::Error,
                installed_version: Some(current.clone()),
                suggestion,
            });
        }
        records
    }

    // ── transitive ──

    /// Check the edges of a resolved tree against installed versions.  An
    /// edge from a package that is itself installed is an `error`; an edge
    /// that only the not-yet-installed part of the tree carries is a
    /// `warning`.  Nodes whose combined range matched nothing are reported
    /// without a suggestion.
    pub async fn detect_transitive_conflicts(
        &self,
        tree: &DependencyTree,
        installed: &BTreeMap<String, Version>,
    ) -> Result<Vec<ConflictRecord>> {
        let mut violated: BTreeMap<String, (Vec<String>, Severity)> = BTreeMap::new();
        let mut specs: BTreeMap<String, Vec<VersionSpec>> = BTreeMap::new();

        for edge in &tree.edges {
            let Some(current) = installed.get(&edge.to) else {
                continue;
            };
            let spec = match VersionSpec::parse(&edge.spec) {
                Ok(spec) => spec,
                Err(e) => {
                    debug!(from = %edge.from, to = %edge.to, error = %e, "Unparseable edge specifier");
                    continue;
                }
            };
            specs.entry(edge.to.clone()).or_default().push(spec.clone());
            if spec.matches(current) {
                continue;
            }
            let severity = if installed.contains_key(&edge.from) {
                Severity::Error
            } else {
                Severity::Warning
            };
            let entry = violated
                .entry(edge.to.clone())
                .or_insert_with(|| (Vec::new(), severity));
            entry.0.push(format!("{} requires {}{}", edge.from, edge.to, edge.spec));
            entry.1 = entry.1.max(severity);
        }

        let mut records = Vec::new();
        for (package, (requirements, severity)) in violated {
            let applicable = specs.remove(&package).unwrap_or_default();
            let suggestion = self.suggest(&package, &applicable, installed).await;
            records.push(ConflictRecord {
                installed_version: installed.get(&package).cloned(),
                package,
                kind: ConflictKind::Transitive,
                requirements,
                severity,
                suggestion,
            });
        }

        for node in tree.nodes.values().filter(|n| !n.conflicts.is_empty()) {
            if records.iter().any(|r| r.package == node.name) {
                continue;
            }
            records.push(ConflictRecord {
                package: node.name.clone(),
                kind: ConflictKind::Transitive,
                requirements: node.conflicts.clone(),
                severity: Severity::Warning,
                installed_version: installed.get(&node.name).cloned(),
                suggestion: None,
            });
        }
        Ok(records)
    }

    // ── incompatible ──

    /// Interpreter mismatches (`error`) and configured bad pairs (`warning`).
    pub async fn detect_incompatible(
        &self,
        installed: &BTreeMap<String, Version>,
        python_version: Option<&Version>,
    ) -> Result<Vec<ConflictRecord>> {
        let mut records = Vec::new();

        if let Some(python) = python_version {
            for (name, version) in installed {
                let meta = match self.index.lookup(name, Some(version)).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        debug!(package = %name, error = %e, "No metadata for interpreter check");
                        continue;
                    }
                };
                let Some(requires_python) = meta.requires_python else {
                    continue;
                };
                if requires_python.matches(python) {
                    continue;
                }
                let suggestion = self
                    .suggest_for_python(name, &meta.available_versions, python, installed)
                    .await;
                records.push(ConflictRecord {
                    package: name.clone(),
                    kind: ConflictKind::Incompatible,
                    requirements: vec![format!(
                        "{name}=={version} requires python{requires_python}, running {python}"
                    )],
                    severity: Severity::Error,
                    installed_version: Some(version.clone()),
                    suggestion,
                });
            }
        }

        for rule in &self.rules {
            let (Some(mine), Some(theirs)) = (installed.get(&rule.package), installed.get(&rule.other))
            else {
                continue;
            };
            if !(rule.spec.matches(mine) && rule.other_spec.matches(theirs)) {
                continue;
            }
            let avoid = exclude(&rule.spec);
            let suggestion = match avoid {
                Some(spec) => self.suggest(&rule.package, &[spec], installed).await,
                None => None,
            };
            records.push(ConflictRecord {
                package: rule.package.clone(),
                kind: ConflictKind::Incompatible,
                requirements: vec![format!(
                    "{}=={mine} is incompatible with {}=={theirs} ({}{} vs {}{})",
                    rule.package, rule.other, rule.package, rule.spec, rule.other, rule.other_spec
                )],
                severity: Severity::Warning,
                installed_version: Some(mine.clone()),
                suggestion,
            });
        }
        Ok(records)
    }

    /// Every detector, most severe first.
    pub async fn detect_all(
        &self,
        installed: &BTreeMap<String, Version>,
        tree: Option<&DependencyTree>,
        python_version: Option<&Version>,
    ) -> Result<Vec<ConflictRecord>> {
        let mut records = self.detect_version_conflicts(installed).await?;
        if let Some(tree) = tree {
            records.extend(self.detect_transitive_conflicts(tree, installed).await?);
        }
        records.extend(self.detect_incompatible(installed, python_version).await?);
        records.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.package.cmp(&b.package))
        });
        Ok(records)
    }

    /// Keep records whose suggestion meets `threshold`.  Records without a
    /// suggestion are dropped.
    pub fn filter_by_confidence(conflicts: &[ConflictRecord], threshold: f64) -> Vec<ConflictRecord> {
        conflicts
            .iter()
            .filter(|c| c.suggestion.is_some() && c.confidence() >= threshold)
            .cloned()
            .collect()
    }

    // ── suggestions ──

    async fn requirements_of(&self, name: &str, version: &Version) -> Option<Vec<Requirement>> {
        match self.index.lookup(name, Some(version)).await {
            Ok(meta) => Some(meta.requirements),
            Err(e) => {
                warn!(package = %name, version = %version, error = %e, "No metadata; skipping conflict check");
                None
            }
        }
    }

    async fn suggest(
        &self,
        package: &str,
        specs: &[VersionSpec],
        installed: &BTreeMap<String, Version>,
    ) -> Option<Suggestion> {
        let available = match self.index.lookup(package, None).await {
            Ok(meta) => meta.available_versions,
            Err(e) => {
                debug!(package = %package, error = %e, "No versions known; no suggestion");
                return None;
            }
        };
        let combined = specs
            .iter()
            .fold(VersionSpec::any(), |acc, spec| acc.intersect(spec));
        let version = combined.best_match(&available)?;
        let confidence = self.revalidate(package, &version, installed).await;
        Some(Suggestion {
            version,
            confidence,
        })
    }

    async fn suggest_for_python(
        &self,
        package: &str,
        available: &[Version],
        python: &Version,
        installed: &BTreeMap<String, Version>,
    ) -> Option<Suggestion> {
        let mut candidates: Vec<&Version> = available.iter().filter(|v| !v.is_prerelease()).collect();
        candidates.sort();
        for candidate in candidates.into_iter().rev() {
            let Ok(meta) = self.index.lookup(package, Some(candidate)).await else {
                continue;
            };
            if meta.requires_python.as_ref().map_or(true, |s| s.matches(python)) {
                let confidence = self.revalidate(package, candidate, installed).await;
                return Some(Suggestion {
                    version: candidate.clone(),
                    confidence,
                });
            }
        }
        None
    }

    /// One level deep: do the suggested release's own requirements hold
    /// against what is installed?
    async fn revalidate(
        &self,
        package: &str,
        version: &Version,
        installed: &BTreeMap<String, Version>,
    ) -> f64 {
        let requirements = match self.index.lookup(package, Some(version)).await {
            Ok(meta) => meta.requirements,
            Err(_) => return CONFIDENCE_UNVERIFIED,
        };
        let clean = requirements.iter().all(|req| {
            req.name == package
                || installed
                    .get(&req.name)
                    .map_or(true, |current| req.spec.matches(current))
        });
        if clean {
            CONFIDENCE_VERIFIED
        } else {
            CONFIDENCE_NEW_VIOLATIONS
        }
    }
}

/// A spec matching exactly what `spec` excludes, when that is expressible
/// as a single range.
fn exclude(spec: &VersionSpec) -> Option<VersionSpec> {
    let [clause] = spec.clauses() else {
        return None;
    };
    let text = clause.to_string();
    let inverted = if let Some(rest) = text.strip_prefix(">=") {
        format!("<{rest}")
    } else if let Some(rest) = text.strip_prefix("<=") {
        format!(">{rest}")
    } else if let Some(rest) = text.strip_prefix("==") {
        if rest.starts_with('=') {
            return None;
        }
        format!("!={rest}")
    } else if let Some(rest) = text.strip_prefix('>') {
        format!("<={rest}")
    } else if let Some(rest) = text.strip_prefix('<') {
        format!(">={rest}")
    } else {
        return None;
    };
    VersionSpec::parse(&inverted).ok()
}
