//! Dependency resolution
//!
//! Breadth-first, depth-bounded expansion of a package's requirement graph
//! against a [`PackageIndex`].  A package reached through several paths gets
//! one node carrying the conjunction of every incoming specifier; a node
//! whose conjunction matches nothing records the conflicting requirements
//! instead of failing the resolve.  Missing metadata stops that branch only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::installer::index::PackageIndex;
use crate::installer::version::{normalize_name, Requirement, Version, VersionSpec};
use crate::util::lock;

/// `from` requires `to` with `spec`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub spec: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: String,
    /// Conjunction of every incoming specifier
    pub spec: VersionSpec,
    pub resolved_version: Option<Version>,
    pub required_by: BTreeSet<String>,
    pub requires: BTreeSet<String>,
    /// Requirements that could not be satisfied together
    pub conflicts: Vec<String>,
    pub depth: usize,
    pub available_versions: Vec<Version>,
    pub requires_python: Option<VersionSpec>,
    pub artifact_url: Option<String>,
}

impl DependencyNode {
    fn new(name: &str, spec: VersionSpec, depth: usize) -> Self {
        Self {
            name: name.to_string(),
            spec,
            resolved_version: None,
            required_by: BTreeSet::new(),
            requires: BTreeSet::new(),
            conflicts: Vec::new(),
            depth,
            available_versions: Vec::new(),
            requires_python: None,
            artifact_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyTree {
    /// Root package name, or the requirements file for multi-root trees
    pub root: String,
    pub roots: Vec<String>,
    pub nodes: BTreeMap<String, DependencyNode>,
    pub edges: BTreeSet<DependencyEdge>,
    /// Packages whose metadata could not be fetched
    pub unresolved: BTreeSet<String>,
}

impl DependencyTree {
    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(&normalize_name(name))
    }

    pub fn has_conflicts(&self) -> bool {
        self.nodes.values().any(|n| !n.conflicts.is_empty())
    }

    /// Resolved `name → version` for every node that resolved.
    pub fn pinned(&self) -> BTreeMap<String, Version> {
        self.nodes
            .values()
            .filter_map(|n| n.resolved_version.clone().map(|v| (n.name.clone(), v)))
            .collect()
    }

    /// Dependencies before dependents.  Fails on a cycle.
    pub fn install_order(&self) -> Result<Vec<String>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| {
                let deps = n.requires.iter().filter(|d| self.nodes.contains_key(*d)).count();
                (n.name.as_str(), deps)
            })
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            order.push(name.to_string());
            if let Some(node) = self.nodes.get(name) {
                for dependent in &node.required_by {
                    if let Some(count) = remaining.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(dependent.as_str());
                        }
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(Error::CyclicDependency(
                remaining.keys().map(|k| k.to_string()).collect(),
            ));
        }
        Ok(order)
    }
}

pub struct DependencyResolver {
    index: Arc<dyn PackageIndex>,
    max_depth: usize,
    memo: Mutex<HashMap<(String, String), DependencyTree>>,
}

impl DependencyResolver {
    pub fn new(index: Arc<dyn PackageIndex>, max_depth: usize) -> Self {
        Self {
            index,
            max_depth,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<dyn PackageIndex> {
        &self.index
    }

    /// Resolve one root package.  Memoized per `(root, spec)`.
    pub async fn resolve(&self, root: &str, spec: &VersionSpec) -> Result<DependencyTree> {
        let root_req = Requirement::new(root, spec.clone());
        let key = (root_req.name.clone(), spec.to_string());
        if let Some(tree) = lock(&self.memo).get(&key) {
            debug!(root = %key.0, spec = %key.1, "Resolution cache hit");
            return Ok(tree.clone());
        }

        let tree = self.expand(root_req.name.clone(), vec![root_req]).await;
        lock(&self.memo).insert(key, tree.clone());
        Ok(tree)
    }

    /// Resolve every requirement of a requirements file as one tree.
    pub async fn resolve_requirements_file(&self, path: impl AsRef<Path>) -> Result<DependencyTree> {
        let path = path.as_ref();
        let requirements = parse_requirements_file(path)?;
        let mut joined: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
        joined.sort();
        let key = (path.display().to_string(), joined.join(";"));
        if let Some(tree) = lock(&self.memo).get(&key) {
            return Ok(tree.clone());
        }

        let tree = self.expand(path.display().to_string(), requirements).await;
        lock(&self.memo).insert(key, tree.clone());
        Ok(tree)
    }

    /// Drop memoized trees that contain `name`.
    pub fn invalidate(&self, name: &str) {
        let name = normalize_name(name);
        let mut memo = lock(&self.memo);
        let before = memo.len();
        memo.retain(|_, tree| !tree.nodes.contains_key(&name));
        debug!(package = %name, dropped = before - memo.len(), "Invalidated resolutions");
    }

    pub fn clear_cache(&self) {
        lock(&self.memo).clear();
    }

    /// Number of memoized trees.
    pub fn cached_trees(&self) -> usize {
        lock(&self.memo).len()
    }

    async fn expand(&self, label: String, roots: Vec<Requirement>) -> DependencyTree {
        let mut tree = DependencyTree {
            root: label,
            roots: Vec::new(),
            nodes: BTreeMap::new(),
            edges: BTreeSet::new(),
            unresolved: BTreeSet::new(),
        };
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        let mut queue = VecDeque::new();

        for req in roots {
            let node = tree
                .nodes
                .entry(req.name.clone())
                .or_insert_with(|| DependencyNode::new(&req.name, VersionSpec::any(), 0));
            node.spec = node.spec.intersect(&req.spec);
            incoming
                .entry(req.name.clone())
                .or_default()
                .push(format!("(root) requires {req}"));
            if !tree.roots.contains(&req.name) {
                tree.roots.push(req.name.clone());
                queue.push_back((req.name.clone(), 0usize));
            }
        }

        let mut expanded = HashSet::new();
        while let Some((name, depth)) = queue.pop_front() {
            if !expanded.insert(name.clone()) {
                continue;
            }
            let spec = match tree.nodes.get(&name) {
                Some(node) => node.spec.clone(),
                None => continue,
            };

            let newest = match self.index.lookup(&name, None).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(package = %name, error = %e, "Metadata unavailable; branch not expanded");
                    tree.unresolved.insert(name.clone());
                    continue;
                }
            };
            let Some(chosen) = spec.best_match(&newest.available_versions) else {
                if let Some(node) = tree.nodes.get_mut(&name) {
                    node.available_versions = newest.available_versions.clone();
                }
                debug!(package = %name, spec = %spec, "No available version satisfies");
                continue;
            };
            let meta = if chosen == newest.version {
                newest
            } else {
                match self.index.lookup(&name, Some(&chosen)).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(package = %name, version = %chosen, error = %e, "Release metadata unavailable");
                        tree.unresolved.insert(name.clone());
                        continue;
                    }
                }
            };

            if let Some(node) = tree.nodes.get_mut(&name) {
                node.resolved_version = Some(chosen.clone());
                node.available_versions = meta.available_versions.clone();
                node.requires_python = meta.requires_python.clone();
                node.artifact_url = meta.artifact_url.clone();
            }
            if depth >= self.max_depth {
                debug!(package = %name, depth, "Depth limit reached");
                continue;
            }

            for req in &meta.requirements {
                if req.name == name {
                    continue;
                }
                tree.edges.insert(DependencyEdge {
                    from: name.clone(),
                    to: req.name.clone(),
                    spec: req.spec.to_string(),
                });
                incoming
                    .entry(req.name.clone())
                    .or_default()
                    .push(format!("{name} requires {req}"));

                let dep = tree
                    .nodes
                    .entry(req.name.clone())
                    .or_insert_with(|| DependencyNode::new(&req.name, VersionSpec::any(), depth + 1));
                dep.spec = dep.spec.intersect(&req.spec);
                dep.required_by.insert(name.clone());
                if let Some(node) = tree.nodes.get_mut(&name) {
                    node.requires.insert(req.name.clone());
                }
                queue.push_back((req.name.clone(), depth + 1));
            }
        }

        // Specs can tighten after a node was expanded; re-check every node
        // against its final conjunction.
        for node in tree.nodes.values_mut() {
            if node.available_versions.is_empty() {
                continue;
            }
            let satisfied = node
                .resolved_version
                .as_ref()
                .is_some_and(|v| node.spec.matches(v));
            if satisfied {
                continue;
            }
            match node.spec.best_match(&node.available_versions) {
                Some(version) => node.resolved_version = Some(version),
                None => {
                    node.resolved_version = None;
                    node.conflicts = incoming.remove(&node.name).unwrap_or_default();
                }
            }
        }

        info!(
            root = %tree.root,
            nodes = tree.nodes.len(),
            edges = tree.edges.len(),
            unresolved = tree.unresolved.len(),
            "Dependency tree resolved"
        );
        tree
    }
}

/// Parse a requirements file, following `-r` / `--requirement` includes
/// relative to the including file.
pub fn parse_requirements_file(path: impl AsRef<Path>) -> Result<Vec<Requirement>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    parse_into(path.as_ref(), &mut seen, &mut out)?;
    Ok(out)
}

fn parse_into(path: &Path, seen: &mut HashSet<PathBuf>, out: &mut Vec<Requirement>) -> Result<()> {
    let canonical = path
        .canonicalize()
        .map_err(|e| Error::external(format!("read requirements {:?}", path), e))?;
    if !seen.insert(canonical.clone()) {
        debug!(path = ?path, "Requirements file already included");
        return Ok(());
    }
    let text = std::fs::read_to_string(&canonical)?;
    let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();

    for (lineno, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let include = line
            .strip_prefix("-r ")
            .or_else(|| line.strip_prefix("--requirement "))
            .or_else(|| line.strip_prefix("--requirement="));
        if let Some(target) = include {
            parse_into(&base.join(target.trim()), seen, out)?;
            continue;
        }
        if line.starts_with('-') {
            debug!(path = ?path, line = lineno + 1, option = line, "Skipping requirements option");
            continue;
        }
        let req = Requirement::parse(line).map_err(|e| {
            Error::InvalidInput(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
        out.push(req);
    }
    Ok(())
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(i) => &line[..i],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::index::StaticIndex;

    fn index() -> Arc<dyn PackageIndex> {
        let index = StaticIndex::new()
            .with_package("app", "1.0", &["web>=2.0", "db"])
            .unwrap()
            .with_package("web", "1.5", &["util"])
            .unwrap()
            .with_package("web", "2.1", &["util>=1.0", "templates"])
            .unwrap()
            .with_package("db", "0.9", &["util<2.0"])
            .unwrap()
            .with_package("util", "1.2", &[])
            .unwrap()
            .with_package("util", "2.3", &[])
            .unwrap()
            .with_package("ghostly", "1.0", &["missing-pkg"])
            .unwrap()
            .with_package("clash", "1.0", &["util>=3.0"])
            .unwrap();
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_resolves_shared_dependency_once() {
        let resolver = DependencyResolver::new(index(), 10);
        let tree = resolver.resolve("app", &VersionSpec::any()).await.unwrap();

        assert_eq!(tree.roots, vec!["app"]);
        let web = tree.node("web").unwrap();
        assert_eq!(web.resolved_version, Some(Version::parse("2.1").unwrap()));

        let util = tree.node("util").unwrap();
        assert_eq!(
            util.required_by.iter().cloned().collect::<Vec<_>>(),
            vec!["db", "web"]
        );
        // util>=1.0 AND util<2.0
        assert_eq!(util.resolved_version, Some(Version::parse("1.2").unwrap()));
        assert!(!tree.has_conflicts());
        assert!(tree.unresolved.contains("templates"));
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic_and_memoized() {
        let resolver = DependencyResolver::new(index(), 10);
        let first = resolver.resolve("app", &VersionSpec::any()).await.unwrap();
        let second = resolver.resolve("app", &VersionSpec::any()).await.unwrap();
        assert_eq!(first, second);

        assert_eq!(resolver.cached_trees(), 1);

        resolver.invalidate("util");
        assert_eq!(resolver.cached_trees(), 0);
        let third = resolver.resolve("app", &VersionSpec::any()).await.unwrap();
        assert_eq!(first.nodes, third.nodes);
        assert_eq!(first.edges, third.edges);

        resolver.invalidate("unrelated");
        assert_eq!(resolver.cached_trees(), 1);
        resolver.clear_cache();
        assert_eq!(resolver.cached_trees(), 0);
    }

    #[tokio::test]
    async fn test_missing_metadata_stops_branch_only() {
        let resolver = DependencyResolver::new(index(), 10);
        let tree = resolver.resolve("ghostly", &VersionSpec::any()).await.unwrap();
        assert!(tree.node("ghostly").unwrap().resolved_version.is_some());
        assert!(tree.unresolved.contains("missing-pkg"));
    }

    #[tokio::test]
    async fn test_unsatisfiable_conjunction_records_conflict() {
        let resolver = DependencyResolver::new(index(), 10);
        let tree = resolver
            .resolve("clash", &VersionSpec::any())
            .await
            .unwrap();
        let util = tree.node("util").unwrap();
        assert!(util.resolved_version.is_none());
        assert_eq!(util.conflicts, vec!["clash requires util>=3.0"]);
        assert!(tree.has_conflicts());
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let resolver = DependencyResolver::new(index(), 0);
        let tree = resolver.resolve("app", &VersionSpec::any()).await.unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.node("app").unwrap().resolved_version.is_some());
    }

    #[tokio::test]
    async fn test_install_order_puts_dependencies_first() {
        let resolver = DependencyResolver::new(index(), 10);
        let tree = resolver.resolve("app", &VersionSpec::any()).await.unwrap();
        let order = tree.install_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("util") < pos("web"));
        assert!(pos("util") < pos("db"));
        assert!(pos("web") < pos("app"));
        assert_eq!(order.last().map(String::as_str), Some("app"));
    }

    #[tokio::test]
    async fn test_install_order_cycle() {
        let index = StaticIndex::new()
            .with_package("ping", "1.0", &["pong"])
            .unwrap()
            .with_package("pong", "1.0", &["ping"])
            .unwrap();
        let resolver = DependencyResolver::new(Arc::new(index), 10);
        let tree = resolver.resolve("ping", &VersionSpec::any()).await.unwrap();
        assert!(matches!(
            tree.install_order(),
            Err(Error::CyclicDependency(names)) if names == vec!["ping", "pong"]
        ));
    }

    #[tokio::test]
    async fn test_requirements_file_with_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.txt"),
            "# shared\nutil>=1.0  # pinned below 2 elsewhere\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "-r base.txt\n--index-url https://example.invalid/simple\n\ndb\n",
        )
        .unwrap();

        let reqs = parse_requirements_file(dir.path().join("requirements.txt")).unwrap();
        let names: Vec<&str> = reqs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["util", "db"]);

        let resolver = DependencyResolver::new(index(), 10);
        let tree = resolver
            .resolve_requirements_file(dir.path().join("requirements.txt"))
            .await
            .unwrap();
        assert_eq!(tree.roots, vec!["util", "db"]);
        assert_eq!(
            tree.node("util").unwrap().resolved_version,
            Some(Version::parse("1.2").unwrap())
        );
    }

    #[test]
    fn test_bad_requirement_line_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        std::fs::write(&path, "six\n>=1.0\n").unwrap();
        match parse_requirements_file(&path) {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains(":2:")),
            other => panic!("expected invalid input, got {other:?}"),
        }
    }
}
