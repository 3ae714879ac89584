//! Per-environment package managers
//!
//! Each environment gets one [`PackageManager`], created on first use and
//! reused afterwards.  A manager serializes package operations on its own
//! environment, so installs into different environments never contend and
//! installs into the same one never interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::engine::environment::IsolatedEnvironment;
use crate::error::{Error, Result};
use crate::executor::PackageSpec;
use crate::installer::cache::PackageCache;
use crate::installer::index::PackageIndex;
use crate::installer::task::PackageOutcome;
use crate::installer::version::{Operator, Requirement, Version};
use crate::util::lock;

pub struct PackageManager {
    env_id: String,
    environment: Weak<IsolatedEnvironment>,
    index: Arc<dyn PackageIndex>,
    cache: Option<Arc<PackageCache>>,
    ops: tokio::sync::Mutex<()>,
    installed: Mutex<Option<BTreeMap<String, String>>>,
}

impl PackageManager {
    fn new(
        environment: &Arc<IsolatedEnvironment>,
        index: Arc<dyn PackageIndex>,
        cache: Option<Arc<PackageCache>>,
    ) -> Self {
        Self {
            env_id: environment.id().to_string(),
            environment: Arc::downgrade(environment),
            index,
            cache,
            ops: tokio::sync::Mutex::new(()),
            installed: Mutex::new(None),
        }
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    fn environment(&self) -> Result<Arc<IsolatedEnvironment>> {
        self.environment
            .upgrade()
            .ok_or_else(|| Error::not_found("environment", self.env_id.clone()))
    }

    /// Installed `name → version`, listed once and reused until the next
    /// install or uninstall.
    pub async fn installed_packages(&self, timeout: Duration) -> Result<BTreeMap<String, String>> {
        if let Some(listing) = lock(&self.installed).clone() {
            return Ok(listing);
        }
        let listing = self.environment()?.list_installed_packages(timeout).await?;
        *lock(&self.installed) = Some(listing.clone());
        Ok(listing)
    }

    fn invalidate_listing(&self) {
        lock(&self.installed).take();
    }

    /// Install one requirement.  Never fails as a whole: the outcome carries
    /// the error.
    pub async fn install(&self, req: &Requirement, upgrade: bool, timeout: Duration) -> PackageOutcome {
        let _guard = self.ops.lock().await;
        let start = Instant::now();
        let result = self.install_locked(req, upgrade, timeout).await;
        self.invalidate_listing();

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(from_cache) => PackageOutcome {
                requirement: req.to_string(),
                success: true,
                from_cache,
                error: None,
                duration_ms,
            },
            Err(e) => {
                warn!(env_id = %self.env_id, package = %req, error = %e, "Package install failed");
                PackageOutcome {
                    requirement: req.to_string(),
                    success: false,
                    from_cache: false,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        }
    }

    async fn install_locked(&self, req: &Requirement, upgrade: bool, timeout: Duration) -> Result<bool> {
        let environment = self.environment()?;
        let version = self.pick_version(req).await;

        let mut spec = match &version {
            Some(v) => PackageSpec::new(req.name.clone()).with_version(v.to_string()),
            // Let the backend resolve the range itself.
            None => PackageSpec::new(format!("{}{}", req.name, req.spec)),
        };
        spec.upgrade = upgrade;

        let mut from_cache = false;
        if let (Some(cache), Some(v)) = (&self.cache, &version) {
            match self.cached_artifact(cache, &req.name, v).await {
                Some(path) => {
                    spec.artifact = Some(path);
                    from_cache = true;
                }
                None => debug!(package = %req.name, version = %v, "No cached artifact; plain install"),
            }
        }

        environment.install_package(&spec, timeout).await?;
        info!(env_id = %self.env_id, package = %req.name, version = ?spec.version, from_cache, "Installed package");
        Ok(from_cache)
    }

    /// Exact pins are taken as written; ranges are resolved against the
    /// index.  `None` when the index cannot say.
    async fn pick_version(&self, req: &Requirement) -> Option<Version> {
        if let [clause] = req.spec.clauses() {
            if clause.op == Operator::Equal && !clause.wildcard {
                return clause.version.clone();
            }
        }
        match self.index.lookup(&req.name, None).await {
            Ok(meta) => req.spec.best_match(&meta.available_versions),
            Err(e) => {
                debug!(package = %req.name, error = %e, "Index lookup failed; version left to backend");
                None
            }
        }
    }

    async fn cached_artifact(
        &self,
        cache: &PackageCache,
        name: &str,
        version: &Version,
    ) -> Option<std::path::PathBuf> {
        let version_text = version.to_string();
        if let Some(path) = cache.get(name, &version_text) {
            return Some(path);
        }
        let url = match self.index.lookup(name, Some(version)).await {
            Ok(meta) => meta.artifact_url?,
            Err(_) => return None,
        };
        match cache.put(name, &version_text, &url).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(package = %name, version = %version_text, error = %e, "Caching artifact failed");
                None
            }
        }
    }

    pub async fn uninstall(&self, name: &str, timeout: Duration) -> Result<()> {
        let _guard = self.ops.lock().await;
        let result = self.environment()?.uninstall_package(name, timeout).await;
        self.invalidate_listing();
        result
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub managers: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Lazily built managers keyed by environment id.
pub struct PackageManagerPool {
    index: Arc<dyn PackageIndex>,
    cache: Option<Arc<PackageCache>>,
    managers: Mutex<HashMap<String, Arc<PackageManager>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PackageManagerPool {
    pub fn new(index: Arc<dyn PackageIndex>, cache: Option<Arc<PackageCache>>) -> Self {
        Self {
            index,
            cache,
            managers: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> Option<&Arc<PackageCache>> {
        self.cache.as_ref()
    }

    /// Manager for `environment`, built on first request.  A cached manager
    /// whose environment was dropped is replaced.
    pub fn get_or_create(&self, environment: &Arc<IsolatedEnvironment>) -> Arc<PackageManager> {
        let mut managers = lock(&self.managers);
        if let Some(existing) = managers.get(environment.id()) {
            if existing
                .environment
                .upgrade()
                .is_some_and(|e| Arc::ptr_eq(&e, environment))
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(existing);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(env_id = %environment.id(), "Creating package manager");
        let manager = Arc::new(PackageManager::new(
            environment,
            Arc::clone(&self.index),
            self.cache.clone(),
        ));
        managers.insert(environment.id().to_string(), Arc::clone(&manager));
        manager
    }

    pub fn remove(&self, env_id: &str) -> bool {
        lock(&self.managers).remove(env_id).is_some()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            managers: lock(&self.managers).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::engine::environment::tests::mock_env;
    use crate::installer::index::StaticIndex;
    use crate::installer::version::VersionSpec;

    const T: Duration = Duration::from_secs(5);

    fn index() -> Arc<dyn PackageIndex> {
        Arc::new(
            StaticIndex::new()
                .with_package("requests", "2.30.0", &[])
                .unwrap()
                .with_package("requests", "2.31.0", &[])
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_pool_reuses_manager_per_environment() {
        let pool = PackageManagerPool::new(index(), None);
        let (a, _) = mock_env("env-pool-a");
        let (b, _) = mock_env("env-pool-b");
        let (a, b) = (Arc::new(a), Arc::new(b));

        let first = pool.get_or_create(&a);
        let again = pool.get_or_create(&a);
        let other = pool.get_or_create(&b);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(
            pool.stats(),
            PoolStats {
                managers: 2,
                hits: 1,
                misses: 2
            }
        );

        assert!(pool.remove("env-pool-a"));
        assert!(!Arc::ptr_eq(&first, &pool.get_or_create(&a)));
    }

    #[tokio::test]
    async fn test_range_resolved_against_index() {
        let (env, driver) = mock_env("env-pm-range");
        let env = Arc::new(env);
        env.activate().await.unwrap();
        let pool = PackageManagerPool::new(index(), None);
        let manager = pool.get_or_create(&env);

        let req = Requirement::new("requests", VersionSpec::parse(">=2.0,<2.31").unwrap());
        let outcome = manager.install(&req, false, T).await;
        assert!(outcome.success);
        assert_eq!(lock(&driver.packages).get("requests").unwrap(), "2.30.0");

        let listing = manager.installed_packages(T).await.unwrap();
        assert_eq!(listing.len(), 1);
    }

    #[tokio::test]
    async fn test_install_into_inactive_environment_fails_softly() {
        let (env, _) = mock_env("env-pm-inactive");
        let env = Arc::new(env);
        let pool = PackageManagerPool::new(index(), None);
        let outcome = pool
            .get_or_create(&env)
            .install(&Requirement::parse("requests").unwrap(), false, T)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("cannot"));
    }

    #[tokio::test]
    async fn test_artifact_cached_from_index_url() {
        let dir = tempfile::tempdir().unwrap();
        let wheel = dir.path().join("requests-2.31.0-py3-none-any.whl");
        std::fs::write(&wheel, b"PK\x03\x04requests").unwrap();

        let mut static_index = StaticIndex::new();
        static_index.add_package("requests", "2.31.0", &[]).unwrap();
        static_index
            .set_artifact_url("requests", "2.31.0", &wheel.display().to_string())
            .unwrap();
        let cache = Arc::new(
            PackageCache::open(CacheConfig {
                cache_dir: dir.path().join("cache"),
                ..CacheConfig::default()
            })
            .unwrap(),
        );

        let (env, _) = mock_env("env-pm-cache");
        let env = Arc::new(env);
        env.activate().await.unwrap();
        let pool = PackageManagerPool::new(Arc::new(static_index), Some(cache.clone()));
        let manager = pool.get_or_create(&env);

        let req = Requirement::parse("requests==2.31.0").unwrap();
        let first = manager.install(&req, false, T).await;
        assert!(first.success && first.from_cache);
        assert_eq!(cache.stats().entries, 1);

        let second = manager.install(&req, false, T).await;
        assert!(second.from_cache);
        assert_eq!(cache.stats().hits, 1);
    }
}
