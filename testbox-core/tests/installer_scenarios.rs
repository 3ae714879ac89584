//! End-to-end installer scenarios against an in-memory driver.
//!
//! The driver keeps an event log of install starts and ends so tests can
//! assert on scheduling order, and can be told to fail or panic per package.

use anyhow::bail;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testbox_core::executor::{DriverContext, EnvironmentDriver, ExecutionOutput, PackageSpec};
use testbox_core::installer::{
    ConflictKind, FixedSampler, IncompatibilityRule, InstallRequest, ParallelInstaller,
    ResourceSample, Severity, StaticIndex, TaskPriority, TaskStatus,
};
use testbox_core::{EnvironmentConfig, Error, InstallerConfig, IsolatedEnvironment};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct ScriptedDriver {
    delay: Duration,
    events: Mutex<Vec<String>>,
    /// package → failures still to report
    failures: Mutex<HashMap<String, u32>>,
    packages: Mutex<BTreeMap<String, String>>,
}

impl ScriptedDriver {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn fail(&self, package: &str, times: u32) {
        self.failures.lock().unwrap().insert(package.to_string(), times);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvironmentDriver for ScriptedDriver {
    fn driver_type(&self) -> &str {
        "scripted"
    }

    async fn activate(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deactivate(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn release(&self, _ctx: &DriverContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &DriverContext,
        argv: &[String],
        _env: &HashMap<String, String>,
        _cwd: Option<&Path>,
    ) -> anyhow::Result<ExecutionOutput> {
        Ok(ExecutionOutput {
            exit_code: 0,
            stdout: argv.join(" "),
            stderr: String::new(),
            duration_ms: 0,
        })
    }

    async fn install_package(&self, _ctx: &DriverContext, spec: &PackageSpec) -> anyhow::Result<()> {
        if spec.name == "boom" {
            panic!("driver crashed installing boom");
        }
        self.events.lock().unwrap().push(format!("start:{}", spec.name));
        tokio::time::sleep(self.delay).await;

        let should_fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&spec.name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            bail!("mirror unavailable for {}", spec.name);
        }

        self.events.lock().unwrap().push(format!("end:{}", spec.name));
        self.packages.lock().unwrap().insert(
            spec.name.clone(),
            spec.version.clone().unwrap_or_else(|| "1.0".into()),
        );
        Ok(())
    }

    async fn uninstall_package(&self, _ctx: &DriverContext, name: &str) -> anyhow::Result<()> {
        self.packages.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_installed_packages(
        &self,
        _ctx: &DriverContext,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.packages.lock().unwrap().clone())
    }
}

fn config(workers: usize) -> InstallerConfig {
    InstallerConfig {
        workers,
        max_concurrent_installs: workers,
        queue_poll_interval_ms: 10,
        admission_poll_interval_ms: 5,
        admission_timeout_ms: 5_000,
        worker_backoff_base_ms: 5,
        ..InstallerConfig::default()
    }
}

fn installer_with(workers: usize, index: StaticIndex) -> ParallelInstaller {
    ParallelInstaller::builder(&config(workers), Arc::new(index))
        .sampler(Arc::new(FixedSampler(ResourceSample::default())))
        .build()
}

fn installer(workers: usize) -> ParallelInstaller {
    installer_with(workers, StaticIndex::new())
}

async fn active_env(id: &str, driver: Arc<ScriptedDriver>) -> Arc<IsolatedEnvironment> {
    let env = Arc::new(IsolatedEnvironment::new(
        id,
        std::env::temp_dir().join("testbox-it").join(id),
        "scripted",
        EnvironmentConfig::default(),
        driver,
    ));
    env.activate().await.unwrap();
    env
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_critical_tier_drains_before_low() {
    let driver = Arc::new(ScriptedDriver::with_delay(Duration::from_millis(20)));
    let env = active_env("env-tiers", driver.clone()).await;
    let installer = installer(2);

    let mut ids = Vec::new();
    for i in 0..10 {
        let request = InstallRequest::new(&env)
            .package(format!("low-{i}"))
            .priority(TaskPriority::Low);
        ids.push(installer.submit_task(request).await.unwrap());
    }
    for name in ["crit-a", "crit-b"] {
        let request = InstallRequest::new(&env)
            .package(name)
            .priority(TaskPriority::Critical);
        ids.push(installer.submit_task(request).await.unwrap());
    }
    assert_eq!(installer.stats().queued, 12);

    installer.start();
    let results = installer.wait_for_tasks(&ids, WAIT).await;
    installer.stop().await;

    assert_eq!(results.len(), 12);
    assert!(results.values().all(|r| r.success));

    let events = driver.events();
    let last_critical_end = events
        .iter()
        .rposition(|e| e.starts_with("end:crit-"))
        .unwrap();
    let first_low_start = events
        .iter()
        .position(|e| e.starts_with("start:low-"))
        .unwrap();
    assert!(
        last_critical_end < first_low_start,
        "low tier started before critical drained: {events:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_task_never_completes() {
    let driver = Arc::new(ScriptedDriver::default());
    let env = active_env("env-cancel", driver.clone()).await;
    let installer = installer(1);

    let doomed = installer
        .submit_task(InstallRequest::new(&env).package("doomed"))
        .await
        .unwrap();
    let kept = installer
        .submit_task(InstallRequest::new(&env).package("kept"))
        .await
        .unwrap();

    assert!(installer.cancel_task(&doomed).unwrap());
    assert!(!installer.cancel_task(&doomed).unwrap());
    assert_eq!(installer.get_task_status(&doomed), TaskStatus::Cancelled);
    assert!(matches!(
        installer.cancel_task("task-missing"),
        Err(Error::NotFound { .. })
    ));

    installer.start();
    let results = installer.wait_for_tasks(&[kept.clone()], WAIT).await;
    installer.stop().await;

    assert!(results[&kept].success);
    assert!(!installer.completed_tasks().contains(&doomed));
    assert!(installer.get_result(&doomed).is_none());
    assert!(!driver.events().iter().any(|e| e.contains("doomed")));
    assert_eq!(installer.stats().cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_driver_panic_is_contained() {
    let driver = Arc::new(ScriptedDriver::default());
    let env = active_env("env-panic", driver.clone()).await;
    let installer = installer(2);
    installer.start();

    let crashed = installer
        .submit_task(InstallRequest::new(&env).package("boom"))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[crashed.clone()], WAIT).await;

    let result = &results[&crashed];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(installer.monitor().active_installs(), 0);
    assert_eq!(installer.get_task_status(&crashed), TaskStatus::Failed);

    // The pool keeps serving after the crash.
    let after = installer
        .submit_task(InstallRequest::new(&env).package("steady"))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[after.clone()], WAIT).await;
    assert!(results[&after].success);
    assert_eq!(installer.stats().live_workers, 2);
    installer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_refused_once_every_worker_gave_up() {
    let driver = Arc::new(ScriptedDriver::default());
    let env = active_env("env-no-workers", driver.clone()).await;
    let installer = ParallelInstaller::builder(
        &InstallerConfig {
            max_consecutive_worker_errors: 1,
            ..config(1)
        },
        Arc::new(StaticIndex::new()),
    )
    .sampler(Arc::new(FixedSampler(ResourceSample::default())))
    .build();
    installer.start();

    let crashed = installer
        .submit_task(InstallRequest::new(&env).package("boom"))
        .await
        .unwrap();
    installer.wait_for_tasks(&[crashed], WAIT).await;
    for _ in 0..200 {
        if installer.stats().live_workers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(installer.stats().live_workers, 0);

    let refused = installer
        .submit_task(InstallRequest::new(&env).package("steady"))
        .await;
    assert!(matches!(refused, Err(Error::StateConflict { .. })));
    assert_eq!(installer.stats().queued, 0);

    installer.start();
    let id = installer
        .submit_task(InstallRequest::new(&env).package("steady"))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;
    assert!(results[&id].success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_until_success() {
    let driver = Arc::new(ScriptedDriver::default());
    driver.fail("flaky", 2);
    let env = active_env("env-retry", driver.clone()).await;
    let installer = installer(1);
    installer.start();

    let id = installer
        .submit_task(InstallRequest::new(&env).package("flaky").max_retries(2))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;

    let result = &results[&id];
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(installer.metrics().tasks_retried, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_exhausted() {
    let driver = Arc::new(ScriptedDriver::default());
    driver.fail("broken", 10);
    let env = active_env("env-exhausted", driver.clone()).await;
    let installer = installer(1);
    installer.start();

    let id = installer
        .submit_task(InstallRequest::new(&env).package("broken").max_retries(1))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;

    let result = &results[&id];
    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.failed(), 1);
    assert!(result.error.as_deref().unwrap().contains("broken"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependent_of_failed_task_is_not_run() {
    let driver = Arc::new(ScriptedDriver::default());
    driver.fail("base", 10);
    let env = active_env("env-chain", driver.clone()).await;
    let installer = installer(2);

    let base = installer
        .submit_task(InstallRequest::new(&env).package("base"))
        .await
        .unwrap();
    let child = installer
        .submit_task(
            InstallRequest::new(&env)
                .package("child")
                .depends_on(base.clone()),
        )
        .await
        .unwrap();

    installer.start();
    let results = installer
        .wait_for_tasks(&[base.clone(), child.clone()], WAIT)
        .await;
    installer.stop().await;

    assert!(!results[&base].success);
    assert!(!results[&child].success);
    assert!(results[&child].outcomes.is_empty());
    assert!(!driver.events().iter().any(|e| e.contains("child")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_reports_installed_conflicts() {
    let index = StaticIndex::new()
        .with_package("app", "1.0", &["lib<2"])
        .unwrap()
        .with_package("lib", "1.5", &[])
        .unwrap()
        .with_package("lib", "2.0", &[])
        .unwrap();
    let driver = Arc::new(ScriptedDriver::default());
    {
        let mut packages = driver.packages.lock().unwrap();
        packages.insert("app".into(), "1.0".into());
        packages.insert("lib".into(), "2.0".into());
    }
    let env = active_env("env-conflict", driver.clone()).await;
    let installer = installer_with(1, index);
    installer.start();

    let id = installer
        .submit_task(InstallRequest::new(&env).package("extra"))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;

    let findings = &results[&id].findings;
    let conflict = findings
        .conflicts
        .iter()
        .find(|c| c.package == "lib")
        .unwrap();
    assert_eq!(conflict.severity, Severity::Error);
    assert_eq!(findings.unresolved, vec!["extra".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_reports_conflicts_the_request_would_introduce() {
    let index = StaticIndex::new()
        .with_package("app", "1.0", &["lib<2"])
        .unwrap()
        .with_package("lib", "1.5", &[])
        .unwrap()
        .with_package("lib", "3.0", &[])
        .unwrap();
    let driver = Arc::new(ScriptedDriver::default());
    {
        let mut packages = driver.packages.lock().unwrap();
        packages.insert("app".into(), "1.0".into());
        packages.insert("lib".into(), "1.5".into());
    }
    let env = active_env("env-proposed", driver.clone()).await;
    let installer = installer_with(1, index);

    let id = installer
        .submit_task(InstallRequest::new(&env).package("lib==3.0"))
        .await
        .unwrap();
    installer.start();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;

    let findings = &results[&id].findings;
    let conflict = findings
        .conflicts
        .iter()
        .find(|c| c.package == "lib")
        .unwrap_or_else(|| panic!("no conflict on lib: {findings:?}"));
    assert_eq!(conflict.severity, Severity::Error);
    assert!(conflict.requirements[0].contains("app==1.0"));
    assert_eq!(conflict.installed_version.as_ref().map(|v| v.to_string()), Some("1.5".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_reports_configured_incompatibilities() {
    let driver = Arc::new(ScriptedDriver::default());
    {
        let mut packages = driver.packages.lock().unwrap();
        packages.insert("torch".into(), "1.9".into());
        packages.insert("numpy".into(), "2.1".into());
    }
    let env = active_env("env-rules", driver.clone()).await;
    let installer = ParallelInstaller::builder(&config(1), Arc::new(StaticIndex::new()))
        .sampler(Arc::new(FixedSampler(ResourceSample::default())))
        .incompatibilities(vec![
            IncompatibilityRule::new("torch", "<2.0", "numpy", ">=2.0").unwrap(),
        ])
        .build();
    installer.start();

    let id = installer
        .submit_task(InstallRequest::new(&env).package("extra"))
        .await
        .unwrap();
    let results = installer.wait_for_tasks(&[id.clone()], WAIT).await;
    installer.stop().await;

    let conflict = results[&id]
        .findings
        .conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::Incompatible)
        .unwrap();
    assert_eq!(conflict.package, "torch");
    assert_eq!(conflict.severity, Severity::Warning);
    assert!(conflict.requirements[0].contains("numpy==2.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_request_rejected() {
    let driver = Arc::new(ScriptedDriver::default());
    let env = active_env("env-invalid", driver).await;
    let installer = installer(1);

    let err = installer
        .submit_task(InstallRequest::new(&env).package("==1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(matches!(
        installer
            .submit_task(InstallRequest::new(&env).package("ok").depends_on("task-nope"))
            .await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(installer.stats().queued, 0);
}
