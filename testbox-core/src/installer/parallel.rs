//! Parallel Installer
//!
//! A fixed pool of workers drains one priority queue of installation tasks
//! into isolated environments.
//!
//! # Concurrency Model:
//! - Workers are tokio tasks.  Each admitted install runs in its own spawned
//!   task whose `JoinHandle` is the panic boundary: a crashing install turns
//!   into a failed result, never a dead worker or a leaked slot.
//! - Admission goes through the [`ResourceMonitor`]; the slot is an RAII
//!   permit dropped after the install task is joined.
//! - Higher tiers drain first and a running task is never preempted.
//!   Cancellation only reaches tasks that are still queued.
//! - A worker that keeps failing backs off exponentially and gives up after
//!   `max_consecutive_worker_errors`.
//!
//! # Locking:
//! Queue, running set and results live behind one mutex, paired with a
//! `Notify` for new work.  The resource monitor has its own lock; the two
//! are never held together.  No lock is held across an `.await`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InstallerConfig;
use crate::engine::environment::IsolatedEnvironment;
use crate::error::{Error, Result};
use crate::installer::cache::PackageCache;
use crate::installer::conflict::{parse_installed, ConflictDetector, IncompatibilityRule, Severity};
use crate::installer::index::PackageIndex;
use crate::installer::monitor::{HostSampler, ResourceLimits, ResourceMonitor, SystemSampler};
use crate::installer::package_manager::PackageManagerPool;
use crate::installer::queue::{DependencyState, Dispatch, TaskQueue};
use crate::installer::resolver::{DependencyResolver, DependencyTree};
use crate::installer::task::{
    parse_packages, InstallRequest, InstallationResult, InstallationTask, TaskFindings,
    TaskPriority, TaskStatus,
};
use crate::installer::version::{Requirement, Version};
use crate::metrics::{InstallTimer, InstallerMetrics, InstallerMetricsSnapshot};
use crate::util::lock;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub active_installs: usize,
    pub live_workers: usize,
}

struct TaskTable {
    queue: TaskQueue,
    running: HashMap<String, TaskPriority>,
    completed: HashMap<String, InstallationResult>,
    cancelled: HashSet<String>,
    known: HashSet<String>,
    /// Finished and cancelled ids, oldest first
    retired: VecDeque<String>,
    retain: usize,
}

impl TaskTable {
    fn new(capacity: usize, retain: usize) -> Self {
        Self {
            queue: TaskQueue::new(capacity),
            running: HashMap::new(),
            completed: HashMap::new(),
            cancelled: HashSet::new(),
            known: HashSet::new(),
            retired: VecDeque::new(),
            retain,
        }
    }

    /// Note `id` as finished and forget the oldest finished tasks beyond
    /// the retention cap.
    fn retire(&mut self, id: String) {
        self.retired.push_back(id);
        while self.completed.len() + self.cancelled.len() > self.retain {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            self.forget(&oldest);
        }
    }

    fn forget(&mut self, id: &str) -> Option<InstallationResult> {
        self.cancelled.remove(id);
        self.known.remove(id);
        self.completed.remove(id)
    }
}

fn dependency_state(
    task: &InstallationTask,
    known: &HashSet<String>,
    completed: &HashMap<String, InstallationResult>,
    cancelled: &HashSet<String>,
) -> DependencyState {
    let mut pending = false;
    for dep in &task.depends_on {
        if !known.contains(dep) {
            return DependencyState::Failed(format!("dependency task '{dep}' is no longer tracked"));
        }
        if cancelled.contains(dep) {
            return DependencyState::Failed(format!("dependency task '{dep}' was cancelled"));
        }
        match completed.get(dep) {
            Some(result) if !result.success => {
                return DependencyState::Failed(format!("dependency task '{dep}' failed"));
            }
            Some(_) => {}
            None => pending = true,
        }
    }
    if pending {
        DependencyState::Pending
    } else {
        DependencyState::Ready
    }
}

/// State shared by the installer handle and its workers.
struct Shared {
    config: InstallerConfig,
    table: Mutex<TaskTable>,
    work: Notify,
    finished: Notify,
    monitor: Arc<ResourceMonitor>,
    pool: PackageManagerPool,
    resolver: DependencyResolver,
    detector: ConflictDetector,
    metrics: InstallerMetrics,
    python_version: Option<Version>,
    live_workers: AtomicUsize,
}

pub struct InstallerBuilder {
    config: InstallerConfig,
    index: Arc<dyn PackageIndex>,
    cache: Option<Arc<PackageCache>>,
    sampler: Arc<dyn SystemSampler>,
    rules: Vec<IncompatibilityRule>,
}

impl InstallerBuilder {
    pub fn cache(mut self, cache: Arc<PackageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn SystemSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn incompatibilities(mut self, rules: Vec<IncompatibilityRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn build(self) -> ParallelInstaller {
        let python_version = self.config.python_version.as_deref().and_then(|raw| {
            Version::parse(raw)
                .map_err(|e| warn!(python = %raw, error = %e, "Ignoring unparseable python_version"))
                .ok()
        });
        let monitor = Arc::new(ResourceMonitor::new(
            ResourceLimits::from(&self.config),
            self.sampler,
        ));
        let shared = Shared {
            table: Mutex::new(TaskTable::new(
                self.config.max_queue_size,
                self.config.max_retained_results,
            )),
            work: Notify::new(),
            finished: Notify::new(),
            monitor,
            pool: PackageManagerPool::new(Arc::clone(&self.index), self.cache),
            resolver: DependencyResolver::new(Arc::clone(&self.index), self.config.resolve_depth),
            detector: ConflictDetector::new(self.index).with_rules(self.rules),
            metrics: InstallerMetrics::default(),
            python_version,
            live_workers: AtomicUsize::new(0),
            config: self.config,
        };

        ParallelInstaller {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }
}

pub struct ParallelInstaller {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl ParallelInstaller {
    pub fn builder(config: &InstallerConfig, index: Arc<dyn PackageIndex>) -> InstallerBuilder {
        InstallerBuilder {
            config: config.clone(),
            index,
            cache: None,
            sampler: Arc::new(HostSampler::new()),
            rules: Vec::new(),
        }
    }

    pub fn new(config: &InstallerConfig, index: Arc<dyn PackageIndex>) -> Self {
        Self::builder(config, index).build()
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.shared.monitor
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.shared.resolver
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.shared.detector
    }

    pub fn cache(&self) -> Option<&Arc<PackageCache>> {
        self.shared.pool.cache()
    }

    // ── lifecycle ──

    /// Spawn the worker pool.  Calling it again while workers run is a no-op.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        workers.retain(|h| !h.is_finished());
        if !workers.is_empty() {
            debug!("Installer already started");
            return;
        }

        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();
        for worker_id in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            shared.live_workers.fetch_add(1, Ordering::SeqCst);
            workers.push(tokio::spawn(worker_loop(shared, worker_id, token.clone())));
        }
        info!(workers = self.shared.config.workers, "Parallel installer started");
    }

    /// Stop the workers.  Running installs finish; queued tasks stay queued
    /// and run after the next [`start`](Self::start).
    pub async fn stop(&self) {
        lock(&self.shutdown).cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Parallel installer stopped");
    }

    /// Started, not stopped, and no worker left running.
    fn workers_exhausted(&self) -> bool {
        let workers = lock(&self.workers);
        !workers.is_empty() && self.shared.live_workers.load(Ordering::SeqCst) == 0
    }

    // ── submission ──

    /// Validate, pre-check and enqueue.  Returns the task id.
    ///
    /// Malformed input fails here; dependency resolution and conflict
    /// detection are advisory and only ever add findings to the task.
    /// Submission is refused while the pool is started but every worker
    /// has given up; [`start`](Self::start) respawns them.
    pub async fn submit_task(&self, request: InstallRequest) -> Result<String> {
        if self.workers_exhausted() {
            error!("Task rejected: every installer worker has stopped");
            return Err(Error::state_conflict("submit task", "no installer worker is alive"));
        }
        let packages = parse_packages(&request.packages)?;
        let status = request.environment.status();
        if status.is_terminal() {
            return Err(Error::state_conflict(
                format!("install into environment '{}'", request.environment.id()),
                status,
            ));
        }
        {
            let table = lock(&self.shared.table);
            if let Some(unknown) = request.depends_on.iter().find(|d| !table.known.contains(*d)) {
                return Err(Error::not_found("task", unknown.clone()));
            }
        }

        let findings = self.precheck(&request.environment, &packages).await;
        let id = format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let task = InstallationTask {
            id: id.clone(),
            environment: Arc::downgrade(&request.environment),
            env_id: request.environment.id().to_string(),
            packages,
            priority: request.priority,
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.shared.config.default_max_retries),
            depends_on: request.depends_on,
            callback: request.callback,
            upgrade: request.upgrade,
            timeout: request.timeout,
            submitted_at: Utc::now(),
            findings,
        };

        {
            let mut table = lock(&self.shared.table);
            table.queue.push(task)?;
            table.known.insert(id.clone());
        }
        self.shared.metrics.record_submitted();
        self.shared.work.notify_waiters();
        info!(task_id = %id, env_id = %request.environment.id(), priority = %request.priority, "Task queued");
        Ok(id)
    }

    async fn precheck(&self, environment: &Arc<IsolatedEnvironment>, packages: &[Requirement]) -> TaskFindings {
        let shared = &self.shared;
        let limit = shared.config.install_timeout();
        let mut findings = TaskFindings::default();

        let mut trees: Vec<DependencyTree> = Vec::new();
        for req in packages {
            match tokio::time::timeout(limit, shared.resolver.resolve(&req.name, &req.spec)).await {
                Ok(Ok(tree)) => trees.push(tree),
                Ok(Err(e)) => findings.warnings.push(format!("resolve {req}: {e}")),
                Err(_) => findings.warnings.push(format!("resolve {req}: timed out")),
            }
        }
        for tree in &trees {
            match tree.install_order() {
                Ok(order) => {
                    for name in order {
                        if !findings.install_order.contains(&name) {
                            findings.install_order.push(name);
                        }
                    }
                }
                Err(e) => findings.warnings.push(format!("order {}: {e}", tree.root)),
            }
            findings.unresolved.extend(tree.unresolved.iter().cloned());
        }
        findings.unresolved.sort();
        findings.unresolved.dedup();

        if !environment.is_active() {
            findings
                .warnings
                .push("environment not active; conflict check skipped".into());
            return findings;
        }
        let manager = shared.pool.get_or_create(environment);
        let installed = match manager.installed_packages(limit).await {
            Ok(raw) => parse_installed(&raw),
            Err(e) => {
                findings.warnings.push(format!("list installed packages: {e}"));
                return findings;
            }
        };

        let detector = &shared.detector;
        match detector.detect_version_conflicts(&installed).await {
            Ok(found) => findings.conflicts.extend(found),
            Err(e) => findings.warnings.push(format!("direct conflicts: {e}")),
        }
        for tree in &trees {
            match detector.detect_transitive_conflicts(tree, &installed).await {
                Ok(found) => findings.conflicts.extend(found),
                Err(e) => findings.warnings.push(format!("transitive conflicts: {e}")),
            }
        }
        match detector
            .detect_incompatible(&installed, shared.python_version.as_ref())
            .await
        {
            Ok(found) => findings.conflicts.extend(found),
            Err(e) => findings.warnings.push(format!("incompatibilities: {e}")),
        }

        // What the environment would hold once these trees are installed.
        let mut proposed = installed.clone();
        for tree in &trees {
            proposed.extend(tree.pinned());
        }
        if proposed != installed {
            match detector.detect_version_conflicts(&proposed).await {
                Ok(found) => {
                    for mut record in found {
                        let known = findings.conflicts.iter().any(|c| {
                            c.package == record.package && c.requirements == record.requirements
                        });
                        if !known {
                            record.installed_version = installed.get(&record.package).cloned();
                            findings.conflicts.push(record);
                        }
                    }
                }
                Err(e) => findings.warnings.push(format!("proposed conflicts: {e}")),
            }
        }

        let errors = findings
            .conflicts
            .iter()
            .filter(|c| c.severity == Severity::Error)
            .count();
        if errors > 0 {
            warn!(env_id = %environment.id(), errors, "Submitting despite version conflicts");
        }
        findings
    }

    // ── queries ──

    /// Cancel a task that is still queued.  `Ok(false)` when it is already
    /// running or finished.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let mut table = lock(&self.shared.table);
        if !table.known.contains(task_id) {
            return Err(Error::not_found("task", task_id));
        }
        if table.queue.cancel(task_id).is_none() {
            return Ok(false);
        }
        table.cancelled.insert(task_id.to_string());
        table.retire(task_id.to_string());
        drop(table);

        self.shared.metrics.record_cancelled();
        self.shared.finished.notify_waiters();
        // Dependents of a cancelled task can now be failed.
        self.shared.work.notify_waiters();
        info!(task_id = %task_id, "Task cancelled");
        Ok(true)
    }

    pub fn get_task_status(&self, task_id: &str) -> TaskStatus {
        let table = lock(&self.shared.table);
        if table.running.contains_key(task_id) {
            TaskStatus::Running
        } else if let Some(result) = table.completed.get(task_id) {
            if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            }
        } else if table.cancelled.contains(task_id) {
            TaskStatus::Cancelled
        } else if table.queue.contains(task_id) {
            TaskStatus::Queued
        } else {
            TaskStatus::Unknown
        }
    }

    pub fn get_result(&self, task_id: &str) -> Option<InstallationResult> {
        lock(&self.shared.table).completed.get(task_id).cloned()
    }

    /// Remove and return a finished task's result.  The id is forgotten.
    pub fn take_result(&self, task_id: &str) -> Option<InstallationResult> {
        let mut table = lock(&self.shared.table);
        if !table.completed.contains_key(task_id) {
            return None;
        }
        table.forget(task_id)
    }

    /// Forget every finished and cancelled task.  Returns how many.
    pub fn clear_finished(&self) -> usize {
        let mut table = lock(&self.shared.table);
        let ids: Vec<String> = table.retired.drain(..).collect();
        let before = table.completed.len() + table.cancelled.len();
        for id in &ids {
            table.forget(id);
        }
        let cleared = before - table.completed.len() - table.cancelled.len();
        debug!(cleared, "Finished tasks cleared");
        cleared
    }

    /// Ids of every task that has a recorded result.
    pub fn completed_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.table).completed.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Block the caller until every id has finished or `timeout` elapses.
    /// Ids still queued at the deadline are cancelled; running ones are
    /// abandoned.  Returns the results that exist.
    pub async fn wait_for_tasks(
        &self,
        task_ids: &[String],
        timeout: Duration,
    ) -> BTreeMap<String, InstallationResult> {
        let deadline = Instant::now() + timeout;
        let poll = self.shared.config.queue_poll_interval();

        loop {
            let notified = self.shared.finished.notified();
            let outstanding: Vec<String> = {
                let table = lock(&self.shared.table);
                task_ids
                    .iter()
                    .filter(|id| {
                        table.known.contains(*id)
                            && !table.completed.contains_key(*id)
                            && !table.cancelled.contains(*id)
                    })
                    .cloned()
                    .collect()
            };
            if outstanding.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(outstanding = outstanding.len(), "wait_for_tasks timed out");
                for id in &outstanding {
                    // Running tasks answer Ok(false) and are left alone.
                    let _ = self.cancel_task(id);
                }
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
            }
        }

        let table = lock(&self.shared.table);
        task_ids
            .iter()
            .filter_map(|id| table.completed.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }

    pub fn stats(&self) -> InstallerStats {
        let table = lock(&self.shared.table);
        let failed = table.completed.values().filter(|r| !r.success).count();
        InstallerStats {
            queued: table.queue.len(),
            running: table.running.len(),
            completed: table.completed.len() - failed,
            failed,
            cancelled: table.cancelled.len(),
            active_installs: self.shared.monitor.active_installs(),
            live_workers: self.shared.live_workers.load(Ordering::SeqCst),
        }
    }

    pub fn metrics(&self) -> InstallerMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Forget the package manager of an environment that was cleaned up.
    pub fn release_environment(&self, env_id: &str) -> bool {
        self.shared.pool.remove(env_id)
    }
}

impl Drop for ParallelInstaller {
    fn drop(&mut self) {
        lock(&self.shutdown).cancel();
    }
}

// ── workers ──

async fn worker_loop(shared: Arc<Shared>, worker_id: usize, cancel: CancellationToken) {
    debug!(worker_id, "Worker started");
    let poll = shared.config.queue_poll_interval();
    let max_errors = shared.config.max_consecutive_worker_errors.max(1);
    let mut consecutive_errors = 0u32;

    while !cancel.is_cancelled() {
        let notified = shared.work.notified();
        let next = {
            let mut guard = lock(&shared.table);
            let table = &mut *guard;
            let (known, completed, cancelled) = (&table.known, &table.completed, &table.cancelled);
            let next = table
                .queue
                .pop(|task| dependency_state(task, known, completed, cancelled));
            if let Some(Dispatch::Run(task)) = &next {
                table.running.insert(task.id.clone(), task.priority);
            }
            next
        };

        match next {
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Some(Dispatch::Abort(task, reason)) => {
                debug!(worker_id, task_id = %task.id, reason = %reason, "Task aborted before running");
                let result = InstallationResult::aborted(&task, reason);
                finish(&shared, task, result, false);
            }
            Some(Dispatch::Run(task)) => match run_task(&shared, task, &cancel).await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    shared.metrics.record_worker_error();
                    if consecutive_errors >= max_errors {
                        error!(worker_id, errors = consecutive_errors, error = %e, "Worker giving up");
                        break;
                    }
                    let backoff = backoff_delay(shared.config.worker_backoff_base_ms, consecutive_errors);
                    warn!(worker_id, error = %e, backoff_ms = backoff.as_millis() as u64, "Worker error; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
        }
    }

    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker_id, "Worker stopped");
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// Admit, install and record one task.  `Err` means the worker itself hit
/// trouble (admission timeout, crashed install); the task is still recorded.
async fn run_task(shared: &Arc<Shared>, task: InstallationTask, cancel: &CancellationToken) -> Result<()> {
    let permit = match shared
        .monitor
        .acquire(
            shared.config.admission_poll_interval(),
            shared.config.admission_timeout(),
            cancel,
        )
        .await
    {
        Ok(permit) => permit,
        Err(_) if cancel.is_cancelled() => {
            debug!(task_id = %task.id, "Shutdown during admission; task requeued");
            let mut table = lock(&shared.table);
            table.running.remove(&task.id);
            table.queue.finish(task.priority);
            table.queue.requeue(task);
            return Ok(());
        }
        Err(e) => {
            let result = InstallationResult::aborted(&task, e.to_string());
            finish(shared, task, result, false);
            return Err(e);
        }
    };

    let install = tokio::spawn(install_task(Arc::clone(shared), task.clone()));
    let joined = install.await;
    drop(permit);

    match joined {
        Ok(result) => {
            finish(shared, task, result, true);
            Ok(())
        }
        Err(join_error) => {
            let reason = if join_error.is_panic() {
                "install panicked".to_string()
            } else {
                format!("install aborted: {join_error}")
            };
            error!(task_id = %task.id, reason = %reason, "Install task crashed");
            let result = InstallationResult::aborted(&task, reason.clone());
            finish(shared, task, result, true);
            Err(Error::external("install task", reason))
        }
    }
}

async fn install_task(shared: Arc<Shared>, task: InstallationTask) -> InstallationResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let Some(environment) = task.environment.upgrade() else {
        return InstallationResult::aborted(&task, format!("environment '{}' is gone", task.env_id));
    };
    if !environment.is_active() {
        return InstallationResult::aborted(
            &task,
            format!("environment '{}' is {}", task.env_id, environment.status()),
        );
    }

    info!(task_id = %task.id, env_id = %task.env_id, packages = task.packages.len(), attempt = task.retry_count + 1, "Installing");
    let manager = shared.pool.get_or_create(&environment);
    let timeout = task.timeout.unwrap_or_else(|| shared.config.install_timeout());

    let mut outcomes = Vec::with_capacity(task.packages.len());
    for req in &task.packages {
        let outcome = {
            let _timer = InstallTimer::new(&shared.metrics);
            manager.install(req, task.upgrade, timeout).await
        };
        shared.metrics.record_package(outcome.success);
        if outcome.from_cache {
            shared.metrics.record_cache_hit();
        }
        outcomes.push(outcome);
    }

    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.requirement.as_str())
        .collect();
    let error = (!failed.is_empty()).then(|| {
        format!(
            "{} of {} packages failed: {}",
            failed.len(),
            outcomes.len(),
            failed.join(", ")
        )
    });

    InstallationResult {
        task_id: task.id.clone(),
        env_id: task.env_id.clone(),
        success: error.is_none(),
        started_at,
        finished_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
        attempts: task.retry_count + 1,
        error,
        findings: task.findings.clone(),
        outcomes,
    }
}

/// Record a finished attempt, or requeue it when retries remain.  `ran`
/// tells whether the task held a running slot.
fn finish(shared: &Shared, task: InstallationTask, result: InstallationResult, ran: bool) {
    let retry = !result.success && ran && task.retry_count < task.max_retries;
    {
        let mut table = lock(&shared.table);
        table.running.remove(&task.id);
        if ran {
            table.queue.finish(task.priority);
        }
        if retry {
            let mut again = task.clone();
            again.retry_count += 1;
            table.queue.requeue(again);
        } else {
            table.completed.insert(task.id.clone(), result.clone());
            table.retire(task.id.clone());
        }
    }
    shared.work.notify_waiters();

    if retry {
        shared.metrics.record_retry();
        info!(task_id = %task.id, attempt = task.retry_count + 1, "Install failed; retrying");
        return;
    }

    shared.metrics.record_finished(result.success);
    shared.finished.notify_waiters();
    info!(
        task_id = %task.id,
        success = result.success,
        succeeded = result.succeeded(),
        failed = result.failed(),
        duration_ms = result.duration_ms,
        "Task finished"
    );

    if let Some(callback) = &task.callback {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
            warn!(task_id = %task.id, "Task callback panicked");
        }
    }
}
