//! Operational Counters
//!
//! Lightweight tracking for the manager and the installer.
//!
//! # Design Goals:
//! - Lock-free atomic counters, `Relaxed` ordering
//! - Reads never block writers; `snapshot()` copies into a plain struct

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    (total_ns.load(Ordering::Relaxed) as f64) / (c as f64) / 1_000_000.0
}

/// Counters kept by [`IsolationManager`](crate::IsolationManager).
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub environments_created: AtomicU64,
    pub environment_create_time_ns: AtomicU64,
    pub environments_cleaned: AtomicU64,
    pub cleanup_failures: AtomicU64,
    pub migrations: AtomicU64,
    pub snapshots_created: AtomicU64,
}

impl ManagerMetrics {
    pub fn record_create(&self, duration: Duration) {
        self.environments_created.fetch_add(1, Ordering::Relaxed);
        self.environment_create_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self, ok: bool) {
        if ok {
            self.environments_cleaned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        ManagerMetricsSnapshot {
            environments_created: self.environments_created.load(Ordering::Relaxed),
            avg_create_ms: avg_duration_ms(
                &self.environments_created,
                &self.environment_create_time_ns,
            ),
            environments_cleaned: self.environments_cleaned.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerMetricsSnapshot {
    pub environments_created: u64,
    pub avg_create_ms: f64,
    pub environments_cleaned: u64,
    pub cleanup_failures: u64,
    pub migrations: u64,
    pub snapshots_created: u64,
}

/// Counters kept by [`ParallelInstaller`](crate::ParallelInstaller).
#[derive(Debug, Default)]
pub struct InstallerMetrics {
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub packages_installed: AtomicU64,
    pub packages_failed: AtomicU64,
    pub install_attempts: AtomicU64,
    pub install_time_ns: AtomicU64,
    pub cache_hits: AtomicU64,
    pub worker_errors: AtomicU64,
}

impl InstallerMetrics {
    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// One finished task attempt that was recorded as final.
    pub fn record_finished(&self, success: bool) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_package(&self, success: bool) {
        if success {
            self.packages_installed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_install(&self, duration: Duration) {
        self.install_attempts.fetch_add(1, Ordering::Relaxed);
        self.install_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_error(&self) {
        self.worker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InstallerMetricsSnapshot {
        InstallerMetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            packages_installed: self.packages_installed.load(Ordering::Relaxed),
            packages_failed: self.packages_failed.load(Ordering::Relaxed),
            avg_install_ms: avg_duration_ms(&self.install_attempts, &self.install_time_ns),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            worker_errors: self.worker_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallerMetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    pub packages_installed: u64,
    pub packages_failed: u64,
    pub avg_install_ms: f64,
    pub cache_hits: u64,
    pub worker_errors: u64,
}

/// Records one package install attempt on drop.
pub struct InstallTimer<'a> {
    start: Instant,
    metrics: &'a InstallerMetrics,
}

impl<'a> InstallTimer<'a> {
    pub fn new(metrics: &'a InstallerMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }
}

impl Drop for InstallTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_install(self.start.elapsed());
    }
}
