//! Install admission control
//!
//! A new install is admitted only while the number of running installs is
//! under its cap and the host's sampled CPU and memory load are under their
//! ceilings.  Admission is polled in short steps rather than waited on, so a
//! worker notices shutdown or a timeout promptly.
//!
//! # Locking:
//! The active-install counter has its own mutex.  It is never held together
//! with the installer's queue lock.  [`HostSampler`] keeps its `System`
//! behind a separate mutex taken only while sampling.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::InstallerConfig;
use crate::error::{Error, Result};
use crate::util::lock;

/// Host load at one instant, both in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub trait SystemSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Samples host CPU and memory through `sysinfo`.
///
/// CPU usage is the delta between two refreshes, so the first sample after
/// construction only reflects the time since [`HostSampler::new`].
pub struct HostSampler {
    system: Mutex<System>,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for HostSampler {
    fn sample(&self) -> ResourceSample {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return ResourceSample::default();
        }
        let mut system = lock(&self.system);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = f64::from(system.global_cpu_usage()).clamp(0.0, 100.0);
        let total = system.total_memory() as f64;
        let memory_percent = if total > 0.0 {
            let used = total - system.available_memory() as f64;
            (used / total * 100.0).clamp(0.0, 100.0)
        } else {
            debug!("Host reports no memory; treating it as idle");
            0.0
        };

        ResourceSample {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Always reports the same load.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedSampler(pub ResourceSample);

impl SystemSampler for FixedSampler {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_concurrent_installs: usize,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl From<&InstallerConfig> for ResourceLimits {
    fn from(config: &InstallerConfig) -> Self {
        Self {
            max_concurrent_installs: config.max_concurrent_installs,
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    AtCapacity { active: usize, limit: usize },
    CpuSaturated(f64),
    MemorySaturated(f64),
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    sampler: Arc<dyn SystemSampler>,
    active: Mutex<usize>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits, sampler: Arc<dyn SystemSampler>) -> Self {
        Self {
            limits,
            sampler,
            active: Mutex::new(0),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn active_installs(&self) -> usize {
        *lock(&self.active)
    }

    pub fn sample(&self) -> ResourceSample {
        self.sampler.sample()
    }

    /// Take a slot if there is headroom.  Every `Admitted` must be paired
    /// with one [`release`](Self::release).
    pub fn try_acquire(&self) -> Admission {
        let mut active = lock(&self.active);
        if *active >= self.limits.max_concurrent_installs {
            return Admission::AtCapacity {
                active: *active,
                limit: self.limits.max_concurrent_installs,
            };
        }

        let sample = self.sampler.sample();
        if sample.cpu_percent > self.limits.max_cpu_percent {
            return Admission::CpuSaturated(sample.cpu_percent);
        }
        if sample.memory_percent > self.limits.max_memory_percent {
            return Admission::MemorySaturated(sample.memory_percent);
        }

        *active += 1;
        Admission::Admitted
    }

    pub fn release(&self) {
        let mut active = lock(&self.active);
        *active = active.saturating_sub(1);
    }

    /// Poll [`try_acquire`](Self::try_acquire) every `poll` until admitted.
    /// The returned permit releases the slot when dropped.
    pub async fn acquire(
        self: &Arc<Self>,
        poll: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InstallPermit> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire() {
                Admission::Admitted => {
                    return Ok(InstallPermit {
                        monitor: Arc::clone(self),
                    })
                }
                refused => {
                    if Instant::now() >= deadline {
                        debug!(?refused, "Admission timed out");
                        return Err(Error::timeout("install admission", timeout));
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::state_conflict("admit install", "shutting down"));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// One admitted install.  Dropping it frees the slot.
pub struct InstallPermit {
    monitor: Arc<ResourceMonitor>,
}

impl Drop for InstallPermit {
    fn drop(&mut self) {
        self.monitor.release();
    }
}
