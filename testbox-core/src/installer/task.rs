//! Installation task and result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::engine::environment::IsolatedEnvironment;
use crate::error::{Error, Result};
use crate::installer::conflict::ConflictRecord;
use crate::installer::version::Requirement;

/// Dispatch tier.  Higher tiers always drain first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Invoked once with the final result of a task.
pub type TaskCallback = Arc<dyn Fn(&InstallationResult) + Send + Sync>;

/// What the pre-submission resolve and conflict pass found.  Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFindings {
    /// Dependencies-first order of the resolved tree
    pub install_order: Vec<String>,
    pub unresolved: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
    /// Steps of the pre-check that could not run
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub requirement: String,
    pub success: bool,
    pub from_cache: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationResult {
    pub task_id: String,
    pub env_id: String,
    pub success: bool,
    pub outcomes: Vec<PackageOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Attempts made, including the final one
    pub attempts: u32,
    pub error: Option<String>,
    pub findings: TaskFindings,
}

impl InstallationResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// A result for a task that never reached an install.
    pub(crate) fn aborted(task: &InstallationTask, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            env_id: task.env_id.clone(),
            success: false,
            outcomes: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            attempts: task.retry_count + 1,
            error: Some(error.into()),
            findings: task.findings.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InstallationTask {
    pub id: String,
    /// Not owned: an environment cleaned up while the task waits makes the
    /// task fail rather than keeping the environment alive.
    pub environment: Weak<IsolatedEnvironment>,
    pub env_id: String,
    pub packages: Vec<Requirement>,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub depends_on: Vec<String>,
    pub callback: Option<TaskCallback>,
    pub upgrade: bool,
    pub timeout: Option<Duration>,
    pub submitted_at: DateTime<Utc>,
    pub findings: TaskFindings,
}

impl fmt::Debug for InstallationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationTask")
            .field("id", &self.id)
            .field("env_id", &self.env_id)
            .field("packages", &self.packages)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("depends_on", &self.depends_on)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Builder for [`ParallelInstaller::submit_task`](crate::ParallelInstaller::submit_task).
#[derive(Clone)]
pub struct InstallRequest {
    pub(crate) environment: Arc<IsolatedEnvironment>,
    pub(crate) packages: Vec<String>,
    pub(crate) priority: TaskPriority,
    pub(crate) max_retries: Option<u32>,
    pub(crate) depends_on: Vec<String>,
    pub(crate) callback: Option<TaskCallback>,
    pub(crate) upgrade: bool,
    pub(crate) timeout: Option<Duration>,
}

impl InstallRequest {
    pub fn new(environment: &Arc<IsolatedEnvironment>) -> Self {
        Self {
            environment: Arc::clone(environment),
            packages: Vec::new(),
            priority: TaskPriority::Normal,
            max_retries: None,
            depends_on: Vec::new(),
            callback: None,
            upgrade: false,
            timeout: None,
        }
    }

    /// `name` or `name<specifier>`, e.g. `requests>=2.31`.
    pub fn package(mut self, requirement: impl Into<String>) -> Self {
        self.packages.push(requirement.into());
        self
    }

    pub fn packages<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(requirements.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&InstallationResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Parse requested packages, rejecting empty lists, blank names and
/// unparseable specifiers.
pub(crate) fn parse_packages(raw: &[String]) -> Result<Vec<Requirement>> {
    if raw.is_empty() {
        return Err(Error::InvalidInput("no packages requested".into()));
    }
    raw.iter()
        .map(|r| {
            if r.trim().is_empty() {
                return Err(Error::InvalidInput("empty package name".into()));
            }
            Requirement::parse(r)
        })
        .collect()
}
