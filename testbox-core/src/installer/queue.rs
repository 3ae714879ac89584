//! Priority task queue with tier draining
//!
//! Tasks pop highest tier first and in submission order within a tier.  On
//! top of that ordering the queue tracks how many tasks of each tier are
//! running: nothing is handed out while a strictly higher tier is still
//! running, so a tier drains completely before the next one starts.
//!
//! Tasks whose dependency tasks are still outstanding are skipped in place;
//! they never occupy a worker and never block other tasks.
//!
//! Not synchronized.  The installer keeps it behind one mutex.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::installer::task::{InstallationTask, TaskPriority};

/// Where a task's dependency tasks stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    Ready,
    Pending,
    /// A dependency failed or was cancelled
    Failed(String),
}

/// What a worker should do with a popped task.
#[derive(Debug)]
pub enum Dispatch {
    Run(InstallationTask),
    /// Finish as failed without running
    Abort(InstallationTask, String),
}

struct Queued {
    priority: TaskPriority,
    seq: u64,
    task: InstallationTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher tier first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TaskQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    running: [usize; 4],
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            running: [0; 4],
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|q| q.task.id == task_id)
    }

    /// Enqueue a new task.  Fails when the queue is full.
    pub fn push(&mut self, task: InstallationTask) -> Result<()> {
        if self.heap.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                resource: "task queue".into(),
                limit: self.capacity,
            });
        }
        self.push_unbounded(task);
        Ok(())
    }

    /// Re-enqueue a retry.  Retries were already admitted once and are not
    /// refused for capacity.
    pub fn requeue(&mut self, task: InstallationTask) {
        self.push_unbounded(task);
    }

    fn push_unbounded(&mut self, task: InstallationTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority: task.priority,
            seq,
            task,
        });
    }

    /// Highest tier with a running task.
    pub fn highest_running(&self) -> Option<TaskPriority> {
        TaskPriority::ALL
            .iter()
            .rev()
            .copied()
            .find(|p| self.running[p.index()] > 0)
    }

    pub fn running_count(&self) -> usize {
        self.running.iter().sum()
    }

    /// Next task to hand to a worker, if any is eligible now.  A task handed
    /// out as [`Dispatch::Run`] counts as running until
    /// [`finish`](Self::finish) is called for its tier.
    pub fn pop<F>(&mut self, mut dependencies: F) -> Option<Dispatch>
    where
        F: FnMut(&InstallationTask) -> DependencyState,
    {
        let ceiling = self.highest_running();
        let mut skipped = Vec::new();
        let mut found = None;

        while let Some(item) = self.heap.pop() {
            if ceiling.is_some_and(|running| running > item.priority) {
                skipped.push(item);
                break;
            }
            match dependencies(&item.task) {
                DependencyState::Ready => {
                    self.running[item.priority.index()] += 1;
                    found = Some(Dispatch::Run(item.task));
                    break;
                }
                DependencyState::Failed(reason) => {
                    found = Some(Dispatch::Abort(item.task, reason));
                    break;
                }
                DependencyState::Pending => skipped.push(item),
            }
        }

        self.heap.extend(skipped);
        found
    }

    /// A task of `priority` handed out by [`pop`](Self::pop) has stopped
    /// running.
    pub fn finish(&mut self, priority: TaskPriority) {
        let slot = &mut self.running[priority.index()];
        *slot = slot.saturating_sub(1);
    }

    /// Remove a queued task.  Running tasks are not in the queue and cannot
    /// be cancelled here.
    pub fn cancel(&mut self, task_id: &str) -> Option<InstallationTask> {
        let mut items = std::mem::take(&mut self.heap).into_vec();
        let removed = items
            .iter()
            .position(|q| q.task.id == task_id)
            .map(|i| items.swap_remove(i).task);
        self.heap = BinaryHeap::from(items);
        removed
    }

    /// Remove every queued task.
    pub fn drain(&mut self) -> Vec<InstallationTask> {
        std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|q| q.task)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::task::TaskFindings;
    use std::sync::Weak;

    fn task(id: &str, priority: TaskPriority) -> InstallationTask {
        InstallationTask {
            id: id.to_string(),
            environment: Weak::new(),
            env_id: "env-test".into(),
            packages: Vec::new(),
            priority,
            retry_count: 0,
            max_retries: 0,
            depends_on: Vec::new(),
            callback: None,
            upgrade: false,
            timeout: None,
            submitted_at: chrono::Utc::now(),
            findings: TaskFindings::default(),
        }
    }

    fn ready(_: &InstallationTask) -> DependencyState {
        DependencyState::Ready
    }

    fn run_id(d: Option<Dispatch>) -> String {
        match d {
            Some(Dispatch::Run(t)) => t.id,
            other => panic!("expected a runnable task, got {other:?}"),
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = TaskQueue::new(10);
        q.push(task("low-1", TaskPriority::Low)).unwrap();
        q.push(task("high-1", TaskPriority::High)).unwrap();
        q.push(task("low-2", TaskPriority::Low)).unwrap();
        q.push(task("high-2", TaskPriority::High)).unwrap();

        let mut order = Vec::new();
        while let Some(d) = q.pop(ready) {
            let id = run_id(Some(d));
            let p = if id.starts_with("high") { TaskPriority::High } else { TaskPriority::Low };
            q.finish(p);
            order.push(id);
        }
        assert_eq!(order, vec!["high-1", "high-2", "low-1", "low-2"]);
    }

    #[test]
    fn test_lower_tier_waits_for_running_higher_tier() {
        let mut q = TaskQueue::new(10);
        q.push(task("crit", TaskPriority::Critical)).unwrap();
        q.push(task("low", TaskPriority::Low)).unwrap();

        assert_eq!(run_id(q.pop(ready)), "crit");
        assert!(q.pop(ready).is_none());
        assert_eq!(q.len(), 1);

        q.finish(TaskPriority::Critical);
        assert_eq!(run_id(q.pop(ready)), "low");
    }

    #[test]
    fn test_same_tier_runs_concurrently() {
        let mut q = TaskQueue::new(10);
        q.push(task("a", TaskPriority::Normal)).unwrap();
        q.push(task("b", TaskPriority::Normal)).unwrap();
        assert_eq!(run_id(q.pop(ready)), "a");
        assert_eq!(run_id(q.pop(ready)), "b");
        assert_eq!(q.running_count(), 2);
    }

    #[test]
    fn test_pending_dependencies_do_not_block() {
        let mut q = TaskQueue::new(10);
        let mut waiting = task("child", TaskPriority::Critical);
        waiting.depends_on.push("parent".into());
        q.push(waiting).unwrap();
        q.push(task("parent", TaskPriority::Low)).unwrap();

        let deps = |t: &InstallationTask| {
            if t.depends_on.is_empty() {
                DependencyState::Ready
            } else {
                DependencyState::Pending
            }
        };
        assert_eq!(run_id(q.pop(deps)), "parent");
        assert!(q.contains("child"));
    }

    #[test]
    fn test_failed_dependency_aborts() {
        let mut q = TaskQueue::new(10);
        q.push(task("child", TaskPriority::Normal)).unwrap();
        match q.pop(|_| DependencyState::Failed("parent failed".into())) {
            Some(Dispatch::Abort(t, reason)) => {
                assert_eq!(t.id, "child");
                assert_eq!(reason, "parent failed");
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(q.running_count(), 0);
    }

    #[test]
    fn test_capacity_and_requeue() {
        let mut q = TaskQueue::new(1);
        q.push(task("a", TaskPriority::Normal)).unwrap();
        assert!(matches!(
            q.push(task("b", TaskPriority::Normal)),
            Err(Error::CapacityExceeded { limit: 1, .. })
        ));
        q.requeue(task("retry", TaskPriority::Normal));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_cancel_queued() {
        let mut q = TaskQueue::new(10);
        q.push(task("a", TaskPriority::Normal)).unwrap();
        q.push(task("b", TaskPriority::Normal)).unwrap();
        assert_eq!(q.cancel("a").map(|t| t.id), Some("a".to_string()));
        assert!(q.cancel("a").is_none());
        assert_eq!(run_id(q.pop(ready)), "b");
    }
}
