//! C10 — Task Registry: taskId -> cancellation token + lifecycle status.
//!
//! Grounded on the teacher's cache-of-live-state pattern (`session/manager.rs`'s
//! `Cache<String, Arc<RwLock<...>>>`), generalized from a `moka` TTL cache
//! (right for idle SSH connections) to a plain `HashMap` guarded by a
//! `Mutex` — task state has no idle-eviction semantics; tasks are removed
//! explicitly once terminal. Cancellation tokens are
//! `tokio_util::sync::CancellationToken`, each a child of one root token so
//! the whole registry can be torn down in one call.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::ipc::TaskId;
use crate::transfer::TaskStatus;

struct TaskEntry {
    token: CancellationToken,
    status: TaskStatus,
}

/// Maps [`TaskId`] to a cancellation token and current status, per
/// distilled §4.10. `cancel`/`pause` are idempotent: once a task reaches a
/// terminal or paused status, further calls are no-ops.
pub struct TaskRegistry {
    root: CancellationToken,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a fresh task, returning the token its workers should poll
    /// at every checkpoint.
    pub fn register(&self, task_id: TaskId) -> CancellationToken {
        let token = self.root.child_token();
        self.tasks.lock().unwrap().insert(
            task_id,
            TaskEntry {
                token: token.clone(),
                status: TaskStatus::Pending,
            },
        );
        token
    }

    pub fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
        if let Some(entry) = self.tasks.lock().unwrap().get_mut(task_id) {
            entry.status = status;
        }
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.lock().unwrap().get(task_id).map(|e| e.status)
    }

    /// Cancels the task's token and marks it `Cancelled`. Returns `false`
    /// (no-op) if the task is unknown or already in a terminal/paused state
    /// — distilled §4.10 "double-cancel is a no-op".
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        self.transition(task_id, TaskStatus::Cancelled)
    }

    /// Cancels the task's token and marks it `Paused` instead of
    /// `Cancelled`. Upload tasks honor this identically to a cancel
    /// (resume is out of scope for uploads); download tasks use the
    /// `Paused` status to decide whether to keep intermediate files for a
    /// later resume.
    pub fn pause(&self, task_id: &TaskId) -> bool {
        self.transition(task_id, TaskStatus::Paused)
    }

    fn transition(&self, task_id: &TaskId, target: TaskStatus) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(entry) = tasks.get_mut(task_id) else {
            return false;
        };
        if entry.status.is_terminal() || entry.status == TaskStatus::Paused {
            return false;
        }
        entry.token.cancel();
        entry.status = target;
        true
    }

    /// Drops all bookkeeping for a task once its terminal event has been
    /// published.
    pub fn remove(&self, task_id: &TaskId) {
        self.tasks.lock().unwrap().remove(task_id);
    }

    /// Cancels every outstanding task at once, e.g. on session disconnect.
    pub fn shutdown_all(&self) {
        self.root.cancel();
        let mut tasks = self.tasks.lock().unwrap();
        for entry in tasks.values_mut() {
            if !entry.status.is_terminal() {
                entry.status = TaskStatus::Cancelled;
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let registry = TaskRegistry::new();
        let task_id = TaskId::from("t1");
        let token = registry.register(task_id.clone());
        assert!(registry.cancel(&task_id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&task_id));
        assert_eq!(registry.status(&task_id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn pause_then_cancel_is_rejected() {
        let registry = TaskRegistry::new();
        let task_id = TaskId::from("t2");
        registry.register(task_id.clone());
        assert!(registry.pause(&task_id));
        assert!(!registry.cancel(&task_id));
        assert_eq!(registry.status(&task_id), Some(TaskStatus::Paused));
    }

    #[test]
    fn unknown_task_operations_are_no_ops() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel(&TaskId::from("missing")));
        assert_eq!(registry.status(&TaskId::from("missing")), None);
    }

    #[test]
    fn shutdown_all_cancels_every_pending_task() {
        let registry = TaskRegistry::new();
        let a = TaskId::from("a");
        let b = TaskId::from("b");
        let token_a = registry.register(a.clone());
        let token_b = registry.register(b.clone());
        registry.set_status(&b, TaskStatus::Completed);
        registry.shutdown_all();
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
        assert_eq!(registry.status(&a), Some(TaskStatus::Cancelled));
        assert_eq!(registry.status(&b), Some(TaskStatus::Completed));
    }
}
