//! The Tasks Store contract: an external collaborator this
//! broker consumes but never owns. The store is authoritative for terminal
//! task state; the broker never revives a task it reports as terminal.
//!
//! No implementation lives here on purpose: persistence is out of scope
//! for this broker. Callers plug in whatever backs the orchestration
//! database (Postgres, SQLite, an HTTP client to another service, ...) by
//! implementing [`TasksStore`].

use async_trait::async_trait;
use smol_str::SmolStr;
use time::OffsetDateTime;

use crate::model::{TaskId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct StoredTask {
    pub workspace_id: WorkspaceId,
    pub status: TaskStatus,
}

/// Narrow read/write surface onto the durable task record. The
/// broker calls `get_task` before writing a submitted result, to avoid
/// clobbering a terminal status set through some other path, and calls
/// `update_task_status` to persist the outcome once.
#[async_trait]
pub trait TasksStore: Send + Sync + 'static {
    async fn get_task(&self, task_id: &TaskId) -> anyhow::Result<Option<StoredTask>>;

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: serde_json::Value,
        error: Option<SmolStr>,
        completed_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
}

/// A store that does nothing, for deployments/tests where durable
/// persistence is handled entirely out of process. `get_task` always
/// reports no record, so the broker falls through to its fast, in-memory
/// completion path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTasksStore;

#[async_trait]
impl TasksStore for NullTasksStore {
    async fn get_task(&self, _task_id: &TaskId) -> anyhow::Result<Option<StoredTask>> {
        Ok(None)
    }

    async fn update_task_status(
        &self,
        _task_id: &TaskId,
        _status: TaskStatus,
        _result: serde_json::Value,
        _error: Option<SmolStr>,
        _completed_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_succeeded_and_failed() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[tokio::test]
    async fn null_store_reports_no_record_and_accepts_updates() {
        let store = NullTasksStore;
        let task_id: TaskId = "e1".into();

        assert!(store.get_task(&task_id).await.unwrap().is_none());

        store
            .update_task_status(&task_id, TaskStatus::Succeeded, serde_json::json!({}), None, now_wall_clock())
            .await
            .unwrap();
    }

    fn now_wall_clock() -> OffsetDateTime {
        crate::model::now_wall_clock()
    }
}
