//! Persistence collaborators.
//!
//! The engine treats the record store as a keyed interface, not a schema.
//! Orchestrator code always re-reads through these traits before critical
//! decisions instead of trusting in-process state, which is what lets phase
//! transitions survive process restarts.

use crate::workflow::{PhasePayload, Workflow, WorkflowStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Keyed store for workflow records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Workflow>>;

    async fn get_by_task(&self, task_id: &str) -> Result<Option<Workflow>>;

    async fn insert(&self, workflow: Workflow) -> Result<()>;

    /// Replaces the stored record wholesale.
    async fn update(&self, workflow: Workflow) -> Result<()>;

    async fn set_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()>;

    /// Partial merge: replaces only the phase payload, leaving the rest of
    /// the record untouched.
    async fn merge_payload(&self, id: Uuid, payload: PhasePayload) -> Result<()>;
}

/// The engine's view of a task owned by the external task domain.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub description: String,
    pub completed: bool,
    pub cancelled: bool,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// `None` means the task was deleted.
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;
}

/// In-process store used by the engine in single-process deployments and by
/// every test.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    records: Mutex<HashMap<Uuid, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn get(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_task(&self, task_id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|w| w.task_id == task_id)
            .cloned())
    }

    async fn insert(&self, workflow: Workflow) -> Result<()> {
        self.records.lock().unwrap().insert(workflow.id, workflow);
        Ok(())
    }

    async fn update(&self, workflow: Workflow) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&workflow.id) {
            anyhow::bail!("workflow {} not found", workflow.id);
        }
        records.insert(workflow.id, workflow);
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let workflow = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("workflow {} not found", id))?;
        workflow.status = status;
        workflow.updated_at = chrono::Utc::now().to_rfc3339();
        Ok(())
    }

    async fn merge_payload(&self, id: Uuid, payload: PhasePayload) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let workflow = records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("workflow {} not found", id))?;
        workflow.payload = Some(payload);
        workflow.updated_at = chrono::Utc::now().to_rfc3339();
        Ok(())
    }
}

/// In-process task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, task_id: &str, record: TaskRecord) {
        self.tasks.lock().unwrap().insert(task_id.to_string(), record);
    }

    pub fn active(&self, task_id: &str, description: &str) {
        self.upsert(
            task_id,
            TaskRecord {
                description: description.to_string(),
                completed: false,
                cancelled: false,
            },
        );
    }

    pub fn remove(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
    }

    pub fn mark_completed(&self, task_id: &str) {
        if let Some(record) = self.tasks.lock().unwrap().get_mut(task_id) {
            record.completed = true;
        }
    }

    pub fn mark_cancelled(&self, task_id: &str) {
        if let Some(record) = self.tasks.lock().unwrap().get_mut(task_id) {
            record.cancelled = true;
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.lock().unwrap().get(task_id).cloned())
    }
}
