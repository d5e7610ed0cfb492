//! Queued workflow requests.

use crate::reasoning::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to run one workflow, owned by the queue from enqueue until
/// completion or permanent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub task_id: String,
    /// Whose backend key and rate budget are charged; may differ from the
    /// triggering human.
    pub credential_owner_id: String,
    pub repository: String,
    pub provider: Provider,
    /// Higher runs first within an owner's queue.
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub enqueued_at: DateTime<Utc>,
    /// A-priori cost estimate used for admission; actual usage is recorded
    /// by the reasoning client.
    pub estimated_tokens: u64,
}

impl QueuedRequest {
    pub fn new(
        task_id: impl Into<String>,
        credential_owner_id: impl Into<String>,
        repository: impl Into<String>,
        provider: Provider,
        priority: u8,
        max_retries: u32,
        estimated_tokens: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            credential_owner_id: credential_owner_id.into(),
            repository: repository.into(),
            provider,
            priority,
            retry_count: 0,
            max_retries,
            enqueued_at: Utc::now(),
            estimated_tokens,
        }
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
