//! Status notification collaborator.
//!
//! Best-effort by contract: delivery failures are logged and swallowed so a
//! broken notification channel can never fail a workflow.

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Posts a status message for a task. Implementations report errors;
    /// callers go through [`notify_best_effort`].
    async fn post_status(&self, task_id: &str, message: &str) -> anyhow::Result<()>;
}

/// Sends the notification and swallows any failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, task_id: &str, message: &str) {
    if let Err(e) = notifier.post_status(task_id, message).await {
        tracing::warn!(task_id = %task_id, error = %format!("{e:#}"), "status notification failed");
    }
}

/// Notifier that writes status updates to the log stream.
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn post_status(&self, task_id: &str, message: &str) -> anyhow::Result<()> {
        tracing::info!(task_id = %task_id, "{message}");
        Ok(())
    }
}
