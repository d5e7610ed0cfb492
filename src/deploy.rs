//! Preview-deployment collaborator.
//!
//! Opportunistic: a missing or failing deployer never blocks workflow
//! completion.

use async_trait::async_trait;

#[async_trait]
pub trait PreviewDeployer: Send + Sync {
    /// Deploys a branch and returns the preview URL.
    async fn deploy_branch(&self, repository: &str, branch: &str) -> anyhow::Result<String>;
}
