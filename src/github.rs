//! Version-control collaborator.
//!
//! The orchestrator only needs four operations: read a file at a ref, create
//! a branch, commit a set of file changes, and open or update a pull
//! request. Failures here are ordinary phase failures; nothing in this
//! module retries on its own.

use crate::workflow::plan::{FileAction, GeneratedFile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// `None` when the path does not exist at the ref.
    async fn read_file(&self, repository: &str, path: &str, git_ref: &str)
        -> Result<Option<String>>;

    /// Paths under `prefix` at the ref ("" lists the repository root tree).
    async fn list_paths(&self, repository: &str, git_ref: &str, prefix: &str)
        -> Result<Vec<String>>;

    async fn default_branch(&self, repository: &str) -> Result<String>;

    async fn create_branch(&self, repository: &str, branch: &str, from_ref: &str) -> Result<()>;

    /// Commits the whole change set to `branch` with one message.
    async fn commit_files(
        &self,
        repository: &str,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<()>;

    /// Returns the new pull request number.
    async fn open_pull_request(
        &self,
        repository: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<u64>;

    async fn update_pull_request(
        &self,
        repository: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<()>;
}

/// Derives a branch name from the task id and plan summary.
///
/// `codegen/<task-prefix>-<slug>`, slug capped so GitHub ref limits are
/// never a concern.
pub fn branch_name_for(task_id: &str, summary: &str) -> String {
    let task_prefix: String = task_id.chars().take(8).collect();
    let slug: String = summary
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        format!("codegen/{task_prefix}")
    } else {
        format!("codegen/{task_prefix}-{slug}")
    }
}

/// GitHub REST implementation.
pub struct HttpGithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpGithubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url("https://api.github.com", token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "codeforge")
    }

    async fn sha_for_path(
        &self,
        repository: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repository}/contents/{path}?ref={branch}"),
            )
            .send()
            .await
            .context("Failed to query file metadata")?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let payload: Value = response.json().await?;
        Ok(payload
            .get("sha")
            .and_then(|s| s.as_str())
            .map(String::from))
    }
}

#[async_trait]
impl VersionControl for HttpGithubClient {
    async fn read_file(
        &self,
        repository: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repository}/contents/{path}?ref={git_ref}"),
            )
            .send()
            .await
            .context("Failed to read repository file")?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("reading {path} failed with {status}");
        }

        let payload: Value = response.json().await?;
        let encoded = payload
            .get("content")
            .and_then(|c| c.as_str())
            .context("file payload missing content")?
            .replace('\n', "");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("file content is not valid base64")?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn list_paths(
        &self,
        repository: &str,
        git_ref: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repository}/git/trees/{git_ref}?recursive=1"),
            )
            .send()
            .await
            .context("Failed to list repository tree")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("listing tree failed with {status}");
        }

        let payload: Value = response.json().await?;
        let tree = payload
            .get("tree")
            .and_then(|t| t.as_array())
            .context("tree payload missing entries")?;
        Ok(tree
            .iter()
            .filter(|entry| entry.get("type").and_then(|t| t.as_str()) == Some("blob"))
            .filter_map(|entry| entry.get("path").and_then(|p| p.as_str()))
            .filter(|path| path.starts_with(prefix))
            .map(String::from)
            .collect())
    }

    async fn default_branch(&self, repository: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{repository}"))
            .send()
            .await
            .context("Failed to read repository metadata")?;
        let payload: Value = response.json().await?;
        payload
            .get("default_branch")
            .and_then(|b| b.as_str())
            .map(String::from)
            .context("repository payload missing default_branch")
    }

    async fn create_branch(&self, repository: &str, branch: &str, from_ref: &str) -> Result<()> {
        let head = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repository}/git/ref/heads/{from_ref}"),
            )
            .send()
            .await
            .context("Failed to resolve base ref")?;
        let payload: Value = head.json().await?;
        let sha = payload
            .get("object")
            .and_then(|o| o.get("sha"))
            .and_then(|s| s.as_str())
            .context("base ref payload missing sha")?;

        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{repository}/git/refs"))
            .json(&json!({"ref": format!("refs/heads/{branch}"), "sha": sha}))
            .send()
            .await
            .context("Failed to create branch")?;
        let status = response.status();
        // 422 on an existing ref: commits land on the existing branch.
        if !status.is_success() && status.as_u16() != 422 {
            anyhow::bail!("creating branch {branch} failed with {status}");
        }
        Ok(())
    }

    async fn commit_files(
        &self,
        repository: &str,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<()> {
        for file in files {
            let sha = self.sha_for_path(repository, &file.path, branch).await?;
            match file.action {
                FileAction::Delete => {
                    let Some(sha) = sha else {
                        tracing::warn!(path = %file.path, "delete requested for missing file");
                        continue;
                    };
                    let response = self
                        .request(
                            reqwest::Method::DELETE,
                            &format!("/repos/{repository}/contents/{}", file.path),
                        )
                        .json(&json!({"message": message, "branch": branch, "sha": sha}))
                        .send()
                        .await
                        .context("Failed to delete file")?;
                    let status = response.status();
                    if !status.is_success() {
                        anyhow::bail!("deleting {} failed with {status}", file.path);
                    }
                }
                FileAction::Create | FileAction::Modify => {
                    let encoded =
                        base64::engine::general_purpose::STANDARD.encode(file.content.as_bytes());
                    let mut body = json!({
                        "message": message,
                        "branch": branch,
                        "content": encoded,
                    });
                    if let Some(sha) = sha {
                        body["sha"] = json!(sha);
                    }
                    let response = self
                        .request(
                            reqwest::Method::PUT,
                            &format!("/repos/{repository}/contents/{}", file.path),
                        )
                        .json(&body)
                        .send()
                        .await
                        .context("Failed to commit file")?;
                    let status = response.status();
                    if !status.is_success() {
                        anyhow::bail!("committing {} failed with {status}", file.path);
                    }
                }
            }
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        repository: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<u64> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{repository}/pulls"))
            .json(&json!({"title": title, "head": branch, "base": base, "body": body}))
            .send()
            .await
            .context("Failed to open pull request")?;
        let status = response.status();
        let payload: Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("opening pull request failed with {status}");
        }
        payload
            .get("number")
            .and_then(|n| n.as_u64())
            .context("pull request payload missing number")
    }

    async fn update_pull_request(
        &self,
        repository: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/repos/{repository}/pulls/{number}"),
            )
            .json(&json!({"title": title, "body": body}))
            .send()
            .await
            .context("Failed to update pull request")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("updating pull request #{number} failed with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_combines_task_and_slug() {
        let name = branch_name_for("a1b2c3d4e5f6", "Add session expiry handling to auth");
        assert_eq!(name, "codegen/a1b2c3d4-add-session-expiry-handling-to");
    }

    #[test]
    fn branch_name_survives_symbols_and_empty_summary() {
        let name = branch_name_for("task-7", "!!!");
        assert_eq!(name, "codegen/task-7");

        let name = branch_name_for("task-7", "Fix: crash on load (v2)");
        assert_eq!(name, "codegen/task-7-fix-crash-on-load-v2");
    }
}
