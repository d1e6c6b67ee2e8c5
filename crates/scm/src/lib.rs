//! Source-control provider abstraction.
//!
//! The job controllers only need a narrow slice of a provider's API: posting
//! commit statuses and maintaining a single report comment on a pull request.
//! This crate exposes that slice behind the [`ScmClient`] trait with REST
//! implementations for GitHub and GitLab, plus an in-memory [`FakeClient`]
//! used by the controller tests.
//!
//! # Architecture
//!
//! - [`ScmClient`] defines the provider operations
//! - [`GitHubClient`] talks to the GitHub v3 REST API (github.com or Enterprise)
//! - [`GitLabClient`] talks to the GitLab v4 REST API
//! - [`FakeClient`] records every call for assertions

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod fake;
pub mod github;
pub mod gitlab;
pub mod types;

pub use error::{Result, ScmError};
pub use fake::{FakeClient, RecordedStatus};
pub use github::GitHubClient;
pub use gitlab::GitLabClient;
pub use types::{split_repo, Comment, Driver, State, StatusInput};

use async_trait::async_trait;

/// Operations the reporter needs from a source-control provider.
///
/// `repo` is always the full name `owner/name`.
#[async_trait]
pub trait ScmClient: Send + Sync {
    /// Which provider this client talks to.
    fn driver(&self) -> Driver;

    /// Login of the account the client authenticates as.
    fn bot_name(&self) -> &str;

    /// Create or overwrite the commit status identified by `status.label`.
    async fn create_status(&self, repo: &str, sha: &str, status: &StatusInput) -> Result<()>;

    /// List every comment on a pull request.
    async fn list_pull_request_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>>;

    /// Add a comment to a pull request.
    async fn create_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment>;

    /// Replace the body of an existing pull request comment.
    async fn edit_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        id: u64,
        body: &str,
    ) -> Result<()>;

    /// Delete a pull request comment.
    async fn delete_pull_request_comment(&self, repo: &str, number: u64, id: u64) -> Result<()>;
}

/// Build a client for the named provider kind (`github` or `gitlab`).
///
/// `server` overrides the API base URL; when empty the public SaaS endpoint is used.
pub fn new_client(kind: &str, server: &str, token: &str, bot_name: &str) -> Result<Box<dyn ScmClient>> {
    match kind.to_ascii_lowercase().as_str() {
        "github" => {
            let server = if server.is_empty() {
                github::DEFAULT_API_URL
            } else {
                server
            };
            Ok(Box::new(GitHubClient::new(server, token, bot_name)?))
        }
        "gitlab" => {
            let server = if server.is_empty() {
                gitlab::DEFAULT_API_URL
            } else {
                server
            };
            Ok(Box::new(GitLabClient::new(server, token, bot_name)?))
        }
        other => Err(ScmError::UnsupportedDriver(other.to_string())),
    }
}
