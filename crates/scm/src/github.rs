//! GitHub REST v3 client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ScmError};
use crate::types::{split_repo, Comment, Driver, State, StatusInput};
use crate::ScmClient;

/// Public GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PROVIDER: &str = "GitHub";
const PAGE_SIZE: usize = 100;

/// GitHub client authenticating with a personal access or app installation token.
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    bot_name: String,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    state: &'static str,
    context: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    target_url: &'a str,
}

fn is_empty(value: &&str) -> bool {
    value.is_empty()
}

#[derive(Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Deserialize)]
struct CommentResponse {
    id: u64,
    #[serde(default)]
    body: String,
    user: UserResponse,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

impl From<CommentResponse> for Comment {
    fn from(c: CommentResponse) -> Self {
        Comment {
            id: c.id,
            body: c.body,
            author: c.user.login,
        }
    }
}

impl GitHubClient {
    /// Create a client against `base_url` (e.g. `https://api.github.com` or `https://ghe.example.com/api/v3`).
    pub fn new(base_url: &str, token: &str, bot_name: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lighthouse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            bot_name: bot_name.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, self.url(path))
            .header("Accept", "application/vnd.github+json");
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// GitHub only knows pending/success/failure/error.
    fn state_name(state: State) -> &'static str {
        match state {
            State::Success => "success",
            State::Failure => "failure",
            State::Error | State::Canceled => "error",
            State::Unknown | State::Pending | State::Running => "pending",
        }
    }
}

pub(crate) async fn check(provider: &'static str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ScmError::Api {
        provider,
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ScmClient for GitHubClient {
    fn driver(&self) -> Driver {
        Driver::GitHub
    }

    fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn create_status(&self, repo: &str, sha: &str, status: &StatusInput) -> Result<()> {
        let (owner, name) = split_repo(repo)?;
        let body = StatusRequest {
            state: Self::state_name(status.state),
            context: &status.label,
            description: &status.desc,
            target_url: &status.target,
        };
        debug!(repo, sha, state = body.state, context = %status.label, "Creating GitHub commit status");
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{name}/statuses/{sha}"),
            )
            .json(&body)
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }

    async fn list_pull_request_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>> {
        let (owner, name) = split_repo(repo)?;
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &format!(
                        "/repos/{owner}/{name}/issues/{number}/comments?per_page={PAGE_SIZE}&page={page}"
                    ),
                )
                .send()
                .await?;
            let batch: Vec<CommentResponse> = check(PROVIDER, resp).await?.json().await?;
            let done = batch.len() < PAGE_SIZE;
            comments.extend(batch.into_iter().map(Comment::from));
            if done {
                break;
            }
            page += 1;
        }
        Ok(comments)
    }

    async fn create_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment> {
        let (owner, name) = split_repo(repo)?;
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{name}/issues/{number}/comments"),
            )
            .json(&CommentRequest { body })
            .send()
            .await?;
        let created: CommentResponse = check(PROVIDER, resp).await?.json().await?;
        Ok(created.into())
    }

    async fn edit_pull_request_comment(
        &self,
        repo: &str,
        _number: u64,
        id: u64,
        body: &str,
    ) -> Result<()> {
        let (owner, name) = split_repo(repo)?;
        let resp = self
            .request(
                reqwest::Method::PATCH,
                &format!("/repos/{owner}/{name}/issues/comments/{id}"),
            )
            .json(&CommentRequest { body })
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }

    async fn delete_pull_request_comment(&self, repo: &str, _number: u64, id: u64) -> Result<()> {
        let (owner, name) = split_repo(repo)?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/repos/{owner}/{name}/issues/comments/{id}"),
            )
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }
}
