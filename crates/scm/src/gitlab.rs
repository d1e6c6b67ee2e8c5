//! GitLab REST v4 client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::github::check;
use crate::types::{split_repo, Comment, Driver, State, StatusInput};
use crate::ScmClient;

/// Public GitLab API endpoint.
pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";

const PROVIDER: &str = "GitLab";
const PAGE_SIZE: usize = 100;

/// GitLab client authenticating with a personal or project access token.
pub struct GitLabClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    bot_name: String,
}

#[derive(Serialize)]
struct NoteRequest<'a> {
    body: &'a str,
}

#[derive(Deserialize)]
struct NoteResponse {
    id: u64,
    #[serde(default)]
    body: String,
    author: AuthorResponse,
}

#[derive(Deserialize)]
struct AuthorResponse {
    username: String,
}

impl From<NoteResponse> for Comment {
    fn from(n: NoteResponse) -> Self {
        Comment {
            id: n.id,
            body: n.body,
            author: n.author.username,
        }
    }
}

impl GitLabClient {
    /// Create a client against `base_url` (e.g. `https://gitlab.com/api/v4`).
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

    fn project_path(repo: &str) -> Result<String> {
        // validates the owner/name shape before encoding the whole path as the project id
        split_repo(repo)?;
        Ok(format!("/projects/{}", urlencoding::encode(repo)))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if self.token.is_empty() {
            builder
        } else {
            builder.header("PRIVATE-TOKEN", &self.token)
        }
    }

    /// GitLab has no error state; errors are reported as failed.
    fn state_name(state: State) -> &'static str {
        match state {
            State::Success => "success",
            State::Failure | State::Error => "failed",
            State::Canceled => "canceled",
            State::Running => "running",
            State::Unknown | State::Pending => "pending",
        }
    }
}

#[async_trait]
impl ScmClient for GitLabClient {
    fn driver(&self) -> Driver {
        Driver::GitLab
    }

    fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn create_status(&self, repo: &str, sha: &str, status: &StatusInput) -> Result<()> {
        let project = Self::project_path(repo)?;
        let state = Self::state_name(status.state);
        debug!(repo, sha, state, context = %status.label, "Creating GitLab commit status");
        let mut query = vec![
            ("state", state),
            ("name", status.label.as_str()),
            ("description", status.desc.as_str()),
        ];
        if !status.target.is_empty() {
            query.push(("target_url", status.target.as_str()));
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("{project}/statuses/{sha}"),
            )
            .query(&query)
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }

    async fn list_pull_request_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>> {
        let project = Self::project_path(repo)?;
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &format!(
                        "{project}/merge_requests/{number}/notes?per_page={PAGE_SIZE}&page={page}"
                    ),
                )
                .send()
                .await?;
            let batch: Vec<NoteResponse> = check(PROVIDER, resp).await?.json().await?;
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
        let project = Self::project_path(repo)?;
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("{project}/merge_requests/{number}/notes"),
            )
            .json(&NoteRequest { body })
            .send()
            .await?;
        let created: NoteResponse = check(PROVIDER, resp).await?.json().await?;
        Ok(created.into())
    }

    async fn edit_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        id: u64,
        body: &str,
    ) -> Result<()> {
        let project = Self::project_path(repo)?;
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("{project}/merge_requests/{number}/notes/{id}"),
            )
            .json(&NoteRequest { body })
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }

    async fn delete_pull_request_comment(&self, repo: &str, number: u64, id: u64) -> Result<()> {
        let project = Self::project_path(repo)?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("{project}/merge_requests/{number}/notes/{id}"),
            )
            .send()
            .await?;
        check(PROVIDER, resp).await?;
        Ok(())
    }
}
