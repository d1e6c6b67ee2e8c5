//! In-memory provider that records every call.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{Result, ScmError};
use crate::types::{Comment, Driver, StatusInput};
use crate::ScmClient;

/// A commit status recorded by [`FakeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatus {
    pub repo: String,
    pub sha: String,
    pub status: StatusInput,
}

#[derive(Default)]
struct Recorded {
    statuses: Vec<RecordedStatus>,
    comments: BTreeMap<(String, u64), Vec<Comment>>,
    next_comment_id: u64,
    fail_with: Option<u16>,
}

/// Provider double used by the controller tests.
pub struct FakeClient {
    driver: Driver,
    bot_name: String,
    recorded: Mutex<Recorded>,
}

impl FakeClient {
    #[must_use]
    pub fn new(bot_name: &str) -> Self {
        Self::with_driver(Driver::Fake, bot_name)
    }

    /// Fake that reports itself as `driver`, so provider-specific mapping can be exercised.
    #[must_use]
    pub fn with_driver(driver: Driver, bot_name: &str) -> Self {
        Self {
            driver,
            bot_name: bot_name.to_string(),
            recorded: Mutex::new(Recorded {
                next_comment_id: 1,
                ..Recorded::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following call fail with the given HTTP status; `None` clears it.
    pub fn fail_with(&self, status: Option<u16>) {
        self.lock().fail_with = status;
    }

    /// Seed a comment as if written by `author`.
    pub fn add_comment(&self, repo: &str, number: u64, author: &str, body: &str) -> Comment {
        let mut rec = self.lock();
        let comment = Comment {
            id: rec.next_comment_id,
            body: body.to_string(),
            author: author.to_string(),
        };
        rec.next_comment_id += 1;
        rec.comments
            .entry((repo.to_string(), number))
            .or_default()
            .push(comment.clone());
        comment
    }

    /// Every status posted so far, oldest first.
    #[must_use]
    pub fn statuses(&self) -> Vec<RecordedStatus> {
        self.lock().statuses.clone()
    }

    /// Current comments on a pull request.
    #[must_use]
    pub fn comments(&self, repo: &str, number: u64) -> Vec<Comment> {
        self.lock()
            .comments
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default()
    }

    fn check(rec: &Recorded) -> Result<()> {
        match rec.fail_with {
            Some(status) => Err(ScmError::Api {
                provider: "Fake",
                status,
                message: "injected failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ScmClient for FakeClient {
    fn driver(&self) -> Driver {
        self.driver
    }

    fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn create_status(&self, repo: &str, sha: &str, status: &StatusInput) -> Result<()> {
        let mut rec = self.lock();
        Self::check(&rec)?;
        rec.statuses.push(RecordedStatus {
            repo: repo.to_string(),
            sha: sha.to_string(),
            status: status.clone(),
        });
        Ok(())
    }

    async fn list_pull_request_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>> {
        Self::check(&self.lock())?;
        Ok(self.comments(repo, number))
    }

    async fn create_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment> {
        Self::check(&self.lock())?;
        let bot = self.bot_name.clone();
        Ok(self.add_comment(repo, number, &bot, body))
    }

    async fn edit_pull_request_comment(
        &self,
        repo: &str,
        number: u64,
        id: u64,
        body: &str,
    ) -> Result<()> {
        let mut rec = self.lock();
        Self::check(&rec)?;
        let comment = rec
            .comments
            .get_mut(&(repo.to_string(), number))
            .and_then(|list| list.iter_mut().find(|c| c.id == id))
            .ok_or_else(|| ScmError::Api {
                provider: "Fake",
                status: 404,
                message: format!("comment {id} not found"),
            })?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn delete_pull_request_comment(&self, repo: &str, number: u64, id: u64) -> Result<()> {
        let mut rec = self.lock();
        Self::check(&rec)?;
        if let Some(list) = rec.comments.get_mut(&(repo.to_string(), number)) {
            list.retain(|c| c.id != id);
        }
        Ok(())
    }
}
