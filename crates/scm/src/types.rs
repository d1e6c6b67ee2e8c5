//! Provider-neutral value types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, ScmError};

/// Source-control provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    GitHub,
    GitLab,
    Fake,
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::GitHub => write!(f, "github"),
            Driver::GitLab => write!(f, "gitlab"),
            Driver::Fake => write!(f, "fake"),
        }
    }
}

/// Commit status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Unknown,
    Pending,
    Running,
    Success,
    Failure,
    Canceled,
    Error,
}

impl State {
    /// Terminal states are never re-reported.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Success | State::Failure | State::Error | State::Canceled
        )
    }

    /// Parse the lower-case name written by [`fmt::Display`]; unknown strings map to `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => State::Pending,
            "running" => State::Running,
            "success" => State::Success,
            "failure" => State::Failure,
            "canceled" => State::Canceled,
            "error" => State::Error,
            _ => State::Unknown,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unknown => "unknown",
            State::Pending => "pending",
            State::Running => "running",
            State::Success => "success",
            State::Failure => "failure",
            State::Canceled => "canceled",
            State::Error => "error",
        };
        f.write_str(s)
    }
}

/// Commit status to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInput {
    pub state: State,
    /// Status context shown by the provider
    pub label: String,
    pub desc: String,
    pub target: String,
}

/// A pull request comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub author: String,
}

/// Split `owner/name` (owner may contain further `/` for GitLab groups).
pub fn split_repo(full_name: &str) -> Result<(&str, &str)> {
    match full_name.rsplit_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok((owner, name)),
        _ => Err(ScmError::InvalidRepo(full_name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_repo() {
        assert_eq!(split_repo("org/repo").unwrap(), ("org", "repo"));
        assert_eq!(
            split_repo("group/sub/repo").unwrap(),
            ("group/sub", "repo")
        );
        assert!(split_repo("repo").is_err());
        assert!(split_repo("org/").is_err());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(State::parse("failure"), State::Failure);
        assert_eq!(State::parse(""), State::Unknown);
        assert_eq!(State::parse("bogus"), State::Unknown);
        assert!(State::Canceled.is_terminal());
        assert!(!State::Running.is_terminal());
    }
}
