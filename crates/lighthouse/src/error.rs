//! Error type shared by the reconcilers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency loss on write; the caller re-fetches and retries
    #[error("Conflict writing {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid repository pattern in policy {policy}: {source}")]
    InvalidPolicyPattern {
        policy: String,
        #[source]
        source: regex::Error,
    },

    #[error("Too many policies match repository {repo}: {policies:?}")]
    TooManyPolicies { repo: String, policies: Vec<String> },

    #[error("Security policy {0} referenced by job does not exist")]
    MissingPolicy(String),

    #[error("Job {0} has no pipeline run spec")]
    MissingPipelineSpec(String),

    #[error("Pipeline {0} referenced by job does not exist")]
    MissingPipeline(String),

    #[error("Build id generator returned an empty build id")]
    EmptyBuildId,

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid refs: {0}")]
    InvalidRefs(String),

    #[error("Invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid schedule for periodic {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("Pipeline engine rejected {name}: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SCM error: {0}")]
    Scm(#[from] scm::ScmError),

    #[error("Jenkins error: {0}")]
    Jenkins(#[from] jenkins::JenkinsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{} errors during sync: {}", .0.len(), join(.0))]
    Aggregate(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Lost an optimistic-concurrency race: re-fetch and retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Conflict(_) => true,
            Error::Scm(e) => e.is_transient(),
            Error::Jenkins(e) => e.is_transient(),
            Error::Aggregate(errors) => errors.iter().any(Error::is_transient),
            _ => false,
        }
    }

    /// The job itself is broken; it moves to `error` and is not retried.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::MissingPipelineSpec(_)
                | Error::MissingPipeline(_)
                | Error::MissingPolicy(_)
                | Error::EmptyBuildId
                | Error::Template(_)
                | Error::InvalidRefs(_)
                | Error::InvalidDuration { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
