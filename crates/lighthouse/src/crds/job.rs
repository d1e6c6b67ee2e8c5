//! `LighthouseJob` Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::activity::ActivityRecord;
use super::tekton::PipelineRunSpec;

/// Agent name of the Tekton engine
pub const TEKTON_AGENT: &str = "tekton-pipeline";
/// Agent name of the Jenkins engine
pub const JENKINS_AGENT: &str = "jenkins";

/// Kind of job, which decides the injected environment and branch naming
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineKind::Presubmit => "presubmit",
            PipelineKind::Postsubmit => "postsubmit",
            PipelineKind::Periodic => "periodic",
            PipelineKind::Batch => "batch",
        })
    }
}

/// Lifecycle state of a job
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Triggered,
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
    Error,
}

impl PipelineState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Success
                | PipelineState::Failure
                | PipelineState::Aborted
                | PipelineState::Error
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Triggered => "triggered",
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Success => "success",
            PipelineState::Failure => "failure",
            PipelineState::Aborted => "aborted",
            PipelineState::Error => "error",
        })
    }
}

/// A pull request included in the refs under test
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Pull {
    pub number: u64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub sha: String,
    /// Git ref of the pull request head, e.g. `refs/pull/1/head`
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
}

/// Git coordinates of the code under test
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_link: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub base_sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_link: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub clone_uri: String,
}

impl Refs {
    /// `org/repo`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// URL to clone from: `clone_uri`, else the repository link.
    #[must_use]
    pub fn repo_url(&self) -> &str {
        if self.clone_uri.is_empty() {
            &self.repo_link
        } else {
            &self.clone_uri
        }
    }

    /// Serialised refs: `base[:baseSha](,prNum:prSha[:prRef])*`
    #[must_use]
    pub fn pull_refs(&self) -> String {
        let mut parts = Vec::with_capacity(self.pulls.len() + 1);
        if self.base_sha.is_empty() {
            parts.push(self.base_ref.clone());
        } else {
            parts.push(format!("{}:{}", self.base_ref, self.base_sha));
        }
        for pull in &self.pulls {
            let mut entry = format!("{}:{}", pull.number, pull.sha);
            if !pull.git_ref.is_empty() {
                entry.push(':');
                entry.push_str(&pull.git_ref);
            }
            parts.push(entry);
        }
        parts.join(",")
    }

    /// Revision to check out: first pull SHA, else base SHA, else base ref.
    #[must_use]
    pub fn revision(&self) -> &str {
        self.pulls
            .first()
            .map(|p| p.sha.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.base_sha.as_str()).filter(|s| !s.is_empty()))
            .unwrap_or(&self.base_ref)
    }

    /// Base revision: base SHA, else base ref.
    #[must_use]
    pub fn base_revision(&self) -> &str {
        if self.base_sha.is_empty() {
            &self.base_ref
        } else {
            &self.base_sha
        }
    }

    /// Space separated pull refs (or SHAs when no ref is known) for batch merges.
    #[must_use]
    pub fn batched_refs(&self) -> String {
        self.pulls
            .iter()
            .map(|p| {
                if p.git_ref.is_empty() {
                    p.sha.as_str()
                } else {
                    p.git_ref.as_str()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// SHA of the commit statuses are reported against.
    #[must_use]
    pub fn last_commit_sha(&self) -> &str {
        self.pulls
            .first()
            .map_or(self.base_sha.as_str(), |p| p.sha.as_str())
    }
}

/// A parameter whose value is a template expanded against the refs
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PipelineRunParam {
    pub name: String,
    #[serde(rename = "valueTemplate")]
    pub value_template: String,
}

/// `LighthouseJob` CRD: one requested pipeline execution
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "lighthouse.jenkins.io", version = "v1alpha1", kind = "LighthouseJob")]
#[kube(namespaced)]
#[kube(status = "LighthouseJobStatus")]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"name":"Job","type":"string","jsonPath":".spec.job"}"#)]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#)]
#[kube(printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agent"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Activity","type":"string","jsonPath":".status.activityName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct LighthouseJobSpec {
    #[serde(default, rename = "type")]
    pub job_type: PipelineKind,

    /// Execution engine (`tekton-pipeline`, `jenkins`)
    #[serde(default)]
    pub agent: String,

    /// Namespace the pipeline runs in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Name of the job in the configuration
    #[serde(default)]
    pub job: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_refs: Vec<Refs>,

    /// Status context reported to the provider
    #[serde(default)]
    pub context: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rerun_command: String,

    /// 0 means unlimited
    #[serde(default)]
    pub max_concurrency: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_run_spec: Option<PipelineRunSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_run_params: Vec<PipelineRunParam>,

    /// Pod template for agents that run plain pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec: Option<serde_json::Value>,
}

impl LighthouseJobSpec {
    /// Branch name used in labels and activity records.
    #[must_use]
    pub fn branch(&self) -> String {
        let Some(refs) = &self.refs else {
            return String::new();
        };
        match self.job_type {
            PipelineKind::Batch => "batch".to_string(),
            PipelineKind::Presubmit => refs
                .pulls
                .first()
                .map_or_else(|| refs.base_ref.clone(), |p| format!("PR-{}", p.number)),
            PipelineKind::Postsubmit | PipelineKind::Periodic => refs.base_ref.clone(),
        }
    }

    /// First pull request, if any.
    #[must_use]
    pub fn pull(&self) -> Option<&Pull> {
        self.refs.as_ref().and_then(|r| r.pulls.first())
    }

    /// Identity of "the same job for the same code", used to supersede older runs.
    #[must_use]
    pub fn dedup_key(&self, build_id: &str, fire_time: &str) -> String {
        let (org, repo, base) = self.refs.as_ref().map_or(("", "", ""), |r| {
            (r.org.as_str(), r.repo.as_str(), r.base_ref.as_str())
        });
        match self.job_type {
            PipelineKind::Presubmit => {
                let number = self.pull().map_or(0, |p| p.number);
                format!("{}/{org}/{repo}#{number}", self.job)
            }
            PipelineKind::Postsubmit | PipelineKind::Batch => {
                format!("{}/{org}/{repo}@{base}/{build_id}", self.job)
            }
            PipelineKind::Periodic => format!("{}@{fire_time}", self.job),
        }
    }
}

/// Status of a `LighthouseJob`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LighthouseJobStatus {
    #[serde(default)]
    pub state: PipelineState,

    /// Name of the pipeline run created for this job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub activity_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, rename = "url", skip_serializing_if = "String::is_empty")]
    pub report_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_report_state: String,

    /// Description of the last commit status the provider accepted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_report_description: String,

    #[serde(default, rename = "lastCommitSHA", skip_serializing_if = "String::is_empty")]
    pub last_commit_sha: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityRecord>,
}

impl LighthouseJobStatus {
    /// Move to `state`, refusing to leave a terminal state. The completion
    /// time is stamped on the first move into a terminal state.
    ///
    /// Returns whether the state was accepted.
    pub fn transition(&mut self, state: PipelineState, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || self.completion_time.is_some() {
            return self.state == state;
        }
        self.state = state;
        if state.is_terminal() {
            self.completion_time = Some(now);
        }
        true
    }
}

impl LighthouseJob {
    /// Current state; a job without status has not been admitted yet.
    #[must_use]
    pub fn state(&self) -> Option<PipelineState> {
        self.status.as_ref().map(|s| s.state)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(PipelineState::is_terminal)
    }

    /// Start time, falling back to the creation timestamp.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.start_time)
            .or_else(|| self.metadata.creation_timestamp.as_ref().map(|t| t.0))
    }

    /// Whether `self` was started after `other`; names embed a time-ordered id and break ties.
    #[must_use]
    pub fn is_newer_than(&self, other: &LighthouseJob) -> bool {
        match (self.started_at(), other.started_at()) {
            (Some(a), Some(b)) if a != b => a > b,
            _ => self.name_any() > other.name_any(),
        }
    }
}
