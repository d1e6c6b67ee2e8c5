//! Activity record: a denormalised snapshot of pipeline progress embedded in the job status.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::job::PipelineState;

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    /// Build identifier
    #[serde(default, rename = "build")]
    pub build_id: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, rename = "gitURL")]
    pub git_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "logURL")]
    pub log_url: Option<String>,
    pub status: PipelineState,
    #[serde(default, rename = "baseSHA")]
    pub base_sha: String,
    #[serde(default, rename = "lastCommitSHA")]
    pub last_commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<ActivityStage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ActivityStep>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStage {
    pub name: String,
    pub status: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ActivityStep>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStep {
    pub name: String,
    pub status: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    /// Names of the stages currently running, in declared order.
    #[must_use]
    pub fn running_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == PipelineState::Running)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// `owner/repo`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}
