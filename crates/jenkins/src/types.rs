//! Jenkins JSON API shapes.

use serde::{Deserialize, Serialize};

/// Build parameter that carries the owning lighthouse job name.
pub const LIGHTHOUSE_JOB_ID_PARAM: &str = "LIGHTHOUSE_JOB_ID";

pub const RESULT_SUCCESS: &str = "SUCCESS";
pub const RESULT_FAILURE: &str = "FAILURE";
pub const RESULT_UNSTABLE: &str = "UNSTABLE";
pub const RESULT_ABORTED: &str = "ABORTED";

/// Subset of `/job/<name>/api/json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub property: Vec<JobProperty>,
    #[serde(default)]
    pub last_build: Option<BuildRef>,
}

impl JobInfo {
    /// A job that has never been built reports no parameter definitions.
    #[must_use]
    pub fn has_parameters(&self) -> bool {
        self.property
            .iter()
            .any(|p| !p.parameter_definitions.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProperty {
    #[serde(default)]
    pub parameter_definitions: Vec<ParameterDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildRef {
    pub number: u64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// A build, either running/finished or still waiting in the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Queue item id when the build has not started yet
    #[serde(skip)]
    pub queue_id: Option<u64>,
}

impl Build {
    /// Value of the `LIGHTHOUSE_JOB_ID` build parameter.
    #[must_use]
    pub fn lighthouse_job_id(&self) -> Option<&str> {
        self.actions
            .iter()
            .flat_map(|a| a.parameters.iter())
            .find(|p| p.name == LIGHTHOUSE_JOB_ID_PARAM)
            .and_then(|p| p.value.as_str())
    }

    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        self.queue_id.is_some()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.is_enqueued() || self.building || self.result.is_none()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.as_deref() == Some(RESULT_SUCCESS)
    }

    /// Unstable builds count as failures.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self.result.as_deref(),
            Some(RESULT_FAILURE | RESULT_UNSTABLE)
        )
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.result.as_deref() == Some(RESULT_ABORTED)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BuildList {
    #[serde(default)]
    pub builds: Vec<Build>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Queue {
    #[serde(default)]
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct QueueItem {
    pub id: u64,
    #[serde(default)]
    pub task: QueueTask,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct QueueTask {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Crumb {
    pub crumb: String,
    pub crumb_request_field: String,
}

/// Convert a folder path `a/b` into the URL path `/job/a/job/b`.
#[must_use]
pub fn job_path(job: &str) -> String {
    job.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| format!("/job/{}", urlencoding::encode(part)))
        .collect()
}
