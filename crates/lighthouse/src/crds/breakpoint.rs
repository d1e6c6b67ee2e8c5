//! `LighthouseBreakpoint` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::job::PipelineKind;
use super::tekton::TaskRunDebug;

/// Which task runs a breakpoint applies to; empty fields match anything
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointFilter {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<PipelineKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task: String,
}

/// Debug directive attached to matching task runs
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "lighthouse.jenkins.io", version = "v1alpha1", kind = "LighthouseBreakpoint")]
#[kube(namespaced)]
#[kube(derive = "Default")]
pub struct LighthouseBreakpointSpec {
    #[serde(default)]
    pub filter: BreakpointFilter,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<TaskRunDebug>,
}
