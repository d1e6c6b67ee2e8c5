//! `LighthousePipelineSecurityPolicy` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overrides applied to every job whose repository matches the policy
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Enforce {
    /// Namespace jobs and pipeline runs are moved to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,

    /// Upper bound on the pipeline timeout, e.g. `15m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_pipeline_duration: Option<String>,
}

/// Admission-time enforcement for repositories matching `repositoryPattern`
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "lighthouse.jenkins.io",
    version = "v1alpha1",
    kind = "LighthousePipelineSecurityPolicy"
)]
#[kube(namespaced)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"name":"Pattern","type":"string","jsonPath":".spec.repositoryPattern"}"#)]
#[kube(printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.enforce.namespace"}"#)]
#[serde(rename_all = "camelCase")]
pub struct LighthousePipelineSecurityPolicySpec {
    /// Regular expression that must match the whole `org/repo` name
    pub repository_pattern: String,

    #[serde(default)]
    pub enforce: Enforce,
}
