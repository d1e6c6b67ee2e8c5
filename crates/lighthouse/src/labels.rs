//! Label and annotation keys shared by jobs and pipeline runs.

use std::collections::BTreeMap;

use crate::crds::LighthouseJobSpec;

pub const CREATED_BY_LIGHTHOUSE: &str = "lighthouse.jenkins-x.io/created-by-lighthouse";
pub const JOB_TYPE: &str = "lighthouse.jenkins-x.io/lighthouse-job-type";
pub const JOB_NAME: &str = "lighthouse.jenkins-x.io/job";
pub const ORG: &str = "lighthouse.jenkins-x.io/refs.org";
pub const REPO: &str = "lighthouse.jenkins-x.io/refs.repo";
pub const PULL: &str = "lighthouse.jenkins-x.io/refs.pull";
pub const BASE_REF: &str = "lighthouse.jenkins-x.io/refs.base_ref";
pub const BRANCH: &str = "lighthouse.jenkins-x.io/branch";
pub const BUILD_NUM: &str = "lighthouse.jenkins-x.io/buildNum";
pub const CONTEXT: &str = "lighthouse.jenkins-x.io/context";
pub const LAST_COMMIT_SHA: &str = "lighthouse.jenkins-x.io/lastCommitSHA";
/// Name of the owning `LighthouseJob`
pub const JOB_ID: &str = "lighthouse.jenkins-x.io/id";
pub const SECURITY_POLICY_NAME: &str = "lighthouse.jenkins-x.io/securityPolicyName";

pub const CLONE_URI_ANNOTATION: &str = "lighthouse.jenkins-x.io/cloneURI";
pub const BASE_SHA_ANNOTATION: &str = "lighthouse.jenkins-x.io/baseSHA";
pub const JOB_ANNOTATION: &str = "lighthouse.jenkins-x.io/job";

/// Set by the Tekton dashboard on a re-run; the value is the parent run name
pub const RERUN_OF: &str = "dashboard.tekton.dev/rerunOf";
/// On a job cloned for a dashboard re-run: the name of that re-run
pub const RERUN_PIPELINE_RUN: &str = "lighthouse.jenkins-x.io/rerunPipelineRun";

const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Coerce `value` into a valid label value: at most 63 characters from
/// `[A-Za-z0-9._-]`, starting and ending with an alphanumeric.
#[must_use]
pub fn sanitize_label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LENGTH)
        .collect();
    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Indexing labels for a job spec. `extra` entries win over derived ones.
#[must_use]
pub fn job_labels(
    spec: &LighthouseJobSpec,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CREATED_BY_LIGHTHOUSE.to_string(), "true".to_string());
    labels.insert(JOB_TYPE.to_string(), spec.job_type.to_string());
    labels.insert(JOB_NAME.to_string(), sanitize_label_value(&spec.job));
    if !spec.context.is_empty() {
        labels.insert(CONTEXT.to_string(), sanitize_label_value(&spec.context));
    }
    if let Some(refs) = &spec.refs {
        labels.insert(ORG.to_string(), sanitize_label_value(&refs.org));
        labels.insert(REPO.to_string(), sanitize_label_value(&refs.repo));
        labels.insert(BASE_REF.to_string(), sanitize_label_value(&refs.base_ref));
        labels.insert(BRANCH.to_string(), sanitize_label_value(&spec.branch()));
        let sha = refs.last_commit_sha();
        if !sha.is_empty() {
            labels.insert(LAST_COMMIT_SHA.to_string(), sanitize_label_value(sha));
        }
        if let [pull] = refs.pulls.as_slice() {
            labels.insert(PULL.to_string(), pull.number.to_string());
        }
    }
    for (k, v) in extra {
        labels.insert(k.clone(), v.clone());
    }
    labels.retain(|_, v| !v.is_empty());
    labels
}

/// Annotations carrying values that are not valid label values.
#[must_use]
pub fn job_annotations(
    spec: &LighthouseJobSpec,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(JOB_ANNOTATION.to_string(), spec.job.clone());
    if let Some(refs) = &spec.refs {
        if !refs.clone_uri.is_empty() {
            annotations.insert(CLONE_URI_ANNOTATION.to_string(), refs.clone_uri.clone());
        }
        if !refs.base_sha.is_empty() {
            annotations.insert(BASE_SHA_ANNOTATION.to_string(), refs.base_sha.clone());
        }
    }
    for (k, v) in extra {
        annotations.insert(k.clone(), v.clone());
    }
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{PipelineKind, Pull, Refs};

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("feature/login"), "feature-login");
        assert_eq!(sanitize_label_value("-pr-1-"), "pr-1");
        assert_eq!(sanitize_label_value("ci/prow: unit"), "ci-prow--unit");
        let long = "a".repeat(80);
        assert_eq!(sanitize_label_value(&long).len(), 63);
    }

    #[test]
    fn test_job_labels_for_presubmit() {
        let spec = LighthouseJobSpec {
            job_type: PipelineKind::Presubmit,
            job: "pr-build".into(),
            context: "pr-build".into(),
            refs: Some(Refs {
                org: "acme".into(),
                repo: "web".into(),
                base_ref: "main".into(),
                base_sha: "abc".into(),
                clone_uri: "https://github.com/acme/web.git".into(),
                pulls: vec![Pull {
                    number: 9,
                    sha: "def".into(),
                    ..Pull::default()
                }],
                ..Refs::default()
            }),
            ..LighthouseJobSpec::default()
        };
        let labels = job_labels(&spec, &BTreeMap::new());
        assert_eq!(labels[ORG], "acme");
        assert_eq!(labels[BRANCH], "PR-9");
        assert_eq!(labels[PULL], "9");
        assert_eq!(labels[LAST_COMMIT_SHA], "def");
        assert_eq!(labels[JOB_TYPE], "presubmit");

        let annotations = job_annotations(&spec, &BTreeMap::new());
        assert_eq!(
            annotations[CLONE_URI_ANNOTATION],
            "https://github.com/acme/web.git"
        );
    }
}
