//! Environment injected into every pipeline.

use std::collections::BTreeMap;

use crate::crds::{LighthouseJobSpec, PipelineKind};

pub const BUILD_ID: &str = "BUILD_ID";
pub const JOB_NAME: &str = "JOB_NAME";
pub const JOB_TYPE: &str = "JOB_TYPE";
pub const JOB_SPEC: &str = "JOB_SPEC";
pub const REPO_OWNER: &str = "REPO_OWNER";
pub const REPO_NAME: &str = "REPO_NAME";
pub const REPO_URL: &str = "REPO_URL";
pub const PULL_BASE_REF: &str = "PULL_BASE_REF";
pub const PULL_BASE_SHA: &str = "PULL_BASE_SHA";
pub const PULL_REFS: &str = "PULL_REFS";
pub const PULL_NUMBER: &str = "PULL_NUMBER";
pub const PULL_PULL_SHA: &str = "PULL_PULL_SHA";
pub const PULL_PULL_REF: &str = "PULL_PULL_REF";

/// Variables derived from the job type and refs.
///
/// `BUILD_ID`, `REPO_URL` and `PULL_PULL_REF` depend on launch-time data and
/// are added by the translator.
#[must_use]
pub fn job_env(spec: &LighthouseJobSpec) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(JOB_NAME.to_string(), spec.job.clone());
    env.insert(JOB_TYPE.to_string(), spec.job_type.to_string());
    env.insert(JOB_SPEC.to_string(), format!("type:{}", spec.job_type));

    if spec.job_type == PipelineKind::Periodic {
        return env;
    }
    let Some(refs) = &spec.refs else {
        return env;
    };
    env.insert(REPO_OWNER.to_string(), refs.org.clone());
    env.insert(REPO_NAME.to_string(), refs.repo.clone());
    env.insert(PULL_BASE_REF.to_string(), refs.base_ref.clone());
    env.insert(PULL_BASE_SHA.to_string(), refs.base_sha.clone());
    env.insert(PULL_REFS.to_string(), refs.pull_refs());

    if spec.job_type == PipelineKind::Presubmit {
        if let Some(pull) = refs.pulls.first() {
            env.insert(PULL_NUMBER.to_string(), pull.number.to_string());
            env.insert(PULL_PULL_SHA.to_string(), pull.sha.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::Refs;

    #[test]
    fn test_periodic_has_only_job_vars() {
        let spec = LighthouseJobSpec {
            job_type: PipelineKind::Periodic,
            job: "nightly".into(),
            refs: Some(Refs {
                org: "acme".into(),
                repo: "web".into(),
                ..Refs::default()
            }),
            ..LighthouseJobSpec::default()
        };
        let env = job_env(&spec);
        assert_eq!(env.len(), 3);
        assert_eq!(env[JOB_SPEC], "type:periodic");
        assert!(!env.contains_key(REPO_OWNER));
    }

    #[test]
    fn test_postsubmit_has_no_pull_vars() {
        let spec = LighthouseJobSpec {
            job_type: PipelineKind::Postsubmit,
            job: "release".into(),
            refs: Some(Refs {
                org: "acme".into(),
                repo: "web".into(),
                base_ref: "main".into(),
                base_sha: "abc".into(),
                ..Refs::default()
            }),
            ..LighthouseJobSpec::default()
        };
        let env = job_env(&spec);
        assert_eq!(env[PULL_REFS], "main:abc");
        assert!(!env.contains_key(PULL_NUMBER));
        assert!(!env.contains_key(PULL_PULL_SHA));
    }
}
