//! Security policy resolution.
//!
//! A policy matches a job when its `repositoryPattern` matches the whole
//! `org/repo` name. Resolution is fail-closed: one broken pattern or two
//! matching policies block admission of every job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use regex::Regex;
use tracing::{debug, instrument};

use crate::crds::{LighthouseJob, LighthousePipelineSecurityPolicy};
use crate::error::{Error, Result};
use crate::labels::SECURITY_POLICY_NAME;
use crate::pipeline::duration::parse_duration;
use crate::store::Store;

/// Pick the single policy matching `repo` from `policies`.
pub fn match_policy(
    policies: &[LighthousePipelineSecurityPolicy],
    repo: &str,
) -> Result<Option<LighthousePipelineSecurityPolicy>> {
    let mut matched = Vec::new();
    for policy in policies {
        let pattern = &policy.spec.repository_pattern;
        let re = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            Error::InvalidPolicyPattern {
                policy: policy.name_any(),
                source,
            }
        })?;
        if re.is_match(repo) {
            matched.push(policy);
        }
    }
    match matched.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some((*one).clone())),
        many => Err(Error::TooManyPolicies {
            repo: repo.to_string(),
            policies: many.iter().map(|p| p.name_any()).collect(),
        }),
    }
}

/// Maximum pipeline duration enforced by `policy`, if any.
pub fn maximum_duration(policy: &LighthousePipelineSecurityPolicy) -> Result<Option<Duration>> {
    policy
        .spec
        .enforce
        .maximum_pipeline_duration
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(parse_duration)
        .transpose()
}

/// Resolves policies stored in one namespace.
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn Store<LighthousePipelineSecurityPolicy>>,
    namespace: String,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn Store<LighthousePipelineSecurityPolicy>>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    /// The policy governing `repo` (`org/repo`).
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn resolve(&self, repo: &str) -> Result<Option<LighthousePipelineSecurityPolicy>> {
        let policies = self.store.list(&self.namespace, &BTreeMap::new()).await?;
        let policy = match_policy(&policies, repo)?;
        if let Some(p) = &policy {
            debug!(policy = %p.name_any(), "Security policy matched");
        }
        Ok(policy)
    }

    /// Re-resolve the policy recorded on a job at admission time.
    pub async fn for_job(&self, job: &LighthouseJob) -> Result<Option<LighthousePipelineSecurityPolicy>> {
        let Some(name) = job.labels().get(SECURITY_POLICY_NAME) else {
            return Ok(None);
        };
        self.store
            .get(&self.namespace, name)
            .await?
            .map(Some)
            .ok_or_else(|| Error::MissingPolicy(name.clone()))
    }
}

/// Record the matched policy on a job.
pub fn attach_policy_label(job: &mut LighthouseJob, policy: &LighthousePipelineSecurityPolicy) {
    job.labels_mut()
        .insert(SECURITY_POLICY_NAME.to_string(), policy.name_any());
}
