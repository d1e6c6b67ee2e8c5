//! Admission of new jobs.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::controllers::update_job_status;
use crate::crds::{LighthouseJob, LighthouseJobStatus, PipelineState};
use crate::error::{Error, Result};
use crate::labels::{job_annotations, job_labels};
use crate::naming::{job_name, Snowflake};
use crate::policy::{attach_policy_label, PolicyResolver};
use crate::store::Store;

/// Creates jobs after applying the matching security policy.
pub struct Launcher {
    jobs: Arc<dyn Store<LighthouseJob>>,
    policies: PolicyResolver,
    ids: Arc<Snowflake>,
}

impl Launcher {
    pub fn new(
        jobs: Arc<dyn Store<LighthouseJob>>,
        policies: PolicyResolver,
        ids: Arc<Snowflake>,
    ) -> Self {
        Self { jobs, policies, ids }
    }

    /// Admit `job` and mark it triggered.
    ///
    /// A policy error aborts admission before anything is created. A job
    /// without a name is named `<org>-<repo>-<branch>-<id>`.
    ///
    /// A job of the same name left without a status by an earlier launch whose
    /// status write failed is marked triggered instead of being reported as
    /// `AlreadyExists`.
    #[instrument(skip_all, fields(job = %job.spec.job))]
    pub async fn launch(&self, mut job: LighthouseJob) -> Result<LighthouseJob> {
        if let Some(refs) = &job.spec.refs {
            if let Some(policy) = self.policies.resolve(&refs.full_name()).await? {
                let target = policy.spec.enforce.namespace.clone();
                if !target.is_empty() {
                    job.metadata.namespace = Some(target.clone());
                    job.spec.namespace = target;
                }
                attach_policy_label(&mut job, &policy);
                info!(policy = %policy.name_any(), "Security policy applies");
            }
        }

        let labels = job_labels(&job.spec, &job.labels().clone());
        let annotations = job_annotations(&job.spec, &job.annotations().clone());
        job.metadata.labels = Some(labels);
        job.metadata.annotations = Some(annotations);
        if job.metadata.name.as_deref().unwrap_or_default().is_empty() {
            job.metadata.name = Some(job_name(&job, &self.ids.next_hex()));
        }
        job.status = None;

        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let created = match self.jobs.create(&namespace, &job).await {
            Ok(created) => created,
            Err(Error::AlreadyExists(what)) => match self.jobs.get(&namespace, &name).await? {
                Some(existing) if existing.status.is_none() => {
                    warn!(job = %name, "Job exists without status, resuming admission");
                    existing
                }
                _ => return Err(Error::AlreadyExists(what)),
            },
            Err(e) => return Err(e),
        };
        let now = Utc::now();
        let triggered = update_job_status(self.jobs.as_ref(), &namespace, &name, |j| {
            if j.status.is_some() {
                return false;
            }
            j.status = Some(LighthouseJobStatus {
                state: PipelineState::Triggered,
                start_time: Some(now),
                ..LighthouseJobStatus::default()
            });
            true
        })
        .await?;
        info!(job = %name, namespace = %namespace, "Launched job");
        Ok(triggered.unwrap_or(created))
    }
}
