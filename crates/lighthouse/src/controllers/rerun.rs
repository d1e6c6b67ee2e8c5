//! Re-parenting of pipeline runs re-run from the Tekton dashboard.
//!
//! The dashboard copies a run and labels the copy with its parent's name.
//! The copy is attached to a fresh clone of the parent's job so that its
//! progress is reported like any other run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::{update_job_status, Reconcile, STATUS_WRITE_ATTEMPTS};
use crate::crds::{LighthouseJob, PipelineRun, PipelineState};
use crate::error::{Error, Result};
use crate::labels::{sanitize_label_value, RERUN_OF, RERUN_PIPELINE_RUN};
use crate::naming::rerun_job_name;
use crate::queue::QueueKey;
use crate::store::Store;

/// Attempts at finding a free clone name
const CLONE_ATTEMPTS: u32 = 5;

pub struct RerunReconciler {
    jobs: Arc<dyn Store<LighthouseJob>>,
    runs: Arc<dyn Store<PipelineRun>>,
}

impl RerunReconciler {
    pub fn new(jobs: Arc<dyn Store<LighthouseJob>>, runs: Arc<dyn Store<PipelineRun>>) -> Self {
        Self { jobs, runs }
    }

    /// Queue key for runs carrying the rerun label.
    #[must_use]
    pub fn run_key(run: &PipelineRun) -> Option<QueueKey> {
        run.labels().contains_key(RERUN_OF).then(|| {
            QueueKey::pipeline_run(run.namespace().unwrap_or_default(), run.name_any())
        })
    }

    #[instrument(skip_all, fields(namespace = %namespace, pipeline_run = %name))]
    async fn reconcile_run(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(run) = self.runs.get(namespace, name).await? else {
            return Ok(());
        };
        if !run.owner_references().is_empty() {
            return Ok(());
        }
        let Some(parent_name) = run.labels().get(RERUN_OF).filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let Some(parent) = self.runs.get(namespace, parent_name).await? else {
            debug!(parent = %parent_name, "Parent pipeline run is gone");
            return Ok(());
        };
        let Some(owner) = parent
            .owner_references()
            .iter()
            .find(|o| o.kind == LighthouseJob::kind(&()))
        else {
            debug!(parent = %parent_name, "Parent was not started by a job");
            return Ok(());
        };
        let Some(parent_job) = self.jobs.get(namespace, &owner.name).await? else {
            warn!(job = %owner.name, "Job owning the parent run is gone");
            return Ok(());
        };

        let run_name = run.name_any();
        let clone = match self.existing_clone(&parent_job, &run_name).await? {
            Some(clone) => {
                debug!(job = %clone.name_any(), "Resuming adoption by existing clone");
                clone
            }
            None => {
                let clone = self.clone_job(&parent_job, &run_name).await?;
                info!(job = %clone.name_any(), parent = %parent_job.name_any(), "Created job for rerun");
                clone
            }
        };

        let clone_ns = clone.namespace().unwrap_or_default();
        let now = Utc::now();
        update_job_status(self.jobs.as_ref(), &clone_ns, &clone.name_any(), |j| {
            if j.status.as_ref().is_some_and(|s| s.activity_name == run_name) {
                return false;
            }
            let status = j.status.get_or_insert_with(Default::default);
            status.state = PipelineState::Pending;
            status.activity_name.clone_from(&run_name);
            status.start_time = Some(now);
            true
        })
        .await?;

        self.adopt(namespace, name, &clone).await
    }

    /// A clone of `parent` already made for rerun `run_name` by an earlier attempt.
    async fn existing_clone(&self, parent: &LighthouseJob, run_name: &str) -> Result<Option<LighthouseJob>> {
        let namespace = parent.namespace().unwrap_or_default();
        let selector = BTreeMap::from([(
            RERUN_PIPELINE_RUN.to_string(),
            sanitize_label_value(run_name),
        )]);
        Ok(self
            .jobs
            .list(&namespace, &selector)
            .await?
            .into_iter()
            .find(|j| j.name_any() != parent.name_any()))
    }

    /// Create a copy of `parent` for rerun `run_name` under a fresh `-r-xxxxx` name.
    async fn clone_job(&self, parent: &LighthouseJob, run_name: &str) -> Result<LighthouseJob> {
        let namespace = parent.namespace().unwrap_or_default();
        let mut clone = parent.clone();
        clone
            .labels_mut()
            .insert(RERUN_PIPELINE_RUN.to_string(), sanitize_label_value(run_name));
        let meta = clone.meta_mut();
        meta.resource_version = None;
        meta.uid = None;
        meta.creation_timestamp = None;
        meta.owner_references = None;
        meta.managed_fields = None;
        meta.generate_name = None;
        clone.status = None;

        for _ in 0..CLONE_ATTEMPTS {
            let name = rerun_job_name(&parent.name_any(), &mut rand::thread_rng());
            clone.metadata.name = Some(name.clone());
            match self.jobs.create(&namespace, &clone).await {
                Ok(created) => return Ok(created),
                Err(Error::AlreadyExists(_)) => {
                    debug!(job = %name, "Clone name taken, picking another");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::AlreadyExists(format!(
            "{CLONE_ATTEMPTS} clone names for job {}",
            parent.name_any()
        )))
    }

    /// Make `job` the controller of run `name`.
    async fn adopt(&self, namespace: &str, name: &str, job: &LighthouseJob) -> Result<()> {
        let owner = job
            .controller_owner_ref(&())
            .ok_or_else(|| Error::InvalidRefs(format!("job {} has no uid", job.name_any())))?;
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let Some(mut run) = self.runs.get(namespace, name).await? else {
                return Ok(());
            };
            run.owner_references_mut().push(owner.clone());
            match self.runs.replace(namespace, &run).await {
                Ok(_) => {
                    info!(job = %job.name_any(), "Rerun pipeline now owned by job");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("PipelineRun {namespace}/{name}")))
    }
}

#[async_trait]
impl Reconcile<QueueKey> for RerunReconciler {
    async fn reconcile(&self, key: &QueueKey) -> Result<()> {
        match key {
            QueueKey::PipelineRun { namespace, name } => self.reconcile_run(namespace, name).await,
            QueueKey::Job { .. } => Ok(()),
        }
    }
}
