//! Mirrors job progress back to the source-control provider.
//!
//! Every job change is turned into a commit status. Presubmits that reach a
//! terminal state also update the failed-tests comment on their pull request.
//! `lastReportState` and `lastReportDescription` on the job are the cursor:
//! they only advance after the provider accepted the status, and a terminal
//! cursor ends reporting. The job `description` belongs to the controllers.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use scm::{Driver, ScmClient, State, StatusInput};
use tracing::{debug, info, instrument, warn};

use crate::config::watcher::ConfigAgent;
use crate::config::Config;
use crate::controllers::{update_job_status, Reconcile};
use crate::crds::{ActivityRecord, LighthouseJob, LighthouseJobStatus, PipelineKind, PipelineState};
use crate::error::Result;
use crate::labels::BUILD_NUM;
use crate::queue::QueueKey;
use crate::store::Store;

pub mod comment;

/// Context used when a job has none
pub const DEFAULT_CONTEXT: &str = "jenkins-x";
/// Longest description providers accept
pub const MAX_DESCRIPTION_LENGTH: usize = 63;

/// Cut `desc` to [`MAX_DESCRIPTION_LENGTH`] characters, ending in `...` when shortened.
#[must_use]
pub fn truncate_description(desc: &str) -> String {
    if desc.chars().count() <= MAX_DESCRIPTION_LENGTH {
        return desc.to_string();
    }
    let mut out: String = desc.chars().take(MAX_DESCRIPTION_LENGTH - 4).collect();
    out.push_str("...");
    out
}

/// Commit status state and description for an activity, or `None` when it is not reportable.
#[must_use]
pub fn scm_state(activity: &ActivityRecord, driver: Driver) -> Option<(State, String)> {
    let (state, desc) = match activity.status {
        PipelineState::Success => (State::Success, "Pipeline successful".to_string()),
        PipelineState::Running | PipelineState::Pending => {
            let stages = activity.running_stages();
            if stages.is_empty() || driver == Driver::GitLab {
                (State::Running, "Pipeline running".to_string())
            } else {
                (
                    State::Running,
                    format!("Pipeline running stage(s): {}", stages.join(", ")),
                )
            }
        }
        PipelineState::Aborted => (State::Error, "Error executing pipeline".to_string()),
        PipelineState::Failure => (State::Failure, "Pipeline failed".to_string()),
        PipelineState::Triggered | PipelineState::Error => return None,
    };
    Some((state, truncate_description(&desc)))
}

/// Commit status for a job: its activity while running, its own state once terminal.
///
/// A job can be ended without its pipeline (superseded, or the run could not be
/// created), leaving the recorded activity behind; the job state wins then.
/// An errored job reports its description when it has one.
#[must_use]
pub fn job_scm_state(
    status: &LighthouseJobStatus,
    mut activity: ActivityRecord,
    driver: Driver,
) -> Option<(State, String)> {
    match status.state {
        PipelineState::Error => {
            let desc = if status.description.is_empty() {
                "Error executing pipeline"
            } else {
                status.description.as_str()
            };
            Some((State::Error, truncate_description(desc)))
        }
        state if state.is_terminal() => {
            activity.status = state;
            scm_state(&activity, driver)
        }
        _ => scm_state(&activity, driver),
    }
}

/// Activity for jobs whose engine does not record one.
#[must_use]
pub fn derive_activity(job: &LighthouseJob) -> ActivityRecord {
    let spec = &job.spec;
    let status = job.status.clone().unwrap_or_default();
    let refs = spec.refs.clone().unwrap_or_default();
    let git_url = if refs.clone_uri.is_empty() {
        refs.repo_link.clone()
    } else {
        refs.clone_uri.clone()
    };
    ActivityRecord {
        name: job.name_any(),
        owner: refs.org.clone(),
        repo: refs.repo.clone(),
        branch: spec.branch(),
        build_id: job.labels().get(BUILD_NUM).cloned().unwrap_or_default(),
        context: spec.context.clone(),
        git_url,
        log_url: Some(status.report_url.clone()).filter(|u| !u.is_empty()),
        status: status.state,
        base_sha: refs.base_sha.clone(),
        last_commit_sha: refs.last_commit_sha().to_string(),
        start_time: status.start_time,
        completion_time: status.completion_time,
        stages: Vec::new(),
        steps: Vec::new(),
    }
}

pub struct StatusReporter {
    jobs: Arc<dyn Store<LighthouseJob>>,
    scm: Arc<dyn ScmClient>,
    config: Arc<ConfigAgent<Config>>,
}

impl StatusReporter {
    pub fn new(
        jobs: Arc<dyn Store<LighthouseJob>>,
        scm: Arc<dyn ScmClient>,
        config: Arc<ConfigAgent<Config>>,
    ) -> Self {
        Self { jobs, scm, config }
    }

    /// Queue key for admitted jobs.
    #[must_use]
    pub fn job_key(job: &LighthouseJob) -> Option<QueueKey> {
        job.status
            .is_some()
            .then(|| QueueKey::job(job.namespace().unwrap_or_default(), job.name_any()))
    }

    #[instrument(skip_all, fields(namespace = %namespace, job = %name))]
    async fn report(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(job) = self.jobs.get(namespace, name).await? else {
            return Ok(());
        };
        let Some(status) = &job.status else {
            return Ok(());
        };
        let activity = status
            .activity
            .clone()
            .unwrap_or_else(|| derive_activity(&job));
        let activity_state = activity.status;
        let Some((state, desc)) = job_scm_state(status, activity.clone(), self.scm.driver()) else {
            debug!(state = %activity_state, "Nothing to report");
            return Ok(());
        };

        let sha = if activity.last_commit_sha.is_empty() {
            job.spec
                .refs
                .as_ref()
                .map(|r| r.last_commit_sha().to_string())
                .unwrap_or_default()
        } else {
            activity.last_commit_sha.clone()
        };
        if activity.owner.is_empty()
            || activity.repo.is_empty()
            || sha.is_empty()
            || activity.git_url.is_empty()
        {
            debug!("Job lacks repository coordinates, not reporting");
            return Ok(());
        }
        if State::parse(&status.last_report_state).is_terminal() {
            return Ok(());
        }
        if status.last_report_state == state.to_string() && status.last_report_description == desc {
            return Ok(());
        }

        let repo = activity.full_name();
        let context = if job.spec.context.is_empty() {
            DEFAULT_CONTEXT.to_string()
        } else {
            job.spec.context.clone()
        };
        let input = StatusInput {
            state,
            label: context,
            desc: desc.clone(),
            target: status.report_url.clone(),
        };
        if let Err(e) = self.scm.create_status(&repo, &sha, &input).await {
            warn!(repo = %repo, sha = %sha, error = %e, "Failed to report commit status");
            return Ok(());
        }
        info!(repo = %repo, sha = %sha, state = %state, "Reported commit status");

        if job.spec.job_type == PipelineKind::Presubmit && state.is_terminal() {
            let template = self.config.config().plank.report_template.clone();
            if let Err(e) = comment::report(self.scm.as_ref(), &job, &template).await {
                warn!(repo = %repo, error = %e, "Failed to update report comment");
            }
        }

        let reported = state.to_string();
        update_job_status(self.jobs.as_ref(), namespace, name, |j| {
            let Some(status) = j.status.as_mut() else {
                return false;
            };
            if status.last_report_state == reported
                && status.last_report_description == desc
                && status.last_commit_sha == sha
            {
                return false;
            }
            status.last_report_state.clone_from(&reported);
            status.last_report_description.clone_from(&desc);
            status.last_commit_sha.clone_from(&sha);
            true
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile<QueueKey> for StatusReporter {
    async fn reconcile(&self, key: &QueueKey) -> Result<()> {
        match key {
            QueueKey::Job { namespace, name } => self.report(namespace, name).await,
            QueueKey::PipelineRun { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::finish_job;
    use crate::crds::{ActivityStage, LighthouseJobSpec, Pull, Refs};
    use crate::store::MemoryStore;
    use scm::FakeClient;

    struct Fixture {
        jobs: Arc<MemoryStore<LighthouseJob>>,
        scm: Arc<FakeClient>,
        reporter: StatusReporter,
    }

    fn fixture(driver: Driver) -> Fixture {
        let jobs = Arc::new(MemoryStore::new());
        let scm = Arc::new(FakeClient::with_driver(driver, "bot"));
        let config = Arc::new(ConfigAgent::new(Config::default()));
        let reporter = StatusReporter::new(jobs.clone(), scm.clone(), config);
        Fixture { jobs, scm, reporter }
    }

    fn job(state: PipelineState) -> LighthouseJob {
        let mut job = LighthouseJob::new(
            "acme-web-pr-9-x",
            LighthouseJobSpec {
                job_type: PipelineKind::Presubmit,
                agent: "jenkins".into(),
                job: "pr-build".into(),
                context: "pr-build".into(),
                rerun_command: "/test pr-build".into(),
                refs: Some(Refs {
                    org: "acme".into(),
                    repo: "web".into(),
                    base_ref: "main".into(),
                    base_sha: "base1".into(),
                    clone_uri: "https://github.com/acme/web.git".into(),
                    pulls: vec![Pull {
                        number: 9,
                        sha: "head9".into(),
                        author: "octo".into(),
                        ..Pull::default()
                    }],
                    ..Refs::default()
                }),
                ..LighthouseJobSpec::default()
            },
        );
        job.metadata.namespace = Some("jx".into());
        job.status = Some(LighthouseJobStatus {
            state,
            report_url: "https://dash/acme-web-pr-9-x".into(),
            ..LighthouseJobStatus::default()
        });
        job
    }

    async fn reconcile(f: &Fixture) {
        f.reporter
            .reconcile(&QueueKey::job("jx", "acme-web-pr-9-x"))
            .await
            .unwrap();
    }

    async fn set_state(f: &Fixture, state: PipelineState) {
        update_job_status(f.jobs.as_ref(), "jx", "acme-web-pr-9-x", |j| {
            j.status.as_mut().unwrap().state = state;
            true
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_description_truncation() {
        let long = "x".repeat(70);
        let out = truncate_description(&long);
        assert_eq!(out.len(), 62);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_description(&"y".repeat(63)), "y".repeat(63));
    }

    #[test]
    fn test_running_stages_are_listed_except_on_gitlab() {
        let mut activity = derive_activity(&job(PipelineState::Running));
        activity.stages = ["build", "test"]
            .iter()
            .map(|n| ActivityStage {
                name: (*n).to_string(),
                status: PipelineState::Running,
                ..ActivityStage::default()
            })
            .collect();
        assert_eq!(
            scm_state(&activity, Driver::GitHub),
            Some((State::Running, "Pipeline running stage(s): build, test".into()))
        );
        assert_eq!(
            scm_state(&activity, Driver::GitLab),
            Some((State::Running, "Pipeline running".into()))
        );
        activity.status = PipelineState::Aborted;
        assert_eq!(
            scm_state(&activity, Driver::GitHub),
            Some((State::Error, "Error executing pipeline".into()))
        );
        activity.status = PipelineState::Triggered;
        assert_eq!(scm_state(&activity, Driver::GitHub), None);
    }

    #[tokio::test]
    async fn test_reports_each_change_once() {
        let f = fixture(Driver::GitHub);
        f.jobs.insert(job(PipelineState::Pending)).unwrap();

        reconcile(&f).await;
        reconcile(&f).await;
        let statuses = f.scm.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].repo, "acme/web");
        assert_eq!(statuses[0].sha, "head9");
        assert_eq!(statuses[0].status.state, State::Running);
        assert_eq!(statuses[0].status.label, "pr-build");
        assert_eq!(statuses[0].status.target, "https://dash/acme-web-pr-9-x");

        set_state(&f, PipelineState::Success).await;
        reconcile(&f).await;
        let stored = f.jobs.get("jx", "acme-web-pr-9-x").await.unwrap().unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.last_report_state, "success");
        assert_eq!(status.last_report_description, "Pipeline successful");
        assert!(status.description.is_empty());
        assert_eq!(status.last_commit_sha, "head9");

        // terminal cursor: nothing more is reported
        set_state(&f, PipelineState::Failure).await;
        reconcile(&f).await;
        assert_eq!(f.scm.statuses().len(), 2);
        assert!(f.scm.comments("acme/web", 9).is_empty());
    }

    #[tokio::test]
    async fn test_failed_presubmit_comments_on_pull_request() {
        let f = fixture(Driver::GitHub);
        f.jobs.insert(job(PipelineState::Failure)).unwrap();
        reconcile(&f).await;

        assert_eq!(f.scm.statuses()[0].status.state, State::Failure);
        let comments = f.scm.comments("acme/web", 9);
        assert_eq!(comments.len(), 1);
        assert!(comments[0]
            .body
            .contains("pr-build | head9 | [link](https://dash/acme-web-pr-9-x) | `/test pr-build`"));
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_cursor() {
        let f = fixture(Driver::GitHub);
        f.jobs.insert(job(PipelineState::Running)).unwrap();
        f.scm.fail_with(Some(502));
        reconcile(&f).await;
        let stored = f.jobs.get("jx", "acme-web-pr-9-x").await.unwrap().unwrap();
        assert!(stored.status.unwrap().last_report_state.is_empty());

        f.scm.fail_with(None);
        reconcile(&f).await;
        assert_eq!(f.scm.statuses().len(), 1);
    }

    #[tokio::test]
    async fn test_jobs_without_repository_are_skipped() {
        let f = fixture(Driver::GitHub);
        let mut periodic = job(PipelineState::Running);
        periodic.spec.job_type = PipelineKind::Periodic;
        periodic.spec.refs = None;
        f.jobs.insert(periodic).unwrap();
        reconcile(&f).await;
        assert!(f.scm.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_job_reports_error_not_running() {
        let f = fixture(Driver::GitHub);
        let mut running = job(PipelineState::Running);
        running.spec.agent = "tekton-pipeline".into();
        let activity = derive_activity(&running);
        running.status.as_mut().unwrap().activity = Some(activity);
        let stored = f.jobs.insert(running).unwrap();
        reconcile(&f).await;

        finish_job(f.jobs.as_ref(), &stored, PipelineState::Aborted, "Superseded by a newer run")
            .await
            .unwrap();
        reconcile(&f).await;

        let statuses = f.scm.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status.state, State::Running);
        assert_eq!(statuses[1].status.state, State::Error);
        assert_eq!(statuses[1].status.desc, "Error executing pipeline");

        let status = f.jobs.get("jx", "acme-web-pr-9-x").await.unwrap().unwrap().status.unwrap();
        assert_eq!(status.state, PipelineState::Aborted);
        assert_eq!(status.description, "Superseded by a newer run");
        assert_eq!(status.last_report_state, "error");
        assert_eq!(status.activity.unwrap().status, PipelineState::Aborted);
    }

    #[tokio::test]
    async fn test_errored_job_reports_its_reason() {
        let f = fixture(Driver::GitHub);
        let stored = f.jobs.insert(job(PipelineState::Pending)).unwrap();
        reconcile(&f).await;

        finish_job(f.jobs.as_ref(), &stored, PipelineState::Error, "failed to create pipeline run")
            .await
            .unwrap();
        reconcile(&f).await;

        let statuses = f.scm.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].status.state, State::Error);
        assert_eq!(statuses[1].status.desc, "failed to create pipeline run");
    }

    #[test]
    fn test_terminal_job_state_wins_over_stale_activity() {
        let running = job(PipelineState::Running);
        let activity = derive_activity(&running);
        let mut status = running.status.unwrap();
        status.state = PipelineState::Aborted;
        assert_eq!(
            job_scm_state(&status, activity.clone(), Driver::GitHub),
            Some((State::Error, "Error executing pipeline".into()))
        );
        status.state = PipelineState::Running;
        assert_eq!(
            job_scm_state(&status, activity, Driver::GitHub),
            Some((State::Running, "Pipeline running".into()))
        );
    }
}
