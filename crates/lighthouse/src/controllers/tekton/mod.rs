//! Tekton job reconciler.
//!
//! Job keys launch pipeline runs for triggered jobs; pipeline-run keys copy
//! the run's progress back onto the owning job as an activity record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::{finish_job, run_namespace, update_job_status, Reconcile, STATUS_WRITE_ATTEMPTS};
use crate::crds::tekton::PIPELINE_RUN_CANCELLED;
use crate::crds::{
    LighthouseBreakpoint, LighthouseJob, Pipeline, PipelineKind, PipelineRun, PipelineState,
    TEKTON_AGENT,
};
use crate::error::{Error, Result};
use crate::labels::{BRANCH, BUILD_NUM, CONTEXT, ORG, REPO};
use crate::naming::{pinned_run_name, BuildIdGenerator};
use crate::pipeline::{make_pipeline_run, TranslateContext};
use crate::policy::PolicyResolver;
use crate::queue::QueueKey;
use crate::store::Store;

pub mod activity;

pub use activity::{job_state_from_activity, pipeline_state_from, to_activity};

const CREATE_ATTEMPTS: u32 = 3;
const SUPERSEDED: &str = "Superseded by a newer run";

pub struct TektonReconciler {
    jobs: Arc<dyn Store<LighthouseJob>>,
    runs: Arc<dyn Store<PipelineRun>>,
    pipelines: Arc<dyn Store<Pipeline>>,
    breakpoints: Arc<dyn Store<LighthouseBreakpoint>>,
    policies: PolicyResolver,
    build_ids: Arc<dyn BuildIdGenerator>,
    /// Namespace holding breakpoints
    namespace: String,
}

impl TektonReconciler {
    pub fn new(
        jobs: Arc<dyn Store<LighthouseJob>>,
        runs: Arc<dyn Store<PipelineRun>>,
        pipelines: Arc<dyn Store<Pipeline>>,
        breakpoints: Arc<dyn Store<LighthouseBreakpoint>>,
        policies: PolicyResolver,
        build_ids: Arc<dyn BuildIdGenerator>,
        namespace: &str,
    ) -> Self {
        Self {
            jobs,
            runs,
            pipelines,
            breakpoints,
            policies,
            build_ids,
            namespace: namespace.to_string(),
        }
    }

    /// Queue key for a job event; jobs for other agents are ignored.
    #[must_use]
    pub fn job_key(job: &LighthouseJob) -> Option<QueueKey> {
        (job.spec.agent == TEKTON_AGENT)
            .then(|| QueueKey::job(job.namespace().unwrap_or_default(), job.name_any()))
    }

    /// Queue key for a pipeline run event.
    #[must_use]
    pub fn run_key(run: &PipelineRun) -> Option<QueueKey> {
        Some(QueueKey::pipeline_run(
            run.namespace().unwrap_or_default(),
            run.name_any(),
        ))
    }

    #[instrument(skip_all, fields(namespace = %namespace, job = %name))]
    async fn reconcile_job(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(job) = self.jobs.get(namespace, name).await? else {
            debug!("Job no longer exists");
            return Ok(());
        };
        if job.spec.agent != TEKTON_AGENT || job.state() != Some(PipelineState::Triggered) {
            return Ok(());
        }
        if self.supersede(&job).await? {
            return Ok(());
        }
        match self.launch(&job).await {
            Err(e) if e.is_malformed() || matches!(e, Error::Rejected { .. }) => {
                warn!(error = %e, "Cannot start pipeline for job");
                finish_job(self.jobs.as_ref(), &job, PipelineState::Error, &e.to_string()).await?;
                Ok(())
            }
            other => other,
        }
    }

    /// Abort older runs of the same presubmit. Returns `true` when `job` itself is outdated.
    async fn supersede(&self, job: &LighthouseJob) -> Result<bool> {
        if job.spec.job_type != PipelineKind::Presubmit {
            return Ok(false);
        }
        let namespace = job.namespace().unwrap_or_default();
        let key = job.spec.dedup_key("", "");
        let peers: Vec<LighthouseJob> = self
            .jobs
            .list(&namespace, &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|other| {
                other.name_any() != job.name_any()
                    && other.spec.agent == job.spec.agent
                    && other.status.is_some()
                    && !other.is_terminal()
                    && other.spec.dedup_key("", "") == key
            })
            .collect();

        if peers.iter().any(|other| other.is_newer_than(job)) {
            info!(job = %job.name_any(), "Newer run exists, aborting");
            finish_job(self.jobs.as_ref(), job, PipelineState::Aborted, SUPERSEDED).await?;
            return Ok(true);
        }
        for older in &peers {
            info!(job = %older.name_any(), newer = %job.name_any(), "Aborting superseded job");
            finish_job(self.jobs.as_ref(), older, PipelineState::Aborted, SUPERSEDED).await?;
            let activity = older
                .status
                .as_ref()
                .map(|s| s.activity_name.as_str())
                .unwrap_or_default();
            if !activity.is_empty() {
                self.cancel_run(&run_namespace(older), activity).await?;
            }
        }
        Ok(false)
    }

    /// Ask Tekton to stop run `name`.
    async fn cancel_run(&self, namespace: &str, name: &str) -> Result<()> {
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let Some(mut run) = self.runs.get(namespace, name).await? else {
                return Ok(());
            };
            if run.is_cancelled() {
                return Ok(());
            }
            run.spec.status = Some(PIPELINE_RUN_CANCELLED.to_string());
            match self.runs.replace(namespace, &run).await {
                Ok(_) => {
                    info!(pipeline_run = %name, "Cancelled pipeline run");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(Error::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("PipelineRun {namespace}/{name}")))
    }

    async fn launch(&self, job: &LighthouseJob) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let policy = self.policies.for_job(job).await?;
        let breakpoints = self.breakpoints.list(&self.namespace, &BTreeMap::new()).await?;
        let run_ns = run_namespace(job);
        let ctx = TranslateContext {
            namespace: &run_ns,
            build_ids: self.build_ids.as_ref(),
            pipelines: self.pipelines.as_ref(),
            breakpoints: &breakpoints,
            policy: policy.as_ref(),
        };
        let translated = make_pipeline_run(job, &ctx).await?;
        let mut run = translated.run;
        let generate_name = run.metadata.generate_name.take().unwrap_or_default();
        let run_name = pinned_run_name(&generate_name, &translated.build_id);
        run.metadata.name = Some(run_name.clone());
        let run_ns = run.namespace().unwrap_or(run_ns);

        // an earlier attempt may have labelled the job before its claim failed
        if job.labels().get(BUILD_NUM) != Some(&translated.build_id) {
            let mut labelled = job.clone();
            labelled
                .labels_mut()
                .insert(BUILD_NUM.to_string(), translated.build_id.clone());
            self.jobs.replace(&namespace, &labelled).await?;
        }

        let now = Utc::now();
        let updated = update_job_status(self.jobs.as_ref(), &namespace, &name, |j| {
            let Some(status) = j.status.as_mut() else {
                return false;
            };
            if status.state != PipelineState::Triggered {
                return false;
            }
            status.state = PipelineState::Pending;
            status.activity_name.clone_from(&run_name);
            status.start_time = Some(now);
            true
        })
        .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        if updated.status.as_ref().map(|s| s.activity_name.as_str()) != Some(run_name.as_str()) {
            debug!("Job was claimed elsewhere");
            return Ok(());
        }

        self.create_run(&updated, &run_ns, &run).await
    }

    async fn create_run(&self, job: &LighthouseJob, namespace: &str, run: &PipelineRun) -> Result<()> {
        let run_name = run.name_any();
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            match self.runs.create(namespace, run).await {
                Ok(_) => {
                    info!(pipeline_run = %run_name, run_namespace = %namespace, "Created pipeline run");
                    return Ok(());
                }
                Err(Error::AlreadyExists(what)) => {
                    let existing = self.runs.get(namespace, &run_name).await?;
                    if existing.is_some_and(|r| is_owned_by(&r, job)) {
                        debug!(pipeline_run = %run_name, "Pipeline run already exists");
                        return Ok(());
                    }
                    break format!("{what} is owned by another job");
                }
                Err(e) if e.is_transient() && attempt < CREATE_ATTEMPTS => {
                    warn!(pipeline_run = %run_name, error = %e, attempt, "Create failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(e) => break format!("failed to create pipeline run: {e}"),
            }
        };
        warn!(pipeline_run = %run_name, reason = %failure, "Pipeline run not created");
        finish_job(self.jobs.as_ref(), job, PipelineState::Error, &failure).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(namespace = %namespace, pipeline_run = %name))]
    async fn reconcile_run(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(run) = self.runs.get(namespace, name).await? else {
            return Ok(());
        };
        let Some(job) = self.find_owner(&run).await? else {
            debug!("No job owns this pipeline run");
            return Ok(());
        };
        let Some(status) = &job.status else {
            return Ok(());
        };
        if status.state.is_terminal()
            || (!status.activity_name.is_empty() && status.activity_name != run.name_any())
        {
            return Ok(());
        }

        let activity = to_activity(&run);
        let state = job_state_from_activity(activity.status);
        let completed = activity.completion_time;
        let run_name = run.name_any();
        let job_ns = job.namespace().unwrap_or_default();
        let now = Utc::now();
        let written = update_job_status(self.jobs.as_ref(), &job_ns, &job.name_any(), |j| {
            let Some(current) = j.status.as_mut() else {
                return false;
            };
            let mut next = current.clone();
            if !next.transition(state, completed.unwrap_or(now)) {
                return false;
            }
            if next.activity_name.is_empty() {
                next.activity_name.clone_from(&run_name);
            }
            next.activity = Some(activity.clone());
            if next == *current {
                return false;
            }
            *current = next;
            true
        })
        .await?;
        if let Some(job) = written {
            debug!(job = %job.name_any(), state = ?job.state(), "Job status in sync with pipeline run");
        }
        Ok(())
    }

    /// The job a run belongs to: its controller owner, else the job whose
    /// indexing labels and activity name match.
    async fn find_owner(&self, run: &PipelineRun) -> Result<Option<LighthouseJob>> {
        let namespace = run.namespace().unwrap_or_default();
        if let Some(owner) = run
            .owner_references()
            .iter()
            .find(|o| o.kind == "LighthouseJob" && o.controller == Some(true))
        {
            if let Some(job) = self.jobs.get(&namespace, &owner.name).await? {
                if job.uid().as_deref() == Some(owner.uid.as_str()) {
                    return Ok(Some(job));
                }
            }
        }

        let selector: BTreeMap<String, String> = [ORG, REPO, BRANCH, BUILD_NUM, CONTEXT]
            .iter()
            .filter_map(|k| run.labels().get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect();
        if !selector.contains_key(BUILD_NUM) {
            return Ok(None);
        }
        let run_name = run.name_any();
        Ok(self
            .jobs
            .list(&namespace, &selector)
            .await?
            .into_iter()
            .find(|j| {
                j.status
                    .as_ref()
                    .is_some_and(|s| s.activity_name == run_name)
            }))
    }
}

fn is_owned_by(run: &PipelineRun, job: &LighthouseJob) -> bool {
    let uid = job.uid();
    run.owner_references()
        .iter()
        .any(|o| Some(&o.uid) == uid.as_ref())
}

#[async_trait]
impl Reconcile<QueueKey> for TektonReconciler {
    async fn reconcile(&self, key: &QueueKey) -> Result<()> {
        match key {
            QueueKey::Job { namespace, name } => self.reconcile_job(namespace, name).await,
            QueueKey::PipelineRun { namespace, name } => self.reconcile_run(namespace, name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::tekton::{Condition, PipelineRef};
    use crate::crds::{
        Enforce, LighthouseJobSpec, LighthouseJobStatus, LighthousePipelineSecurityPolicy,
        LighthousePipelineSecurityPolicySpec, PipelineRunSpec, PipelineRunStatus, Pull, Refs,
    };
    use crate::labels::{job_labels, SECURITY_POLICY_NAME};
    use crate::store::{MemoryStore, WriteOp};
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl BuildIdGenerator for Counter {
        fn next_build_id(&self, _job: &LighthouseJob) -> Result<String> {
            Ok((self.0.fetch_add(1, Ordering::SeqCst) + 1).to_string())
        }
    }

    struct Fixture {
        jobs: Arc<MemoryStore<LighthouseJob>>,
        runs: Arc<MemoryStore<PipelineRun>>,
        policies: Arc<MemoryStore<LighthousePipelineSecurityPolicy>>,
        reconciler: TektonReconciler,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryStore::new());
        let runs = Arc::new(MemoryStore::new());
        let policies = Arc::new(MemoryStore::new());
        let reconciler = TektonReconciler::new(
            jobs.clone(),
            runs.clone(),
            Arc::new(MemoryStore::<Pipeline>::new()),
            Arc::new(MemoryStore::<LighthouseBreakpoint>::new()),
            PolicyResolver::new(policies.clone(), "jx"),
            Arc::new(Counter(AtomicU64::new(0))),
            "jx",
        );
        Fixture {
            jobs,
            runs,
            policies,
            reconciler,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn triggered(name: &str, pr: u64, started: DateTime<Utc>) -> LighthouseJob {
        let mut job = LighthouseJob::new(
            name,
            LighthouseJobSpec {
                job_type: PipelineKind::Presubmit,
                agent: TEKTON_AGENT.into(),
                job: "pr-build".into(),
                context: "pr-build".into(),
                refs: Some(Refs {
                    org: "acme".into(),
                    repo: "web".into(),
                    base_ref: "main".into(),
                    base_sha: "base1".into(),
                    clone_uri: "https://github.com/acme/web.git".into(),
                    pulls: vec![Pull {
                        number: pr,
                        sha: "head".into(),
                        ..Pull::default()
                    }],
                    ..Refs::default()
                }),
                pipeline_run_spec: Some(PipelineRunSpec {
                    pipeline_ref: Some(PipelineRef {
                        name: "build".into(),
                        ..PipelineRef::default()
                    }),
                    ..PipelineRunSpec::default()
                }),
                pipeline_run_params: vec![crate::crds::PipelineRunParam {
                    name: "url".into(),
                    value_template: "{{ .Refs.CloneURI }}".into(),
                }],
                ..LighthouseJobSpec::default()
            },
        );
        job.metadata.namespace = Some("jx".into());
        job.metadata.labels = Some(job_labels(&job.spec, &BTreeMap::new()));
        job.status = Some(LighthouseJobStatus {
            state: PipelineState::Triggered,
            start_time: Some(started),
            ..LighthouseJobStatus::default()
        });
        job
    }

    async fn job_key(f: &Fixture, name: &str) {
        f.reconciler
            .reconcile(&QueueKey::job("jx", name))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_triggered_job_gets_one_run() {
        let f = fixture();
        f.jobs.insert(triggered("acme-web-pr-1-a", 1, at(0))).unwrap();

        job_key(&f, "acme-web-pr-1-a").await;
        job_key(&f, "acme-web-pr-1-a").await;

        let runs = f.runs.all();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        let job = f.jobs.get("jx", "acme-web-pr-1-a").await.unwrap().unwrap();
        let status = job.status.as_ref().unwrap();
        assert_eq!(status.state, PipelineState::Pending);
        assert_eq!(status.activity_name, run.name_any());
        assert_eq!(run.name_any(), "acme-web-pr-1-a-1");
        assert_eq!(job.labels()[BUILD_NUM], "1");
        assert!(is_owned_by(run, &job));
    }

    #[tokio::test]
    async fn test_failed_claim_keeps_build_number() {
        let f = fixture();
        f.jobs.insert(triggered("acme-web-pr-2-a", 2, at(0))).unwrap();
        f.jobs.fail_next(WriteOp::ReplaceStatus, 1);

        let key = QueueKey::job("jx", "acme-web-pr-2-a");
        assert!(f.reconciler.reconcile(&key).await.is_err());
        let job = f.jobs.get("jx", "acme-web-pr-2-a").await.unwrap().unwrap();
        assert_eq!(job.labels()[BUILD_NUM], "1");
        assert_eq!(job.state(), Some(PipelineState::Triggered));
        assert!(f.runs.all().is_empty());

        job_key(&f, "acme-web-pr-2-a").await;
        let job = f.jobs.get("jx", "acme-web-pr-2-a").await.unwrap().unwrap();
        assert_eq!(job.labels()[BUILD_NUM], "1");
        assert_eq!(job.status.unwrap().activity_name, "acme-web-pr-2-a-1");
        let runs = f.runs.all();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name_any(), "acme-web-pr-2-a-1");
        assert_eq!(runs[0].labels()[BUILD_NUM], "1");
    }

    #[tokio::test]
    async fn test_other_agents_and_states_are_ignored() {
        let f = fixture();
        let mut jenkins = triggered("j", 1, at(0));
        jenkins.spec.agent = "jenkins".into();
        f.jobs.insert(jenkins.clone()).unwrap();
        let mut admitted_later = triggered("n", 2, at(0));
        admitted_later.status = None;
        f.jobs.insert(admitted_later).unwrap();

        job_key(&f, "j").await;
        job_key(&f, "n").await;
        assert!(f.runs.all().is_empty());
        assert!(TektonReconciler::job_key(&jenkins).is_none());
    }

    #[tokio::test]
    async fn test_malformed_job_moves_to_error() {
        let f = fixture();
        let mut job = triggered("bad", 1, at(0));
        job.spec.pipeline_run_spec = None;
        f.jobs.insert(job).unwrap();

        job_key(&f, "bad").await;

        let job = f.jobs.get("jx", "bad").await.unwrap().unwrap();
        assert_eq!(job.state(), Some(PipelineState::Error));
        assert!(job.status.unwrap().description.contains("no pipeline run spec"));
        assert!(f.runs.all().is_empty());
    }

    #[tokio::test]
    async fn test_missing_policy_blocks_launch() {
        let f = fixture();
        let mut job = triggered("p", 1, at(0));
        job.labels_mut()
            .insert(SECURITY_POLICY_NAME.into(), "gone".into());
        f.jobs.insert(job).unwrap();
        let mut policy = LighthousePipelineSecurityPolicy::new(
            "other",
            LighthousePipelineSecurityPolicySpec {
                repository_pattern: "acme/.*".into(),
                enforce: Enforce::default(),
            },
        );
        policy.metadata.namespace = Some("jx".into());
        f.policies.insert(policy).unwrap();

        job_key(&f, "p").await;
        assert_eq!(
            f.jobs.get("jx", "p").await.unwrap().unwrap().state(),
            Some(PipelineState::Error)
        );
    }

    #[tokio::test]
    async fn test_newer_presubmit_supersedes_older() {
        let f = fixture();
        f.jobs.insert(triggered("old", 7, at(0))).unwrap();
        job_key(&f, "old").await;
        let old_run = f.runs.all()[0].name_any();

        f.jobs.insert(triggered("new", 7, at(5))).unwrap();
        f.jobs.insert(triggered("other-pr", 8, at(1))).unwrap();
        job_key(&f, "new").await;

        let old = f.jobs.get("jx", "old").await.unwrap().unwrap();
        assert_eq!(old.state(), Some(PipelineState::Aborted));
        assert!(old.status.unwrap().completion_time.is_some());
        let cancelled = f.runs.get("jx", &old_run).await.unwrap().unwrap();
        assert!(cancelled.is_cancelled());
        assert_eq!(
            f.jobs.get("jx", "new").await.unwrap().unwrap().state(),
            Some(PipelineState::Pending)
        );
        assert_eq!(
            f.jobs.get("jx", "other-pr").await.unwrap().unwrap().state(),
            Some(PipelineState::Triggered)
        );
    }

    #[tokio::test]
    async fn test_stale_trigger_aborts_itself() {
        let f = fixture();
        f.jobs.insert(triggered("new", 7, at(5))).unwrap();
        f.jobs.insert(triggered("old", 7, at(0))).unwrap();

        job_key(&f, "old").await;
        assert_eq!(
            f.jobs.get("jx", "old").await.unwrap().unwrap().state(),
            Some(PipelineState::Aborted)
        );
        assert!(f.runs.all().is_empty());
    }

    fn finish_run(run: &mut PipelineRun, status: &str) {
        run.status = Some(PipelineRunStatus {
            conditions: vec![Condition {
                type_: "Succeeded".into(),
                status: status.into(),
                reason: None,
                message: None,
            }],
            start_time: Some(at(1)),
            completion_time: (status != "Unknown").then(|| at(9)),
            ..PipelineRunStatus::default()
        });
    }

    #[tokio::test]
    async fn test_run_progress_is_copied_once() {
        let f = fixture();
        f.jobs.insert(triggered("a", 1, at(0))).unwrap();
        job_key(&f, "a").await;
        let mut run = f.runs.all().remove(0);
        let run_key = QueueKey::pipeline_run("jx", run.name_any());

        finish_run(&mut run, "Unknown");
        let run = f.runs.insert(run).unwrap();
        f.reconciler.reconcile(&run_key).await.unwrap();
        let job = f.jobs.get("jx", "a").await.unwrap().unwrap();
        assert_eq!(job.state(), Some(PipelineState::Running));
        assert!(job.status.as_ref().unwrap().activity.is_some());

        let writes = f.jobs.writes();
        f.reconciler.reconcile(&run_key).await.unwrap();
        assert_eq!(f.jobs.writes(), writes);

        let mut run = run;
        finish_run(&mut run, "True");
        f.runs.insert(run.clone()).unwrap();
        f.reconciler.reconcile(&run_key).await.unwrap();
        let status = f.jobs.get("jx", "a").await.unwrap().unwrap().status.unwrap();
        assert_eq!(status.state, PipelineState::Success);
        assert_eq!(status.completion_time, Some(at(9)));

        // a late failure never overrides the outcome
        finish_run(&mut run, "False");
        f.runs.insert(run).unwrap();
        f.reconciler.reconcile(&run_key).await.unwrap();
        assert_eq!(
            f.jobs.get("jx", "a").await.unwrap().unwrap().state(),
            Some(PipelineState::Success)
        );
    }

    #[tokio::test]
    async fn test_owner_found_by_labels() {
        let f = fixture();
        f.jobs.insert(triggered("a", 1, at(0))).unwrap();
        job_key(&f, "a").await;
        let mut run = f.runs.all().remove(0);
        run.metadata.owner_references = None;
        finish_run(&mut run, "False");
        let run = f.runs.insert(run).unwrap();

        f.reconciler
            .reconcile(&QueueKey::pipeline_run("jx", run.name_any()))
            .await
            .unwrap();
        assert_eq!(
            f.jobs.get("jx", "a").await.unwrap().unwrap().state(),
            Some(PipelineState::Failure)
        );
    }

    #[tokio::test]
    async fn test_unowned_run_is_dropped() {
        let f = fixture();
        let mut run = PipelineRun::new("stray", PipelineRunSpec::default());
        run.metadata.namespace = Some("jx".into());
        f.runs.insert(run).unwrap();
        f.reconciler
            .reconcile(&QueueKey::pipeline_run("jx", "stray"))
            .await
            .unwrap();
        assert_eq!(f.jobs.writes(), 0);
    }
}
