//! Jenkins job reconciler.
//!
//! Jenkins has no watch API, so jobs are driven by a periodic sync that
//! lists every Jenkins job, reads the matching builds back through their
//! `LIGHTHOUSE_JOB_ID` parameter and advances each job one step.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ::jenkins::{launch_build, Build, JenkinsApi, PrimingPolicy, LIGHTHOUSE_JOB_ID_PARAM};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{finish_job, update_job_status};
use crate::config::{Config, ConfigAgent};
use crate::crds::{LighthouseJob, PipelineKind, PipelineState, JENKINS_AGENT};
use crate::error::{Error, Result};
use crate::naming::BuildIdGenerator;
use crate::pipeline::env::BUILD_ID;
use crate::pipeline::{job_env, template};
use crate::store::Store;

const DESC_ENQUEUED: &str = "Jenkins job enqueued.";
const DESC_RUNNING: &str = "Jenkins job running.";
const DESC_SUCCEEDED: &str = "Jenkins job succeeded.";
const DESC_FAILED: &str = "Jenkins job failed.";
const DESC_ABORTED: &str = "Jenkins job aborted.";
const DESC_MISSING: &str = "Error finding Jenkins job.";
const DESC_SUPERSEDED: &str = "Aborted by a newer run.";

pub struct JenkinsController {
    jobs: Arc<dyn Store<LighthouseJob>>,
    jenkins: Arc<dyn JenkinsApi>,
    config: Arc<ConfigAgent<Config>>,
    build_ids: Arc<dyn BuildIdGenerator>,
    namespace: String,
    priming: PrimingPolicy,
    /// Builds handed out per configured job during the current sync
    pending: Mutex<HashMap<String, u32>>,
}

impl JenkinsController {
    pub fn new(
        jobs: Arc<dyn Store<LighthouseJob>>,
        jenkins: Arc<dyn JenkinsApi>,
        config: Arc<ConfigAgent<Config>>,
        build_ids: Arc<dyn BuildIdGenerator>,
        namespace: &str,
    ) -> Self {
        Self {
            jobs,
            jenkins,
            config,
            build_ids,
            namespace: namespace.to_string(),
            priming: PrimingPolicy::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_priming(mut self, priming: PrimingPolicy) -> Self {
        self.priming = priming;
        self
    }

    /// Sync every `period` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        info!(namespace = %self.namespace, ?period, "Starting Jenkins sync loop");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        error!(error = %e, "Jenkins sync failed");
                    }
                }
            }
        }
        info!("Jenkins sync loop stopped");
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass over all Jenkins jobs. Worker errors are collected, not short-circuited.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn sync(&self) -> Result<()> {
        let config = self.config.config();
        let mut jobs: Vec<LighthouseJob> = self
            .jobs
            .list(&self.namespace, &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|j| j.spec.agent == JENKINS_AGENT && j.status.is_some())
            .collect();

        let mut names: Vec<String> = jobs.iter().map(|j| j.spec.job.clone()).collect();
        names.sort();
        names.dedup();
        let builds = self.jenkins.list_builds(&names).await?;

        let mut errors = Vec::new();
        if let Err(e) = self.terminate_dupes(&mut jobs, &builds).await {
            errors.push(e);
        }

        {
            let mut pending = self.lock_pending();
            pending.clear();
            for job in jobs.iter().filter(|j| is_in_flight(j)) {
                *pending.entry(job.spec.job.clone()).or_insert(0) += 1;
            }
        }

        let workers = config.jenkins.max_goroutines.max(1);
        let handlers: Vec<_> = jobs
            .iter()
            .map(|job| self.handle(job, &builds, &config))
            .collect();
        let results: Vec<Result<()>> = stream::iter(handlers)
            .buffer_unordered(workers)
            .collect()
            .await;
        errors.extend(results.into_iter().filter_map(Result::err));

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    async fn handle(
        &self,
        job: &LighthouseJob,
        builds: &HashMap<String, Build>,
        config: &Config,
    ) -> Result<()> {
        let build = builds.get(&job.name_any());
        match job.state() {
            Some(PipelineState::Triggered) => self.handle_triggered(job, build).await,
            Some(PipelineState::Pending | PipelineState::Running) => {
                self.handle_pending(job, build, config).await
            }
            Some(PipelineState::Aborted) if completion_unset(job) => {
                self.handle_aborted(job, build).await
            }
            _ => Ok(()),
        }
    }

    /// Keep only the newest non-terminal presubmit per job and pull request.
    async fn terminate_dupes(
        &self,
        jobs: &mut [LighthouseJob],
        builds: &HashMap<String, Build>,
    ) -> Result<()> {
        let mut newest: HashMap<String, usize> = HashMap::new();
        let mut superseded = Vec::new();
        for (idx, job) in jobs.iter().enumerate() {
            if job.spec.job_type != PipelineKind::Presubmit || job.is_terminal() {
                continue;
            }
            let key = job.spec.dedup_key("", "");
            match newest.get(&key).copied() {
                None => {
                    newest.insert(key, idx);
                }
                Some(prev) if job.is_newer_than(&jobs[prev]) => {
                    superseded.push(prev);
                    newest.insert(key, idx);
                }
                Some(_) => superseded.push(idx),
            }
        }

        for idx in superseded {
            let job = &jobs[idx];
            if let Some(build) = builds.get(&job.name_any()) {
                if build.is_enqueued() {
                    debug!(job = %job.name_any(), "Superseded build still queued, leaving it");
                } else if build.is_running() {
                    info!(job = %job.name_any(), build = build.number, "Aborting superseded build");
                    if let Err(e) = self.jenkins.abort(&job.spec.job, build).await {
                        warn!(job = %job.name_any(), build = build.number, error = %e, "Cannot abort superseded build");
                    }
                }
            }
            let updated =
                finish_job(self.jobs.as_ref(), job, PipelineState::Aborted, DESC_SUPERSEDED).await?;
            if let Some(updated) = updated {
                jobs[idx] = updated;
            }
        }
        Ok(())
    }

    /// Reserve a build slot for `job`; `max_concurrency` 0 is unlimited.
    fn grant(&self, job: &LighthouseJob) -> bool {
        let mut pending = self.lock_pending();
        let count = pending.entry(job.spec.job.clone()).or_insert(0);
        if job.spec.max_concurrency > 0 && *count >= job.spec.max_concurrency {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, job: &LighthouseJob) {
        if let Some(count) = self.lock_pending().get_mut(&job.spec.job) {
            *count = count.saturating_sub(1);
        }
    }

    async fn handle_triggered(&self, job: &LighthouseJob, build: Option<&Build>) -> Result<()> {
        if build.is_none() {
            if !self.grant(job) {
                debug!(job = %job.name_any(), max = job.spec.max_concurrency, "Concurrency limit reached");
                return Ok(());
            }
            if let Err(e) = self.start_build(job).await {
                self.release(job);
                return match e {
                    Error::Jenkins(ref err) if !err.is_transient() => {
                        warn!(job = %job.name_any(), error = %err, "Cannot start Jenkins build");
                        finish_job(self.jobs.as_ref(), job, PipelineState::Error, &err.to_string())
                            .await?;
                        Ok(())
                    }
                    other => Err(other),
                };
            }
        }
        self.write_state(job, PipelineState::Pending, DESC_ENQUEUED, None)
            .await
    }

    async fn start_build(&self, job: &LighthouseJob) -> Result<()> {
        let build_id = self.build_ids.next_build_id(job)?;
        if build_id.is_empty() {
            return Err(Error::EmptyBuildId);
        }
        let mut env = job_env(&job.spec);
        env.insert(BUILD_ID.to_string(), build_id);
        let mut params: Vec<(String, String)> = env.into_iter().collect();
        params.push((LIGHTHOUSE_JOB_ID_PARAM.to_string(), job.name_any()));
        info!(job = %job.name_any(), jenkins_job = %job.spec.job, "Launching Jenkins build");
        launch_build(self.jenkins.as_ref(), &job.spec.job, &params, self.priming).await?;
        Ok(())
    }

    async fn handle_pending(
        &self,
        job: &LighthouseJob,
        build: Option<&Build>,
        config: &Config,
    ) -> Result<()> {
        let Some(build) = build else {
            warn!(job = %job.name_any(), "No Jenkins build found for pending job");
            finish_job(self.jobs.as_ref(), job, PipelineState::Error, DESC_MISSING).await?;
            return Ok(());
        };
        let (state, description) = build_state(build);
        let url = report_url(&config.jenkins.job_url_template, job, build);
        self.write_state(job, state, description, Some(url)).await
    }

    async fn handle_aborted(&self, job: &LighthouseJob, build: Option<&Build>) -> Result<()> {
        if let Some(build) = build.filter(|b| b.is_running()) {
            info!(job = %job.name_any(), "Aborting Jenkins build of aborted job");
            self.jenkins.abort(&job.spec.job, build).await?;
        }
        let now = Utc::now();
        update_job_status(self.jobs.as_ref(), &job_namespace(job), &job.name_any(), |j| {
            match j.status.as_mut() {
                Some(status) if status.completion_time.is_none() => {
                    status.completion_time = Some(now);
                    true
                }
                _ => false,
            }
        })
        .await?;
        Ok(())
    }

    async fn write_state(
        &self,
        job: &LighthouseJob,
        state: PipelineState,
        description: &str,
        url: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        update_job_status(self.jobs.as_ref(), &job_namespace(job), &job.name_any(), |j| {
            let Some(current) = j.status.as_mut() else {
                return false;
            };
            let mut next = current.clone();
            if !next.transition(state, now) {
                return false;
            }
            // the reporter owns the description between transitions
            if next.state != current.state {
                description.clone_into(&mut next.description);
            }
            if let Some(url) = &url {
                next.report_url.clone_from(url);
            }
            if next == *current {
                return false;
            }
            *current = next;
            true
        })
        .await?;
        Ok(())
    }
}

fn job_namespace(job: &LighthouseJob) -> String {
    job.namespace().unwrap_or_default()
}

fn is_in_flight(job: &LighthouseJob) -> bool {
    matches!(
        job.state(),
        Some(PipelineState::Pending | PipelineState::Running)
    )
}

fn completion_unset(job: &LighthouseJob) -> bool {
    job.status
        .as_ref()
        .is_some_and(|s| s.completion_time.is_none())
}

/// Job state for a Jenkins build; unstable builds fail.
fn build_state(build: &Build) -> (PipelineState, &'static str) {
    if build.is_enqueued() {
        (PipelineState::Pending, DESC_ENQUEUED)
    } else if build.is_running() {
        (PipelineState::Running, DESC_RUNNING)
    } else if build.is_success() {
        (PipelineState::Success, DESC_SUCCEEDED)
    } else if build.is_aborted() {
        (PipelineState::Aborted, DESC_ABORTED)
    } else {
        (PipelineState::Failure, DESC_FAILED)
    }
}

/// Render the configured report URL; falls back to the build page.
fn report_url(template: &str, job: &LighthouseJob, build: &Build) -> String {
    let data = json!({
        "BuildURL": build.url,
        "BuildNumber": build.number,
        "Name": job.name_any(),
        "Namespace": job_namespace(job),
        "Job": job.spec.job,
    });
    match template::render(template, &data) {
        Ok(url) if !url.is_empty() => url,
        Ok(_) => build.url.clone(),
        Err(e) => {
            warn!(error = %e, "Invalid Jenkins report URL template");
            build.url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJobSpec, LighthouseJobStatus, Pull, Refs};
    use crate::store::MemoryStore;
    use ::jenkins::FakeJenkins;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl BuildIdGenerator for Counter {
        fn next_build_id(&self, _job: &LighthouseJob) -> Result<String> {
            Ok((self.0.fetch_add(1, Ordering::SeqCst) + 100).to_string())
        }
    }

    struct Fixture {
        jobs: Arc<MemoryStore<LighthouseJob>>,
        jenkins: Arc<FakeJenkins>,
        controller: JenkinsController,
    }

    fn fixture(config: Config) -> Fixture {
        let jobs = Arc::new(MemoryStore::new());
        let jenkins = Arc::new(FakeJenkins::new());
        jenkins.add_job("X", true);
        let controller = JenkinsController::new(
            jobs.clone(),
            jenkins.clone(),
            Arc::new(ConfigAgent::new(config)),
            Arc::new(Counter(AtomicU64::new(0))),
            "jx",
        );
        Fixture {
            jobs,
            jenkins,
            controller,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn job(name: &str, pr: u64, started: DateTime<Utc>, state: PipelineState) -> LighthouseJob {
        let mut job = LighthouseJob::new(
            name,
            LighthouseJobSpec {
                job_type: PipelineKind::Presubmit,
                agent: JENKINS_AGENT.into(),
                job: "X".into(),
                refs: Some(Refs {
                    org: "org".into(),
                    repo: "repo".into(),
                    base_ref: "main".into(),
                    pulls: vec![Pull {
                        number: pr,
                        sha: "abc".into(),
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
            start_time: Some(started),
            ..LighthouseJobStatus::default()
        });
        job
    }

    async fn state_of(f: &Fixture, name: &str) -> LighthouseJobStatus {
        f.jobs.get("jx", name).await.unwrap().unwrap().status.unwrap()
    }

    #[tokio::test]
    async fn test_presubmit_dedup_aborts_older_build() {
        let f = fixture(Config::default());
        f.jobs.insert(job("old", 42, at(1), PipelineState::Triggered)).unwrap();
        f.jobs.insert(job("new", 42, at(2), PipelineState::Triggered)).unwrap();
        f.jenkins.add_build("X", "old", false);
        f.jenkins.add_build("X", "new", false);

        f.controller.sync().await.unwrap();

        let old = state_of(&f, "old").await;
        assert_eq!(old.state, PipelineState::Aborted);
        assert!(old.completion_time.is_some());
        let aborted = f.jenkins.aborted();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].1.lighthouse_job_id(), Some("old"));
        assert_eq!(state_of(&f, "new").await.state, PipelineState::Pending);
        assert!(f.jenkins.launched().is_empty());
    }

    #[tokio::test]
    async fn test_failed_abort_still_retires_every_dupe() {
        let f = fixture(Config::default());
        for (name, minute) in [("a", 1), ("b", 2), ("c", 3)] {
            f.jobs.insert(job(name, 7, at(minute), PipelineState::Pending)).unwrap();
            f.jenkins.add_build("X", name, false);
        }
        f.jenkins.fail_aborts(1);

        f.controller.sync().await.unwrap();

        assert_eq!(state_of(&f, "a").await.state, PipelineState::Aborted);
        assert_eq!(state_of(&f, "b").await.state, PipelineState::Aborted);
        assert_eq!(state_of(&f, "c").await.state, PipelineState::Running);
        let aborted = f.jenkins.aborted();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].1.lighthouse_job_id(), Some("b"));
    }

    #[tokio::test]
    async fn test_build_lifecycle() {
        let mut config = Config::default();
        config.jenkins.job_url_template = "https://dash/{{Job}}/{{BuildNumber}}".into();
        let f = fixture(config);
        f.jobs.insert(job("a", 1, at(1), PipelineState::Triggered)).unwrap();

        f.controller.sync().await.unwrap();
        let launched = f.jenkins.launched();
        assert_eq!(launched.len(), 1);
        let params: BTreeMap<_, _> = launched[0].1.iter().cloned().collect();
        assert_eq!(params[LIGHTHOUSE_JOB_ID_PARAM], "a");
        assert_eq!(params["BUILD_ID"], "100");
        assert_eq!(params["PULL_NUMBER"], "1");
        assert_eq!(state_of(&f, "a").await.state, PipelineState::Pending);

        f.controller.sync().await.unwrap();
        let status = state_of(&f, "a").await;
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(status.report_url, "https://dash/X/1");

        f.jenkins.finish("X", "a", "UNSTABLE");
        f.controller.sync().await.unwrap();
        let status = state_of(&f, "a").await;
        assert_eq!(status.state, PipelineState::Failure);
        assert!(status.completion_time.is_some());

        let writes = f.jobs.writes();
        f.controller.sync().await.unwrap();
        assert_eq!(f.jobs.writes(), writes);
        assert_eq!(f.jenkins.launched().len(), 1);
    }

    #[tokio::test]
    async fn test_max_concurrency_holds_within_one_sync() {
        let f = fixture(Config::default());
        for (name, pr) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut j = job(name, pr, at(1), PipelineState::Triggered);
            j.spec.max_concurrency = 2;
            f.jobs.insert(j).unwrap();
        }

        f.controller.sync().await.unwrap();
        assert_eq!(f.jenkins.launched().len(), 2);

        let states = [
            state_of(&f, "a").await.state,
            state_of(&f, "b").await.state,
            state_of(&f, "c").await.state,
        ];
        assert_eq!(
            states.iter().filter(|s| **s == PipelineState::Triggered).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_vanished_build_and_unknown_job_error_out() {
        let f = fixture(Config::default());
        f.jobs.insert(job("lost", 1, at(1), PipelineState::Pending)).unwrap();
        let mut missing = job("nojob", 2, at(1), PipelineState::Triggered);
        missing.spec.job = "does-not-exist".into();
        f.jobs.insert(missing).unwrap();

        f.controller.sync().await.unwrap();

        let lost = state_of(&f, "lost").await;
        assert_eq!(lost.state, PipelineState::Error);
        assert_eq!(lost.description, DESC_MISSING);
        let nojob = state_of(&f, "nojob").await;
        assert_eq!(nojob.state, PipelineState::Error);
        assert!(nojob.description.contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_aborted_job_stops_its_build() {
        let f = fixture(Config::default());
        f.jobs.insert(job("a", 1, at(1), PipelineState::Aborted)).unwrap();
        f.jenkins.add_build("X", "a", false);

        f.controller.sync().await.unwrap();

        assert_eq!(f.jenkins.aborted().len(), 1);
        assert!(state_of(&f, "a").await.completion_time.is_some());
    }
}
