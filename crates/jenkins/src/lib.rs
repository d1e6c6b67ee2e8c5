//! Jenkins client for the lighthouse Jenkins agent.
//!
//! Builds are correlated with lighthouse jobs through the `LIGHTHOUSE_JOB_ID`
//! build parameter: every launch carries the job name and [`JenkinsApi::list_builds`]
//! reads it back from both the build queue and the build history.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;
pub mod fake;
pub mod types;

pub use client::JenkinsClient;
pub use error::{JenkinsError, Result};
pub use fake::FakeJenkins;
pub use types::{job_path, Build, BuildRef, JobInfo, LIGHTHOUSE_JOB_ID_PARAM};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

/// Operations the Jenkins reconciler needs from a Jenkins server.
///
/// Job names may be folder paths (`team/app`).
#[async_trait]
pub trait JenkinsApi: Send + Sync {
    /// Fetch job metadata including parameter definitions.
    async fn get_job(&self, job: &str) -> Result<JobInfo>;

    /// Queued and started builds of `jobs`, keyed by their `LIGHTHOUSE_JOB_ID`.
    async fn list_builds(&self, jobs: &[String]) -> Result<HashMap<String, Build>>;

    /// Trigger a build without parameters.
    async fn build(&self, job: &str) -> Result<()>;

    /// Trigger a parameterised build.
    async fn build_with_parameters(&self, job: &str, params: &[(String, String)]) -> Result<()>;

    /// Stop a running build or cancel its queue item.
    async fn abort(&self, job: &str, build: &Build) -> Result<()>;
}

/// How long [`launch_build`] waits for a never-built job to expose its parameters.
#[derive(Debug, Clone, Copy)]
pub struct PrimingPolicy {
    pub poll_interval: Duration,
    pub attempts: u32,
}

impl Default for PrimingPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            attempts: 30,
        }
    }
}

/// Launch a parameterised build.
///
/// Jenkins only reports parameter definitions once a job has run, and rejects
/// `buildWithParameters` until then. A job without definitions is primed with a
/// throw-away build which is aborted as soon as the parameters appear.
pub async fn launch_build(
    api: &dyn JenkinsApi,
    job: &str,
    params: &[(String, String)],
    priming: PrimingPolicy,
) -> Result<()> {
    let info = api.get_job(job).await?;
    if !info.has_parameters() {
        info!(job, "Priming Jenkins job that has never run");
        api.build(job).await?;
        let mut primed = None;
        for _ in 0..priming.attempts {
            tokio::time::sleep(priming.poll_interval).await;
            let info = api.get_job(job).await?;
            if info.has_parameters() {
                primed = Some(info);
                break;
            }
        }
        let primed = primed.ok_or_else(|| JenkinsError::ParametersTimeout(job.to_string()))?;
        if let Some(last) = primed.last_build {
            let throwaway = Build {
                number: last.number,
                url: last.url,
                building: true,
                ..Build::default()
            };
            api.abort(job, &throwaway).await?;
        }
    }
    api.build_with_parameters(job, params).await
}
