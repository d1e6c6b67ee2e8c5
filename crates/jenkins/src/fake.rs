//! In-memory Jenkins used by the reconciler tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{JenkinsError, Result};
use crate::types::{
    Action, Build, BuildRef, JobInfo, JobProperty, Parameter, ParameterDefinition,
    LIGHTHOUSE_JOB_ID_PARAM, RESULT_ABORTED,
};
use crate::JenkinsApi;

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobInfo>,
    builds: HashMap<String, Vec<Build>>,
    launched: Vec<(String, Vec<(String, String)>)>,
    plain_builds: Vec<String>,
    aborted: Vec<(String, Build)>,
    failing_aborts: u32,
}

/// Records launches and aborts; builds stay running until [`FakeJenkins::finish`] is called.
#[derive(Default)]
pub struct FakeJenkins {
    state: Mutex<State>,
}

impl FakeJenkins {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job; `parameterised` mimics a job that already ran once.
    pub fn add_job(&self, name: &str, parameterised: bool) {
        let mut info = JobInfo {
            name: name.to_string(),
            url: format!("https://jenkins.example.com/job/{name}/"),
            ..JobInfo::default()
        };
        if parameterised {
            prime(&mut info);
        }
        self.lock().jobs.insert(name.to_string(), info);
    }

    /// Insert a build carrying `LIGHTHOUSE_JOB_ID = lighthouse_job`.
    pub fn add_build(&self, job: &str, lighthouse_job: &str, enqueued: bool) -> Build {
        let mut state = self.lock();
        let number = next_number(&state, job);
        let build = Build {
            number: if enqueued { 0 } else { number },
            url: format!("https://jenkins.example.com/job/{job}/{number}/"),
            building: !enqueued,
            result: None,
            actions: vec![job_id_action(lighthouse_job)],
            queue_id: enqueued.then_some(number),
        };
        state
            .builds
            .entry(job.to_string())
            .or_default()
            .push(build.clone());
        build
    }

    /// Complete the build of `lighthouse_job` with a Jenkins result such as `SUCCESS`.
    pub fn finish(&self, job: &str, lighthouse_job: &str, result: &str) {
        let mut state = self.lock();
        if let Some(builds) = state.builds.get_mut(job) {
            for build in builds
                .iter_mut()
                .filter(|b| b.lighthouse_job_id() == Some(lighthouse_job))
            {
                build.building = false;
                build.queue_id = None;
                build.result = Some(result.to_string());
            }
        }
    }

    /// Parameterised launches, oldest first.
    #[must_use]
    pub fn launched(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.lock().launched.clone()
    }

    /// Jobs that received a build without parameters.
    #[must_use]
    pub fn plain_builds(&self) -> Vec<String> {
        self.lock().plain_builds.clone()
    }

    /// Reject the next `count` abort requests with a server error.
    pub fn fail_aborts(&self, count: u32) {
        self.lock().failing_aborts = count;
    }

    /// Abort requests that succeeded, oldest first.
    #[must_use]
    pub fn aborted(&self) -> Vec<(String, Build)> {
        self.lock().aborted.clone()
    }
}

fn prime(info: &mut JobInfo) {
    info.property = vec![JobProperty {
        parameter_definitions: vec![ParameterDefinition {
            name: LIGHTHOUSE_JOB_ID_PARAM.to_string(),
        }],
    }];
}

fn next_number(state: &State, job: &str) -> u64 {
    state.builds.get(job).map_or(0, Vec::len) as u64 + 1
}

fn job_id_action(lighthouse_job: &str) -> Action {
    Action {
        parameters: vec![Parameter {
            name: LIGHTHOUSE_JOB_ID_PARAM.to_string(),
            value: serde_json::Value::String(lighthouse_job.to_string()),
        }],
    }
}

#[async_trait]
impl JenkinsApi for FakeJenkins {
    async fn get_job(&self, job: &str) -> Result<JobInfo> {
        self.lock()
            .jobs
            .get(job)
            .cloned()
            .ok_or_else(|| JenkinsError::JobNotFound(job.to_string()))
    }

    async fn list_builds(&self, jobs: &[String]) -> Result<HashMap<String, Build>> {
        let state = self.lock();
        let mut out = HashMap::new();
        for job in jobs {
            for build in state.builds.get(job).into_iter().flatten() {
                if let Some(id) = build.lighthouse_job_id() {
                    out.insert(id.to_string(), build.clone());
                }
            }
        }
        Ok(out)
    }

    async fn build(&self, job: &str) -> Result<()> {
        let mut state = self.lock();
        let number = next_number(&state, job);
        let info = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| JenkinsError::JobNotFound(job.to_string()))?;
        prime(info);
        info.last_build = Some(BuildRef {
            number,
            url: format!("https://jenkins.example.com/job/{job}/{number}/"),
        });
        state.plain_builds.push(job.to_string());
        state.builds.entry(job.to_string()).or_default().push(Build {
            number,
            building: true,
            ..Build::default()
        });
        Ok(())
    }

    async fn build_with_parameters(&self, job: &str, params: &[(String, String)]) -> Result<()> {
        if !self.lock().jobs.contains_key(job) {
            return Err(JenkinsError::JobNotFound(job.to_string()));
        }
        if let Some((_, id)) = params.iter().find(|(k, _)| k == LIGHTHOUSE_JOB_ID_PARAM) {
            self.add_build(job, id, false);
        }
        self.lock()
            .launched
            .push((job.to_string(), params.to_vec()));
        Ok(())
    }

    async fn abort(&self, job: &str, build: &Build) -> Result<()> {
        let mut state = self.lock();
        if state.failing_aborts > 0 {
            state.failing_aborts -= 1;
            return Err(JenkinsError::Api {
                path: format!("/job/{job}/{}/stop", build.number),
                status: 500,
                message: "abort rejected".to_string(),
            });
        }
        state.aborted.push((job.to_string(), build.clone()));
        if let Some(builds) = state.builds.get_mut(job) {
            for b in builds
                .iter_mut()
                .filter(|b| b.number == build.number && b.queue_id == build.queue_id)
            {
                b.building = false;
                b.queue_id = None;
                b.result = Some(RESULT_ABORTED.to_string());
            }
        }
        Ok(())
    }
}
