//! reqwest-backed [`JenkinsApi`] implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::error::{JenkinsError, Result};
use crate::types::{job_path, Build, BuildList, Crumb, JobInfo, Queue};
use crate::JenkinsApi;

const BUILDS_TREE: &str = "builds[number,url,building,result,actions[parameters[name,value]]]";
const QUEUE_TREE: &str = "items[id,task[name,url],actions[parameters[name,value]]]";
const JOB_TREE: &str = "name,url,lastBuild[number,url],property[parameterDefinitions[name]]";

/// Jenkins client authenticating with a user name and API token.
///
/// The CSRF crumb is fetched once in [`JenkinsClient::connect`] and refreshed
/// only when the server rejects a POST with 403.
pub struct JenkinsClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    token: String,
    crumb: Mutex<Option<Crumb>>,
}

impl JenkinsClient {
    /// Build a client and fetch the CSRF crumb. Servers without crumb protection are accepted.
    pub async fn connect(base_url: &str, user: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lighthouse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let client = Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            token: token.to_string(),
            crumb: Mutex::new(None),
        };
        client.refresh_crumb().await?;
        Ok(client)
    }

    async fn refresh_crumb(&self) -> Result<()> {
        let resp = self
            .request(Method::GET, "/crumbIssuer/api/json")
            .send()
            .await?;
        let crumb = if resp.status() == StatusCode::NOT_FOUND {
            debug!("Jenkins crumb issuer disabled");
            None
        } else {
            Some(check("/crumbIssuer/api/json", resp).await?.json::<Crumb>().await?)
        };
        *self.crumb.lock().unwrap_or_else(PoisonError::into_inner) = crumb;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if self.user.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.user, Some(&self.token))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(Method::GET, path).send().await?;
        Ok(check(path, resp).await?.json().await?)
    }

    async fn post(&self, path: &str, query: &[(String, String)]) -> Result<()> {
        let resp = self.send_post(path, query).await?;
        let resp = if resp.status() == StatusCode::FORBIDDEN {
            info!(path, "Jenkins rejected crumb, refreshing");
            self.refresh_crumb().await?;
            self.send_post(path, query).await?
        } else {
            resp
        };
        check(path, resp).await?;
        Ok(())
    }

    async fn send_post(&self, path: &str, query: &[(String, String)]) -> Result<Response> {
        let mut builder = self.request(Method::POST, path).query(query);
        let crumb = self
            .crumb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(crumb) = crumb {
            builder = builder.header(crumb.crumb_request_field, crumb.crumb);
        }
        Ok(builder.send().await?)
    }

    async fn job_builds(&self, job: &str) -> Result<Vec<Build>> {
        let path = format!("{}/api/json?tree={BUILDS_TREE}", job_path(job));
        let resp = self.request(Method::GET, &path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(JenkinsError::JobNotFound(job.to_string()));
        }
        let list: BuildList = check(&path, resp).await?.json().await?;
        Ok(list.builds)
    }
}

async fn check(path: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(JenkinsError::Api {
        path: path.to_string(),
        status: status.as_u16(),
        message,
    })
}

/// Last folder segment, which is what the queue reports as the task name.
fn leaf_name(job: &str) -> &str {
    job.rsplit('/').next().unwrap_or(job)
}

#[async_trait]
impl JenkinsApi for JenkinsClient {
    async fn get_job(&self, job: &str) -> Result<JobInfo> {
        let path = format!("{}/api/json?tree={JOB_TREE}", job_path(job));
        let resp = self.request(Method::GET, &path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(JenkinsError::JobNotFound(job.to_string()));
        }
        Ok(check(&path, resp).await?.json().await?)
    }

    async fn list_builds(&self, jobs: &[String]) -> Result<HashMap<String, Build>> {
        let mut builds: HashMap<String, Build> = HashMap::new();

        let queue: Queue = self
            .get_json(&format!("/queue/api/json?tree={QUEUE_TREE}"))
            .await?;
        for item in queue.items {
            if !jobs.iter().any(|job| leaf_name(job) == item.task.name) {
                continue;
            }
            let build = Build {
                url: item.task.url,
                actions: item.actions,
                queue_id: Some(item.id),
                ..Build::default()
            };
            if let Some(id) = build.lighthouse_job_id() {
                builds.insert(id.to_string(), build);
            }
        }

        for job in jobs {
            let job_builds = match self.job_builds(job).await {
                Ok(b) => b,
                Err(JenkinsError::JobNotFound(_)) => {
                    warn!(job = %job, "Jenkins job not found while listing builds");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for build in job_builds {
                let Some(id) = build.lighthouse_job_id().map(str::to_string) else {
                    continue;
                };
                // a started build supersedes its queue item; newer numbers win
                let replace = builds
                    .get(&id)
                    .is_none_or(|existing| existing.is_enqueued() || existing.number < build.number);
                if replace {
                    builds.insert(id, build);
                }
            }
        }
        Ok(builds)
    }

    async fn build(&self, job: &str) -> Result<()> {
        self.post(&format!("{}/build", job_path(job)), &[]).await
    }

    async fn build_with_parameters(&self, job: &str, params: &[(String, String)]) -> Result<()> {
        self.post(&format!("{}/buildWithParameters", job_path(job)), params)
            .await
    }

    async fn abort(&self, job: &str, build: &Build) -> Result<()> {
        match build.queue_id {
            Some(id) => {
                self.post("/queue/cancelItem", &[("id".to_string(), id.to_string())])
                    .await
            }
            None => {
                self.post(&format!("{}/{}/stop", job_path(job), build.number), &[])
                    .await
            }
        }
    }
}
