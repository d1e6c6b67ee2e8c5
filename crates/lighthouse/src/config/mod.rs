//! Job and plugin configuration.
//!
//! Both documents live in ConfigMaps and are reloaded at runtime by
//! [`ConfigAgent`]. A document that fails to parse or validate never
//! replaces the last good one.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crds::{PipelineRunParam, PipelineRunSpec, Refs, TEKTON_AGENT};
use crate::error::{Error, Result};
use crate::periodic::Schedule;

pub mod watcher;

pub use watcher::ConfigAgent;

/// A document stored under one key of a ConfigMap.
pub trait ConfigKind: DeserializeOwned + Send + Sync + 'static {
    /// ConfigMap data key holding the document
    const KEY: &'static str;

    fn validate(&self) -> Result<()>;

    /// Parse and validate a YAML document. An empty document yields the defaults.
    fn parse(raw: &str) -> Result<Self> {
        let parsed: Self = if raw.trim().is_empty() {
            serde_yaml::from_str("{}")?
        } else {
            serde_yaml::from_str(raw)?
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

/// Job configuration (`config.yaml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub periodics: Vec<Periodic>,

    #[serde(default)]
    pub plank: Plank,

    #[serde(default)]
    pub jenkins: JenkinsConfig,

    /// Source-control provider kind (`github`, `gitlab`)
    #[serde(default = "default_git_kind")]
    pub git_kind: String,
}

fn default_git_kind() -> String {
    "github".to_string()
}

/// A job started on a schedule rather than by an event
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Periodic {
    pub name: String,

    /// Five or six field cron expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,

    /// Fixed interval such as `1h`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,

    #[serde(default = "default_agent")]
    pub agent: String,

    /// Namespace the job is created in; empty means the controller namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,

    #[serde(default)]
    pub max_concurrency: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_run_spec: Option<PipelineRunSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_run_params: Vec<PipelineRunParam>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn default_agent() -> String {
    TEKTON_AGENT.to_string()
}

impl Periodic {
    /// The parsed firing schedule.
    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::from_periodic(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Plank {
    /// Template appended to failure comments; rendered against the job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report_template: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JenkinsConfig {
    /// Template for the report URL of a Jenkins build; `{{BuildURL}}` is the build page
    #[serde(default = "default_job_url_template")]
    pub job_url_template: String,

    /// Upper bound on concurrent Jenkins calls per sync
    #[serde(default = "default_max_goroutines")]
    pub max_goroutines: usize,
}

fn default_job_url_template() -> String {
    "{{BuildURL}}".to_string()
}

fn default_max_goroutines() -> usize {
    20
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        Self {
            job_url_template: default_job_url_template(),
            max_goroutines: default_max_goroutines(),
        }
    }
}

impl ConfigKind for Config {
    const KEY: &'static str = "config.yaml";

    fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for periodic in &self.periodics {
            if periodic.name.is_empty() {
                return Err(Error::Config("periodic without a name".to_string()));
            }
            if !names.insert(periodic.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate periodic {}",
                    periodic.name
                )));
            }
            periodic.schedule()?;
        }
        if self.jenkins.max_goroutines == 0 {
            return Err(Error::Config(
                "jenkins.max_goroutines must be at least 1".to_string(),
            ));
        }
        match self.git_kind.as_str() {
            "github" | "gitlab" => Ok(()),
            other => Err(Error::Config(format!("unsupported git_kind {other}"))),
        }
    }
}

/// Plugin configuration (`plugins.yaml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Enabled plugins per `org` or `org/repo`
    #[serde(default)]
    pub plugins: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Trigger {
    #[serde(default)]
    pub repos: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trusted_org: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub join_org_url: String,

    #[serde(default)]
    pub only_org_members: bool,

    #[serde(default)]
    pub ignore_ok_to_test: bool,
}

impl ConfigKind for PluginConfig {
    const KEY: &'static str = "plugins.yaml";

    fn validate(&self) -> Result<()> {
        if let Some(key) = self.plugins.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Config(format!("invalid plugin scope {key:?}")));
        }
        for trigger in &self.triggers {
            if let Some(repo) = trigger.repos.iter().find(|r| r.trim().is_empty()) {
                return Err(Error::Config(format!("invalid trigger repo {repo:?}")));
            }
        }
        Ok(())
    }
}
