//! Text templates for pipeline params, report comments and report URLs.
//!
//! Templates are rendered with handlebars. Go-style leading-dot paths such as
//! `{{ .Refs.BaseSHA }}` are accepted and rewritten to `{{ Refs.BaseSHA }}`.

use std::sync::LazyLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::crds::{LighthouseJob, Refs};
use crate::error::{Error, Result};

static LEADING_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(~?\s*)\.([A-Za-z])").unwrap());

fn registry() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb
}

/// Rewrite `{{ .X }}` into `{{ X }}`.
#[must_use]
pub fn normalize(template: &str) -> String {
    LEADING_DOT.replace_all(template, "{{${1}${2}").into_owned()
}

/// Render `template` against `data`. Missing fields render as empty strings.
pub fn render<T: Serialize>(template: &str, data: &T) -> Result<String> {
    registry()
        .render_template(&normalize(template), data)
        .map_err(|e| Error::Template(e.to_string()))
}

/// Refs with Go-style field names.
#[must_use]
pub fn refs_value(refs: &Refs) -> Value {
    let pulls: Vec<Value> = refs
        .pulls
        .iter()
        .map(|p| {
            json!({
                "Number": p.number,
                "Author": p.author,
                "SHA": p.sha,
                "Ref": p.git_ref,
                "Link": p.link,
            })
        })
        .collect();
    json!({
        "Org": refs.org,
        "Repo": refs.repo,
        "RepoLink": refs.repo_link,
        "BaseRef": refs.base_ref,
        "BaseSHA": refs.base_sha,
        "BaseLink": refs.base_link,
        "CloneURI": refs.clone_uri,
        "Pulls": pulls,
    })
}

/// Payload for `PipelineRunParams` value templates: `{Refs}`.
#[must_use]
pub fn refs_payload(refs: &Refs) -> Value {
    json!({ "Refs": refs_value(refs) })
}

/// Payload for report templates: the job's spec and status.
#[must_use]
pub fn job_payload(job: &LighthouseJob) -> Value {
    let spec = &job.spec;
    let status = job.status.clone().unwrap_or_default();
    json!({
        "Name": job.metadata.name,
        "Namespace": job.metadata.namespace,
        "Spec": {
            "Type": spec.job_type.to_string(),
            "Agent": spec.agent,
            "Job": spec.job,
            "Context": spec.context,
            "RerunCommand": spec.rerun_command,
            "Refs": spec.refs.as_ref().map(refs_value),
        },
        "Status": {
            "State": status.state.to_string(),
            "ActivityName": status.activity_name,
            "Description": status.description,
            "URL": status.report_url,
        },
    })
}
