//! `LighthouseJob` to `PipelineRun` translation.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use regex::Regex;
use tracing::debug;

use super::duration::{format_duration, parse_duration};
use super::env::{job_env, BUILD_ID, PULL_PULL_REF, REPO_URL};
use super::template::{refs_payload, render};
use crate::breakpoint::{self, BreakpointInput};
use crate::crds::tekton::{Param, ParamValue, PipelineTaskRunSpec, TimeoutFields};
use crate::crds::{
    LighthouseBreakpoint, LighthouseJob, LighthousePipelineSecurityPolicy, Pipeline,
    PipelineKind, PipelineRun, PipelineRunSpec, PipelineSpec, Refs,
};
use crate::error::{Error, Result};
use crate::labels::{job_annotations, job_labels, BUILD_NUM, JOB_ID};
use crate::naming::{run_generate_name, BuildIdGenerator};
use crate::policy::maximum_duration;
use crate::store::Store;

/// Pipeline timeout applied when the template sets none
pub const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

const GIT_CLONE_TASK: &str = "git-clone";
const GIT_BATCH_MERGE_TASK: &str = "git-batch-merge";

static PARAM_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\(params\.([A-Za-z0-9_.-]+)\)$").unwrap());

/// Everything the translator reads besides the job itself.
pub struct TranslateContext<'a> {
    /// Namespace the run is created in unless a policy moves it
    pub namespace: &'a str,
    pub build_ids: &'a dyn BuildIdGenerator,
    pub pipelines: &'a dyn Store<Pipeline>,
    pub breakpoints: &'a [LighthouseBreakpoint],
    pub policy: Option<&'a LighthousePipelineSecurityPolicy>,
}

/// A run ready to be created, and the build id baked into it.
#[derive(Debug, Clone)]
pub struct Translated {
    pub run: PipelineRun,
    pub build_id: String,
}

/// Build the pipeline run for `job`.
pub async fn make_pipeline_run(
    job: &LighthouseJob,
    ctx: &TranslateContext<'_>,
) -> Result<Translated> {
    let job_name = job.name_any();
    let template = job
        .spec
        .pipeline_run_spec
        .as_ref()
        .ok_or_else(|| Error::MissingPipelineSpec(job_name.clone()))?;

    let build_id = match job.labels().get(BUILD_NUM).filter(|id| !id.is_empty()) {
        Some(id) => id.clone(),
        None => ctx.build_ids.next_build_id(job)?,
    };
    if build_id.is_empty() {
        return Err(Error::EmptyBuildId);
    }

    let mut labels = job_labels(&job.spec, job.labels());
    labels.insert(BUILD_NUM.to_string(), build_id.clone());
    labels.insert(JOB_ID.to_string(), job_name.clone());
    let annotations = job_annotations(&job.spec, job.annotations());

    let mut spec = template.clone();
    if spec.timeout.is_none() {
        let timeouts = spec.timeouts.get_or_insert_with(TimeoutFields::default);
        if timeouts.pipeline.is_none() {
            timeouts.pipeline = Some(format_duration(DEFAULT_PIPELINE_TIMEOUT));
        }
    }

    let mut namespace = ctx.namespace.to_string();
    if let Some(policy) = ctx.policy {
        let enforce = &policy.spec.enforce;
        if !enforce.namespace.is_empty() {
            namespace = enforce.namespace.clone();
        }
    }

    let refs = job.spec.refs.clone().unwrap_or_default();
    let mut env = job_env(&job.spec);
    env.insert(BUILD_ID.to_string(), build_id.clone());
    if !refs.repo_url().is_empty() {
        env.insert(REPO_URL.to_string(), refs.repo_url().to_string());
    }
    if job.spec.job_type == PipelineKind::Batch {
        env.insert(PULL_PULL_REF.to_string(), refs.batched_refs());
    }

    let needs_tasks = job.spec.pipeline_run_params.is_empty() || !ctx.breakpoints.is_empty();
    let pipeline = if needs_tasks {
        resolve_pipeline(&spec, &namespace, ctx.pipelines).await?
    } else {
        None
    };

    if job.spec.pipeline_run_params.is_empty() {
        if let Some(pipeline) = &pipeline {
            env.extend(git_task_env(pipeline, &refs));
        }
    } else {
        let payload = refs_payload(&refs);
        for param in &job.spec.pipeline_run_params {
            env.insert(param.name.clone(), render(&param.value_template, &payload)?);
        }
    }

    for (name, value) in &env {
        match spec.params.iter_mut().find(|p| &p.name == name) {
            Some(existing) => existing.value = ParamValue::String(value.clone()),
            None => spec.params.push(Param::string(name, value)),
        }
    }

    if let Some(pipeline) = &pipeline {
        for task in pipeline.all_tasks() {
            let input = BreakpointInput::for_task(&job.spec, &task.name);
            let Some(debug) = breakpoint::resolve(ctx.breakpoints, &input) else {
                continue;
            };
            debug!(job = %job_name, task = %task.name, "Attaching breakpoint");
            match spec
                .task_run_specs
                .iter_mut()
                .find(|s| s.pipeline_task_name == task.name)
            {
                Some(existing) => existing.debug = Some(debug),
                None => spec.task_run_specs.push(PipelineTaskRunSpec {
                    pipeline_task_name: task.name.clone(),
                    debug: Some(debug),
                    ..PipelineTaskRunSpec::default()
                }),
            }
        }
    }

    if let Some(policy) = ctx.policy {
        let enforce = &policy.spec.enforce;
        if !enforce.service_account_name.is_empty() {
            spec.service_account_name = Some(enforce.service_account_name.clone());
        }
        if let Some(max) = maximum_duration(policy)? {
            clamp_timeout(&mut spec, max)?;
        }
    }

    let mut run = PipelineRun::new("", spec);
    run.metadata = ObjectMeta {
        generate_name: Some(run_generate_name(&job_name)),
        namespace: Some(namespace),
        labels: Some(labels),
        annotations: Some(annotations),
        owner_references: job.controller_owner_ref(&()).map(|r| vec![r]),
        ..ObjectMeta::default()
    };
    Ok(Translated { run, build_id })
}

/// The inline pipeline, or the referenced `Pipeline` from `namespace`.
async fn resolve_pipeline(
    spec: &PipelineRunSpec,
    namespace: &str,
    pipelines: &dyn Store<Pipeline>,
) -> Result<Option<PipelineSpec>> {
    if let Some(inline) = &spec.pipeline_spec {
        return Ok(Some(inline.clone()));
    }
    let Some(reference) = &spec.pipeline_ref else {
        return Ok(None);
    };
    match pipelines.get(namespace, &reference.name).await? {
        Some(pipeline) => Ok(Some(pipeline.spec)),
        None => Err(Error::MissingPipeline(format!("{namespace}/{}", reference.name))),
    }
}

/// Env entries for the pipeline params consumed by `git-clone` and
/// `git-batch-merge` tasks, keyed by the pipeline param each task param references.
fn git_task_env(pipeline: &PipelineSpec, refs: &Refs) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for task in pipeline.all_tasks() {
        let Some(task_ref) = &task.task_ref else {
            continue;
        };
        for param in &task.params {
            let Some(target) = param.as_str().and_then(param_reference) else {
                continue;
            };
            let value = match (task_ref.name.as_str(), param.name.as_str()) {
                (GIT_CLONE_TASK | GIT_BATCH_MERGE_TASK, "url") => refs.repo_url().to_string(),
                (GIT_CLONE_TASK, "revision") => refs.revision().to_string(),
                (GIT_BATCH_MERGE_TASK, "revision") => refs.base_revision().to_string(),
                (GIT_BATCH_MERGE_TASK, "batchedRefs") => refs.batched_refs(),
                _ => continue,
            };
            env.insert(target, value);
        }
    }
    env
}

/// `NAME` from `$(params.NAME)`.
fn param_reference(value: &str) -> Option<String> {
    PARAM_REFERENCE
        .captures(value.trim())
        .map(|c| c[1].to_string())
}

/// Lower the pipeline timeout to `max` when it is larger. A zero timeout means none.
fn clamp_timeout(spec: &mut PipelineRunSpec, max: Duration) -> Result<()> {
    if max.is_zero() {
        return Ok(());
    }
    let legacy = spec
        .timeouts
        .as_ref()
        .is_none_or(|t| t.pipeline.is_none())
        && spec.timeout.is_some();
    let current = if legacy {
        spec.timeout.clone()
    } else {
        spec.timeouts.as_ref().and_then(|t| t.pipeline.clone())
    };
    let current = current.as_deref().map(parse_duration).transpose()?;
    let exceeds = current.is_none_or(|d| d.is_zero() || d > max);
    if !exceeds {
        return Ok(());
    }
    let clamped = format_duration(max);
    if legacy {
        spec.timeout = Some(clamped);
    } else {
        spec.timeouts.get_or_insert_with(TimeoutFields::default).pipeline = Some(clamped);
    }
    Ok(())
}
