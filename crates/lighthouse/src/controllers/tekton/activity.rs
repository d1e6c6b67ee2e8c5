//! Activity records derived from pipeline runs.

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use crate::crds::tekton::{succeeded_condition, Condition, StepState};
use crate::crds::{ActivityRecord, ActivityStage, ActivityStep, PipelineRun, PipelineState};
use crate::labels::{
    BASE_SHA_ANNOTATION, BRANCH, BUILD_NUM, CLONE_URI_ANNOTATION, CONTEXT, LAST_COMMIT_SHA, ORG,
    REPO,
};

/// State of a run or task run from its `Succeeded` condition and timestamps.
#[must_use]
pub fn pipeline_state_from(
    conditions: &[Condition],
    start: Option<DateTime<Utc>>,
    completion: Option<DateTime<Utc>>,
) -> PipelineState {
    let condition = succeeded_condition(conditions);
    match condition.map(|c| c.status.as_str()) {
        Some("True") => PipelineState::Success,
        Some("False") if condition.is_some_and(is_cancellation) => PipelineState::Aborted,
        Some("False") => PipelineState::Failure,
        _ if start.is_none() => PipelineState::Triggered,
        Some("Unknown") => PipelineState::Running,
        _ if completion.is_none() => PipelineState::Running,
        _ => PipelineState::Pending,
    }
}

fn is_cancellation(condition: &Condition) -> bool {
    condition
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("Cancelled"))
}

fn step_state(step: &StepState) -> PipelineState {
    match (&step.terminated, &step.running) {
        (Some(t), _) if t.exit_code == 0 => PipelineState::Success,
        (Some(_), _) => PipelineState::Failure,
        (None, Some(_)) => PipelineState::Running,
        (None, None) => PipelineState::Pending,
    }
}

fn to_step(step: &StepState) -> ActivityStep {
    ActivityStep {
        name: step.name.clone(),
        status: step_state(step),
        start_time: step
            .terminated
            .as_ref()
            .and_then(|t| t.started_at)
            .or_else(|| step.running.as_ref().and_then(|r| r.started_at)),
        completion_time: step.terminated.as_ref().and_then(|t| t.finished_at),
    }
}

/// Snapshot of `run` for the job status.
#[must_use]
pub fn to_activity(run: &PipelineRun) -> ActivityRecord {
    let labels = run.labels();
    let annotations = run.annotations();
    let label = |key: &str| labels.get(key).cloned().unwrap_or_default();
    let annotation = |key: &str| annotations.get(key).cloned().unwrap_or_default();
    let status = run.status.clone().unwrap_or_default();

    let mut stages: Vec<ActivityStage> = status
        .task_runs
        .values()
        .map(|task_run| {
            let task = task_run.status.clone().unwrap_or_default();
            ActivityStage {
                name: task_run.pipeline_task_name.clone(),
                status: pipeline_state_from(&task.conditions, task.start_time, task.completion_time),
                start_time: task.start_time,
                completion_time: task.completion_time,
                steps: task.steps.iter().map(to_step).collect(),
            }
        })
        .collect();
    // not yet started stages go last
    stages.sort_by(|a, b| match (a.start_time, b.start_time) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });

    ActivityRecord {
        name: run.name_any(),
        owner: label(ORG),
        repo: label(REPO),
        branch: label(BRANCH),
        build_id: label(BUILD_NUM),
        context: label(CONTEXT),
        git_url: annotation(CLONE_URI_ANNOTATION),
        log_url: None,
        status: pipeline_state_from(&status.conditions, status.start_time, status.completion_time),
        base_sha: annotation(BASE_SHA_ANNOTATION),
        last_commit_sha: label(LAST_COMMIT_SHA),
        start_time: status.start_time,
        completion_time: status.completion_time,
        stages,
        steps: Vec::new(),
    }
}

/// Job state for an activity state; a run that has not started is still pending for the job.
#[must_use]
pub fn job_state_from_activity(state: PipelineState) -> PipelineState {
    match state {
        PipelineState::Triggered => PipelineState::Pending,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn condition(status: &str, reason: Option<&str>) -> Vec<Condition> {
        vec![Condition {
            type_: "Succeeded".into(),
            status: status.into(),
            reason: reason.map(Into::into),
            message: None,
        }]
    }

    #[test]
    fn test_state_mapping() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(pipeline_state_from(&condition("True", None), Some(t), Some(t)), PipelineState::Success);
        assert_eq!(pipeline_state_from(&condition("False", None), Some(t), Some(t)), PipelineState::Failure);
        assert_eq!(
            pipeline_state_from(&condition("False", Some("PipelineRunCancelled")), Some(t), Some(t)),
            PipelineState::Aborted
        );
        assert_eq!(pipeline_state_from(&[], None, None), PipelineState::Triggered);
        assert_eq!(pipeline_state_from(&condition("Unknown", None), Some(t), None), PipelineState::Running);
        assert_eq!(pipeline_state_from(&[], Some(t), None), PipelineState::Running);
        assert_eq!(pipeline_state_from(&[], Some(t), Some(t)), PipelineState::Pending);
        assert_eq!(job_state_from_activity(PipelineState::Triggered), PipelineState::Pending);
    }

    #[test]
    fn test_activity_from_run() {
        let run: PipelineRun = serde_json::from_value(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "PipelineRun",
            "metadata": {
                "name": "acme-web-pr-1-42",
                "namespace": "jx",
                "labels": {
                    "lighthouse.jenkins-x.io/refs.org": "acme",
                    "lighthouse.jenkins-x.io/refs.repo": "web",
                    "lighthouse.jenkins-x.io/branch": "PR-1",
                    "lighthouse.jenkins-x.io/buildNum": "42",
                    "lighthouse.jenkins-x.io/context": "pr-build",
                    "lighthouse.jenkins-x.io/lastCommitSHA": "def"
                },
                "annotations": {
                    "lighthouse.jenkins-x.io/cloneURI": "https://github.com/acme/web.git",
                    "lighthouse.jenkins-x.io/baseSHA": "abc"
                }
            },
            "spec": {},
            "status": {
                "conditions": [{"type": "Succeeded", "status": "Unknown", "reason": "Running"}],
                "startTime": "2024-03-01T10:00:00Z",
                "taskRuns": {
                    "run-test-x": {
                        "pipelineTaskName": "test",
                        "status": {
                            "conditions": [{"type": "Succeeded", "status": "Unknown"}],
                            "startTime": "2024-03-01T10:05:00Z",
                            "steps": [{"name": "unit", "running": {"startedAt": "2024-03-01T10:05:01Z"}}]
                        }
                    },
                    "run-build-y": {
                        "pipelineTaskName": "build",
                        "status": {
                            "conditions": [{"type": "Succeeded", "status": "True"}],
                            "startTime": "2024-03-01T10:00:10Z",
                            "completionTime": "2024-03-01T10:04:00Z",
                            "steps": [
                                {"name": "compile", "terminated": {"exitCode": 0}},
                                {"name": "lint", "terminated": {"exitCode": 2}}
                            ]
                        }
                    },
                    "run-deploy-z": {"pipelineTaskName": "deploy"}
                }
            }
        }))
        .unwrap();

        let activity = to_activity(&run);
        assert_eq!(activity.name, "acme-web-pr-1-42");
        assert_eq!(activity.full_name(), "acme/web");
        assert_eq!(activity.build_id, "42");
        assert_eq!(activity.git_url, "https://github.com/acme/web.git");
        assert_eq!(activity.status, PipelineState::Running);

        let names: Vec<&str> = activity.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
        assert_eq!(activity.stages[0].steps[1].status, PipelineState::Failure);
        assert_eq!(activity.stages[1].steps[0].status, PipelineState::Running);
        assert_eq!(activity.stages[2].status, PipelineState::Triggered);
        assert_eq!(activity.running_stages(), vec!["test"]);
    }
}
