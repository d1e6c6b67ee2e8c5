//! Debug breakpoint resolution.

use crate::crds::tekton::TaskRunDebug;
use crate::crds::{BreakpointFilter, LighthouseBreakpoint, LighthouseJobSpec, PipelineKind};

/// What a task run looks like to breakpoint filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointInput {
    pub job_type: Option<PipelineKind>,
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub context: String,
    pub task: String,
}

impl BreakpointInput {
    /// Input for `task` of the job described by `spec`.
    #[must_use]
    pub fn for_task(spec: &LighthouseJobSpec, task: &str) -> Self {
        let (owner, repository) = spec
            .refs
            .as_ref()
            .map(|r| (r.org.clone(), r.repo.clone()))
            .unwrap_or_default();
        Self {
            job_type: Some(spec.job_type),
            owner,
            repository,
            branch: spec.branch(),
            context: spec.context.clone(),
            task: task.to_string(),
        }
    }
}

fn field_matches(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == value
}

/// A filter field is ignored when empty; otherwise it must equal the input.
#[must_use]
pub fn matches(filter: &BreakpointFilter, input: &BreakpointInput) -> bool {
    filter.job_type.is_none_or(|t| input.job_type == Some(t))
        && field_matches(&filter.owner, &input.owner)
        && field_matches(&filter.repository, &input.repository)
        && field_matches(&filter.branch, &input.branch)
        && field_matches(&filter.context, &input.context)
        && field_matches(&filter.task, &input.task)
}

/// Debug configuration of the first breakpoint matching `input`.
#[must_use]
pub fn resolve(breakpoints: &[LighthouseBreakpoint], input: &BreakpointInput) -> Option<TaskRunDebug> {
    breakpoints
        .iter()
        .find(|bp| matches(&bp.spec.filter, input))
        .and_then(|bp| bp.spec.debug.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::LighthouseBreakpointSpec;

    fn breakpoint(name: &str, filter: BreakpointFilter, reason: &str) -> LighthouseBreakpoint {
        LighthouseBreakpoint::new(
            name,
            LighthouseBreakpointSpec {
                filter,
                debug: Some(TaskRunDebug {
                    breakpoint: vec![reason.to_string()],
                }),
            },
        )
    }

    fn input() -> BreakpointInput {
        BreakpointInput {
            job_type: Some(PipelineKind::Presubmit),
            owner: "acme".into(),
            repository: "web".into(),
            branch: "PR-1".into(),
            context: "pr-build".into(),
            task: "build".into(),
        }
    }

    #[test]
    fn test_first_declared_match_wins() {
        let bps = vec![
            breakpoint(
                "other-repo",
                BreakpointFilter {
                    repository: "api".into(),
                    ..BreakpointFilter::default()
                },
                "onFailure",
            ),
            breakpoint(
                "web",
                BreakpointFilter {
                    owner: "acme".into(),
                    repository: "web".into(),
                    ..BreakpointFilter::default()
                },
                "onFailure",
            ),
            breakpoint("catch-all", BreakpointFilter::default(), "beforeSteps"),
        ];
        let debug = resolve(&bps, &input()).unwrap();
        assert_eq!(debug.breakpoint, vec!["onFailure".to_string()]);
    }

    #[test]
    fn test_type_and_task_filters() {
        let bps = vec![breakpoint(
            "postsubmit-deploy",
            BreakpointFilter {
                job_type: Some(PipelineKind::Postsubmit),
                task: "deploy".into(),
                ..BreakpointFilter::default()
            },
            "onFailure",
        )];
        assert!(resolve(&bps, &input()).is_none());

        let deploy = BreakpointInput {
            job_type: Some(PipelineKind::Postsubmit),
            task: "deploy".into(),
            ..input()
        };
        assert!(resolve(&bps, &deploy).is_some());
    }
}
