//! The failed-tests comment kept on a pull request.
//!
//! Each bot comment carrying [`COMMENT_TAG`] holds a table with one row per
//! failed context. Only the newest such comment survives a report; older ones
//! are deleted, and the newest is deleted as well once no failures remain.

use scm::{Comment, ScmClient};
use tracing::{debug, info};

use crate::crds::{LighthouseJob, PipelineState};
use crate::error::Result;
use crate::pipeline::template::{job_payload, render};

/// Marker identifying report comments
pub const COMMENT_TAG: &str = "<!-- test report -->";

const TABLE_HEADER: &str = "Test name | Commit | Details | Rerun command";
const TABLE_RULE: &str = "--- | --- | --- | ---";
const ABOUT: &str = "Instructions for interacting with me using PR comments are available [here](https://jenkins-x.io/docs/resources/faq/using/chatops/).";

/// What to do with the report comments of one pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentPlan {
    /// Outdated report comments to remove
    pub delete: Vec<u64>,
    /// Newest report comment, edited in place when failures remain
    pub latest: Option<u64>,
    /// Table rows of the new report
    pub entries: Vec<String>,
}

/// Table row for a failed job: `context | sha | [link](url) | `rerun``.
#[must_use]
pub fn create_entry(job: &LighthouseJob) -> String {
    let sha = job.spec.pull().map(|p| p.sha.as_str()).unwrap_or_default();
    let url = job
        .status
        .as_ref()
        .map(|s| s.report_url.as_str())
        .unwrap_or_default();
    [
        job.spec.context.clone(),
        sha.to_string(),
        format!("[link]({url})"),
        format!("`{}`", job.spec.rerun_command),
    ]
    .join(" | ")
}

/// Rows of a report comment body.
fn parse_entries(body: &str) -> Vec<&str> {
    body.lines()
        .skip_while(|l| l.trim() != TABLE_RULE)
        .skip(1)
        .take_while(|l| !l.trim().is_empty())
        .collect()
}

/// Work out the next report for `job` given the comments already on its pull request.
#[must_use]
pub fn plan(comments: &[Comment], bot: &str, job: &LighthouseJob) -> CommentPlan {
    let context = job.spec.context.as_str();
    let mut plan = CommentPlan::default();
    let mut latest_body = None;
    for comment in comments
        .iter()
        .filter(|c| c.author == bot && c.body.contains(COMMENT_TAG))
    {
        if let Some(previous) = plan.latest.replace(comment.id) {
            plan.delete.push(previous);
        }
        latest_body = Some(comment.body.as_str());
    }
    if let Some(body) = latest_body {
        plan.entries = parse_entries(body)
            .into_iter()
            .filter(|row| row.split(" | ").next().map(str::trim) != Some(context))
            .map(str::to_string)
            .collect();
    }
    if job.state() == Some(PipelineState::Failure) {
        plan.entries.push(create_entry(job));
    }
    plan
}

/// Body of a report comment.
#[must_use]
pub fn render_comment(author: &str, entries: &[String], extra: &str) -> String {
    let plural = if entries.len() > 1 { "s" } else { "" };
    let mut lines = vec![
        format!("@{author}: The following test{plural} **failed**, say `/retest` to rerun them all:"),
        String::new(),
        TABLE_HEADER.to_string(),
        TABLE_RULE.to_string(),
    ];
    lines.extend(entries.iter().cloned());
    if !extra.is_empty() {
        lines.push(String::new());
        lines.push(extra.to_string());
    }
    lines.extend(
        [
            "",
            "<details>",
            "",
            ABOUT,
            "</details>",
            COMMENT_TAG,
        ]
        .map(String::from),
    );
    lines.join("\n")
}

/// Bring the report comment of `job`'s pull request up to date.
pub async fn report(scm: &dyn ScmClient, job: &LighthouseJob, report_template: &str) -> Result<()> {
    let Some(refs) = &job.spec.refs else {
        return Ok(());
    };
    let Some(pull) = refs.pulls.first() else {
        return Ok(());
    };
    let repo = refs.full_name();
    let comments = scm.list_pull_request_comments(&repo, pull.number).await?;
    let plan = plan(&comments, scm.bot_name(), job);

    for id in &plan.delete {
        scm.delete_pull_request_comment(&repo, pull.number, *id).await?;
    }
    match (plan.latest, plan.entries.is_empty()) {
        (Some(id), true) => {
            info!(repo = %repo, pull = pull.number, "No failures left, removing report comment");
            scm.delete_pull_request_comment(&repo, pull.number, id).await?;
        }
        (None, true) => debug!(repo = %repo, pull = pull.number, "Nothing to report"),
        (latest, false) => {
            let extra = if report_template.is_empty() {
                String::new()
            } else {
                render(report_template, &job_payload(job))?
            };
            let body = render_comment(&pull.author, &plan.entries, &extra);
            match latest {
                Some(id) => {
                    scm.edit_pull_request_comment(&repo, pull.number, id, &body)
                        .await?;
                }
                None => {
                    scm.create_pull_request_comment(&repo, pull.number, &body)
                        .await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJobSpec, LighthouseJobStatus, PipelineKind, Pull, Refs};
    use scm::FakeClient;

    fn job(context: &str, state: PipelineState) -> LighthouseJob {
        let mut job = LighthouseJob::new(
            &format!("acme-web-pr-3-{context}"),
            LighthouseJobSpec {
                job_type: PipelineKind::Presubmit,
                context: context.into(),
                rerun_command: format!("/test {context}"),
                refs: Some(Refs {
                    org: "acme".into(),
                    repo: "web".into(),
                    pulls: vec![Pull {
                        number: 3,
                        sha: "abc".into(),
                        author: "octo".into(),
                        ..Pull::default()
                    }],
                    ..Refs::default()
                }),
                ..LighthouseJobSpec::default()
            },
        );
        job.status = Some(LighthouseJobStatus {
            state,
            report_url: format!("https://dash/{context}"),
            ..LighthouseJobStatus::default()
        });
        job
    }

    #[test]
    fn test_entry_format() {
        assert_eq!(
            create_entry(&job("unit", PipelineState::Failure)),
            "unit | abc | [link](https://dash/unit) | `/test unit`"
        );
    }

    #[test]
    fn test_plan_replaces_rows_of_same_context() {
        let body = render_comment(
            "octo",
            &[
                "unit | old | [link](x) | `/test unit`".to_string(),
                "lint | old | [link](y) | `/test lint`".to_string(),
            ],
            "",
        );
        let comments = vec![
            Comment { id: 1, body: body.clone(), author: "bot".into() },
            Comment { id: 2, body: "lgtm".into(), author: "octo".into() },
            Comment { id: 3, body, author: "bot".into() },
            Comment { id: 4, body: format!("fake {COMMENT_TAG}"), author: "octo".into() },
        ];

        let failed = plan(&comments, "bot", &job("unit", PipelineState::Failure));
        assert_eq!(failed.delete, vec![1]);
        assert_eq!(failed.latest, Some(3));
        assert_eq!(
            failed.entries,
            vec![
                "lint | old | [link](y) | `/test lint`".to_string(),
                "unit | abc | [link](https://dash/unit) | `/test unit`".to_string(),
            ]
        );

        let passed = plan(&comments, "bot", &job("lint", PipelineState::Success));
        assert_eq!(passed.entries, vec!["unit | old | [link](x) | `/test unit`".to_string()]);
    }

    #[tokio::test]
    async fn test_comment_lifecycle() {
        let scm = FakeClient::new("bot");

        report(&scm, &job("unit", PipelineState::Failure), "").await.unwrap();
        let comments = scm.comments("acme/web", 3);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.starts_with("@octo: The following test **failed**"));
        assert!(comments[0].body.ends_with(COMMENT_TAG));

        report(&scm, &job("lint", PipelineState::Failure), "[history](https://dash/{{ .Spec.Refs.Org }})")
            .await
            .unwrap();
        let comments = scm.comments("acme/web", 3);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.contains("following tests **failed**"));
        assert!(comments[0].body.contains("[history](https://dash/acme)"));

        report(&scm, &job("unit", PipelineState::Success), "").await.unwrap();
        report(&scm, &job("lint", PipelineState::Success), "").await.unwrap();
        assert!(scm.comments("acme/web", 3).is_empty());
    }
}
