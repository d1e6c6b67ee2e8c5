//! Garbage collection of old jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::crds::LighthouseJob;
use crate::error::{Error, Result};
use crate::store::Store;

/// Default age after which jobs are deleted
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Whether `job` is older than `max_age` at `now`.
///
/// Age counts from the completion time, or from the start time while the
/// job has not completed. A job with neither is kept.
#[must_use]
pub fn is_expired(job: &LighthouseJob, now: DateTime<Utc>, max_age: Duration) -> bool {
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return false;
    };
    let Some(status) = &job.status else {
        return false;
    };
    status
        .completion_time
        .or(status.start_time)
        .and_then(|t| t.checked_add_signed(max_age))
        .is_some_and(|deadline| deadline < now)
}

/// Names of the expired jobs in `jobs`.
#[must_use]
pub fn select_expired(jobs: &[LighthouseJob], now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
    jobs.iter()
        .filter(|j| is_expired(j, now, max_age))
        .map(ResourceExt::name_any)
        .collect()
}

/// Outcome of one collection pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Delete the jobs of `namespace` that expired at `now`.
///
/// With `dry_run` the expired jobs are reported as deleted but left in place.
/// A job already gone counts as deleted.
#[instrument(skip_all, fields(namespace = %namespace, dry_run = dry_run))]
pub async fn collect_garbage(
    jobs: &dyn Store<LighthouseJob>,
    namespace: &str,
    now: DateTime<Utc>,
    max_age: Duration,
    dry_run: bool,
) -> Result<GcReport> {
    let all = jobs.list(namespace, &Default::default()).await?;
    let expired = select_expired(&all, now, max_age);
    info!(total = all.len(), expired = expired.len(), "Collecting expired jobs");

    let mut report = GcReport::default();
    for name in expired {
        if dry_run {
            info!(job = %name, "Would delete job");
            report.deleted.push(name);
            continue;
        }
        match jobs.delete(namespace, &name).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                info!(job = %name, "Deleted job");
                report.deleted.push(name);
            }
            Err(e) => {
                warn!(job = %name, error = %e, "Failed to delete job");
                report.failed.push(name);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJobSpec, LighthouseJobStatus, PipelineState};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn job(name: &str, start: Option<DateTime<Utc>>, completion: Option<DateTime<Utc>>) -> LighthouseJob {
        let mut job = LighthouseJob::new(name, LighthouseJobSpec::default());
        job.metadata.namespace = Some("jx".into());
        job.status = Some(LighthouseJobStatus {
            state: if completion.is_some() {
                PipelineState::Success
            } else {
                PipelineState::Running
            },
            start_time: start,
            completion_time: completion,
            ..LighthouseJobStatus::default()
        });
        job
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_expiry_prefers_completion_time() {
        let now = day(20);
        // started long ago but finished recently
        assert!(!is_expired(&job("a", Some(day(1)), Some(day(15))), now, DEFAULT_MAX_AGE));
        assert!(is_expired(&job("b", Some(day(1)), Some(day(2))), now, DEFAULT_MAX_AGE));
        assert!(is_expired(&job("c", Some(day(1)), None), now, DEFAULT_MAX_AGE));
        assert!(!is_expired(&job("d", None, None), now, DEFAULT_MAX_AGE));
        // exactly max age is kept
        assert!(!is_expired(&job("e", Some(day(13)), None), now, DEFAULT_MAX_AGE));
    }

    #[tokio::test]
    async fn test_dry_run_keeps_jobs() {
        let store = MemoryStore::new();
        store.insert(job("old", Some(day(1)), Some(day(2)))).unwrap();
        let report = collect_garbage(&store, "jx", day(20), DEFAULT_MAX_AGE, true)
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["old".to_string()]);
        assert_eq!(store.all().len(), 1);
    }
}
