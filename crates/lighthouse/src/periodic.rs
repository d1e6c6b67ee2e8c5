//! Scheduled jobs.
//!
//! The scheduler keeps the next fire time of every configured periodic and
//! launches a job when it is due. Job names are derived from the fire time,
//! so a fire seen twice (restarts, several replicas) creates one job.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, ConfigAgent, Periodic};
use crate::crds::{LighthouseJob, LighthouseJobSpec, PipelineKind};
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::naming::periodic_job_name;
use crate::pipeline::duration::parse_duration;

/// When a periodic fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    /// Fires on multiples of the interval since the Unix epoch
    Interval(Duration),
}

impl Schedule {
    /// Parse the schedule of `periodic`; exactly one of `cron` and `interval` must be set.
    pub fn from_periodic(periodic: &Periodic) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSchedule {
            job: periodic.name.clone(),
            reason,
        };
        match (periodic.cron.trim(), periodic.interval.trim()) {
            ("", "") => Err(invalid("one of cron or interval is required".to_string())),
            (cron, interval) if !cron.is_empty() && !interval.is_empty() => Err(invalid(format!(
                "cron {cron:?} and interval {interval:?} are mutually exclusive"
            ))),
            (cron, "") => {
                // the cron crate wants a leading seconds field
                let expr = if cron.split_whitespace().count() == 5 {
                    format!("0 {cron}")
                } else {
                    cron.to_string()
                };
                cron::Schedule::from_str(&expr)
                    .map(|s| Schedule::Cron(Box::new(s)))
                    .map_err(|e| invalid(e.to_string()))
            }
            (_, interval) => {
                let every = parse_duration(interval).map_err(|e| invalid(e.to_string()))?;
                if every.as_secs() == 0 {
                    return Err(invalid(format!("interval {interval:?} is shorter than a second")));
                }
                Ok(Schedule::Interval(every))
            }
        }
    }

    /// First fire strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Interval(every) => {
                let step = i64::try_from(every.as_secs()).ok()?;
                let next = (after.timestamp().div_euclid(step) + 1) * step;
                Utc.timestamp_opt(next, 0).single()
            }
        }
    }
}

/// The job for one fire of `periodic`.
#[must_use]
pub fn periodic_job(periodic: &Periodic, namespace: &str, fire: DateTime<Utc>) -> LighthouseJob {
    let mut job = LighthouseJob::new(
        &periodic_job_name(&periodic.name, fire),
        LighthouseJobSpec {
            job_type: PipelineKind::Periodic,
            agent: periodic.agent.clone(),
            job: periodic.name.clone(),
            refs: periodic.refs.clone(),
            context: if periodic.context.is_empty() {
                periodic.name.clone()
            } else {
                periodic.context.clone()
            },
            max_concurrency: periodic.max_concurrency,
            pipeline_run_spec: periodic.pipeline_run_spec.clone(),
            pipeline_run_params: periodic.pipeline_run_params.clone(),
            ..LighthouseJobSpec::default()
        },
    );
    job.metadata.namespace = Some(if periodic.namespace.is_empty() {
        namespace.to_string()
    } else {
        periodic.namespace.clone()
    });
    job.metadata.labels = Some(periodic.labels.clone());
    job.metadata.annotations = Some(periodic.annotations.clone());
    job
}

/// Next fire of one periodic, remembered with the schedule text it was computed from.
#[derive(Debug, Clone)]
struct Slot {
    cron: String,
    interval: String,
    next: DateTime<Utc>,
}

pub struct PeriodicScheduler {
    launcher: Arc<Launcher>,
    config: Arc<ConfigAgent<Config>>,
    namespace: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PeriodicScheduler {
    pub fn new(launcher: Arc<Launcher>, config: Arc<ConfigAgent<Config>>, namespace: &str) -> Self {
        Self {
            launcher,
            config,
            namespace: namespace.to_string(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Launch every periodic due at `now` and return the jobs created.
    ///
    /// A periodic seen for the first time, or whose schedule changed, is
    /// armed for its next fire after `now`. Fires missed between two ticks
    /// collapse into one job. A failed launch is retried on the next tick.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<LighthouseJob> {
        let config = self.config.config();
        let due = self.due(&config.periodics, now);

        let mut launched = Vec::new();
        for (periodic, fire) in due {
            let job = periodic_job(periodic, &self.namespace, fire);
            let fired = match self.launcher.launch(job).await {
                Ok(job) => {
                    info!(periodic = %periodic.name, job = %job.name_any(), "Periodic fired");
                    launched.push(job);
                    true
                }
                Err(Error::AlreadyExists(name)) => {
                    debug!(periodic = %periodic.name, job = %name, "Fire already launched");
                    true
                }
                Err(e) => {
                    warn!(periodic = %periodic.name, error = %e, "Failed to launch periodic");
                    false
                }
            };
            if fired {
                self.rearm(periodic, now);
            }
        }
        launched
    }

    /// Periodics whose next fire is at or before `now`, with that fire time.
    fn due<'a>(&self, periodics: &'a [Periodic], now: DateTime<Utc>) -> Vec<(&'a Periodic, DateTime<Utc>)> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|name, _| periodics.iter().any(|p| &p.name == name));

        let mut due = Vec::new();
        for periodic in periodics {
            let armed = slots
                .get(&periodic.name)
                .filter(|s| s.cron == periodic.cron && s.interval == periodic.interval)
                .map(|s| s.next);
            match armed {
                Some(next) if next <= now => due.push((periodic, next)),
                Some(_) => {}
                None => match Self::arm(periodic, now) {
                    Some(slot) => {
                        debug!(periodic = %periodic.name, next = %slot.next, "Armed periodic");
                        slots.insert(periodic.name.clone(), slot);
                    }
                    None => {
                        slots.remove(&periodic.name);
                    }
                },
            }
        }
        due
    }

    fn rearm(&self, periodic: &Periodic, now: DateTime<Utc>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match Self::arm(periodic, now) {
            Some(slot) => slots.insert(periodic.name.clone(), slot),
            None => slots.remove(&periodic.name),
        };
    }

    fn arm(periodic: &Periodic, now: DateTime<Utc>) -> Option<Slot> {
        let schedule = match periodic.schedule() {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(periodic = %periodic.name, error = %e, "Skipping periodic");
                return None;
            }
        };
        let next = schedule.next_after(now)?;
        Some(Slot {
            cron: periodic.cron.clone(),
            interval: periodic.interval.clone(),
            next,
        })
    }

    /// Tick every `period` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        info!(period = ?period, "Starting periodic scheduler");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("Periodic scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthousePipelineSecurityPolicy, PipelineState};
    use crate::naming::Snowflake;
    use crate::policy::PolicyResolver;
    use crate::store::{MemoryStore, Store, WriteOp};

    fn periodic(name: &str, cron: &str, interval: &str) -> Periodic {
        Periodic {
            name: name.into(),
            cron: cron.into(),
            interval: interval.into(),
            agent: "tekton-pipeline".into(),
            ..Periodic::default()
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
    }

    fn scheduler(periodics: Vec<Periodic>) -> (Arc<MemoryStore<LighthouseJob>>, PeriodicScheduler) {
        let jobs = Arc::new(MemoryStore::new());
        let launcher = Launcher::new(
            jobs.clone(),
            PolicyResolver::new(Arc::new(MemoryStore::<LighthousePipelineSecurityPolicy>::new()), "jx"),
            Arc::new(Snowflake::new(0)),
        );
        let config = Arc::new(ConfigAgent::new(Config {
            periodics,
            ..Config::default()
        }));
        (jobs, PeriodicScheduler::new(Arc::new(launcher), config, "jx"))
    }

    #[test]
    fn test_schedules() {
        let nightly = Schedule::from_periodic(&periodic("nightly", "0 2 * * *", "")).unwrap();
        assert_eq!(nightly.next_after(at(1, 0, 0)), Some(at(2, 0, 0)));
        assert_eq!(nightly.next_after(at(2, 0, 0)), Some(Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap()));

        let poll = Schedule::from_periodic(&periodic("poll", "", "15m")).unwrap();
        assert_eq!(poll.next_after(at(10, 7, 0)), Some(at(10, 15, 0)));
        assert_eq!(poll.next_after(at(10, 15, 0)), Some(at(10, 30, 0)));

        assert!(Schedule::from_periodic(&periodic("x", "", "")).is_err());
        assert!(Schedule::from_periodic(&periodic("x", "0 2 * * *", "1h")).is_err());
        assert!(Schedule::from_periodic(&periodic("x", "", "soon")).is_err());
    }

    #[test]
    fn test_periodic_job_shape() {
        let mut p = periodic("nightly", "0 2 * * *", "");
        p.labels.insert("team".into(), "infra".into());
        let job = periodic_job(&p, "jx", at(2, 0, 0));
        assert_eq!(job.name_any(), format!("nightly-{}", at(2, 0, 0).timestamp()));
        assert_eq!(job.spec.job_type, PipelineKind::Periodic);
        assert_eq!(job.spec.context, "nightly");
        assert_eq!(job.namespace().as_deref(), Some("jx"));
        assert_eq!(job.labels()["team"], "infra");
    }

    #[tokio::test]
    async fn test_tick_launches_due_periodics_once() {
        let (jobs, scheduler) = scheduler(vec![periodic("poll", "", "15m"), periodic("nightly", "0 2 * * *", "")]);

        // first sighting only arms
        assert!(scheduler.tick(at(10, 7, 0)).await.is_empty());
        assert!(scheduler.tick(at(10, 14, 59)).await.is_empty());

        let launched = scheduler.tick(at(10, 15, 3)).await;
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].name_any(), format!("poll-{}", at(10, 15, 0).timestamp()));
        assert_eq!(launched[0].state(), Some(PipelineState::Triggered));

        assert!(scheduler.tick(at(10, 20, 0)).await.is_empty());
        // two missed fires collapse into one
        assert_eq!(scheduler.tick(at(10, 50, 0)).await.len(), 1);
        assert_eq!(jobs.list("jx", &Default::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_fire_is_suppressed() {
        let (jobs, first) = scheduler(vec![periodic("poll", "", "15m")]);
        first.tick(at(10, 7, 0)).await;
        assert_eq!(first.tick(at(10, 15, 0)).await.len(), 1);

        // a second replica sharing the store sees the same fire
        let launcher = Launcher::new(
            jobs.clone(),
            PolicyResolver::new(Arc::new(MemoryStore::<LighthousePipelineSecurityPolicy>::new()), "jx"),
            Arc::new(Snowflake::new(1)),
        );
        let config = Arc::new(ConfigAgent::new(Config {
            periodics: vec![periodic("poll", "", "15m")],
            ..Config::default()
        }));
        let second = PeriodicScheduler::new(Arc::new(launcher), config, "jx");
        second.tick(at(10, 7, 0)).await;
        assert!(second.tick(at(10, 15, 1)).await.is_empty());
        assert_eq!(jobs.all().len(), 1);
    }

    #[tokio::test]
    async fn test_fire_left_without_status_is_completed_next_tick() {
        let (jobs, scheduler) = scheduler(vec![periodic("poll", "", "15m")]);
        scheduler.tick(at(10, 7, 0)).await;

        jobs.fail_next(WriteOp::ReplaceStatus, 1);
        assert!(scheduler.tick(at(10, 15, 0)).await.is_empty());
        assert!(jobs.all()[0].status.is_none());

        let launched = scheduler.tick(at(10, 15, 30)).await;
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].name_any(), format!("poll-{}", at(10, 15, 0).timestamp()));
        let stored = jobs.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state(), Some(PipelineState::Triggered));
    }
}
