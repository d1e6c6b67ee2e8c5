//! Resource naming: time-ordered ids, job names, pinned run names and rerun suffixes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::crds::LighthouseJob;
use crate::error::Result;

const MAX_K8S_NAME_LENGTH: usize = 63;
/// 2020-01-01T00:00:00Z in milliseconds
const SNOWFLAKE_EPOCH_MS: i64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const RERUN_MARKER: &str = "-r-";
const RERUN_SUFFIX_HEX: usize = 5;

/// Source of build ids injected into pipelines as `BUILD_ID`.
pub trait BuildIdGenerator: Send + Sync {
    fn next_build_id(&self, job: &LighthouseJob) -> Result<String>;
}

/// 64-bit time-ordered ids: 41 bits of milliseconds since 2020-01-01, 10 bits
/// of node id and 12 bits of sequence. Ids never go backwards, even if the
/// wall clock does.
pub struct Snowflake {
    node: u64,
    state: Mutex<(u64, u64)>,
}

impl Snowflake {
    #[must_use]
    pub fn new(node: u16) -> Self {
        Self {
            node: u64::from(node) & ((1 << NODE_BITS) - 1),
            state: Mutex::new((0, 0)),
        }
    }

    /// Id for the current wall-clock time.
    pub fn next_id(&self) -> u64 {
        self.next_id_at(Utc::now())
    }

    /// Id for `now`; exposed so tests can drive the clock.
    pub fn next_id_at(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = u64::try_from(now.timestamp_millis() - SNOWFLAKE_EPOCH_MS).unwrap_or(0);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (last_ms, seq) = *state;
        let (ms, seq) = if elapsed > last_ms {
            (elapsed, 0)
        } else if seq < MAX_SEQUENCE {
            (last_ms, seq + 1)
        } else {
            // sequence exhausted for this millisecond: borrow the next one
            (last_ms + 1, 0)
        };
        *state = (ms, seq);
        (ms << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | seq
    }

    /// 16 lower-case hex digits, so lexical order matches time order.
    pub fn next_hex(&self) -> String {
        format!("{:016x}", self.next_id())
    }
}

impl Default for Snowflake {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BuildIdGenerator for Snowflake {
    fn next_build_id(&self, _job: &LighthouseJob) -> Result<String> {
        Ok(self.next_id().to_string())
    }
}

/// Lower-case DNS-1123 label: `[a-z0-9-]`, alphanumeric at both ends.
#[must_use]
pub fn to_dns_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = false;
    for c in value.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Shorten `name` to `limit` characters, keeping `suffix` intact and
/// replacing the cut tail of the prefix with a short hash.
#[must_use]
pub fn ensure_name_length(prefix: &str, suffix: &str, limit: usize) -> String {
    let full = format!("{prefix}{suffix}");
    if full.len() <= limit {
        return full;
    }
    let hash = hash_string(prefix);
    let available = limit.saturating_sub(suffix.len() + hash.len() + 1);
    let head: String = prefix.chars().take(available).collect();
    let head = head.trim_end_matches('-');
    format!("{head}-{hash}{suffix}")
}

fn hash_string(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:08x}", hasher.finish() & 0xffff_ffff)
}

/// Name of a new job: `<org>-<repo>-<branch>-<id>` when refs exist, else `<job>-<id>`.
#[must_use]
pub fn job_name(job: &LighthouseJob, id_hex: &str) -> String {
    let spec = &job.spec;
    let base = match &spec.refs {
        Some(refs) => format!("{}-{}-{}", refs.org, refs.repo, spec.branch()),
        None => spec.job.clone(),
    };
    let base = to_dns_label(&base);
    ensure_name_length(&base, &format!("-{id_hex}"), MAX_K8S_NAME_LENGTH)
}

/// Deterministic name for a periodic fire so duplicate fires collide.
#[must_use]
pub fn periodic_job_name(job: &str, fire: DateTime<Utc>) -> String {
    ensure_name_length(
        &to_dns_label(job),
        &format!("-{}", fire.timestamp()),
        MAX_K8S_NAME_LENGTH,
    )
}

/// `generateName` prefix for the runs of a job.
#[must_use]
pub fn run_generate_name(job_name: &str) -> String {
    // leave room for the 5 characters the API server appends
    ensure_name_length(job_name, "-", MAX_K8S_NAME_LENGTH - 5)
}

/// Final run name: the generate-name prefix followed by the build id.
#[must_use]
pub fn pinned_run_name(generate_name: &str, build_id: &str) -> String {
    let prefix = generate_name.trim_end_matches('-');
    ensure_name_length(prefix, &format!("-{build_id}"), MAX_K8S_NAME_LENGTH)
}

/// Parent name with any `-r-xxxxx` suffix removed.
#[must_use]
pub fn strip_rerun_suffix(name: &str) -> &str {
    if let Some(idx) = name.rfind(RERUN_MARKER) {
        let tail = &name[idx + RERUN_MARKER.len()..];
        if tail.len() == RERUN_SUFFIX_HEX && tail.chars().all(|c| c.is_ascii_hexdigit()) {
            return &name[..idx];
        }
    }
    name
}

/// Name for a rerun clone of `parent`: `<parent-base>-r-<5 hex>`.
pub fn rerun_job_name<R: Rng + ?Sized>(parent: &str, rng: &mut R) -> String {
    let suffix = format!("{RERUN_MARKER}{:05x}", rng.gen_range(0..0x10_0000u32));
    ensure_name_length(strip_rerun_suffix(parent), &suffix, MAX_K8S_NAME_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJobSpec, PipelineKind, Pull, Refs};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_snowflake_is_time_ordered() {
        let flake = Snowflake::new(3);
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = flake.next_id_at(t);
        let b = flake.next_id_at(t);
        let c = flake.next_id_at(t - chrono::Duration::seconds(10));
        let d = flake.next_id_at(t + chrono::Duration::milliseconds(1));
        assert!(a < b && b < c && c < d);
        assert_eq!((a >> SEQUENCE_BITS) & 0x3ff, 3);
        assert!(format!("{a:016x}") < format!("{d:016x}"));
    }

    #[test]
    fn test_job_name_embeds_branch_and_id() {
        let job = LighthouseJob::new(
            "",
            LighthouseJobSpec {
                job_type: PipelineKind::Presubmit,
                refs: Some(Refs {
                    org: "Acme".into(),
                    repo: "web_app".into(),
                    base_ref: "main".into(),
                    pulls: vec![Pull {
                        number: 12,
                        ..Pull::default()
                    }],
                    ..Refs::default()
                }),
                ..LighthouseJobSpec::default()
            },
        );
        assert_eq!(
            job_name(&job, "0123456789abcdef"),
            "acme-web-app-pr-12-0123456789abcdef"
        );
    }

    #[test]
    fn test_long_names_keep_suffix() {
        let prefix = "x".repeat(80);
        let name = ensure_name_length(&prefix, "-0123456789abcdef", 63);
        assert_eq!(name.len(), 63);
        assert!(name.ends_with("-0123456789abcdef"));
    }

    #[test]
    fn test_rerun_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let first = rerun_job_name("release-gin-app", &mut rng);
        assert!(first.starts_with("release-gin-app-r-"));
        assert_eq!(first.len(), "release-gin-app-r-".len() + 5);

        let second = rerun_job_name(&first, &mut rng);
        assert!(second.starts_with("release-gin-app-r-"));
        assert_eq!(second.len(), first.len());
        assert_eq!(strip_rerun_suffix("build-r-1"), "build-r-1");
    }

    #[test]
    fn test_pinned_run_name() {
        let generate = run_generate_name("acme-web-pr-1-0123456789abcdef");
        assert_eq!(generate, "acme-web-pr-1-0123456789abcdef-");
        assert_eq!(
            pinned_run_name(&generate, "42"),
            "acme-web-pr-1-0123456789abcdef-42"
        );
    }
}
