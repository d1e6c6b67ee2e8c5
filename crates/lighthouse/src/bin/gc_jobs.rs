/*
 * Lighthouse - Job Garbage Collector
 * Copyright (C) 2025 Lighthouse team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! One-shot deletion of `LighthouseJob` resources older than `--max-age`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use kube::Client;
use lighthouse::crds::LighthouseJob;
use lighthouse::gc::collect_garbage;
use lighthouse::store::KubeStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lighthouse-gc-jobs", version, about = "Delete old LighthouseJobs")]
struct Args {
    /// Namespace to collect jobs from
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Age after completion (or start, for unfinished jobs) at which a job is deleted
    #[arg(long, default_value = "168h", value_parser = humantime::parse_duration)]
    max_age: Duration,

    /// List the jobs that would be deleted without deleting them
    #[arg(long)]
    dry_run: bool,

    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let client = Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    let store = KubeStore::<LighthouseJob>::new(client);

    let report = collect_garbage(&store, &args.namespace, Utc::now(), args.max_age, args.dry_run)
        .await
        .with_context(|| format!("collecting jobs in {}", args.namespace))?;

    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        dry_run = args.dry_run,
        "Garbage collection finished"
    );
    if !report.failed.is_empty() {
        bail!(
            "failed to delete {} jobs: {}",
            report.failed.len(),
            report.failed.join(", ")
        );
    }
    Ok(())
}
