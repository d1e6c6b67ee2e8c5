/*
 * Lighthouse - Job Controller Service
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

//! Controller Service - reconcilers for `LighthouseJob` resources
//!
//! This service:
//! - Turns triggered Tekton jobs into pipeline runs and follows their progress
//! - Re-parents pipeline runs re-run from the Tekton dashboard
//! - Drives Jenkins builds for jobs using the Jenkins agent
//! - Reports job progress to the source-control provider
//! - Launches periodic jobs
//! - Serves health and readiness endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::{Api, Client};
use lighthouse::config::{Config, ConfigAgent, ConfigKind, PluginConfig};
use lighthouse::controllers::{
    feed, run_workers, JenkinsController, RerunReconciler, TektonReconciler,
};
use lighthouse::crds::{
    LighthouseBreakpoint, LighthouseJob, LighthousePipelineSecurityPolicy, Pipeline, PipelineRun,
};
use lighthouse::labels::{CREATED_BY_LIGHTHOUSE, RERUN_OF};
use lighthouse::naming::Snowflake;
use lighthouse::periodic::PeriodicScheduler;
use lighthouse::policy::PolicyResolver;
use lighthouse::queue::{QueueKey, WorkQueue};
use lighthouse::reporter::StatusReporter;
use lighthouse::store::{KubeStore, Store};
use lighthouse::Launcher;
use serde_json::{json, Value};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PERIODIC_TICK: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "lighthouse-controller", version, about = "Lighthouse job controllers")]
struct Args {
    /// Namespace holding the controller configuration, policies and breakpoints
    #[arg(long, env = "NAMESPACE", default_value = "jx")]
    namespace: String,

    /// Workers per reconciler
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: usize,

    /// Period of the full informer resync
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[arg(long, env = "CONFIG_MAP", default_value = "config")]
    config_map: String,

    #[arg(long, env = "PLUGIN_CONFIG_MAP", default_value = "plugins")]
    plugin_config_map: String,

    /// Jenkins server; the Jenkins controller only runs when set
    #[arg(long, env = "JENKINS_URL")]
    jenkins_url: Option<String>,

    #[arg(long, env = "JENKINS_USER", default_value = "")]
    jenkins_user: String,

    #[arg(long, env = "JENKINS_TOKEN", default_value = "", hide_env_values = true)]
    jenkins_token: String,

    #[arg(long, env = "JENKINS_SYNC_SECONDS", default_value_t = 30)]
    jenkins_sync_seconds: u64,

    /// Source-control provider; defaults to `git_kind` of the job configuration
    #[arg(long, env = "GIT_KIND")]
    git_kind: Option<String>,

    /// API URL of a self-hosted provider
    #[arg(long, env = "GIT_SERVER", default_value = "")]
    git_server: String,

    /// Provider token; reporting is disabled without one
    #[arg(long, env = "GIT_TOKEN", hide_env_values = true)]
    git_token: Option<String>,

    #[arg(long, env = "BOT_NAME", default_value = "jenkins-x-bot")]
    bot_name: String,

    /// Node id embedded in generated names; must differ between replicas
    #[arg(long, env = "NODE_ID", default_value_t = 0)]
    node_id: u16,
}

#[derive(Clone)]
struct AppState {
    ready: Arc<AtomicBool>,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build a config agent seeded from ConfigMap `name`; a missing or broken map yields defaults.
async fn load_config<T: ConfigKind + Default>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Arc<ConfigAgent<T>>> {
    let agent = Arc::new(ConfigAgent::new(T::default()));
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api
        .get_opt(name)
        .await
        .with_context(|| format!("reading ConfigMap {namespace}/{name}"))?
    {
        Some(cm) => {
            if let Err(e) = agent.apply(&cm) {
                warn!(configmap = %name, error = %e, "Starting with default configuration");
            }
        }
        None => warn!(configmap = %name, "ConfigMap not found, starting with defaults"),
    }
    Ok(agent)
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(
        "Starting Lighthouse controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!(namespace = %args.namespace, "Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let state = AppState {
        ready: Arc::new(AtomicBool::new(false)),
    };
    let resync = Some(Duration::from_secs(args.resync_seconds));

    let config = load_config::<Config>(&client, &args.namespace, &args.config_map).await?;
    let plugins =
        load_config::<PluginConfig>(&client, &args.namespace, &args.plugin_config_map).await?;

    let jobs: Arc<dyn Store<LighthouseJob>> = Arc::new(KubeStore::new(client.clone()));
    let runs: Arc<dyn Store<PipelineRun>> = Arc::new(KubeStore::new(client.clone()));
    let pipelines: Arc<dyn Store<Pipeline>> = Arc::new(KubeStore::new(client.clone()));
    let breakpoints: Arc<dyn Store<LighthouseBreakpoint>> =
        Arc::new(KubeStore::new(client.clone()));
    let policies: Arc<dyn Store<LighthousePipelineSecurityPolicy>> =
        Arc::new(KubeStore::new(client.clone()));
    let ids = Arc::new(Snowflake::new(args.node_id));
    let resolver = PolicyResolver::new(policies, &args.namespace);

    let mut tasks = JoinSet::new();

    tasks.spawn(Arc::clone(&config).watch(
        client.clone(),
        args.namespace.clone(),
        args.config_map.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(Arc::clone(&plugins).watch(
        client.clone(),
        args.namespace.clone(),
        args.plugin_config_map.clone(),
        shutdown.clone(),
    ));

    // jobs move to their policy namespace, so jobs and runs are watched cluster wide
    let job_api: Api<LighthouseJob> = Api::all(client.clone());
    let run_api: Api<PipelineRun> = Api::all(client.clone());
    let run_selector = format!("{CREATED_BY_LIGHTHOUSE}=true");

    // Tekton
    let tekton_queue = WorkQueue::<QueueKey>::new();
    let tekton = Arc::new(TektonReconciler::new(
        Arc::clone(&jobs),
        Arc::clone(&runs),
        pipelines,
        breakpoints,
        resolver.clone(),
        ids.clone(),
        &args.namespace,
    ));
    tasks.spawn(feed(
        job_api.clone(),
        watcher::Config::default(),
        Arc::clone(&tekton_queue),
        TektonReconciler::job_key,
        resync,
        shutdown.clone(),
    ));
    tasks.spawn(feed(
        run_api.clone(),
        watcher::Config::default().labels(&run_selector),
        Arc::clone(&tekton_queue),
        TektonReconciler::run_key,
        resync,
        shutdown.clone(),
    ));
    tasks.spawn(run_workers("tekton", Arc::clone(&tekton_queue), tekton, args.workers));

    // Dashboard reruns
    let rerun_queue = WorkQueue::<QueueKey>::new();
    let rerun = Arc::new(RerunReconciler::new(Arc::clone(&jobs), Arc::clone(&runs)));
    tasks.spawn(feed(
        run_api,
        watcher::Config::default().labels(RERUN_OF),
        Arc::clone(&rerun_queue),
        RerunReconciler::run_key,
        None,
        shutdown.clone(),
    ));
    tasks.spawn(run_workers("rerun", Arc::clone(&rerun_queue), rerun, args.workers));

    // Reporting
    let report_queue = WorkQueue::<QueueKey>::new();
    match &args.git_token {
        Some(token) if !token.is_empty() => {
            let kind = args
                .git_kind
                .clone()
                .unwrap_or_else(|| config.config().git_kind.clone());
            let scm = scm::new_client(&kind, &args.git_server, token, &args.bot_name)
                .context("creating source-control client")?;
            let reporter = Arc::new(StatusReporter::new(
                Arc::clone(&jobs),
                Arc::from(scm),
                Arc::clone(&config),
            ));
            tasks.spawn(feed(
                job_api,
                watcher::Config::default(),
                Arc::clone(&report_queue),
                StatusReporter::job_key,
                resync,
                shutdown.clone(),
            ));
            tasks.spawn(run_workers("reporter", Arc::clone(&report_queue), reporter, args.workers));
            info!(provider = %kind, "Status reporting enabled");
        }
        _ => warn!("No git token configured, status reporting disabled"),
    }

    // Jenkins
    if let Some(url) = &args.jenkins_url {
        let api = jenkins::JenkinsClient::connect(url, &args.jenkins_user, &args.jenkins_token)
            .await
            .with_context(|| format!("connecting to Jenkins at {url}"))?;
        let controller = Arc::new(JenkinsController::new(
            Arc::clone(&jobs),
            Arc::new(api),
            Arc::clone(&config),
            ids.clone(),
            &args.namespace,
        ));
        tasks.spawn(controller.run(
            Duration::from_secs(args.jenkins_sync_seconds),
            shutdown.clone(),
        ));
    }

    // Periodics
    let launcher = Arc::new(Launcher::new(Arc::clone(&jobs), resolver, ids));
    let scheduler = Arc::new(PeriodicScheduler::new(
        launcher,
        Arc::clone(&config),
        &args.namespace,
    ));
    tasks.spawn(scheduler.run(PERIODIC_TICK, shutdown.clone()));

    state.ready.store(true, Ordering::SeqCst);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", args.health_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Health server listening on {addr}");

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await?;

    state.ready.store(false, Ordering::SeqCst);
    shutdown.cancel();
    tekton_queue.shut_down();
    rerun_queue.shut_down();
    report_queue.shut_down();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "Background task failed");
        }
    }
    info!("Controller service stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "lighthouse-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.ready.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "lighthouse-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
