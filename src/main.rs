use anyhow::{Context, Result};
use clap::Parser;
use fleet_deploy::services::deployments::{
    BackendConnector, DeploymentManager, FleetOrchestrator, ProgressEvent, ProgressStore, RunPlan,
};
use fleet_deploy::{cli, config, routes, state};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind fleet-deploy listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind fleet-deploy listener on {addr}"))
        }
    }
}

fn render(event: &ProgressEvent) -> Vec<String> {
    let ProgressEvent::Updated(update) = event else {
        return Vec::new();
    };
    let progress = &update.progress;
    let step = progress
        .failed_step()
        .or(progress.started_step())
        .or(progress.completed_step())
        .unwrap_or("-");
    let mut lines = vec![format!(
        "{host} [{pipeline}] {from:>3}% -> {to:>3}% {state} {step}",
        host = progress.host,
        pipeline = update.pipeline,
        from = progress.from,
        to = progress.to,
        state = progress.outcome.label(),
    )];
    if let Some(error) = progress.error() {
        lines.push(format!("{host}   error: {error}", host = progress.host));
    }
    lines
}

/// Emits rendered progress until `done` fires, then flushes whatever is
/// still queued so the final snapshots are not lost.
async fn follow_progress(
    mut events: Receiver<ProgressEvent>,
    done: CancellationToken,
    mut emit: impl FnMut(String),
) {
    loop {
        tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(event) => render(&event).into_iter().for_each(&mut emit),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress printer lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = done.cancelled() => break,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => render(&event).into_iter().for_each(&mut emit),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress printer lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Runs one plan to completion, printing progress, and fails unless every
/// host ends up installed.
async fn run_plan(manager: &DeploymentManager, path: &Path) -> Result<()> {
    let plan = RunPlan::load(path)?;
    let done = CancellationToken::new();
    let printer = tokio::spawn(follow_progress(manager.watch(), done.clone(), |line| {
        println!("{line}")
    }));

    let info = manager
        .start_run(plan)
        .await
        .context("failed to start deployment run")?;
    tracing::info!(run_id = %info.run_id, hosts = info.hosts.len(), "deployment run started");

    if let Some(token) = manager.cancel_token().await {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; cancelling after the current steps");
                token.cancel();
            }
        });
    }
    let summary = manager.wait().await;
    done.cancel();
    if let Err(err) = printer.await {
        tracing::warn!(error = %err, "progress printer failed");
    }

    let status = manager.status().await;
    if let Some(summary) = &summary {
        for (host, outcome) in &summary.hosts {
            tracing::info!(host = %host, outcome = ?outcome, "host finished");
        }
    }
    if !status.all_installed {
        anyhow::bail!(
            "{}",
            status
                .message
                .unwrap_or_else(|| "deployment did not complete".to_string())
        );
    }
    println!("All {} host(s) installed.", info.hosts.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::DeployConfig::from_env()?;
    let connector = Arc::new(BackendConnector::new(
        config.ssh_settings(),
        config.bmc_settings(),
    ));
    let orchestrator = FleetOrchestrator::new(
        connector,
        Arc::new(ProgressStore::new()),
        config.orchestrator_settings(),
    );
    let deployments = Arc::new(DeploymentManager::new(orchestrator));

    if let Some(plan) = args.plan.as_deref() {
        return run_plan(&deployments, plan).await;
    }

    tracing::info!(
        agent_url = %config.agent_url,
        pool_policy = ?config.pool_policy,
        max_parallel_hosts = config.max_parallel_hosts,
        "deployment service configured"
    );
    let state = state::AppState {
        deployments: deployments.clone(),
    };
    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    let shutdown = deployments.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            shutdown.cancel_run().await;
        })
        .await?;

    // Let in-flight steps settle so every session is released.
    deployments.wait().await;
    Ok(())
}
