use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::catalog::Catalog;
use super::error::PipelineDefinitionError;
use super::orchestrator::{FleetOrchestrator, FleetRun, RunSummary};
use super::pool::PoolError;
use super::progress::{all_installed, pending_hosts, ProgressEvent, ProgressStore, ProgressUpdate};
use super::types::{
    AccountConfig, HostDescriptor, HostIdentity, InstallArtifacts, NetworkConfig, SharedConfig,
};
use super::util::validate_username;

/// Everything one deployment run needs, as submitted by an operator.
#[derive(Debug, Clone, Deserialize)]
pub struct RunPlan {
    pub hosts: Vec<HostDescriptor>,
    pub account: AccountConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub artifacts: InstallArtifacts,
}

impl RunPlan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read run plan {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse run plan {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.hosts.is_empty() {
            return Err(ManagerError::InvalidPlan("no hosts listed".to_string()));
        }
        validate_username(&self.account.username)
            .map_err(|err| ManagerError::InvalidPlan(err.to_string()))?;
        if self.account.password.is_empty() {
            return Err(ManagerError::InvalidPlan("Password is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("a deployment run is already in progress")]
    AlreadyRunning,
    #[error("a deployment run is in progress; cancel it first")]
    RunActive,
    #[error("invalid run plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineDefinitionError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub hosts: Vec<HostIdentity>,
    pub connect_failures: BTreeMap<HostIdentity, String>,
}

impl From<&FleetRun> for RunInfo {
    fn from(run: &FleetRun) -> Self {
        Self {
            run_id: run.id(),
            started_at: run.started_at(),
            hosts: run.hosts().to_vec(),
            connect_failures: run
                .connect_failures()
                .iter()
                .map(|(host, err)| (host.clone(), err.to_string()))
                .collect(),
        }
    }
}

/// Aggregate view backing the "continue" gate of the install screen.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run: Option<RunInfo>,
    pub running: bool,
    pub all_installed: bool,
    pub pending_hosts: Vec<HostIdentity>,
    pub message: Option<String>,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Recovering {what} from poisoned lock");
            poisoned.into_inner()
        }
    }
}

/// Clears the pending-start slot even when `start_run` is dropped mid-connect.
struct PendingStart<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        lock_or_recover(self.slot, "pending start").take();
    }
}

/// Owns the single active run and the progress store it writes to.
///
/// Connecting to the fleet happens outside the `active` lock. `start_gate`
/// serializes starts against resets, and `pending` holds the token of a run
/// that is still connecting.
pub struct DeploymentManager {
    orchestrator: FleetOrchestrator,
    active: tokio::sync::Mutex<Option<FleetRun>>,
    start_gate: tokio::sync::Mutex<()>,
    pending: Mutex<Option<CancellationToken>>,
    last: Mutex<Option<RunInfo>>,
}

impl DeploymentManager {
    pub fn new(orchestrator: FleetOrchestrator) -> Self {
        Self {
            orchestrator,
            active: tokio::sync::Mutex::new(None),
            start_gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        self.orchestrator.store()
    }

    fn last(&self) -> MutexGuard<'_, Option<RunInfo>> {
        lock_or_recover(&self.last, "run info")
    }

    fn pending(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        lock_or_recover(&self.pending, "pending start")
    }

    async fn is_running(&self) -> bool {
        if self.pending().is_some() {
            return true;
        }
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    pub async fn start_run(&self, plan: RunPlan) -> Result<RunInfo, ManagerError> {
        plan.validate()?;
        let _gate = self
            .start_gate
            .try_lock()
            .map_err(|_| ManagerError::AlreadyRunning)?;
        let requested = CancellationToken::new();
        *self.pending() = Some(requested.clone());
        let pending = PendingStart {
            slot: &self.pending,
        };
        if self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.is_finished())
        {
            return Err(ManagerError::AlreadyRunning);
        }
        let catalog = Catalog::new(plan.artifacts)?;
        let config = SharedConfig {
            account: plan.account,
            network: plan.network,
        };

        let started = self
            .orchestrator
            .start(&plan.hosts, config, Arc::new(catalog))
            .await;
        let run = started?;
        if requested.is_cancelled() {
            tracing::info!(run_id = %run.id(), "cancel requested while connecting");
            run.cancel();
        }

        let info = RunInfo::from(&run);
        *self.active.lock().await = Some(run);
        drop(pending);
        *self.last() = Some(info.clone());
        Ok(info)
    }

    /// Signals the active run to stop. Returns false when nothing is running.
    pub async fn cancel_run(&self) -> bool {
        let mut cancelled = false;
        if let Some(requested) = self.pending().as_ref() {
            tracing::info!("cancelling deployment run while hosts connect");
            requested.cancel();
            cancelled = true;
        }
        match self.active.lock().await.as_ref() {
            Some(run) if !run.is_finished() => {
                tracing::info!(run_id = %run.id(), "cancelling deployment run");
                run.cancel();
                true
            }
            _ => cancelled,
        }
    }

    pub async fn cancel_token(&self) -> Option<CancellationToken> {
        self.active.lock().await.as_ref().map(FleetRun::cancel_token)
    }

    /// Cancels any active run, waits for it to settle, then clears all progress.
    pub async fn reset(&self) {
        if let Some(requested) = self.pending().as_ref() {
            requested.cancel();
        }
        // Waits out a start that is still connecting.
        let _gate = self.start_gate.lock().await;
        let run = self.active.lock().await.take();
        if let Some(run) = run {
            run.cancel();
            if let Err(err) = run.wait().await {
                tracing::warn!(error = %err, "deployment run task failed during reset");
            }
        }
        *self.last() = None;
        self.store().reset();
    }

    /// Forgets a host's progress. Refused while a run is active.
    pub async fn drop_host(&self, host: &HostIdentity) -> Result<bool, ManagerError> {
        if self.is_running().await {
            return Err(ManagerError::RunActive);
        }
        Ok(self.store().delete(host))
    }

    /// Waits for the active run to finish and returns its summary.
    pub async fn wait(&self) -> Option<RunSummary> {
        let run = self.active.lock().await.take()?;
        match run.wait().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                tracing::warn!(error = %err, "deployment run task failed");
                None
            }
        }
    }

    pub async fn status(&self) -> RunStatus {
        let running = self.is_running().await;
        let snapshot = self.store().snapshot();
        let installed = all_installed(&snapshot);
        let pending = pending_hosts(&snapshot);
        let message = if installed {
            None
        } else if snapshot.is_empty() {
            Some("No hosts have reported progress yet".to_string())
        } else {
            let names: Vec<&str> = pending.iter().map(HostIdentity::as_str).collect();
            Some(format!(
                "Waiting for {} host(s) to finish installing: {}",
                pending.len(),
                names.join(", ")
            ))
        };
        RunStatus {
            run: self.last().clone(),
            running,
            all_installed: installed,
            pending_hosts: pending,
            message,
        }
    }

    pub fn progress(&self) -> Vec<ProgressUpdate> {
        self.store().updates()
    }

    pub fn watch(&self) -> broadcast::Receiver<ProgressEvent> {
        self.store().watch()
    }
}
