use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::client::{ConnectionClient, Connector, SharedClient};
use super::error::ConnectionError;
use super::executor::{StepContext, StepExecutor};
use super::pipeline::{InstallPipeline, PipelineDefinition, PipelineState};
use super::pool::{ClientPool, PoolBuild, PoolError, PoolPolicy};
use super::progress::{InstallProgress, ProgressOutcome, ProgressStore};
use super::types::{HostDescriptor, HostIdentity, PipelineKind, SharedConfig};

/// Step name recorded for hosts that never connected.
pub const CONNECT_STEP: &str = "connect";

/// Chooses the pipelines a host runs, in order.
pub trait PipelineFactory: Send + Sync {
    fn pipelines(&self, client: &dyn ConnectionClient) -> Vec<Arc<PipelineDefinition>>;
}

impl PipelineFactory for Vec<Arc<PipelineDefinition>> {
    fn pipelines(&self, _client: &dyn ConnectionClient) -> Vec<Arc<PipelineDefinition>> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub policy: PoolPolicy,
    pub max_parallel_hosts: usize,
    pub step_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            policy: PoolPolicy::FailFast,
            max_parallel_hosts: 64,
            step_timeout: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostOutcome {
    Succeeded,
    Failed { pipeline: PipelineKind, step: String },
    Cancelled { pipeline: PipelineKind },
    /// The host task panicked or was aborted.
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub hosts: BTreeMap<HostIdentity, HostOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        !self.hosts.is_empty()
            && self
                .hosts
                .values()
                .all(|outcome| *outcome == HostOutcome::Succeeded)
    }
}

/// Handle to a run in flight.
pub struct FleetRun {
    id: Uuid,
    started_at: DateTime<Utc>,
    hosts: Vec<HostIdentity>,
    connect_failures: BTreeMap<HostIdentity, ConnectionError>,
    cancel: CancellationToken,
    handle: JoinHandle<RunSummary>,
}

impl FleetRun {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn hosts(&self) -> &[HostIdentity] {
        &self.hosts
    }

    pub fn connect_failures(&self) -> &BTreeMap<HostIdentity, ConnectionError> {
        &self.connect_failures
    }

    /// Asks every pipeline to stop before its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A handle that cancels this run without borrowing it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for every host to settle and the pool to be disposed.
    pub async fn wait(self) -> Result<RunSummary, JoinError> {
        self.handle.await
    }
}

/// Fans pipelines out over a client pool and feeds the progress store.
pub struct FleetOrchestrator {
    connector: Arc<dyn Connector>,
    store: Arc<ProgressStore>,
    settings: OrchestratorSettings,
}

impl FleetOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<ProgressStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            connector,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Connects to `hosts` and starts their pipelines in the background.
    ///
    /// Under fail-fast, a connection failure is returned here and no
    /// pipeline starts.
    pub async fn start(
        &self,
        hosts: &[HostDescriptor],
        config: SharedConfig,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<FleetRun, PoolError> {
        self.store.reset();
        let PoolBuild { pool, failures } = ClientPool::create(
            self.connector.as_ref(),
            hosts,
            self.settings.policy,
            self.settings.max_parallel_hosts,
        )
        .await?;
        for (host, err) in &failures {
            self.store.set(
                host,
                PipelineKind::System,
                InstallProgress {
                    host: host.clone(),
                    from: 0,
                    to: 0,
                    outcome: ProgressOutcome::Failed {
                        failed_step: CONNECT_STEP.to_string(),
                        completed_step: None,
                        error: err.to_string(),
                    },
                },
            );
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let run_hosts = pool.hosts();
        let executor = StepExecutor::new(self.settings.step_timeout);
        let config = Arc::new(config);
        let store = self.store.clone();
        let run_cancel = cancel.clone();
        tracing::info!(
            run_id = %id,
            hosts = run_hosts.len(),
            failed_to_connect = failures.len(),
            "deployment run starting"
        );

        let handle = tokio::spawn(
            async move {
                let results = pool
                    .map(|client| {
                        run_host(
                            client,
                            config.clone(),
                            factory.clone(),
                            store.clone(),
                            executor,
                            run_cancel.clone(),
                        )
                    })
                    .await;
                pool.dispose().await;

                let hosts = pool
                    .hosts()
                    .into_iter()
                    .zip(results)
                    .map(|(host, result)| (host, result.unwrap_or(HostOutcome::Aborted)))
                    .collect();
                let summary = RunSummary { hosts };
                tracing::info!(
                    succeeded = summary.all_succeeded(),
                    cancelled = run_cancel.is_cancelled(),
                    "deployment run finished"
                );
                summary
            }
            .instrument(tracing::info_span!("fleet_run", run_id = %id)),
        );

        Ok(FleetRun {
            id,
            started_at: Utc::now(),
            hosts: run_hosts,
            connect_failures: failures,
            cancel,
            handle,
        })
    }
}

async fn run_host(
    client: SharedClient,
    config: Arc<SharedConfig>,
    factory: Arc<dyn PipelineFactory>,
    store: Arc<ProgressStore>,
    executor: StepExecutor,
    cancel: CancellationToken,
) -> HostOutcome {
    let host = client.host().clone();
    let identity = client.identity();
    tracing::info!(
        host = %host,
        backend = client.kind().as_str(),
        architecture = identity.architecture.as_deref().unwrap_or("unknown"),
        "host pipelines starting"
    );

    for definition in factory.pipelines(client.as_ref()) {
        let kind = definition.kind();
        let ctx = StepContext {
            client: client.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
        };
        let span = tracing::info_span!("host_pipeline", host = %host, pipeline = %kind);
        let state = InstallPipeline::new(definition.clone(), executor)
            .run(ctx, |progress| store.set(&host, kind, progress))
            .instrument(span)
            .await;
        match state {
            PipelineState::Succeeded => continue,
            PipelineState::Failed(index) => {
                let step = definition
                    .steps()
                    .get(index)
                    .map(|step| step.name.clone())
                    .unwrap_or_default();
                return HostOutcome::Failed {
                    pipeline: kind,
                    step,
                };
            }
            PipelineState::Cancelled => return HostOutcome::Cancelled { pipeline: kind },
            other => {
                tracing::warn!(host = %host, pipeline = %kind, state = ?other, "pipeline ended without a terminal state");
                return HostOutcome::Aborted;
            }
        }
    }
    HostOutcome::Succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::deployments::error::ConnectFailure;
    use crate::services::deployments::progress::ProgressEvent;
    use crate::test_support::{
        scripted_steps, shared_config, ssh_descriptor, MockConnector, ProgressRecorder,
        StepScript,
    };
    use std::sync::Mutex;

    const DRIVER: [(&str, u8); 4] = [
        ("preinstall", 50),
        ("step1", 98),
        ("step2", 100),
        ("complete", 100),
    ];

    fn orchestrator(connector: MockConnector) -> (FleetOrchestrator, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let orchestrator = FleetOrchestrator::new(
            connector.clone(),
            Arc::new(ProgressStore::new()),
            OrchestratorSettings {
                step_timeout: Duration::from_secs(5),
                ..OrchestratorSettings::default()
            },
        );
        (orchestrator, connector)
    }

    fn both_pipelines(script: &StepScript) -> anyhow::Result<Arc<dyn PipelineFactory>> {
        let system = PipelineDefinition::new(
            PipelineKind::System,
            scripted_steps(&[("image", 60), ("configure", 100)], script),
        )?;
        let driver = PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&DRIVER, script))?;
        Ok(Arc::new(vec![Arc::new(system), Arc::new(driver)]))
    }

    #[tokio::test]
    async fn failing_host_does_not_block_siblings() -> anyhow::Result<()> {
        let (orchestrator, connector) = orchestrator(MockConnector::new());
        let recorder = ProgressRecorder::attach(orchestrator.store());
        let script = StepScript::default().fail_on_host("10.0.0.2", "step1", "disk full");
        let hosts: Vec<_> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
            .into_iter()
            .map(ssh_descriptor)
            .collect();

        let run = orchestrator
            .start(&hosts, shared_config(), both_pipelines(&script)?)
            .await?;
        let summary = run.wait().await?;

        let store = orchestrator.store();
        for host in ["10.0.0.1", "10.0.0.3"] {
            let driver = store.get(&HostIdentity::new(host), PipelineKind::Driver);
            assert!(driver.as_ref().is_some_and(|p| p.is_succeeded() && p.to == 100));
            assert_eq!(summary.hosts[&HostIdentity::new(host)], HostOutcome::Succeeded);
        }
        let failed = store.get(&HostIdentity::new("10.0.0.2"), PipelineKind::Driver);
        assert_eq!(failed.as_ref().and_then(|p| p.failed_step()), Some("step1"));
        assert_eq!(failed.as_ref().and_then(|p| p.error()), Some("disk full"));
        assert_eq!(
            summary.hosts[&HostIdentity::new("10.0.0.2")],
            HostOutcome::Failed {
                pipeline: PipelineKind::Driver,
                step: "step1".to_string()
            }
        );
        assert!(!store.all_installed());

        let host_two = recorder.for_host("10.0.0.2", PipelineKind::Driver);
        assert!(host_two
            .iter()
            .all(|p| p.started_step() != Some("step2") && p.completed_step() != Some("step2")));
        assert_eq!(
            script.invocations_for("10.0.0.2"),
            vec!["image", "configure", "preinstall", "step1"]
        );

        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let Some(client) = connector.client(host) else {
                panic!("missing client {host}");
            };
            assert_eq!(client.dispose_count(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn all_hosts_succeeding_opens_the_gate() -> anyhow::Result<()> {
        let (orchestrator, _) = orchestrator(MockConnector::new());
        let script = StepScript::default();
        let hosts = vec![ssh_descriptor("10.0.0.1"), ssh_descriptor("10.0.0.2")];
        let run = orchestrator
            .start(&hosts, shared_config(), both_pipelines(&script)?)
            .await?;
        let summary = run.wait().await?;
        assert!(summary.all_succeeded());
        assert!(orchestrator.store().all_installed());
        Ok(())
    }

    #[tokio::test]
    async fn connection_failure_aborts_the_run() -> anyhow::Result<()> {
        let (orchestrator, connector) =
            orchestrator(MockConnector::new().reject("B", ConnectFailure::Unreachable));
        let script = StepScript::default();
        let hosts = vec![ssh_descriptor("A"), ssh_descriptor("B")];

        let result = orchestrator
            .start(&hosts, shared_config(), both_pipelines(&script)?)
            .await;
        match result {
            Err(PoolError::Connect(err)) => assert_eq!(err.host.as_str(), "B"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("run should not start"),
        }
        let Some(a) = connector.client("A") else {
            panic!("A should have connected");
        };
        assert_eq!(a.dispose_count(), 1);
        assert!(script.invocations().is_empty());
        assert!(orchestrator.store().snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn partial_policy_records_connect_failures() -> anyhow::Result<()> {
        let connector = Arc::new(MockConnector::new().reject("B", ConnectFailure::Rejected));
        let orchestrator = FleetOrchestrator::new(
            connector,
            Arc::new(ProgressStore::new()),
            OrchestratorSettings {
                policy: PoolPolicy::Partial,
                ..OrchestratorSettings::default()
            },
        );
        let script = StepScript::default();
        let hosts = vec![ssh_descriptor("A"), ssh_descriptor("B")];
        let run = orchestrator
            .start(&hosts, shared_config(), both_pipelines(&script)?)
            .await?;
        assert_eq!(run.hosts(), &[HostIdentity::new("A")]);
        assert!(run.connect_failures().contains_key(&HostIdentity::new("B")));
        run.wait().await?;

        let b = orchestrator
            .store()
            .get(&HostIdentity::new("B"), PipelineKind::System);
        assert_eq!(b.as_ref().and_then(|p| p.failed_step()), Some(CONNECT_STEP));
        assert!(!orchestrator.store().all_installed());
        Ok(())
    }

    #[tokio::test]
    async fn interleaved_hosts_keep_their_own_step_order() -> anyhow::Result<()> {
        let (orchestrator, _) = orchestrator(MockConnector::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        orchestrator.store().subscribe(move |event| {
            if let ProgressEvent::Updated(update) = event {
                if let Some(step) = update.progress.started_step() {
                    sink.lock()
                        .expect("order lock")
                        .push((update.progress.host.to_string(), step.to_string()));
                }
            }
        });
        let script = StepScript::default()
            .delay_for("A", Duration::from_millis(10))
            .delay_for("B", Duration::from_millis(1));
        let driver = PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&DRIVER, &script))?;
        let factory: Arc<dyn PipelineFactory> = Arc::new(vec![Arc::new(driver)]);
        let hosts = vec![ssh_descriptor("A"), ssh_descriptor("B")];
        orchestrator
            .start(&hosts, shared_config(), factory)
            .await?
            .wait()
            .await?;

        let order = order.lock().expect("order lock").clone();
        for host in ["A", "B"] {
            let steps: Vec<&str> = order
                .iter()
                .filter(|(seen, _)| seen == host)
                .map(|(_, step)| step.as_str())
                .collect();
            assert_eq!(steps, vec!["preinstall", "step1", "step2", "complete"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancel_stops_hosts_and_disposes_once() -> anyhow::Result<()> {
        let (orchestrator, connector) = orchestrator(MockConnector::new());
        let script = StepScript::default()
            .delay_for("A", Duration::from_millis(30))
            .delay_for("B", Duration::from_millis(30));
        let driver = PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&DRIVER, &script))?;
        let factory: Arc<dyn PipelineFactory> = Arc::new(vec![Arc::new(driver)]);
        let hosts = vec![ssh_descriptor("A"), ssh_descriptor("B")];
        let run = orchestrator.start(&hosts, shared_config(), factory).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        run.cancel();
        let summary = run.wait().await?;

        for host in ["A", "B"] {
            assert_eq!(
                summary.hosts[&HostIdentity::new(host)],
                HostOutcome::Cancelled {
                    pipeline: PipelineKind::Driver
                }
            );
            let progress = orchestrator
                .store()
                .get(&HostIdentity::new(host), PipelineKind::Driver);
            assert_eq!(progress.as_ref().map(|p| p.ok()), Some(false));
            assert_eq!(
                progress.as_ref().and_then(|p| p.completed_step()),
                Some("preinstall")
            );
            assert_eq!(script.invocations_for(host), vec!["preinstall"]);
            let Some(client) = connector.client(host) else {
                panic!("missing client {host}");
            };
            assert_eq!(client.dispose_count(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn system_failure_skips_driver_pipeline() -> anyhow::Result<()> {
        let (orchestrator, _) = orchestrator(MockConnector::new());
        let script = StepScript::default().fail_at("image", "write error");
        let hosts = vec![ssh_descriptor("A")];
        orchestrator
            .start(&hosts, shared_config(), both_pipelines(&script)?)
            .await?
            .wait()
            .await?;
        let store = orchestrator.store();
        assert!(store
            .get(&HostIdentity::new("A"), PipelineKind::Driver)
            .is_none());
        assert_eq!(script.invocations(), vec!["image"]);
        Ok(())
    }
}
