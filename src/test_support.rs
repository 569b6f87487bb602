use crate::services::deployments::{
    AccountConfig, Backend, BackendKind, BmcOps, ClientError, ClientIdentity, CommandOutput,
    ConnectFailure, ConnectionClient, ConnectionError, Connector, HostDescriptor, HostIdentity,
    InstallProgress, Ipv4Mode, NetworkConfig, PipelineKind, ProgressEvent, ProgressStore,
    ResetType, SharedClient, SharedConfig, ShellOps, SshCredential, StepContext, StepDefinition,
    TerminalSize,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use url::Url;

pub fn shared_config() -> SharedConfig {
    SharedConfig {
        account: AccountConfig {
            username: "ops".to_string(),
            password: "s3cret".to_string(),
        },
        network: NetworkConfig {
            ipv4: Ipv4Mode::Static { prefix_len: 24 },
            gateway: Some("10.0.0.254".parse().expect("gateway")),
            dns: vec!["10.0.0.53".parse().expect("dns")],
        },
    }
}

pub fn ssh_descriptor(host: &str) -> HostDescriptor {
    HostDescriptor::Ssh {
        host: host.to_string(),
        port: 22,
        username: "root".to_string(),
        credential: SshCredential::Password {
            password: "pw".to_string(),
        },
        host_key_fingerprint: None,
    }
}

pub fn bmc_descriptor(ip: &str) -> HostDescriptor {
    HostDescriptor::Bmc {
        ip: ip.to_string(),
        username: "admin".to_string(),
        password: "pw".to_string(),
    }
}

/// In-memory client that records every primitive it is asked to perform.
pub struct MockClient {
    host: HostIdentity,
    kind: BackendKind,
    disposed: AtomicBool,
    dispose_calls: AtomicU32,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    log: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn new(host: &str, kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            host: HostIdentity::new(host),
            kind,
            disposed: AtomicBool::new(false),
            dispose_calls: AtomicU32::new(0),
            responses: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn ssh(host: &str) -> Arc<Self> {
        Self::new(host, BackendKind::Ssh)
    }

    pub fn bmc(host: &str) -> Arc<Self> {
        Self::new(host, BackendKind::Bmc)
    }

    /// Commands containing `needle` return `output` instead of success.
    pub fn respond(&self, needle: &str, output: CommandOutput) {
        self.responses
            .lock()
            .expect("responses lock")
            .push((needle.to_string(), output));
    }

    pub fn dispose_count(&self) -> u32 {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("log lock").push(entry);
    }

    fn output_for(&self, command: &str) -> CommandOutput {
        self.responses
            .lock()
            .expect("responses lock")
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ShellOps for MockClient {
    async fn run_command(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError> {
        self.ensure_open()?;
        self.record(format!("run {command}"));
        Ok(self.output_for(command))
    }

    async fn run_sudo(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError> {
        self.ensure_open()?;
        self.record(format!("sudo {command}"));
        Ok(self.output_for(command))
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, ClientError> {
        self.ensure_open()?;
        self.record(format!("upload {} {remote}", local.display()));
        Ok(0)
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, ClientError> {
        self.ensure_open()?;
        self.record(format!("download {remote} {}", local.display()));
        Ok(0)
    }

    async fn open_shell(&self, _size: TerminalSize) -> Result<DuplexStream, ClientError> {
        self.ensure_open()?;
        let (ours, _theirs) = tokio::io::duplex(64);
        Ok(ours)
    }
}

#[async_trait]
impl BmcOps for MockClient {
    async fn reset(&self, reset: ResetType) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.record(format!("reset {}", reset.as_redfish()));
        Ok(())
    }

    async fn boot_once_from_cd(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.record("boot-once cd".to_string());
        Ok(())
    }

    async fn mount_media(&self, image_url: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.record(format!("mount {image_url}"));
        Ok(())
    }

    async fn unmount_media(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.record("unmount".to_string());
        Ok(())
    }

    async fn wait_for_agent(&self, _cancel: &CancellationToken) -> Result<String, ClientError> {
        self.ensure_open()?;
        self.record("wait-agent".to_string());
        Ok(format!("agent-{}", self.host))
    }

    async fn dispatch(
        &self,
        command: &str,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, ClientError> {
        self.ensure_open()?;
        self.record(format!("dispatch {command}"));
        Ok(self.output_for(command))
    }

    async fn fetch_file(
        &self,
        source_url: &str,
        target_path: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.record(format!("fetch {source_url} {target_path}"));
        Ok(())
    }
}

#[async_trait]
impl ConnectionClient for MockClient {
    fn host(&self) -> &HostIdentity {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            architecture: Some("aarch64".to_string()),
            default_target: Some("1".to_string()),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn backend(&self) -> Backend<'_> {
        match self.kind {
            BackendKind::Bmc => Backend::Bmc(self),
            BackendKind::Ssh => Backend::Ssh(self),
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out `MockClient`s, with scripted delays and rejections.
#[derive(Default)]
pub struct MockConnector {
    rejections: HashMap<HostIdentity, ConnectFailure>,
    delays: HashMap<HostIdentity, Duration>,
    clients: Mutex<HashMap<HostIdentity, Arc<MockClient>>>,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(mut self, host: &str, kind: ConnectFailure) -> Self {
        self.rejections.insert(HostIdentity::new(host), kind);
        self
    }

    pub fn delay(mut self, host: &str, delay: Duration) -> Self {
        self.delays.insert(HostIdentity::new(host), delay);
        self
    }

    pub fn client(&self, host: &str) -> Option<Arc<MockClient>> {
        self.clients
            .lock()
            .expect("clients lock")
            .get(&HostIdentity::new(host))
            .cloned()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, descriptor: &HostDescriptor) -> Result<SharedClient, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let host = descriptor.host_id();
        if let Some(delay) = self.delays.get(&host) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(kind) = self.rejections.get(&host) {
            return Err(ConnectionError::new(host, *kind, kind.to_string()));
        }
        let client = MockClient::new(host.as_str(), descriptor.backend());
        self.clients
            .lock()
            .expect("clients lock")
            .insert(host, client.clone());
        Ok(client)
    }
}

#[derive(Clone)]
struct ScriptedFailure {
    host: Option<HostIdentity>,
    step: String,
    message: String,
}

/// Scripted behaviour for steps built with `scripted_steps`.
#[derive(Clone, Default)]
pub struct StepScript {
    failures: Arc<Vec<ScriptedFailure>>,
    cancels: Arc<Vec<(String, CancellationToken)>>,
    delays: Arc<HashMap<HostIdentity, Duration>>,
    invocations: Arc<Mutex<Vec<(HostIdentity, String)>>>,
}

impl StepScript {
    fn with_failure(mut self, host: Option<HostIdentity>, step: &str, message: &str) -> Self {
        let mut failures = (*self.failures).clone();
        failures.push(ScriptedFailure {
            host,
            step: step.to_string(),
            message: message.to_string(),
        });
        self.failures = Arc::new(failures);
        self
    }

    pub fn fail_at(self, step: &str, message: &str) -> Self {
        self.with_failure(None, step, message)
    }

    pub fn fail_on_host(self, host: &str, step: &str, message: &str) -> Self {
        self.with_failure(Some(HostIdentity::new(host)), step, message)
    }

    /// Cancels `token` once `step` has finished its work.
    pub fn cancel_after(mut self, step: &str, token: CancellationToken) -> Self {
        let mut cancels = (*self.cancels).clone();
        cancels.push((step.to_string(), token));
        self.cancels = Arc::new(cancels);
        self
    }

    pub fn delay_for(mut self, host: &str, delay: Duration) -> Self {
        let mut delays = (*self.delays).clone();
        delays.insert(HostIdentity::new(host), delay);
        self.delays = Arc::new(delays);
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .iter()
            .map(|(_, step)| step.clone())
            .collect()
    }

    pub fn invocations_for(&self, host: &str) -> Vec<String> {
        let host = HostIdentity::new(host);
        self.invocations
            .lock()
            .expect("invocations lock")
            .iter()
            .filter(|(seen, _)| *seen == host)
            .map(|(_, step)| step.clone())
            .collect()
    }

    async fn play(&self, step: &str, ctx: &StepContext) -> anyhow::Result<()> {
        let host = ctx.client.host().clone();
        self.invocations
            .lock()
            .expect("invocations lock")
            .push((host.clone(), step.to_string()));
        if let Some(delay) = self.delays.get(&host) {
            tokio::time::sleep(*delay).await;
        }
        let failure = self.failures.iter().find(|failure| {
            failure.step == step && failure.host.as_ref().map_or(true, |only| *only == host)
        });
        if let Some(failure) = failure {
            anyhow::bail!("{}", failure.message);
        }
        for (after, token) in self.cancels.iter() {
            if after == step {
                token.cancel();
            }
        }
        Ok(())
    }
}

pub fn scripted_steps(steps: &[(&str, u8)], script: &StepScript) -> Vec<StepDefinition> {
    steps
        .iter()
        .map(|(name, target)| {
            let script = script.clone();
            let step = name.to_string();
            StepDefinition::new(*name, *target, move |ctx: StepContext| {
                let script = script.clone();
                let step = step.clone();
                async move { script.play(&step, &ctx).await }
            })
        })
        .collect()
}

/// Collects every progress update a store publishes, in arrival order.
#[derive(Clone, Default)]
pub struct ProgressRecorder {
    events: Arc<Mutex<Vec<(PipelineKind, InstallProgress)>>>,
}

impl ProgressRecorder {
    pub fn attach(store: &ProgressStore) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        store.subscribe(move |event| {
            if let ProgressEvent::Updated(update) = event {
                sink.lock()
                    .expect("recorder lock")
                    .push((update.pipeline, update.progress.clone()));
            }
        });
        recorder
    }

    pub fn all(&self) -> Vec<(PipelineKind, InstallProgress)> {
        self.events.lock().expect("recorder lock").clone()
    }

    pub fn for_host(&self, host: &str, pipeline: PipelineKind) -> Vec<InstallProgress> {
        let host = HostIdentity::new(host);
        self.all()
            .into_iter()
            .filter(|(kind, progress)| *kind == pipeline && progress.host == host)
            .map(|(_, progress)| progress)
            .collect()
    }
}

/// Serves `router` on an ephemeral loopback port. Returns `None` when the
/// sandbox forbids binding.
pub async fn spawn_fake_http(router: axum::Router) -> anyhow::Result<Option<Url>> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return Ok(None),
        Err(err) if err.to_string().to_lowercase().contains("operation not permitted") => {
            return Ok(None)
        }
        Err(err) => return Err(err.into()),
    };
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::warn!(error = %err, "fake http server stopped");
        }
    });
    Ok(Some(Url::parse(&format!("http://{addr}/"))?))
}
