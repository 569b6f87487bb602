use async_trait::async_trait;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::agent::{AgentClient, AgentError, HostMatch, PollLimit, TaskOutcome, TaskResult};
use super::client::{Backend, BmcOps, CommandOutput, ConnectionClient, ResetType};
use super::error::{ClientError, ConnectFailure, ConnectionError, DisposeError};
use super::redfish::{RedfishError, RedfishSession};
use super::types::{BackendKind, ClientIdentity, HostIdentity};
use super::util::tail_lines;

#[derive(Debug, Clone)]
pub struct BmcSettings {
    pub request_timeout: Duration,
    pub accept_invalid_certs: bool,
    /// Hub the bootstrap image's agent registers with.
    pub agent_url: Url,
    pub poll_interval: Duration,
    pub poll_limit: PollLimit,
}

fn connect_failure(host: &HostIdentity, err: RedfishError) -> ConnectionError {
    let kind = if err.is_unreachable() {
        ConnectFailure::Unreachable
    } else if matches!(err, RedfishError::Unauthorized(_)) {
        ConnectFailure::Rejected
    } else {
        ConnectFailure::Protocol
    };
    ConnectionError::new(host.clone(), kind, err.to_string())
}

fn bmc_base_url(ip: &str) -> Result<Url, url::ParseError> {
    let ip = ip.trim();
    if ip.parse::<Ipv6Addr>().is_ok() {
        return Url::parse(&format!("https://[{ip}]/"));
    }
    Url::parse(&format!("https://{ip}/"))
}

/// A host managed out-of-band through its BMC.
///
/// Redfish calls that change machine state are serialized through
/// `operation_lock`; BMCs reject or mis-order concurrent mutations.
pub struct BmcClient {
    host: HostIdentity,
    session: RedfishSession,
    system_id: String,
    system_uuid: Option<String>,
    identity: ClientIdentity,
    agent: AgentClient,
    agent_host: AsyncMutex<Option<String>>,
    /// Registration from before the last reset; its environment is gone.
    superseded_agent: AsyncMutex<Option<String>>,
    operation_lock: AsyncMutex<()>,
    poll_interval: Duration,
    poll_limit: PollLimit,
    closed: AtomicBool,
}

impl BmcClient {
    pub async fn connect(
        ip: &str,
        username: &str,
        password: &str,
        settings: &BmcSettings,
    ) -> Result<Self, ConnectionError> {
        let host = HostIdentity::new(ip);
        let base = bmc_base_url(ip).map_err(|err| {
            ConnectionError::new(
                host.clone(),
                ConnectFailure::Protocol,
                format!("invalid BMC address: {err}"),
            )
        })?;
        Self::connect_with_base(host, base, username, password, settings).await
    }

    pub async fn connect_with_base(
        host: HostIdentity,
        base: Url,
        username: &str,
        password: &str,
        settings: &BmcSettings,
    ) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|err| {
                ConnectionError::new(host.clone(), ConnectFailure::Protocol, err.to_string())
            })?;

        let session = RedfishSession::auto_detect(http.clone(), base, username, password)
            .await
            .map_err(|err| connect_failure(&host, err))?;

        let discovered = Self::discover(&session).await;
        let (system_id, system_uuid, architecture) = match discovered {
            Ok(found) => found,
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(host = %host, error = %close_err, "failed to close BMC session");
                }
                return Err(connect_failure(&host, err));
            }
        };
        tracing::info!(
            host = %host,
            dialect = ?session.dialect(),
            system_id = %system_id,
            architecture = architecture.as_deref().unwrap_or("unknown"),
            "BMC session established"
        );

        Ok(Self {
            identity: ClientIdentity {
                architecture,
                default_target: Some(system_id.clone()),
            },
            host,
            session,
            system_id,
            system_uuid,
            agent: AgentClient::new(http, settings.agent_url.clone()),
            agent_host: AsyncMutex::new(None),
            superseded_agent: AsyncMutex::new(None),
            operation_lock: AsyncMutex::new(()),
            poll_interval: settings.poll_interval,
            poll_limit: settings.poll_limit,
            closed: AtomicBool::new(false),
        })
    }

    async fn discover(
        session: &RedfishSession,
    ) -> Result<(String, Option<String>, Option<String>), RedfishError> {
        let system_id = session.default_system_id().await?;
        let system_uuid = session.system_uuid(&system_id).await?;
        let architecture = session
            .cpu_info(&system_id)
            .await?
            .into_iter()
            .next()
            .map(|cpu| cpu.architecture);
        Ok((system_id, system_uuid, architecture))
    }

    fn redfish_error(&self, err: RedfishError) -> ClientError {
        ClientError::Protocol {
            host: self.host.clone(),
            message: err.to_string(),
        }
    }

    fn agent_error(&self, err: AgentError) -> ClientError {
        match err {
            AgentError::Cancelled => ClientError::Cancelled {
                host: self.host.clone(),
            },
            other => ClientError::Protocol {
                host: self.host.clone(),
                message: other.to_string(),
            },
        }
    }

    async fn registered_agent(&self) -> Result<String, ClientError> {
        self.agent_host
            .lock()
            .await
            .clone()
            .ok_or_else(|| ClientError::Protocol {
                host: self.host.clone(),
                message: "bootstrap agent has not registered yet".to_string(),
            })
    }

    async fn await_task(
        &self,
        agent_host: &str,
        task_id: u64,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, ClientError> {
        let outcome = self
            .agent
            .block_until_task_complete(
                agent_host,
                task_id,
                self.poll_interval,
                self.poll_limit,
                cancel,
            )
            .await
            .map_err(|err| self.agent_error(err))?;
        match outcome {
            TaskOutcome::Finished(result) => Ok(result),
            TaskOutcome::Pending => Err(ClientError::Command {
                host: self.host.clone(),
                message: format!("agent task {task_id} still pending after polling limit"),
            }),
            TaskOutcome::NotFound => Err(ClientError::Protocol {
                host: self.host.clone(),
                message: format!("agent lost task {task_id}"),
            }),
        }
    }
}

#[async_trait]
impl BmcOps for BmcClient {
    async fn reset(&self, reset: ResetType) -> Result<(), ClientError> {
        self.ensure_open()?;
        let _guard = self.operation_lock.lock().await;
        tracing::info!(host = %self.host, reset = reset.as_redfish(), "resetting system");
        self.session
            .reset(&self.system_id, reset)
            .await
            .map_err(|err| self.redfish_error(err))?;
        if let Some(previous) = self.agent_host.lock().await.take() {
            tracing::debug!(host = %self.host, agent_host = %previous, "agent superseded by reset");
            *self.superseded_agent.lock().await = Some(previous);
        }
        Ok(())
    }

    async fn boot_once_from_cd(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let _guard = self.operation_lock.lock().await;
        self.session
            .boot_once_from_cd(&self.system_id)
            .await
            .map_err(|err| self.redfish_error(err))
    }

    async fn mount_media(&self, image_url: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let _guard = self.operation_lock.lock().await;
        tracing::info!(host = %self.host, image_url, "mounting virtual media");
        self.session
            .insert_media(image_url)
            .await
            .map_err(|err| self.redfish_error(err))
    }

    async fn unmount_media(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let _guard = self.operation_lock.lock().await;
        self.session
            .eject_media()
            .await
            .map_err(|err| self.redfish_error(err))
    }

    async fn wait_for_agent(&self, cancel: &CancellationToken) -> Result<String, ClientError> {
        self.ensure_open()?;
        // Some BMCs omit the system UUID; fall back to the management address.
        let wanted = match &self.system_uuid {
            Some(uuid) => HostMatch::SystemUuid(uuid.clone()),
            None => HostMatch::Ip(self.host.as_str().to_string()),
        };
        let superseded = self.superseded_agent.lock().await.clone();
        let found = self
            .agent
            .wait_for_host(
                &wanted,
                superseded.as_deref(),
                self.poll_interval,
                self.poll_limit,
                cancel,
            )
            .await
            .map_err(|err| self.agent_error(err))?;
        let Some(agent_host) = found else {
            return Err(ClientError::Protocol {
                host: self.host.clone(),
                message: "bootstrap agent never registered".to_string(),
            });
        };
        tracing::info!(host = %self.host, agent_host = %agent_host, "bootstrap agent registered");
        *self.agent_host.lock().await = Some(agent_host.clone());
        self.superseded_agent.lock().await.take();
        Ok(agent_host)
    }

    async fn dispatch(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ClientError> {
        self.ensure_open()?;
        let agent_host = self.registered_agent().await?;
        let task_id = self
            .agent
            .exec_command(&agent_host, command)
            .await
            .map_err(|err| self.agent_error(err))?;
        let result = self.await_task(&agent_host, task_id, cancel).await?;
        let code = result.exit_code.unwrap_or(if result.ok { 0 } else { 1 });
        Ok(CommandOutput {
            stdout: result.output,
            stderr: result.error.unwrap_or_default(),
            code,
        })
    }

    async fn fetch_file(
        &self,
        source_url: &str,
        target_path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let agent_host = self.registered_agent().await?;
        let task_id = self
            .agent
            .upload_file(&agent_host, source_url, target_path)
            .await
            .map_err(|err| self.agent_error(err))?;
        let result = self.await_task(&agent_host, task_id, cancel).await?;
        if result.ok {
            return Ok(());
        }
        let detail = result.error.unwrap_or(result.output);
        Err(ClientError::Transfer {
            host: self.host.clone(),
            message: format!("fetching {source_url} failed: {}", tail_lines(&detail)),
        })
    }
}

#[async_trait]
impl ConnectionClient for BmcClient {
    fn host(&self) -> &HostIdentity {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Bmc
    }

    fn identity(&self) -> ClientIdentity {
        self.identity.clone()
    }

    fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn backend(&self) -> Backend<'_> {
        Backend::Bmc(self)
    }

    async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.operation_lock.lock().await;
        match self.session.close().await {
            Ok(()) => tracing::debug!(host = %self.host, "BMC session closed"),
            Err(err) => {
                let err = DisposeError {
                    host: self.host.clone(),
                    message: err.to_string(),
                };
                tracing::warn!(error = %err, "BMC session close failed");
            }
        }
    }
}
