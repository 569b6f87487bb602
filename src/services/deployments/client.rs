use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use super::bmc::{BmcClient, BmcSettings};
use super::error::{ClientError, ConnectionError};
use super::ssh::{SshClient, SshSettings};
use super::types::{BackendKind, ClientIdentity, HostDescriptor, HostIdentity};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turns a non-zero exit into a `ClientError::Command` carrying stderr.
    pub fn check(self, host: &HostIdentity, command: &str) -> Result<Self, ClientError> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(ClientError::Command {
            host: host.clone(),
            message: format!("`{command}` exited with {}: {detail}", self.code),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Redfish `ResetType` values the pipelines use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    On,
    ForceOff,
    ForceRestart,
    PowerCycle,
}

impl ResetType {
    pub fn as_redfish(&self) -> &'static str {
        match self {
            ResetType::On => "On",
            ResetType::ForceOff => "ForceOff",
            ResetType::ForceRestart => "ForceRestart",
            ResetType::PowerCycle => "PowerCycle",
        }
    }
}

/// Out-of-band primitives of a BMC-managed host.
#[async_trait]
pub trait BmcOps: Send + Sync {
    /// Power action on the system. The registered agent does not survive it.
    async fn reset(&self, reset: ResetType) -> Result<(), ClientError>;
    async fn boot_once_from_cd(&self) -> Result<(), ClientError>;
    async fn mount_media(&self, image_url: &str) -> Result<(), ClientError>;
    async fn unmount_media(&self) -> Result<(), ClientError>;
    /// Waits for an agent on this host to register. A registration from
    /// before the last reset is not accepted while the hub still lists it.
    async fn wait_for_agent(&self, cancel: &CancellationToken) -> Result<String, ClientError>;
    /// Runs a command on the host through the bootstrap agent.
    async fn dispatch(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ClientError>;
    /// Has the bootstrap agent fetch `source_url` into `target_path` on the host.
    async fn fetch_file(
        &self,
        source_url: &str,
        target_path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;
}

/// In-band primitives of an SSH-reachable host.
#[async_trait]
pub trait ShellOps: Send + Sync {
    async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError>;
    async fn run_sudo(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError>;
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, ClientError>;
    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, ClientError>;
    async fn open_shell(&self, size: TerminalSize) -> Result<DuplexStream, ClientError>;
}

pub enum Backend<'a> {
    Bmc(&'a dyn BmcOps),
    Ssh(&'a dyn ShellOps),
}

/// A live session to one host. Owned by exactly one `ClientPool`.
#[async_trait]
pub trait ConnectionClient: Send + Sync {
    fn host(&self) -> &HostIdentity;

    fn kind(&self) -> BackendKind;

    fn identity(&self) -> ClientIdentity;

    fn is_disposed(&self) -> bool;

    fn backend(&self) -> Backend<'_>;

    /// Releases the session. Safe to call more than once; failures are logged.
    async fn dispose(&self);

    fn shell(&self) -> Result<&dyn ShellOps, ClientError> {
        self.ensure_open()?;
        match self.backend() {
            Backend::Ssh(ops) => Ok(ops),
            Backend::Bmc(_) => Err(ClientError::Unsupported {
                backend: BackendKind::Bmc.as_str(),
                operation: "shell access",
            }),
        }
    }

    fn bmc(&self) -> Result<&dyn BmcOps, ClientError> {
        self.ensure_open()?;
        match self.backend() {
            Backend::Bmc(ops) => Ok(ops),
            Backend::Ssh(_) => Err(ClientError::Unsupported {
                backend: BackendKind::Ssh.as_str(),
                operation: "out-of-band management",
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Closed {
                host: self.host().clone(),
            });
        }
        Ok(())
    }
}

pub type SharedClient = Arc<dyn ConnectionClient>;

/// Establishes one client per host descriptor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &HostDescriptor) -> Result<SharedClient, ConnectionError>;
}

/// Connects each descriptor through its real backend.
#[derive(Clone)]
pub struct BackendConnector {
    ssh: SshSettings,
    bmc: BmcSettings,
}

impl BackendConnector {
    pub fn new(ssh: SshSettings, bmc: BmcSettings) -> Self {
        Self { ssh, bmc }
    }
}

#[async_trait]
impl Connector for BackendConnector {
    async fn connect(&self, descriptor: &HostDescriptor) -> Result<SharedClient, ConnectionError> {
        match descriptor {
            HostDescriptor::Bmc {
                ip,
                username,
                password,
            } => {
                let client = BmcClient::connect(ip, username, password, &self.bmc).await?;
                Ok(Arc::new(client))
            }
            HostDescriptor::Ssh { .. } => {
                let client = SshClient::connect(descriptor, &self.ssh).await?;
                Ok(Arc::new(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockClient;

    #[test]
    fn check_reports_stderr_on_failure() {
        let host = HostIdentity::new("10.0.0.1");
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "No space left on device\n".to_string(),
            code: 1,
        };
        let err = output.check(&host, "dd if=/x of=/y").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 1"));
        assert!(message.contains("No space left on device"));

        let ok = CommandOutput {
            stdout: "done".to_string(),
            stderr: String::new(),
            code: 0,
        };
        assert!(ok.check(&host, "true").is_ok());
    }

    #[tokio::test]
    async fn disposed_client_reports_closed() {
        let client = MockClient::ssh("10.0.0.1");
        assert!(client.shell().is_ok());
        client.dispose().await;
        match client.shell() {
            Err(ClientError::Closed { host }) => assert_eq!(host.as_str(), "10.0.0.1"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected closed error"),
        }
    }

    #[test]
    fn ssh_client_refuses_bmc_primitives() {
        let client = MockClient::ssh("10.0.0.1");
        assert!(matches!(
            client.bmc(),
            Err(ClientError::Unsupported { backend: "ssh", .. })
        ));
    }
}
