use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Key identifying one target machine for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostIdentity(String);

impl HostIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Bmc,
    Ssh,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Bmc => "bmc",
            BackendKind::Ssh => "ssh",
        }
    }
}

/// What a client learned about its host while connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    pub architecture: Option<String>,
    /// Redfish system id for BMC hosts, login shell for SSH hosts.
    pub default_target: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SshCredential {
    None,
    Password {
        password: String,
    },
    Key {
        private_key_pem: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshCredential::None => f.write_str("None"),
            SshCredential::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            SshCredential::Key { passphrase, .. } => f
                .debug_struct("Key")
                .field("private_key_pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl SshCredential {
    /// Password usable for `sudo -S`, if the credential carries one.
    pub fn sudo_password(&self) -> Option<&str> {
        match self {
            SshCredential::Password { password } => Some(password.as_str()),
            _ => None,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// One entry of the host list handed over by the configuration collector.
#[derive(Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum HostDescriptor {
    Bmc {
        ip: String,
        username: String,
        password: String,
    },
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        credential: SshCredential,
        #[serde(default)]
        host_key_fingerprint: Option<String>,
    },
}

impl HostDescriptor {
    pub fn host_id(&self) -> HostIdentity {
        match self {
            HostDescriptor::Bmc { ip, .. } => HostIdentity::new(ip.as_str()),
            HostDescriptor::Ssh { host, port, .. } if *port == 22 => {
                HostIdentity::new(host.as_str())
            }
            HostDescriptor::Ssh { host, port, .. } => HostIdentity::new(format!("{host}:{port}")),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            HostDescriptor::Bmc { .. } => BackendKind::Bmc,
            HostDescriptor::Ssh { .. } => BackendKind::Ssh,
        }
    }
}

impl fmt::Debug for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostDescriptor::Bmc { ip, username, .. } => f
                .debug_struct("Bmc")
                .field("ip", ip)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            HostDescriptor::Ssh {
                host,
                port,
                username,
                credential,
                host_key_fingerprint,
            } => f
                .debug_struct("Ssh")
                .field("host", host)
                .field("port", port)
                .field("username", username)
                .field("credential", credential)
                .field("host_key_fingerprint", host_key_fingerprint)
                .finish(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Ipv4Mode {
    #[default]
    Dhcp,
    Static {
        prefix_len: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub ipv4: Ipv4Mode,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
}

/// Account and network settings applied identically to every host of a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SharedConfig {
    pub account: AccountConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Files and images the built-in pipelines install.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallArtifacts {
    /// URL of the bootstrap ISO mounted as BMC virtual media.
    #[serde(default)]
    pub bootstrap_image_url: Option<String>,
    /// URL the bootstrap agent streams onto the system disk.
    #[serde(default)]
    pub system_image_url: Option<String>,
    #[serde(default = "default_target_disk")]
    pub target_disk: String,
    /// Root filesystem of the written image, mounted to configure it.
    #[serde(default = "default_root_partition")]
    pub root_partition: String,
    /// Local driver package uploaded over SSH.
    #[serde(default)]
    pub driver_package: Option<PathBuf>,
    /// URL the bootstrap agent fetches the driver package from.
    #[serde(default)]
    pub driver_package_url: Option<String>,
    #[serde(default = "default_driver_install_command")]
    pub driver_install_command: String,
    #[serde(default = "default_driver_verify_command")]
    pub driver_verify_command: String,
}

impl Default for InstallArtifacts {
    fn default() -> Self {
        Self {
            bootstrap_image_url: None,
            system_image_url: None,
            target_disk: default_target_disk(),
            root_partition: default_root_partition(),
            driver_package: None,
            driver_package_url: None,
            driver_install_command: default_driver_install_command(),
            driver_verify_command: default_driver_verify_command(),
        }
    }
}

fn default_root_partition() -> String {
    "/dev/sda2".to_string()
}

fn default_target_disk() -> String {
    "/dev/sda".to_string()
}

fn default_driver_install_command() -> String {
    "bash {package} --quiet".to_string()
}

fn default_driver_verify_command() -> String {
    "npu-smi info".to_string()
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    System,
    Driver,
}

impl PipelineKind {
    /// Kinds that must all succeed before a host counts as installed.
    pub const REQUIRED: [PipelineKind; 2] = [PipelineKind::System, PipelineKind::Driver];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::System => "system",
            PipelineKind::Driver => "driver",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
