use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, ErrorCode, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::client::{Backend, CommandOutput, ConnectionClient, ShellOps, TerminalSize};
use super::error::{ClientError, ConnectFailure, ConnectionError, DisposeError};
use super::types::{BackendKind, ClientIdentity, HostDescriptor, HostIdentity, SshCredential};
use super::util::shell_quote;

const SHELL_BUFFER_BYTES: usize = 16 * 1024;
const SHELL_POLL_MS: u32 = 100;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub known_hosts_path: PathBuf,
    pub accept_new_host_keys: bool,
    pub connect_timeout: Duration,
}

#[derive(Clone)]
struct SshTarget {
    /// Key the plan knows this host by; errors always carry it.
    id: HostIdentity,
    host: String,
    port: u16,
    username: String,
    credential: SshCredential,
    host_key_fingerprint: Option<String>,
}

pub(super) fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{b64}")
}

pub(super) fn host_key_type_to_name(key_type: HostKeyType) -> String {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
    .to_string()
}

fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

pub(super) fn known_hosts_entry(
    host: &str,
    port: u16,
    key_type: HostKeyType,
    key: &[u8],
) -> String {
    let algo = host_key_type_to_name(key_type);
    let key_b64 = STANDARD.encode(key);
    format!("{} {algo} {key_b64}", known_hosts_name(host, port))
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "host resolved to no address"))
}

/// Whether a libssh2 failure during auth means the server said no.
fn is_auth_rejection(err: &ssh2::Error) -> bool {
    // LIBSSH2_ERROR_AUTHENTICATION_FAILED, LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
    matches!(err.code(), ErrorCode::Session(-18) | ErrorCode::Session(-19))
}

fn handshake(target: &SshTarget, settings: &SshSettings) -> Result<Session, ConnectionError> {
    let host_id = target.id.clone();
    let addr = resolve(&target.host, target.port)
        .map_err(|err| ConnectionError::unreachable(host_id.clone(), err.to_string()))?;
    let tcp = TcpStream::connect_timeout(&addr, settings.connect_timeout)
        .map_err(|err| ConnectionError::unreachable(host_id.clone(), err.to_string()))?;
    tcp.set_read_timeout(Some(settings.connect_timeout)).ok();
    tcp.set_write_timeout(Some(settings.connect_timeout)).ok();
    let mut session = Session::new().map_err(|err| {
        ConnectionError::new(host_id.clone(), ConnectFailure::Protocol, err.to_string())
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|err| {
        ConnectionError::new(
            host_id,
            ConnectFailure::Protocol,
            format!("SSH handshake failed: {err}"),
        )
    })?;
    Ok(session)
}

fn verify_host_key(
    session: &Session,
    target: &SshTarget,
    settings: &SshSettings,
) -> Result<(), ConnectionError> {
    let host_id = target.id.clone();
    let untrusted = |message: String| {
        ConnectionError::new(host_id.clone(), ConnectFailure::Untrusted, message)
    };
    let (host_key, host_key_type) = session
        .host_key()
        .ok_or_else(|| untrusted("SSH host key unavailable".to_string()))?;
    let fingerprint = fingerprint_sha256(host_key);

    let mut known_hosts = session
        .known_hosts()
        .map_err(|err| untrusted(err.to_string()))?;
    let known_hosts_path = &settings.known_hosts_path;
    if known_hosts_path.exists() {
        known_hosts
            .read_file(known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(|err| untrusted(format!("failed to read known_hosts: {err}")))?;
    }
    match known_hosts.check_port(&target.host, target.port, host_key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => {
            match target.host_key_fingerprint.as_deref().map(str::trim) {
                Some(approved) if approved != fingerprint => {
                    return Err(untrusted(format!(
                        "SSH host key fingerprint mismatch (expected {approved}, got {fingerprint})"
                    )));
                }
                Some(_) => {}
                None if settings.accept_new_host_keys => {}
                None => {
                    return Err(untrusted(format!(
                        "SSH host key not trusted yet. Approve fingerprint {fingerprint} first"
                    )));
                }
            }
            ensure_parent_dir(known_hosts_path)
                .map_err(|err| untrusted(format!("failed to prepare known_hosts: {err}")))?;
            known_hosts
                .add(
                    &known_hosts_name(&target.host, target.port),
                    host_key,
                    "fleet-deploy trusted",
                    KnownHostKeyFormat::from(host_key_type),
                )
                .and_then(|_| known_hosts.write_file(known_hosts_path, KnownHostFileKind::OpenSSH))
                .map_err(|err| untrusted(format!("failed to record host key: {err}")))?;
            tracing::info!(
                host = %host_id,
                fingerprint = %fingerprint,
                entry = %known_hosts_entry(&target.host, target.port, host_key_type, host_key),
                "trusted new SSH host key"
            );
            Ok(())
        }
        CheckResult::Mismatch => Err(untrusted(format!(
            "SSH host key mismatch for {host_id}. Refusing to connect; remove its entry from {} if the host was reinstalled",
            known_hosts_path.display()
        ))),
        CheckResult::Failure => Err(untrusted(format!(
            "unable to verify SSH host key (known_hosts: {})",
            known_hosts_path.display()
        ))),
    }
}

fn authenticate(session: &Session, target: &SshTarget) -> Result<(), ConnectionError> {
    let host_id = target.id.clone();
    let result = match &target.credential {
        SshCredential::None => session.auth_methods(&target.username).map(|_| ()),
        SshCredential::Password { password } => {
            session.userauth_password(&target.username, password)
        }
        SshCredential::Key {
            private_key_pem,
            passphrase,
        } => session.userauth_pubkey_memory(
            &target.username,
            None,
            private_key_pem.trim(),
            passphrase.as_deref(),
        ),
    };
    if let Err(err) = result {
        let kind = if is_auth_rejection(&err) {
            ConnectFailure::Rejected
        } else {
            ConnectFailure::Protocol
        };
        return Err(ConnectionError::new(
            host_id,
            kind,
            format!("SSH authentication failed: {err}"),
        ));
    }
    if !session.authenticated() {
        return Err(ConnectionError::rejected(
            host_id,
            "SSH server did not accept the credentials",
        ));
    }
    Ok(())
}

fn open_session(target: &SshTarget, settings: &SshSettings) -> Result<Session, ConnectionError> {
    let session = handshake(target, settings)?;
    verify_host_key(&session, target, settings)?;
    authenticate(&session, target)?;
    Ok(session)
}

fn set_timeout(session: &Session, timeout: Option<Duration>) {
    let millis = timeout
        .map(|value| value.as_millis().min(u128::from(u32::MAX)) as u32)
        .unwrap_or(0);
    session.set_timeout(millis);
}

pub(super) fn run_command(
    session: &Session,
    command: &str,
    stdin: Option<&str>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ssh2::Error> {
    set_timeout(session, timeout);
    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    if let Some(stdin) = stdin {
        channel.write_all(stdin.as_bytes()).ok();
        channel.send_eof().ok();
    }
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).ok();
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();
    let code = channel.exit_status().unwrap_or(-1);
    Ok(CommandOutput {
        stdout,
        stderr,
        code,
    })
}

fn sudo_command(password: Option<&str>, command: &str) -> (String, Option<String>) {
    match password.filter(|value| !value.trim().is_empty()) {
        Some(password) => (
            format!("sudo -S -p '' bash -c {}", shell_quote(command)),
            Some(format!("{password}\n")),
        ),
        None => (format!("sudo -n bash -c {}", shell_quote(command)), None),
    }
}

pub struct SshClient {
    host: HostIdentity,
    target: SshTarget,
    settings: SshSettings,
    session: Arc<Mutex<Option<Session>>>,
    identity: ClientIdentity,
    closed: Arc<AtomicBool>,
}

impl SshClient {
    pub async fn connect(
        descriptor: &HostDescriptor,
        settings: &SshSettings,
    ) -> Result<Self, ConnectionError> {
        let host = descriptor.host_id();
        let HostDescriptor::Ssh {
            host: address,
            port,
            username,
            credential,
            host_key_fingerprint,
        } = descriptor
        else {
            return Err(ConnectionError::new(
                host,
                ConnectFailure::Protocol,
                "descriptor is not an SSH host",
            ));
        };
        let target = SshTarget {
            id: host.clone(),
            host: address.trim().to_string(),
            port: *port,
            username: username.trim().to_string(),
            credential: credential.clone(),
            host_key_fingerprint: host_key_fingerprint.clone(),
        };

        let blocking_target = target.clone();
        let blocking_settings = settings.clone();
        let session = tokio::task::spawn_blocking(move || {
            open_session(&blocking_target, &blocking_settings)
        })
        .await
        .map_err(|err| ConnectionError::new(host.clone(), ConnectFailure::Protocol, err.to_string()))??;

        let mut client = Self {
            host: host.clone(),
            target,
            settings: settings.clone(),
            session: Arc::new(Mutex::new(Some(session))),
            identity: ClientIdentity::default(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        client.identity = client.discover_identity().await;
        tracing::info!(
            host = %host,
            architecture = ?client.identity.architecture,
            shell = ?client.identity.default_target,
            "SSH session established"
        );
        Ok(client)
    }

    async fn discover_identity(&self) -> ClientIdentity {
        let architecture = self
            .run_command("uname -m", Some(Duration::from_secs(10)))
            .await
            .ok()
            .map(|output| output.stdout.trim().to_string())
            .filter(|value| !value.is_empty());
        let default_target = self
            .run_command("echo \"$SHELL\"", Some(Duration::from_secs(10)))
            .await
            .ok()
            .map(|output| output.stdout.trim().to_string())
            .filter(|value| !value.is_empty());
        ClientIdentity {
            architecture,
            default_target,
        }
    }

    fn session_lock(session: &Mutex<Option<Session>>) -> MutexGuard<'_, Option<Session>> {
        match session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering SSH session from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    /// Runs blocking libssh2 work on the session. Holding the lock serializes
    /// operations against this host.
    async fn with_session<T, F>(&self, work: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&HostIdentity, &Session) -> Result<T, ClientError> + Send + 'static,
    {
        self.ensure_open()?;
        let session = self.session.clone();
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::session_lock(&session);
            let Some(session) = guard.as_ref() else {
                return Err(ClientError::Closed { host });
            };
            work(&host, session)
        })
        .await
        .map_err(|err| ClientError::Protocol {
            host: self.host.clone(),
            message: format!("SSH worker failed: {err}"),
        })?
    }
}

#[async_trait]
impl ShellOps for SshClient {
    async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError> {
        let command = command.to_string();
        self.with_session(move |host, session| {
            run_command(session, &command, None, timeout).map_err(|err| ClientError::Command {
                host: host.clone(),
                message: format!("failed to exec `{command}`: {err}"),
            })
        })
        .await
    }

    async fn run_sudo(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ClientError> {
        let (wrapped, stdin) = sudo_command(self.target.credential.sudo_password(), command);
        self.with_session(move |host, session| {
            run_command(session, &wrapped, stdin.as_deref(), timeout).map_err(|err| {
                ClientError::Command {
                    host: host.clone(),
                    message: format!("failed to exec sudo command: {err}"),
                }
            })
        })
        .await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, ClientError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_session(move |host, session| {
            let transfer = |message: String| ClientError::Transfer {
                host: host.clone(),
                message,
            };
            let sftp = session
                .sftp()
                .map_err(|err| transfer(format!("SFTP unavailable: {err}")))?;
            let mut source = fs::File::open(&local)
                .map_err(|err| transfer(format!("failed to open {}: {err}", local.display())))?;
            let mut sink = sftp
                .create(Path::new(&remote))
                .map_err(|err| transfer(format!("failed to create {remote}: {err}")))?;
            std::io::copy(&mut source, &mut sink)
                .map_err(|err| transfer(format!("failed to upload {}: {err}", local.display())))
        })
        .await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, ClientError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_session(move |host, session| {
            let transfer = |message: String| ClientError::Transfer {
                host: host.clone(),
                message,
            };
            let sftp = session
                .sftp()
                .map_err(|err| transfer(format!("SFTP unavailable: {err}")))?;
            let mut source = sftp
                .open(Path::new(&remote))
                .map_err(|err| transfer(format!("failed to open {remote}: {err}")))?;
            ensure_parent_dir(&local)
                .map_err(|err| transfer(format!("failed to prepare {}: {err}", local.display())))?;
            let mut sink = fs::File::create(&local)
                .map_err(|err| transfer(format!("failed to create {}: {err}", local.display())))?;
            std::io::copy(&mut source, &mut sink)
                .map_err(|err| transfer(format!("failed to download {remote}: {err}")))
        })
        .await
    }

    async fn open_shell(&self, size: TerminalSize) -> Result<DuplexStream, ClientError> {
        self.ensure_open()?;
        // The shell gets its own session so it never holds the command lock.
        let target = self.target.clone();
        let settings = self.settings.clone();
        let host = self.host.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&target, &settings))
            .await
            .map_err(|err| ClientError::Protocol {
                host: host.clone(),
                message: err.to_string(),
            })?
            .map_err(|err| ClientError::Protocol {
                host: host.clone(),
                message: err.to_string(),
            })?;

        let mut channel = session
            .channel_session()
            .and_then(|mut channel| {
                channel.request_pty("xterm", None, Some((size.cols, size.rows, 0, 0)))?;
                channel.shell()?;
                Ok(channel)
            })
            .map_err(|err| ClientError::Protocol {
                host: host.clone(),
                message: format!("failed to open interactive shell: {err}"),
            })?;

        let (caller_end, pump_end) = tokio::io::duplex(SHELL_BUFFER_BYTES);
        let (mut pump_reader, mut pump_writer) = tokio::io::split(pump_end);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let mut buf = vec![0u8; SHELL_BUFFER_BYTES];
            loop {
                match pump_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let closed = self.closed.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            session.set_timeout(SHELL_POLL_MS);
            let mut buf = vec![0u8; SHELL_BUFFER_BYTES];
            loop {
                if closed.load(Ordering::SeqCst) || channel.eof() {
                    break;
                }
                loop {
                    match input_rx.try_recv() {
                        Ok(bytes) => {
                            if channel.write_all(&bytes).is_err() {
                                return;
                            }
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            channel.send_eof().ok();
                            break;
                        }
                    }
                }
                match channel.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if runtime.block_on(pump_writer.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::TimedOut => {}
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(_) => break,
                }
            }
            channel.close().ok();
            session.disconnect(None, "shell closed", None).ok();
        });

        Ok(caller_end)
    }
}

#[async_trait]
impl ConnectionClient for SshClient {
    fn host(&self) -> &HostIdentity {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ssh
    }

    fn identity(&self) -> ClientIdentity {
        self.identity.clone()
    }

    fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn backend(&self) -> Backend<'_> {
        Backend::Ssh(self)
    }

    async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        let host = self.host.clone();
        let result = tokio::task::spawn_blocking(move || {
            let taken = Self::session_lock(&session).take();
            match taken {
                Some(session) => session
                    .disconnect(None, "deployment finished", None)
                    .map_err(|err| DisposeError {
                        host: host.clone(),
                        message: err.to_string(),
                    }),
                None => Ok(()),
            }
        })
        .await;
        match result {
            Ok(Ok(())) => tracing::debug!(host = %self.host, "SSH session closed"),
            Ok(Err(err)) => tracing::warn!(error = %err, "SSH session close failed"),
            Err(err) => tracing::warn!(host = %self.host, error = %err, "SSH close task failed"),
        }
    }
}
