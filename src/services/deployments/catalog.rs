use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::client::{Backend, CommandOutput, ConnectionClient, ResetType};
use super::error::PipelineDefinitionError;
use super::executor::{StepContext, StepDefinition};
use super::orchestrator::PipelineFactory;
use super::pipeline::PipelineDefinition;
use super::types::{
    AccountConfig, BackendKind, InstallArtifacts, Ipv4Mode, NetworkConfig, PipelineKind,
};
use super::util::{random_hex, shell_quote, validate_username};

/// Where the written image's root filesystem is mounted while configuring it.
const TARGET_MOUNT: &str = "/mnt/fleet-target";
/// Created over sudo, so root owns it.
const STAGING_DIR: &str = "/var/tmp/fleet-deploy";
/// SFTP writes as the login user; land uploads somewhere it can write.
const UPLOAD_DIR: &str = "/tmp";
const NETWORK_UNIT: &str = "etc/systemd/network/10-fleet-deploy.network";

const AGENT_WAIT: Duration = Duration::from_secs(30 * 60);
const IMAGE_WRITE: Duration = Duration::from_secs(2 * 60 * 60);
const DRIVER_INSTALL: Duration = Duration::from_secs(60 * 60);

/// The built-in system and driver pipelines, built once per run.
pub struct Catalog {
    bmc_system: Arc<PipelineDefinition>,
    ssh_system: Arc<PipelineDefinition>,
    driver: Arc<PipelineDefinition>,
}

impl Catalog {
    pub fn new(artifacts: InstallArtifacts) -> Result<Self, PipelineDefinitionError> {
        let artifacts = Arc::new(artifacts);
        let bmc_system = PipelineDefinition::new(
            PipelineKind::System,
            vec![
                step("mount-bootstrap", 10, &artifacts, mount_bootstrap),
                step("boot-bootstrap", 20, &artifacts, boot_bootstrap),
                step("wait-agent", 30, &artifacts, wait_agent).with_timeout(AGENT_WAIT),
                step("write-image", 80, &artifacts, write_image).with_timeout(IMAGE_WRITE),
                step("configure-account", 90, &artifacts, configure_account),
                step("configure-network", 95, &artifacts, configure_network),
                step("finalize", 100, &artifacts, finalize),
            ],
        )?;
        let ssh_system = PipelineDefinition::new(
            PipelineKind::System,
            vec![
                step("probe-system", 50, &artifacts, probe_system),
                step("configure-account", 100, &artifacts, configure_account),
            ],
        )?;
        let driver = PipelineDefinition::new(
            PipelineKind::Driver,
            vec![
                step("preinstall", 20, &artifacts, preinstall).with_timeout(AGENT_WAIT),
                step("upload", 50, &artifacts, upload_driver),
                step("install", 98, &artifacts, install_driver).with_timeout(DRIVER_INSTALL),
                step("verify", 100, &artifacts, verify_driver),
                step("complete", 100, &artifacts, complete),
            ],
        )?;
        Ok(Self {
            bmc_system: Arc::new(bmc_system),
            ssh_system: Arc::new(ssh_system),
            driver: Arc::new(driver),
        })
    }

    pub fn system(&self, backend: BackendKind) -> &Arc<PipelineDefinition> {
        match backend {
            BackendKind::Bmc => &self.bmc_system,
            BackendKind::Ssh => &self.ssh_system,
        }
    }

    pub fn driver(&self) -> &Arc<PipelineDefinition> {
        &self.driver
    }
}

impl PipelineFactory for Catalog {
    fn pipelines(&self, client: &dyn ConnectionClient) -> Vec<Arc<PipelineDefinition>> {
        vec![self.system(client.kind()).clone(), self.driver.clone()]
    }
}

fn step<F, Fut>(name: &str, target: u8, artifacts: &Arc<InstallArtifacts>, run: F) -> StepDefinition
where
    F: Fn(StepContext, Arc<InstallArtifacts>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let artifacts = artifacts.clone();
    StepDefinition::new(name, target, move |ctx: StepContext| {
        run(ctx, artifacts.clone())
    })
}

/// Runs `command` as root on the host, over sudo or through the agent.
/// `label` stands in for the command in errors.
async fn exec(ctx: &StepContext, label: &str, command: &str) -> anyhow::Result<CommandOutput> {
    ctx.client.ensure_open()?;
    let output = match ctx.client.backend() {
        Backend::Ssh(shell) => shell.run_sudo(command, None).await?,
        Backend::Bmc(bmc) => bmc.dispatch(command, &ctx.cancel).await?,
    };
    Ok(output.check(ctx.client.host(), label)?)
}

fn required<'a>(value: &'a Option<String>, what: &str) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{what} is not configured"))
}

async fn mount_bootstrap(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let url = required(&artifacts.bootstrap_image_url, "bootstrap image URL")?;
    let bmc = ctx.client.bmc()?;
    if let Err(err) = bmc.unmount_media().await {
        tracing::debug!(host = %ctx.client.host(), error = %err, "no virtual media to eject");
    }
    bmc.mount_media(url).await?;
    Ok(())
}

async fn boot_bootstrap(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let bmc = ctx.client.bmc()?;
    bmc.boot_once_from_cd().await?;
    bmc.reset(ResetType::PowerCycle).await?;
    Ok(())
}

async fn wait_agent(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let agent = ctx.client.bmc()?.wait_for_agent(&ctx.cancel).await?;
    tracing::info!(host = %ctx.client.host(), agent = %agent, "bootstrap environment is up");
    Ok(())
}

async fn write_image(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let url = required(&artifacts.system_image_url, "system image URL")?;
    let disk = &artifacts.target_disk;
    ctx.client
        .bmc()?
        .fetch_file(url, disk, &ctx.cancel)
        .await
        .with_context(|| format!("writing system image to {disk}"))?;
    exec(
        &ctx,
        "partition rescan",
        &format!("sync && partprobe {}", shell_quote(disk)),
    )
    .await?;
    Ok(())
}

async fn configure_account(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let account = &ctx.config.account;
    validate_username(&account.username)?;
    let command = match ctx.client.kind() {
        BackendKind::Bmc => format!(
            "{} && {}",
            mount_target(&artifacts.root_partition),
            account_command(account, Some(TARGET_MOUNT))
        ),
        BackendKind::Ssh => account_command(account, None),
    };
    exec(&ctx, "account setup", &command).await?;
    Ok(())
}

async fn configure_network(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let command = format!(
        "{} && {}",
        mount_target(&artifacts.root_partition),
        network_command(&ctx.config.network, TARGET_MOUNT)
    );
    exec(&ctx, "network setup", &command).await?;
    Ok(())
}

async fn finalize(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    exec(
        &ctx,
        "unmount target",
        &format!("sync; umount {TARGET_MOUNT} 2>/dev/null || true"),
    )
    .await?;
    let bmc = ctx.client.bmc()?;
    bmc.unmount_media().await?;
    bmc.reset(ResetType::ForceRestart).await?;
    Ok(())
}

async fn probe_system(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let shell = ctx.client.shell()?;
    let output = shell
        .run_command("uname -m && test -r /etc/os-release", Some(Duration::from_secs(30)))
        .await?
        .check(ctx.client.host(), "system probe")?;
    let architecture = output.stdout.lines().next().unwrap_or_default().trim();
    tracing::info!(host = %ctx.client.host(), architecture, "system reachable");
    Ok(())
}

async fn preinstall(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    if let Backend::Bmc(bmc) = ctx.client.backend() {
        // The installed system runs its own agent, which registers again after the reboot.
        bmc.wait_for_agent(&ctx.cancel).await?;
    }
    exec(
        &ctx,
        "staging setup",
        &format!("mkdir -p {STAGING_DIR} && test -w {STAGING_DIR}"),
    )
    .await?;
    Ok(())
}

async fn upload_driver(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let remote = package_path(&artifacts, ctx.client.kind())?;
    ctx.client.ensure_open()?;
    match ctx.client.backend() {
        Backend::Ssh(shell) => {
            let local = artifacts
                .driver_package
                .as_deref()
                .context("driver package path is not configured")?;
            let partial = format!("{UPLOAD_DIR}/.fleet-upload-{}", random_hex(6));
            let bytes = shell.upload_file(local, &partial).await?;
            let placed = exec(
                &ctx,
                "package placement",
                &format!("mv -f {} {}", shell_quote(&partial), shell_quote(&remote)),
            )
            .await;
            if let Err(err) = placed {
                let cleanup = format!("rm -f {}", shell_quote(&partial));
                if let Err(rm_err) = shell.run_command(&cleanup, None).await {
                    tracing::debug!(host = %ctx.client.host(), error = %rm_err, "failed to remove partial upload");
                }
                return Err(err);
            }
            tracing::info!(host = %ctx.client.host(), bytes, "driver package uploaded");
        }
        Backend::Bmc(bmc) => {
            let url = required(&artifacts.driver_package_url, "driver package URL")?;
            bmc.fetch_file(url, &remote, &ctx.cancel).await?;
        }
    }
    Ok(())
}

async fn install_driver(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    let remote = package_path(&artifacts, ctx.client.kind())?;
    let command = artifacts
        .driver_install_command
        .replace("{package}", &shell_quote(&remote));
    exec(&ctx, "driver installer", &command).await?;
    Ok(())
}

async fn verify_driver(ctx: StepContext, artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    exec(&ctx, "driver verification", &artifacts.driver_verify_command).await?;
    Ok(())
}

async fn complete(ctx: StepContext, _artifacts: Arc<InstallArtifacts>) -> anyhow::Result<()> {
    exec(&ctx, "staging cleanup", &format!("rm -rf {STAGING_DIR}")).await?;
    Ok(())
}

/// Where the driver package lands on the host.
fn package_path(artifacts: &InstallArtifacts, backend: BackendKind) -> anyhow::Result<String> {
    let name = match backend {
        BackendKind::Ssh => artifacts
            .driver_package
            .as_deref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned()),
        BackendKind::Bmc => artifacts
            .driver_package_url
            .as_deref()
            .and_then(|raw| url::Url::parse(raw).ok())
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty()),
    };
    let name = name.context("driver package is not configured")?;
    Ok(format!("{STAGING_DIR}/{name}"))
}

fn mount_target(root_partition: &str) -> String {
    format!(
        "mkdir -p {TARGET_MOUNT} && (mountpoint -q {TARGET_MOUNT} || mount {} {TARGET_MOUNT})",
        shell_quote(root_partition)
    )
}

/// Creates the account if missing and sets its password, optionally inside a chroot.
fn account_command(account: &AccountConfig, root: Option<&str>) -> String {
    let prefix = root
        .map(|root| format!("chroot {} ", shell_quote(root)))
        .unwrap_or_default();
    let user = shell_quote(account.username.trim());
    let credentials = shell_quote(&format!("{}:{}", account.username.trim(), account.password));
    format!(
        "({prefix}id -u {user} >/dev/null 2>&1 || {prefix}useradd -m -s /bin/bash {user}) \
         && echo {credentials} | {prefix}chpasswd"
    )
}

/// Renders a systemd-networkd unit. Static mode pins whatever address the
/// host holds when the unit is written, read into `$addr`.
fn network_unit(network: &NetworkConfig) -> String {
    let mut unit = String::from("[Match]\nName=en* eth*\n\n[Network]\n");
    match network.ipv4 {
        Ipv4Mode::Dhcp => unit.push_str("DHCP=ipv4\n"),
        Ipv4Mode::Static { prefix_len } => {
            unit.push_str(&format!("Address=${{addr}}/{prefix_len}\n"));
        }
    }
    if let Some(gateway) = network.gateway {
        unit.push_str(&format!("Gateway={gateway}\n"));
    }
    for dns in &network.dns {
        unit.push_str(&format!("DNS={dns}\n"));
    }
    unit
}

fn network_command(network: &NetworkConfig, root: &str) -> String {
    let path = format!("{root}/{NETWORK_UNIT}");
    let discover = match network.ipv4 {
        Ipv4Mode::Dhcp => String::new(),
        Ipv4Mode::Static { .. } => "addr=$(ip -4 -o addr show scope global \
             | awk 'NR==1 {split($4, a, \"/\"); print a[1]}') && test -n \"$addr\" && "
            .to_string(),
    };
    format!(
        "{discover}mkdir -p {dir} && cat > {path} <<EOF\n{unit}EOF\n\
         chroot {root} systemctl enable systemd-networkd >/dev/null 2>&1 || true",
        dir = shell_quote(&format!("{root}/etc/systemd/network")),
        path = shell_quote(&path),
        root = shell_quote(root),
        unit = network_unit(network),
    )
}
