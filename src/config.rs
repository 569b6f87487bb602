use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::services::deployments::{
    BmcSettings, OrchestratorSettings, PollLimit, PoolPolicy, SshSettings,
};

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/fleet-deploy/config.json";
const DEFAULT_KNOWN_HOSTS_PATH: &str = "/var/lib/fleet-deploy/ssh/known_hosts";
const DEFAULT_AGENT_URL: &str = "http://127.0.0.1:8080/";

pub(crate) fn setup_config_path() -> PathBuf {
    env_optional_path("DEPLOY_SETUP_CONFIG_PATH")
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

/// Values an installer may persist instead of exporting environment variables.
/// Environment variables still win.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    ssh_known_hosts_path: Option<String>,
    #[serde(default)]
    agent_url: Option<String>,
    #[serde(default)]
    pool_policy: Option<String>,
    #[serde(default)]
    max_parallel_hosts: Option<u64>,
    #[serde(default)]
    step_timeout_seconds: Option<u64>,
    #[serde(default)]
    bmc_accept_invalid_certs: Option<bool>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub ssh_known_hosts_path: PathBuf,
    pub ssh_accept_new_host_keys: bool,
    pub ssh_connect_timeout_seconds: u64,
    pub bmc_request_timeout_seconds: u64,
    pub bmc_accept_invalid_certs: bool,
    pub agent_url: Url,
    pub agent_poll_interval_ms: u64,
    /// Negative means poll forever.
    pub agent_poll_limit: i64,
    pub pool_policy: PoolPolicy,
    pub step_timeout_seconds: u64,
    pub max_parallel_hosts: usize,
}

impl DeployConfig {
    pub fn from_env() -> Result<Self> {
        let overrides = load_setup_config_overrides(&setup_config_path()).unwrap_or_default();
        Self::resolve(&overrides)
    }

    fn resolve(overrides: &SetupConfigOverrides) -> Result<Self> {
        let known_hosts_default = non_empty(overrides.ssh_known_hosts_path.as_deref())
            .unwrap_or(DEFAULT_KNOWN_HOSTS_PATH);
        let ssh_known_hosts_path = env_path("DEPLOY_SSH_KNOWN_HOSTS_PATH", known_hosts_default)?;

        let agent_url = env_string(
            "DEPLOY_AGENT_URL",
            non_empty(overrides.agent_url.as_deref()).unwrap_or(DEFAULT_AGENT_URL),
        );
        let agent_url = Url::parse(&agent_url)
            .with_context(|| format!("DEPLOY_AGENT_URL is not a valid URL: {agent_url}"))?;

        let pool_policy = env_string(
            "DEPLOY_POOL_POLICY",
            non_empty(overrides.pool_policy.as_deref()).unwrap_or("fail_fast"),
        );
        let pool_policy = pool_policy
            .parse::<PoolPolicy>()
            .map_err(anyhow::Error::msg)
            .context("DEPLOY_POOL_POLICY must be fail_fast or partial")?;

        let max_parallel_hosts = env_u64(
            "DEPLOY_MAX_PARALLEL_HOSTS",
            overrides.max_parallel_hosts.filter(|v| *v > 0).unwrap_or(64),
        );
        if max_parallel_hosts == 0 {
            anyhow::bail!("DEPLOY_MAX_PARALLEL_HOSTS must be at least 1");
        }

        Ok(Self {
            ssh_known_hosts_path,
            ssh_accept_new_host_keys: env_bool("DEPLOY_SSH_ACCEPT_NEW_HOST_KEYS", false),
            ssh_connect_timeout_seconds: env_u64("DEPLOY_SSH_CONNECT_TIMEOUT_SECONDS", 20),
            bmc_request_timeout_seconds: env_u64("DEPLOY_BMC_REQUEST_TIMEOUT_SECONDS", 30),
            bmc_accept_invalid_certs: env_bool(
                "DEPLOY_BMC_ACCEPT_INVALID_CERTS",
                overrides.bmc_accept_invalid_certs.unwrap_or(true),
            ),
            agent_url,
            agent_poll_interval_ms: env_u64("DEPLOY_AGENT_POLL_INTERVAL_MS", 1000),
            agent_poll_limit: env_i64("DEPLOY_AGENT_POLL_LIMIT", 1800),
            pool_policy,
            step_timeout_seconds: env_u64(
                "DEPLOY_STEP_TIMEOUT_SECONDS",
                overrides.step_timeout_seconds.filter(|v| *v > 0).unwrap_or(1800),
            ),
            max_parallel_hosts: usize::try_from(max_parallel_hosts).unwrap_or(usize::MAX),
        })
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            known_hosts_path: self.ssh_known_hosts_path.clone(),
            accept_new_host_keys: self.ssh_accept_new_host_keys,
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout_seconds),
        }
    }

    pub fn bmc_settings(&self) -> BmcSettings {
        BmcSettings {
            request_timeout: Duration::from_secs(self.bmc_request_timeout_seconds),
            accept_invalid_certs: self.bmc_accept_invalid_certs,
            agent_url: self.agent_url.clone(),
            poll_interval: Duration::from_millis(self.agent_poll_interval_ms.max(1)),
            poll_limit: PollLimit::from_count(self.agent_poll_limit),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            policy: self.pool_policy,
            max_parallel_hosts: self.max_parallel_hosts,
            step_timeout: Duration::from_secs(self.step_timeout_seconds),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_overrides() -> Result<()> {
        let config = DeployConfig::resolve(&SetupConfigOverrides::default())?;
        assert_eq!(config.pool_policy, PoolPolicy::FailFast);
        assert_eq!(config.max_parallel_hosts, 64);
        assert_eq!(config.agent_url.as_str(), DEFAULT_AGENT_URL);
        assert_eq!(
            config.ssh_known_hosts_path,
            PathBuf::from(DEFAULT_KNOWN_HOSTS_PATH)
        );
        assert_eq!(
            config.orchestrator_settings().step_timeout,
            Duration::from_secs(1800)
        );
        assert_eq!(config.bmc_settings().poll_limit, PollLimit::Attempts(1800));
        Ok(())
    }

    #[test]
    fn setup_file_overrides_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "agent_url": "http://10.1.0.5:9000/",
                "pool_policy": "partial",
                "max_parallel_hosts": 8,
                "ssh_known_hosts_path": "  ",
                "bmc_accept_invalid_certs": false
            }}"#
        )?;
        let Some(overrides) = load_setup_config_overrides(file.path()) else {
            panic!("overrides should parse");
        };
        let config = DeployConfig::resolve(&overrides)?;
        assert_eq!(config.agent_url.as_str(), "http://10.1.0.5:9000/");
        assert_eq!(config.pool_policy, PoolPolicy::Partial);
        assert_eq!(config.max_parallel_hosts, 8);
        assert!(!config.bmc_accept_invalid_certs);
        assert_eq!(
            config.ssh_known_hosts_path,
            PathBuf::from(DEFAULT_KNOWN_HOSTS_PATH)
        );
        Ok(())
    }

    #[test]
    fn unreadable_setup_file_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(load_setup_config_overrides(&dir.path().join("missing.json")).is_none());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json")?;
        assert!(load_setup_config_overrides(&broken).is_none());
        Ok(())
    }

    #[test]
    fn invalid_pool_policy_is_an_error() {
        let overrides = SetupConfigOverrides {
            pool_policy: Some("whenever".to_string()),
            ..SetupConfigOverrides::default()
        };
        assert!(DeployConfig::resolve(&overrides).is_err());
    }
}
