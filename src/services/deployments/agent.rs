use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("bootstrap agent request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bootstrap agent returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid bootstrap agent url: {0}")]
    Url(#[from] url::ParseError),
    #[error("wait for bootstrap agent was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentHostInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub system_uuid: Option<String>,
}

/// How a registered agent host is matched to a deployment target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatch {
    Ip(String),
    SystemUuid(String),
}

impl HostMatch {
    fn matches(&self, info: &AgentHostInfo) -> bool {
        match self {
            HostMatch::Ip(ip) => info.ips.iter().any(|candidate| candidate.trim() == ip),
            HostMatch::SystemUuid(uuid) => info
                .system_uuid
                .as_deref()
                .is_some_and(|candidate| candidate.trim().eq_ignore_ascii_case(uuid)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskResult {
    pub ok: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// What the agent knows about a task at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(TaskResult),
    Pending,
    NotFound,
}

/// How long `block_until_task_complete` keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLimit {
    Attempts(u32),
    Unbounded,
}

impl PollLimit {
    /// Negative counts mean "poll forever".
    pub fn from_count(count: i64) -> Self {
        if count < 0 {
            PollLimit::Unbounded
        } else {
            PollLimit::Attempts(count.min(i64::from(u32::MAX)) as u32)
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        match self {
            PollLimit::Attempts(limit) => attempt < *limit,
            PollLimit::Unbounded => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HostList {
    #[serde(default)]
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskAccepted {
    task_id: u64,
}

/// HTTP client for the lightweight agent running inside the bootstrap image.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base: Url,
}

impl AgentClient {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn ensure_ok(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(AgentError::Status {
            status,
            body: response.text().await.unwrap_or_default(),
        })
    }

    pub async fn list_hosts(&self) -> Result<Vec<String>, AgentError> {
        let response = self.http.get(self.base.join("api/list")?).send().await?;
        let list: HostList = Self::ensure_ok(response).await?.json().await?;
        Ok(list.hosts)
    }

    pub async fn get_host_info(&self, host_id: &str) -> Result<Option<AgentHostInfo>, AgentError> {
        let response = self
            .http
            .get(self.base.join("api/info")?)
            .query(&[("host", host_id)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::ensure_ok(response).await?.json().await?))
    }

    async fn submit(&self, path: &str, body: serde_json::Value) -> Result<u64, AgentError> {
        let response = self
            .http
            .post(self.base.join(path)?)
            .json(&body)
            .send()
            .await?;
        let accepted: TaskAccepted = Self::ensure_ok(response).await?.json().await?;
        Ok(accepted.task_id)
    }

    pub async fn exec_command(&self, host_id: &str, command: &str) -> Result<u64, AgentError> {
        self.submit(
            "api/exec",
            serde_json::json!({ "host": host_id, "cmd": command }),
        )
        .await
    }

    /// Has the agent download `source_url` onto the host at `target_path`.
    pub async fn upload_file(
        &self,
        host_id: &str,
        source_url: &str,
        target_path: &str,
    ) -> Result<u64, AgentError> {
        self.submit(
            "api/file/upload",
            serde_json::json!({ "host": host_id, "url": source_url, "path": target_path }),
        )
        .await
    }

    /// Has the agent push `source_path` from the host to `upload_url`.
    pub async fn download_file(
        &self,
        host_id: &str,
        source_path: &str,
        upload_url: &str,
    ) -> Result<u64, AgentError> {
        self.submit(
            "api/file/download",
            serde_json::json!({ "host": host_id, "path": source_path, "url": upload_url }),
        )
        .await
    }

    pub async fn get_result(&self, host_id: &str, task_id: u64) -> Result<TaskOutcome, AgentError> {
        let task_id = task_id.to_string();
        let response = self
            .http
            .get(self.base.join("api/result")?)
            .query(&[("host", host_id), ("task_id", task_id.as_str())])
            .send()
            .await?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(TaskOutcome::Pending),
            StatusCode::NOT_FOUND => Ok(TaskOutcome::NotFound),
            _ => {
                let result: TaskResult = Self::ensure_ok(response).await?.json().await?;
                Ok(TaskOutcome::Finished(result))
            }
        }
    }

    /// Polls every `interval` until the task leaves the pending state or
    /// `limit` polls have been made, returning `Pending` on give-up.
    pub async fn block_until_task_complete(
        &self,
        host_id: &str,
        task_id: u64,
        interval: Duration,
        limit: PollLimit,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, AgentError> {
        let mut attempt = 0u32;
        let mut last = TaskOutcome::Pending;
        while limit.allows(attempt) {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            last = self.get_result(host_id, task_id).await?;
            if last != TaskOutcome::Pending {
                return Ok(last);
            }
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::debug!(host_id, task_id, attempts = attempt, "gave up waiting for agent task");
        Ok(last)
    }

    /// Every registered host matching `wanted`, in hub order.
    pub async fn matching_hosts(&self, wanted: &HostMatch) -> Result<Vec<String>, AgentError> {
        let mut found = Vec::new();
        for host_id in self.list_hosts().await? {
            let Some(info) = self.get_host_info(&host_id).await? else {
                continue;
            };
            if wanted.matches(&info) {
                found.push(host_id);
            }
        }
        Ok(found)
    }

    pub async fn find_host(&self, wanted: &HostMatch) -> Result<Option<String>, AgentError> {
        Ok(self.matching_hosts(wanted).await?.into_iter().next())
    }

    /// Polls until a matching host registers.
    ///
    /// `superseded` names a registration left over from before a reboot. It is
    /// never returned while still listed; once it drops off the hub, the same
    /// id may be accepted again.
    pub async fn wait_for_host(
        &self,
        wanted: &HostMatch,
        superseded: Option<&str>,
        interval: Duration,
        limit: PollLimit,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        let mut superseded = superseded.map(str::to_string);
        let mut attempt = 0u32;
        while limit.allows(attempt) {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.matching_hosts(wanted).await {
                Ok(found) => {
                    if let Some(old) = superseded.as_deref() {
                        if !found.iter().any(|host_id| host_id == old) {
                            tracing::debug!(host_id = old, "superseded agent left the hub");
                            superseded = None;
                        }
                    }
                    let fresh = found
                        .into_iter()
                        .find(|host_id| superseded.as_deref() != Some(host_id.as_str()));
                    if let Some(host_id) = fresh {
                        return Ok(Some(host_id));
                    }
                }
                Err(err) => tracing::debug!(?wanted, error = %err, "bootstrap agent not ready"),
            }
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(None)
    }
}
