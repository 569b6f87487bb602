use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use super::client::{Connector, SharedClient};
use super::error::ConnectionError;
use super::types::{HostDescriptor, HostIdentity};

/// What pool construction does when some hosts fail to connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Any failure aborts the pool and disposes the hosts that did connect.
    #[default]
    FailFast,
    /// Keep the hosts that connected and report the rest.
    Partial,
}

impl FromStr for PoolPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(PoolPolicy::FailFast),
            "partial" => Ok(PoolPolicy::Partial),
            other => Err(format!("unknown pool policy '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Connect(#[from] ConnectionError),
    #[error("host {0} is listed more than once")]
    DuplicateHost(HostIdentity),
}

/// A pool plus the hosts that could not join it under `PoolPolicy::Partial`.
pub struct PoolBuild {
    pub pool: ClientPool,
    pub failures: BTreeMap<HostIdentity, ConnectionError>,
}

/// Owns one client per host for the length of a run.
pub struct ClientPool {
    clients: Vec<SharedClient>,
    max_parallel: usize,
    disposed: AtomicBool,
}

impl ClientPool {
    /// Connects to every host concurrently; no single failure aborts the
    /// others' attempts. The policy decides what happens afterwards.
    pub async fn create(
        connector: &dyn Connector,
        descriptors: &[HostDescriptor],
        policy: PoolPolicy,
        max_parallel: usize,
    ) -> Result<PoolBuild, PoolError> {
        let mut seen = BTreeSet::new();
        for descriptor in descriptors {
            let host = descriptor.host_id();
            if !seen.insert(host.clone()) {
                return Err(PoolError::DuplicateHost(host));
            }
        }

        let max_parallel = max_parallel.max(1);
        let pending: Vec<_> = descriptors
            .iter()
            .map(|descriptor| connector.connect(descriptor))
            .collect();
        let attempts: Vec<Result<SharedClient, ConnectionError>> = stream::iter(pending)
            .buffered(max_parallel)
            .collect()
            .await;

        let mut clients = Vec::with_capacity(attempts.len());
        let mut failures = BTreeMap::new();
        let mut first_error = None;
        for attempt in attempts {
            match attempt {
                Ok(client) => clients.push(client),
                Err(err) => {
                    tracing::warn!(host = %err.host, kind = %err.kind, error = %err.message, "host connection failed");
                    if first_error.is_none() {
                        first_error = Some(err.clone());
                    }
                    failures.insert(err.host.clone(), err);
                }
            }
        }

        let pool = ClientPool {
            clients,
            max_parallel,
            disposed: AtomicBool::new(false),
        };
        match (policy, first_error) {
            (PoolPolicy::FailFast, Some(err)) => {
                pool.dispose().await;
                Err(PoolError::Connect(err))
            }
            _ => {
                tracing::info!(
                    connected = pool.len(),
                    failed = failures.len(),
                    "client pool ready"
                );
                Ok(PoolBuild { pool, failures })
            }
        }
    }

    pub fn from_clients(clients: Vec<SharedClient>, max_parallel: usize) -> Self {
        Self {
            clients,
            max_parallel: max_parallel.max(1),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[SharedClient] {
        &self.clients
    }

    pub fn hosts(&self) -> Vec<HostIdentity> {
        self.clients
            .iter()
            .map(|client| client.host().clone())
            .collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Runs `f` for every client on its own task, at most `max_parallel` at
    /// a time. Results keep input order; a panicking task only loses its
    /// own slot.
    pub async fn map<T, F, Fut>(&self, f: F) -> Vec<Result<T, JoinError>>
    where
        F: Fn(SharedClient) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let handles: Vec<_> = self
            .clients
            .iter()
            .map(|client| {
                let work = f(client.clone());
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await.ok();
                    work.await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (client, handle) in self.clients.iter().zip(handles) {
            let result = handle.await;
            if let Err(err) = &result {
                tracing::warn!(host = %client.host(), error = %err, "host task did not complete");
            }
            results.push(result);
        }
        results
    }

    /// Disposes every client concurrently. Only the first call does anything.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        futures::future::join_all(self.clients.iter().map(|client| client.dispose())).await;
        tracing::debug!(clients = self.clients.len(), "client pool disposed");
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        if !self.is_disposed() && !self.clients.is_empty() {
            tracing::warn!(
                clients = self.clients.len(),
                "client pool dropped without dispose; sessions may leak"
            );
        }
    }
}
