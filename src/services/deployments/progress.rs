use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::types::{HostIdentity, PipelineKind};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    Running {
        started_step: Option<String>,
        completed_step: Option<String>,
    },
    Succeeded {
        completed_step: String,
    },
    Failed {
        failed_step: String,
        completed_step: Option<String>,
        error: String,
    },
    Cancelled {
        completed_step: Option<String>,
    },
}

impl ProgressOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressOutcome::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProgressOutcome::Running { .. } => "running",
            ProgressOutcome::Succeeded { .. } => "succeeded",
            ProgressOutcome::Failed { .. } => "failed",
            ProgressOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// Latest progress of one pipeline on one host. `0 <= from <= to <= 100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    pub host: HostIdentity,
    pub from: u8,
    pub to: u8,
    pub outcome: ProgressOutcome,
}

impl InstallProgress {
    pub fn ok(&self) -> bool {
        !matches!(
            self.outcome,
            ProgressOutcome::Failed { .. } | ProgressOutcome::Cancelled { .. }
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.outcome, ProgressOutcome::Succeeded { .. })
    }

    pub fn started_step(&self) -> Option<&str> {
        match &self.outcome {
            ProgressOutcome::Running { started_step, .. } => started_step.as_deref(),
            _ => None,
        }
    }

    pub fn completed_step(&self) -> Option<&str> {
        match &self.outcome {
            ProgressOutcome::Running { completed_step, .. }
            | ProgressOutcome::Failed { completed_step, .. }
            | ProgressOutcome::Cancelled { completed_step } => completed_step.as_deref(),
            ProgressOutcome::Succeeded { completed_step } => Some(completed_step),
        }
    }

    pub fn failed_step(&self) -> Option<&str> {
        match &self.outcome {
            ProgressOutcome::Failed { failed_step, .. } => Some(failed_step),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ProgressOutcome::Failed { error, .. } => Some(error),
            ProgressOutcome::Cancelled { .. } => Some("cancelled"),
            _ => None,
        }
    }

    fn wire<'a>(&'a self, pipeline: Option<PipelineKind>) -> ProgressWire<'a> {
        ProgressWire {
            host: &self.host,
            pipeline,
            state: self.outcome.label(),
            from: self.from,
            to: self.to,
            ok: self.ok(),
            started_step: self.started_step(),
            completed_step: self.completed_step(),
            failed_step: self.failed_step(),
            error: self.error(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressWire<'a> {
    host: &'a HostIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<PipelineKind>,
    state: &'static str,
    from: u8,
    to: u8,
    ok: bool,
    started_step: Option<&'a str>,
    completed_step: Option<&'a str>,
    failed_step: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for InstallProgress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.wire(None).serialize(serializer)
    }
}

/// A snapshot tagged with the pipeline it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub pipeline: PipelineKind,
    pub progress: InstallProgress,
}

impl Serialize for ProgressUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.progress.wire(Some(self.pipeline)).serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Updated(ProgressUpdate),
    Removed { host: HostIdentity },
    Reset,
}

pub type ProgressMap = BTreeMap<HostIdentity, BTreeMap<PipelineKind, InstallProgress>>;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Latest progress per host and pipeline for the current run.
///
/// Listeners run synchronously on the writer's thread, outside the map lock.
/// A panicking listener is logged and skipped.
pub struct ProgressStore {
    entries: Mutex<ProgressMap>,
    listeners: Mutex<BTreeMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
    events: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

fn recover<'a, T>(result: std::sync::LockResult<MutexGuard<'a, T>>, what: &str) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = what, "progress lock poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, ProgressMap> {
        recover(self.entries.lock(), "entries")
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<ListenerId, Listener>> {
        recover(self.listeners.lock(), "listeners")
    }

    pub fn set(&self, host: &HostIdentity, pipeline: PipelineKind, snapshot: InstallProgress) {
        self.entries()
            .entry(host.clone())
            .or_default()
            .insert(pipeline, snapshot.clone());
        self.publish(ProgressEvent::Updated(ProgressUpdate {
            pipeline,
            progress: snapshot,
        }));
    }

    pub fn get(&self, host: &HostIdentity, pipeline: PipelineKind) -> Option<InstallProgress> {
        self.entries()
            .get(host)
            .and_then(|pipelines| pipelines.get(&pipeline))
            .cloned()
    }

    /// Removes every pipeline entry for `host`. Returns whether anything was removed.
    pub fn delete(&self, host: &HostIdentity) -> bool {
        let removed = self.entries().remove(host).is_some();
        if removed {
            self.publish(ProgressEvent::Removed { host: host.clone() });
        }
        removed
    }

    pub fn reset(&self) {
        self.entries().clear();
        self.publish(ProgressEvent::Reset);
    }

    pub fn snapshot(&self) -> ProgressMap {
        self.entries().clone()
    }

    /// Flattened snapshot, ordered by host then pipeline.
    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.entries()
            .values()
            .flat_map(|pipelines| {
                pipelines.iter().map(|(pipeline, progress)| ProgressUpdate {
                    pipeline: *pipeline,
                    progress: progress.clone(),
                })
            })
            .collect()
    }

    pub fn all_installed(&self) -> bool {
        all_installed(&self.entries())
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners().remove(&id).is_some()
    }

    /// Async view of the same events. Slow receivers observe `Lagged`.
    pub fn watch(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ProgressEvent) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(listener = id, "progress listener panicked");
            }
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// True once every host reports both required pipelines succeeded at 100.
pub fn all_installed(progress: &ProgressMap) -> bool {
    !progress.is_empty() && progress.values().all(host_installed)
}

pub fn host_installed(pipelines: &BTreeMap<PipelineKind, InstallProgress>) -> bool {
    PipelineKind::REQUIRED.iter().all(|kind| {
        pipelines
            .get(kind)
            .is_some_and(|progress| progress.is_succeeded() && progress.to == 100)
    })
}

/// Hosts holding back `all_installed`, in host order.
pub fn pending_hosts(progress: &ProgressMap) -> Vec<HostIdentity> {
    progress
        .iter()
        .filter(|(_, pipelines)| !host_installed(pipelines))
        .map(|(host, _)| host.clone())
        .collect()
}
