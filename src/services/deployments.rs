pub mod agent;
pub mod bmc;
pub mod catalog;
pub mod client;
pub mod error;
pub mod executor;
pub mod manager;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod redfish;
pub mod ssh;
pub mod types;
mod util;

pub use agent::{AgentClient, AgentError, HostMatch, PollLimit, TaskOutcome};
pub use bmc::{BmcClient, BmcSettings};
pub use catalog::Catalog;
pub use client::{
    Backend, BackendConnector, BmcOps, CommandOutput, ConnectionClient, Connector, ResetType,
    SharedClient, ShellOps, TerminalSize,
};
pub use error::{
    ClientError, ConnectFailure, ConnectionError, DisposeError, PipelineDefinitionError,
    StepCause, StepError,
};
pub use executor::{StepContext, StepDefinition, StepExecutor};
pub use manager::{DeploymentManager, ManagerError, RunInfo, RunPlan, RunStatus};
pub use orchestrator::{
    FleetOrchestrator, FleetRun, HostOutcome, OrchestratorSettings, PipelineFactory, RunSummary,
};
pub use pipeline::{InstallPipeline, PipelineDefinition, PipelineState};
pub use pool::{ClientPool, PoolBuild, PoolError, PoolPolicy};
pub use progress::{
    all_installed, InstallProgress, ProgressEvent, ProgressOutcome, ProgressStore, ProgressUpdate,
};
pub use ssh::{SshClient, SshSettings};
pub use types::{
    AccountConfig, BackendKind, ClientIdentity, HostDescriptor, HostIdentity, InstallArtifacts,
    Ipv4Mode, NetworkConfig, PipelineKind, SharedConfig, SshCredential,
};
