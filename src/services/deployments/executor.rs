use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::client::SharedClient;
use super::error::{ClientError, StepCause, StepError};
use super::types::SharedConfig;

pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Everything one step invocation may touch.
#[derive(Clone)]
pub struct StepContext {
    pub client: SharedClient,
    pub config: Arc<SharedConfig>,
    pub cancel: CancellationToken,
}

pub trait StepAction: Send + Sync {
    fn run(&self, ctx: StepContext) -> StepFuture;
}

impl<F, Fut> StepAction for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(&self, ctx: StepContext) -> StepFuture {
        Box::pin(self(ctx))
    }
}

/// One named unit of work with its cumulative progress target.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub target: u8,
    pub timeout: Option<Duration>,
    action: Arc<dyn StepAction>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, target: u8, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            target,
            timeout: None,
            action: Arc::new(action),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn observed_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ClientError>(),
            Some(ClientError::Cancelled { .. })
        )
    })
}

/// Runs single steps under a deadline.
///
/// Cancellation is cooperative: the token is checked before the step starts
/// and handed to the step, which may stop early at its own safe points.
#[derive(Debug, Clone, Copy)]
pub struct StepExecutor {
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn execute(&self, step: &StepDefinition, ctx: StepContext) -> Result<(), StepError> {
        if ctx.cancel.is_cancelled() {
            return Err(StepError {
                step: step.name.clone(),
                cause: StepCause::Cancelled,
            });
        }
        let limit = step.timeout.unwrap_or(self.default_timeout);
        let cancel = ctx.cancel.clone();
        let host = ctx.client.host().clone();

        let cause = match tokio::time::timeout(limit, step.action.run(ctx)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) if cancel.is_cancelled() && observed_cancellation(&err) => {
                StepCause::Cancelled
            }
            Ok(Err(err)) => StepCause::Failed(format!("{err:#}")),
            Err(_) => StepCause::Timeout(limit),
        };
        let err = StepError {
            step: step.name.clone(),
            cause,
        };
        tracing::warn!(host = %host, step = %step.name, error = %err, "step failed");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{shared_config, MockClient};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context(cancel: CancellationToken) -> StepContext {
        StepContext {
            client: MockClient::ssh("10.0.0.1"),
            config: Arc::new(shared_config()),
            cancel,
        }
    }

    #[tokio::test]
    async fn successful_step_resolves_ok() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let step = StepDefinition::new("copy", 50, move |ctx: StepContext| {
            let flag = flag.clone();
            async move {
                ctx.client.shell()?.run_command("true", None).await?;
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        let executor = StepExecutor::new(Duration::from_secs(5));
        assert!(executor
            .execute(&step, context(CancellationToken::new()))
            .await
            .is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_carries_step_name_and_cause() {
        let step = StepDefinition::new("step1", 98, |_ctx: StepContext| async {
            Err::<(), _>(anyhow::anyhow!("disk full"))
        });
        let executor = StepExecutor::new(Duration::from_secs(5));
        let err = executor
            .execute(&step, context(CancellationToken::new()))
            .await
            .unwrap_err();
        assert_eq!(err.step, "step1");
        assert_eq!(err.cause, StepCause::Failed("disk full".to_string()));
    }

    #[tokio::test]
    async fn step_deadline_becomes_timeout() {
        let step = StepDefinition::new("reboot", 80, |_ctx: StepContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        })
        .with_timeout(Duration::from_millis(10));
        let executor = StepExecutor::new(Duration::from_secs(3600));
        let err = executor
            .execute(&step, context(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.step, "reboot");
    }

    #[tokio::test]
    async fn default_deadline_applies_without_step_timeout() {
        let step = StepDefinition::new("wait", 80, |_ctx: StepContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        });
        let executor = StepExecutor::new(Duration::from_millis(10));
        let err = executor
            .execute(&step, context(CancellationToken::new()))
            .await
            .unwrap_err();
        assert_eq!(err.cause, StepCause::Timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_step() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let step = StepDefinition::new("copy", 50, move |_ctx: StepContext| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = StepExecutor::new(Duration::from_secs(5))
            .execute(&step, context(cancel))
            .await
            .unwrap_err();
        assert_eq!(err.cause, StepCause::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn step_observing_cancellation_reports_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let step = StepDefinition::new("wait-agent", 60, move |ctx: StepContext| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Err::<(), anyhow::Error>(
                    ClientError::Cancelled {
                        host: ctx.client.host().clone(),
                    }
                    .into(),
                )
            }
        });
        let err = StepExecutor::new(Duration::from_secs(5))
            .execute(&step, context(cancel))
            .await
            .unwrap_err();
        assert_eq!(err.cause, StepCause::Cancelled);
    }
}
