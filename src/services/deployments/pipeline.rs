use std::sync::Arc;

use super::error::{PipelineDefinitionError, StepCause};
use super::executor::{StepContext, StepDefinition, StepExecutor};
use super::progress::{InstallProgress, ProgressOutcome};
use super::types::PipelineKind;

/// An ordered, validated list of steps for one pipeline kind.
///
/// Targets are cumulative, non-decreasing and end at 100. Definitions are
/// immutable and shared across hosts and runs.
#[derive(Debug)]
pub struct PipelineDefinition {
    kind: PipelineKind,
    steps: Vec<StepDefinition>,
}

impl PipelineDefinition {
    pub fn new(
        kind: PipelineKind,
        steps: Vec<StepDefinition>,
    ) -> Result<Self, PipelineDefinitionError> {
        let mut previous = 0u8;
        for step in &steps {
            if step.target > 100 {
                return Err(PipelineDefinitionError::OutOfRange {
                    step: step.name.clone(),
                    target: step.target,
                });
            }
            if step.target < previous {
                return Err(PipelineDefinitionError::Decreasing {
                    step: step.name.clone(),
                    target: step.target,
                    previous,
                });
            }
            previous = step.target;
        }
        let last = steps.last().ok_or(PipelineDefinitionError::Empty)?;
        if last.target != 100 {
            return Err(PipelineDefinitionError::Incomplete {
                step: last.name.clone(),
                target: last.target,
            });
        }
        Ok(Self { kind, steps })
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    fn range(&self, index: usize) -> (u8, u8) {
        let from = index
            .checked_sub(1)
            .map(|previous| self.steps[previous].target)
            .unwrap_or(0);
        (from, self.steps[index].target)
    }

    fn step_name(&self, index: usize) -> Option<String> {
        self.steps.get(index).map(|step| step.name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running(usize),
    Succeeded,
    Failed(usize),
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Failed(_) | PipelineState::Cancelled
        )
    }
}

/// Drives one host through one pipeline definition, once.
pub struct InstallPipeline {
    definition: Arc<PipelineDefinition>,
    executor: StepExecutor,
    state: PipelineState,
}

impl InstallPipeline {
    pub fn new(definition: Arc<PipelineDefinition>, executor: StepExecutor) -> Self {
        Self {
            definition,
            executor,
            state: PipelineState::Pending,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.definition.kind()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Runs every step in order and reports each transition through `emit`.
    ///
    /// Consumes the pipeline; a terminal pipeline is never run again. The
    /// last emitted snapshot is always terminal.
    pub async fn run<F>(mut self, ctx: StepContext, mut emit: F) -> PipelineState
    where
        F: FnMut(InstallProgress) + Send,
    {
        let definition = self.definition.clone();
        let host = ctx.client.host().clone();
        let snapshot = |from: u8, to: u8, outcome: ProgressOutcome| InstallProgress {
            host: host.clone(),
            from,
            to,
            outcome,
        };

        let steps = definition.steps();
        let mut completed: Option<String> = None;
        for (index, step) in steps.iter().enumerate() {
            let (from, to) = definition.range(index);
            if ctx.cancel.is_cancelled() {
                tracing::info!(step = %step.name, "cancelled before step");
                self.state = PipelineState::Cancelled;
                emit(snapshot(
                    from,
                    from,
                    ProgressOutcome::Cancelled {
                        completed_step: completed,
                    },
                ));
                return self.state;
            }

            self.state = PipelineState::Running(index);
            emit(snapshot(
                from,
                to,
                ProgressOutcome::Running {
                    started_step: Some(step.name.clone()),
                    completed_step: completed.clone(),
                },
            ));
            tracing::debug!(step = %step.name, from, to, "step started");

            if let Err(err) = self.executor.execute(step, ctx.clone()).await {
                let outcome = match err.cause {
                    StepCause::Cancelled => {
                        self.state = PipelineState::Cancelled;
                        ProgressOutcome::Cancelled {
                            completed_step: completed,
                        }
                    }
                    cause => {
                        self.state = PipelineState::Failed(index);
                        ProgressOutcome::Failed {
                            failed_step: step.name.clone(),
                            completed_step: completed,
                            error: cause.to_string(),
                        }
                    }
                };
                emit(snapshot(from, to, outcome));
                return self.state;
            }

            if index + 1 == steps.len() {
                self.state = PipelineState::Succeeded;
                emit(snapshot(
                    100,
                    100,
                    ProgressOutcome::Succeeded {
                        completed_step: step.name.clone(),
                    },
                ));
                tracing::info!("pipeline succeeded");
                return self.state;
            }

            completed = definition.step_name(index);
            emit(snapshot(
                from,
                to,
                ProgressOutcome::Running {
                    started_step: None,
                    completed_step: completed.clone(),
                },
            ));
        }
        // Definitions are never empty, so the loop always returns.
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scripted_steps, shared_config, MockClient, StepScript};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const SCENARIO: [(&str, u8); 4] = [
        ("preinstall", 50),
        ("step1", 98),
        ("step2", 100),
        ("complete", 100),
    ];

    fn context(host: &str, cancel: CancellationToken) -> StepContext {
        StepContext {
            client: MockClient::ssh(host),
            config: Arc::new(shared_config()),
            cancel,
        }
    }

    async fn run_collect(
        definition: PipelineDefinition,
        cancel: CancellationToken,
    ) -> (PipelineState, Vec<InstallProgress>) {
        let pipeline = InstallPipeline::new(
            Arc::new(definition),
            StepExecutor::new(Duration::from_secs(5)),
        );
        let mut events = Vec::new();
        let state = pipeline
            .run(context("10.0.0.1", cancel), |event| events.push(event))
            .await;
        (state, events)
    }

    fn ranges(events: &[InstallProgress]) -> Vec<(u8, u8)> {
        events.iter().map(|event| (event.from, event.to)).collect()
    }

    #[test]
    fn definition_rejects_bad_targets() {
        let script = StepScript::default();
        let err = PipelineDefinition::new(PipelineKind::Driver, Vec::new()).unwrap_err();
        assert_eq!(err, PipelineDefinitionError::Empty);

        let err = PipelineDefinition::new(
            PipelineKind::Driver,
            scripted_steps(&[("a", 60), ("b", 40), ("c", 100)], &script),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineDefinitionError::Decreasing { .. }));

        let err = PipelineDefinition::new(
            PipelineKind::Driver,
            scripted_steps(&[("a", 60), ("b", 90)], &script),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineDefinitionError::Incomplete { target: 90, .. }
        ));

        let err = PipelineDefinition::new(
            PipelineKind::Driver,
            scripted_steps(&[("a", 101)], &script),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineDefinitionError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn successful_pipeline_walks_every_range() -> anyhow::Result<()> {
        let definition = PipelineDefinition::new(
            PipelineKind::Driver,
            scripted_steps(&SCENARIO, &StepScript::default()),
        )?;
        let (state, events) = run_collect(definition, CancellationToken::new()).await;
        assert_eq!(state, PipelineState::Succeeded);

        let completions: Vec<&InstallProgress> = events
            .iter()
            .filter(|event| event.started_step().is_none())
            .collect();
        let completion_ranges: Vec<(u8, u8)> =
            completions.iter().map(|event| (event.from, event.to)).collect();
        assert_eq!(
            completion_ranges,
            vec![(0, 50), (50, 98), (98, 100), (100, 100)]
        );
        let last = events.last().map(|event| event.outcome.clone());
        assert_eq!(
            last,
            Some(ProgressOutcome::Succeeded {
                completed_step: "complete".to_string()
            })
        );

        let started: Vec<&str> = events.iter().filter_map(|e| e.started_step()).collect();
        assert_eq!(started, vec!["preinstall", "step1", "step2", "complete"]);
        Ok(())
    }

    #[tokio::test]
    async fn failing_step_halts_the_pipeline() -> anyhow::Result<()> {
        let script = StepScript::default().fail_at("step1", "disk full");
        let definition =
            PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&SCENARIO, &script))?;
        let (state, events) = run_collect(definition, CancellationToken::new()).await;
        assert_eq!(state, PipelineState::Failed(1));

        assert_eq!(ranges(&events), vec![(0, 50), (0, 50), (50, 98), (50, 98)]);
        assert_eq!(events[0].started_step(), Some("preinstall"));
        assert_eq!(events[1].completed_step(), Some("preinstall"));
        assert_eq!(events[1].started_step(), None);
        assert_eq!(events[2].started_step(), Some("step1"));
        assert_eq!(
            events[3].outcome,
            ProgressOutcome::Failed {
                failed_step: "step1".to_string(),
                completed_step: Some("preinstall".to_string()),
                error: "disk full".to_string(),
            }
        );
        assert!(!events[3].ok());

        for event in &events {
            assert_ne!(event.started_step(), Some("step2"));
            assert_ne!(event.completed_step(), Some("step2"));
        }
        assert_eq!(script.invocations(), vec!["preinstall", "step1"]);
        Ok(())
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_chained() -> anyhow::Result<()> {
        let definition = PipelineDefinition::new(
            PipelineKind::System,
            scripted_steps(
                &[("mount", 10), ("boot", 30), ("wait", 30), ("write", 80), ("done", 100)],
                &StepScript::default(),
            ),
        )?;
        let (_, events) = run_collect(definition, CancellationToken::new()).await;
        for pair in events.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(prev.from <= prev.to && prev.to <= 100);
            assert!(next.to >= prev.to, "to regressed: {prev:?} -> {next:?}");
            let prev_completed_step =
                prev.started_step().is_none() && matches!(prev.outcome, ProgressOutcome::Running { .. });
            if prev_completed_step {
                assert_eq!(next.from, prev.to);
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_step() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let script = StepScript::default().cancel_after("step1", cancel.clone());
        let definition =
            PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&SCENARIO, &script))?;
        let (state, events) = run_collect(definition, cancel).await;
        assert_eq!(state, PipelineState::Cancelled);

        let last = events.last().cloned();
        let Some(last) = last else {
            panic!("expected events");
        };
        assert_eq!(
            last.outcome,
            ProgressOutcome::Cancelled {
                completed_step: Some("step1".to_string())
            }
        );
        assert_eq!((last.from, last.to), (98, 98));
        assert!(!last.ok());
        assert_eq!(last.error(), Some("cancelled"));
        assert!(events.iter().all(|event| event.started_step() != Some("step2")));
        assert_eq!(script.invocations(), vec!["preinstall", "step1"]);
        Ok(())
    }

    #[tokio::test]
    async fn pre_cancelled_pipeline_reports_no_steps() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let script = StepScript::default();
        let definition =
            PipelineDefinition::new(PipelineKind::Driver, scripted_steps(&SCENARIO, &script))?;
        let (state, events) = run_collect(definition, cancel).await;
        assert_eq!(state, PipelineState::Cancelled);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].completed_step(), None);
        assert_eq!((events[0].from, events[0].to), (0, 0));
        assert!(script.invocations().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn emitted_snapshots_belong_to_the_client_host() -> anyhow::Result<()> {
        let definition = PipelineDefinition::new(
            PipelineKind::Driver,
            scripted_steps(&[("only", 100)], &StepScript::default()),
        )?;
        let pipeline = InstallPipeline::new(
            Arc::new(definition),
            StepExecutor::new(Duration::from_secs(5)),
        );
        assert_eq!(pipeline.state(), PipelineState::Pending);
        let seen = Mutex::new(Vec::new());
        let state = pipeline
            .run(context("10.9.9.9", CancellationToken::new()), |event| {
                seen.lock().unwrap().push(event.host.clone());
            })
            .await;
        assert!(state.is_terminal());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|host| host.as_str() == "10.9.9.9"));
        Ok(())
    }
}
