//! Ordered transform pipelines.
//!
//! # Responsibilities
//! - Run a direction's stages in configured order, chaining outputs
//! - Isolate stage failures and panics so the byte stream stays intact
//! - Flag stages that overrun their time budget

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::{RelayError, TransformError};
use crate::observability::metrics;
use crate::transform::{Direction, MessageContext, ModuleRegistry, Transform};

/// Result of running one chunk through a pipeline.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Bytes to forward.
    pub data: Vec<u8>,
    /// `RelayError::TransformStage` for every stage skipped on this chunk.
    pub failures: Vec<RelayError>,
}

impl PipelineOutput {
    /// Names of the stages that failed, in execution order.
    pub fn failed_stages(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|e| match e {
                RelayError::TransformStage { stage, .. } => Some(stage.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// The enabled stages for one direction, in order.
#[derive(Clone)]
pub struct Pipeline {
    direction: Direction,
    stages: Vec<Arc<dyn Transform>>,
    stage_budget: Duration,
}

impl Pipeline {
    /// Create a pipeline from stages in the order they should run.
    pub fn new(direction: Direction, stages: Vec<Arc<dyn Transform>>) -> Self {
        Self {
            direction,
            stages,
            stage_budget: Duration::from_millis(250),
        }
    }

    /// An identity pipeline.
    pub fn empty(direction: Direction) -> Self {
        Self::new(direction, Vec::new())
    }

    pub fn with_stage_budget(mut self, budget: Duration) -> Self {
        self.stage_budget = budget;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run `data` through every stage.
    ///
    /// Each stage receives the previous stage's output. A stage that returns
    /// an error or panics is skipped: the next stage receives the bytes the
    /// failing stage was given.
    pub fn apply(&self, ctx: &MessageContext, data: Vec<u8>) -> PipelineOutput {
        let mut data = data;
        let mut failures = Vec::new();

        for (position, stage) in self.stages.iter().enumerate() {
            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| stage.process(ctx, &data)));
            let elapsed = started.elapsed();

            let failure = match result {
                Ok(Ok(output)) => {
                    data = output;
                    None
                }
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(TransformError::Panicked(panic_message(payload.as_ref()))),
            };

            if let Some(error) = failure {
                let error = RelayError::TransformStage {
                    stage: stage.name().to_string(),
                    reason: error.to_string(),
                };
                tracing::warn!(
                    stage = stage.name(),
                    position,
                    direction = %ctx.direction,
                    message_number = ctx.message_number,
                    source = %ctx.source,
                    destination = %ctx.destination,
                    error = %error,
                    "Transform stage failed, forwarding its input unchanged"
                );
                metrics::record_stage_failure(stage.name());
                failures.push(error);
            }

            if elapsed > self.stage_budget {
                tracing::warn!(
                    stage = stage.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.stage_budget.as_millis() as u64,
                    "Transform stage exceeded its time budget"
                );
            }
        }

        PipelineOutput {
            data,
            failures,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("direction", &self.direction)
            .field("stages", &self.stage_names())
            .field("stage_budget", &self.stage_budget)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Both directions' pipelines for one relay run.
///
/// Immutable once built. Reloading builds a new set and swaps it in; sessions
/// keep the `Arc<PipelineSet>` they bound when they started.
#[derive(Debug, Clone)]
pub struct PipelineSet {
    client_to_remote: Pipeline,
    remote_to_client: Pipeline,
}

impl PipelineSet {
    pub fn new(client_to_remote: Pipeline, remote_to_client: Pipeline) -> Self {
        Self {
            client_to_remote,
            remote_to_client,
        }
    }

    /// Identity pipelines in both directions.
    pub fn empty() -> Self {
        Self::new(
            Pipeline::empty(Direction::ClientToRemote),
            Pipeline::empty(Direction::RemoteToClient),
        )
    }

    /// Instantiate every enabled module through the registry.
    pub fn from_config(
        config: &PipelineConfig,
        registry: &ModuleRegistry,
    ) -> Result<Self, TransformError> {
        let budget = Duration::from_millis(config.stage_budget_ms);
        let build = |direction, stages: &[crate::config::StageConfig]| {
            stages
                .iter()
                .map(|stage| registry.build(stage))
                .collect::<Result<Vec<_>, _>>()
                .map(|stages| Pipeline::new(direction, stages).with_stage_budget(budget))
        };

        Ok(Self::new(
            build(Direction::ClientToRemote, config.client.as_slice())?,
            build(Direction::RemoteToClient, config.server.as_slice())?,
        ))
    }

    pub fn for_direction(&self, direction: Direction) -> &Pipeline {
        match direction {
            Direction::ClientToRemote => &self.client_to_remote,
            Direction::RemoteToClient => &self.remote_to_client,
        }
    }

    /// Run a chunk through the pipeline for `ctx.direction`.
    pub fn apply(&self, ctx: &MessageContext, data: Vec<u8>) -> PipelineOutput {
        self.for_direction(ctx.direction).apply(ctx, data)
    }
}

impl Default for PipelineSet {
    fn default() -> Self {
        Self::empty()
    }
}
