//! Batch pipeline: an ordered list of batch-in/batch-out stages.

use anyhow::Context as _;

use crate::error::GenericError;
use crate::model::Batch;

mod stages;
pub use self::stages::{ChaosStage, GeneratorStage, ScenarioStage};

mod runner;
pub use self::runner::{ConcurrencyRunner, Interrupted, RunOptions, RunSignal};

/// A uniform batch transformer.
///
/// Stages are synchronous and must be shareable across workers; anything
/// stateful inside a stage has to provide its own synchronization.
pub trait BatchStage: Send + Sync {
    /// Stage name, used to tag errors.
    fn name(&self) -> &'static str;

    /// Transforms one batch.
    fn process(&self, batch: Batch) -> Result<Batch, GenericError>;
}

/// An ordered list of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn BatchStage>>,
}

impl Pipeline {
    /// Creates a pipeline from stages, applied in order.
    pub fn new(stages: Vec<Box<dyn BatchStage>>) -> Self {
        Pipeline { stages }
    }

    /// Folds the batch through every stage, stopping at the first error.
    ///
    /// Errors carry the name of the stage that produced them.
    pub fn process(&self, initial: Batch) -> Result<Batch, GenericError> {
        let mut batch = initial;
        for stage in &self.stages {
            batch = stage
                .process(batch)
                .with_context(|| format!("stage {}", stage.name()))?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    struct RenameStage {
        name: &'static str,
        suffix: &'static str,
    }

    impl BatchStage for RenameStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn process(&self, mut batch: Batch) -> Result<Batch, GenericError> {
            for span in &mut batch {
                span.name.push_str(self.suffix);
            }
            Ok(batch)
        }
    }

    struct FailingStage;

    impl BatchStage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn process(&self, _batch: Batch) -> Result<Batch, GenericError> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    fn span(name: &str) -> Span {
        use std::sync::Arc;
        use std::time::{Duration, SystemTime};

        use crate::model::{AttrMap, SpanId, SpanKind, SpanStatus, TraceId};

        Span {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: SpanId::INVALID,
            name: name.to_string(),
            kind: SpanKind::Internal,
            start_time: SystemTime::UNIX_EPOCH,
            end_time: SystemTime::UNIX_EPOCH + Duration::from_millis(1),
            attributes: Arc::new(AttrMap::new()),
            resource_attributes: Arc::new(AttrMap::new()),
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::ok(),
        }
    }

    #[test]
    fn test_stages_run_in_order() {
        let pipeline = Pipeline::new(vec![
            Box::new(RenameStage {
                name: "first",
                suffix: "-a",
            }),
            Box::new(RenameStage {
                name: "second",
                suffix: "-b",
            }),
        ]);

        let out = pipeline.process(vec![span("op")]).unwrap();
        assert_eq!(out[0].name, "op-a-b");
    }

    #[test]
    fn test_errors_are_tagged_with_stage_name() {
        let pipeline = Pipeline::new(vec![
            Box::new(RenameStage {
                name: "first",
                suffix: "-a",
            }),
            Box::new(FailingStage),
        ]);

        let err = pipeline.process(Batch::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("stage failing"));
    }
}
