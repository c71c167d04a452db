//! The stage implementations: trace generation and chaos mutation.

use std::borrow::Cow;
use std::sync::Mutex;

use super::BatchStage;
use crate::chaos::{ChaosEngine, Decider};
use crate::error::GenericError;
use crate::generator::TraceGenerator;
use crate::model::Batch;
use crate::scenario::ScenarioGenerator;

/// Stage that replaces its input with a freshly generated random batch.
pub struct GeneratorStage {
    generator: TraceGenerator,
}

impl GeneratorStage {
    /// Creates a stage around a trace generator.
    pub fn new(generator: TraceGenerator) -> Self {
        GeneratorStage { generator }
    }
}

impl BatchStage for GeneratorStage {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn process(&self, _batch: Batch) -> Result<Batch, GenericError> {
        Ok(self.generator.generate_batch(&mut rand::rng()))
    }
}

/// Stage that replaces its input with the next scenario batch.
pub struct ScenarioStage {
    generator: ScenarioGenerator,
}

impl ScenarioStage {
    /// Creates a stage around a scenario generator.
    pub fn new(generator: ScenarioGenerator) -> Self {
        ScenarioStage { generator }
    }
}

impl BatchStage for ScenarioStage {
    fn name(&self) -> &'static str {
        "scenario"
    }

    fn process(&self, _batch: Batch) -> Result<Batch, GenericError> {
        Ok(self.generator.generate_batch())
    }
}

/// Stage that runs the chaos engine over the batch.
///
/// The engine is stateless, but the decider is a shared seeded PRNG, so calls
/// into it are serialized under a mutex.
pub struct ChaosStage {
    engine: ChaosEngine,
    decider: Mutex<Decider>,
}

impl ChaosStage {
    /// Creates a stage around a compiled engine and its decider.
    pub fn new(engine: ChaosEngine, decider: Decider) -> Self {
        ChaosStage {
            engine,
            decider: Mutex::new(decider),
        }
    }
}

impl BatchStage for ChaosStage {
    fn name(&self) -> &'static str {
        "chaos"
    }

    fn process(&self, batch: Batch) -> Result<Batch, GenericError> {
        let mut decider = self.decider.lock().unwrap();
        let applied = self.engine.apply(&batch, &mut **decider);
        if let Cow::Owned(mutated) = applied {
            return Ok(mutated);
        }
        Ok(batch)
    }
}
