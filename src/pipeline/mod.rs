//! Operators and pipelines: the push-based data-flow layer that sits on top
//! of the dispatcher. A pipeline is one **starter** (driven by the
//! dispatcher's morsel loop) feeding a chain of **sink** operators that
//! terminate in a **breaker** (spec.md §4.6).

pub mod join;
pub mod operators;
pub mod sort;

use std::sync::Arc;

use crate::batch::{Batch, BatchDescription};
use crate::dispatcher::{Dispatcher, Job, MorselRanges, Worker};
use crate::error::Result;
use crate::qep::Qep;

/// Delivers a batch to the next stage in a pipeline. Every operator except
/// the starter implements this; breakers implement it as "buffer it".
pub trait Sink: Send + Sync {
    fn push(&self, batch: Batch, worker_id: usize) -> Result<()>;
}

/// The first stage of a pipeline: driven by the dispatcher instead of being
/// pushed into, via row-range morsels.
pub trait PipelineStarter: Send + Sync {
    fn input_size(&self) -> u64;
    fn min_morsel_size(&self) -> u64 {
        64
    }
    fn expected_time_per_unit(&self) -> f64 {
        1e-7
    }
    fn execute_range(&self, from: u64, to: u64, worker_id: usize) -> Result<()>;
}

/// The terminal sink of a pipeline: buffers until the pipeline completes,
/// then exposes its accumulated batches.
pub trait Breaker: Sink {
    fn description(&self) -> Arc<BatchDescription>;
    fn consume_batches(&self, target: &mut Vec<Batch>);
    /// Called once, from the finalization coordinator, before
    /// `consume_batches` is relied on by a downstream pipeline.
    fn finalize_all(&self);
}

/// Gathers every pushed batch with no further processing (the "default
/// breaker" of spec.md §9's operator sum type).
pub struct CollectBreaker {
    description: Arc<BatchDescription>,
    batches: parking_lot::Mutex<Vec<Batch>>,
}

impl CollectBreaker {
    pub fn new(description: Arc<BatchDescription>) -> Arc<Self> {
        Arc::new(Self { description, batches: parking_lot::Mutex::new(Vec::new()) })
    }
}

impl Sink for CollectBreaker {
    fn push(&self, batch: Batch, _worker_id: usize) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}

impl Breaker for CollectBreaker {
    fn description(&self) -> Arc<BatchDescription> {
        self.description.clone()
    }

    fn consume_batches(&self, target: &mut Vec<Batch>) {
        target.append(&mut self.batches.lock());
    }

    fn finalize_all(&self) {}
}

/// Bridges a `PipelineStarter`/`Breaker` pair into a dispatcher `Job`,
/// wiring its completion back into the owning `Qep`.
struct MorselJob {
    starter: Arc<dyn PipelineStarter>,
    ranges: MorselRanges,
    min_morsel_size: u64,
    expected_time_per_unit: f64,
    on_finalize: Box<dyn Fn() + Send + Sync>,
}

impl Job for MorselJob {
    fn input_size(&self) -> u64 {
        self.starter.input_size()
    }
    fn min_morsel_size(&self) -> u64 {
        self.min_morsel_size
    }
    fn expected_time_per_unit(&self) -> f64 {
        self.expected_time_per_unit
    }
    fn execute_next_morsel(&self, size: u64, worker: &Worker) -> bool {
        match self.ranges.claim(worker.node, size) {
            Some((from, to)) => {
                if let Err(e) = self.starter.execute_range(from, to, worker.id) {
                    tracing::warn!(error = %e, "morsel execution failed");
                }
                true
            }
            None => false,
        }
    }
    fn finalize(&self) {
        (self.on_finalize)()
    }
}

/// One pipeline: a starter, a breaker, and the ids of pipelines it depends
/// on (e.g. a join probe pipeline depends on its build pipeline).
pub struct Pipeline {
    pub id: usize,
    pub dependencies: Vec<usize>,
    pub starter: Arc<dyn PipelineStarter>,
    pub breaker: Arc<dyn Breaker>,
}

impl crate::qep::PipelineNode for Pipeline {
    fn id(&self) -> usize {
        self.id
    }

    fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    fn start_execution(&self, qep: Arc<Qep>, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let breaker = self.breaker.clone();
        let id = self.id;
        let job = Arc::new(MorselJob {
            starter: self.starter.clone(),
            ranges: MorselRanges::new(self.starter.input_size(), dispatcher.num_numa_nodes()),
            min_morsel_size: self.starter.min_morsel_size(),
            expected_time_per_unit: self.starter.expected_time_per_unit(),
            on_finalize: Box::new(move || {
                breaker.finalize_all();
                qep.pipeline_finished(id);
            }),
        });
        dispatcher.submit_or_run(job);
        Ok(())
    }
}

/// Assembles pipelines into a QEP, tracking the current output schema so
/// later stages can reference columns by name (spec.md "Pipeline
/// assembly").
pub struct QepBuilder {
    pipelines: Vec<Pipeline>,
}

impl QepBuilder {
    pub fn new() -> Self {
        Self { pipelines: Vec::new() }
    }

    /// Adds a pipeline, returning its id for use as a dependency elsewhere.
    pub fn add_pipeline(&mut self, starter: Arc<dyn PipelineStarter>, breaker: Arc<dyn Breaker>) -> usize {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline { id, dependencies: Vec::new(), starter, breaker });
        id
    }

    /// Records that `pipeline_id` cannot start until `depends_on` completes
    /// (`add_join_probe(build_pipeline)` in spec.md terms).
    pub fn add_dependency(&mut self, pipeline_id: usize, depends_on: usize) {
        self.pipelines[pipeline_id].dependencies.push(depends_on);
    }

    pub fn build(self) -> Vec<Pipeline> {
        self.pipelines
    }
}

impl Default for QepBuilder {
    fn default() -> Self {
        Self::new()
    }
}
