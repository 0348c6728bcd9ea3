//! QEP driver: a minimal data-flow scheduler over a DAG of pipelines. Tracks
//! which pipelines have completed and which are currently executing under
//! one scheduling mutex, starting newly-ready pipelines as dependencies
//! clear (spec.md §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// What the QEP driver needs from a pipeline: an id, its dependency ids, and
/// a way to kick off execution once those dependencies are satisfied.
pub trait PipelineNode: Send + Sync {
    fn id(&self) -> usize;
    fn dependencies(&self) -> &[usize];
    fn start_execution(&self, qep: Arc<Qep>, dispatcher: Arc<Dispatcher>) -> Result<()>;
}

struct Scheduling {
    completed: Vec<bool>,
    executing: Vec<bool>,
}

pub struct Qep {
    pipelines: Vec<Arc<dyn PipelineNode>>,
    dispatcher: Arc<Dispatcher>,
    scheduling: Mutex<Scheduling>,
    finished: AtomicBool,
}

impl Qep {
    pub fn new(pipelines: Vec<Arc<dyn PipelineNode>>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let n = pipelines.len();
        Arc::new(Self {
            pipelines,
            dispatcher,
            scheduling: Mutex::new(Scheduling { completed: vec![false; n], executing: vec![false; n] }),
            finished: AtomicBool::new(n == 0),
        })
    }

    fn ready_ids(scheduling: &Scheduling, pipelines: &[Arc<dyn PipelineNode>]) -> Vec<usize> {
        pipelines
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                !scheduling.executing[*i]
                    && !scheduling.completed[*i]
                    && p.dependencies().iter().all(|&d| scheduling.completed[d])
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Marks every currently-startable pipeline as executing, then starts
    /// each (spec.md §4.8 `begin`).
    pub fn begin(self: &Arc<Self>) -> Result<()> {
        let ready = {
            let mut scheduling = self.scheduling.lock();
            let ready = Self::ready_ids(&scheduling, &self.pipelines);
            for &id in &ready {
                scheduling.executing[id] = true;
            }
            ready
        };
        for id in ready {
            self.pipelines[id].start_execution(self.clone(), self.dispatcher.clone())?;
        }
        Ok(())
    }

    /// Called by a pipeline's finalization coordinator. Marks `id` complete,
    /// checks for overall completion, then starts whatever newly unblocked.
    pub fn pipeline_finished(self: &Arc<Self>, id: usize) {
        let ready = {
            let mut scheduling = self.scheduling.lock();
            scheduling.completed[id] = true;
            debug!(pipeline = id, "pipeline finished");
            if scheduling.completed.iter().all(|&c| c) {
                self.finished.store(true, Ordering::Release);
                return;
            }
            let ready = Self::ready_ids(&scheduling, &self.pipelines);
            for &r in &ready {
                scheduling.executing[r] = true;
            }
            ready
        };
        for r in ready {
            if let Err(e) = self.pipelines[r].start_execution(self.clone(), self.dispatcher.clone()) {
                tracing::warn!(pipeline = r, error = %e, "failed to start pipeline");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Polls `finished` with a short sleep (spec.md `wait_for_execution`).
    pub fn wait_for_execution(&self) {
        while !self.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Node {
        id: usize,
        deps: Vec<usize>,
        started: Arc<AtomicUsize>,
    }

    impl PipelineNode for Node {
        fn id(&self) -> usize {
            self.id
        }
        fn dependencies(&self) -> &[usize] {
            &self.deps
        }
        fn start_execution(&self, qep: Arc<Qep>, _dispatcher: Arc<Dispatcher>) -> Result<()> {
            self.started.fetch_add(1, Ordering::Relaxed);
            let id = self.id;
            qep.pipeline_finished(id);
            Ok(())
        }
    }

    #[test]
    fn dependent_pipeline_runs_only_after_its_dependency_completes() {
        let dispatcher = Dispatcher::new(1, 1);
        let started = Arc::new(AtomicUsize::new(0));
        let pipelines: Vec<Arc<dyn PipelineNode>> = vec![
            Arc::new(Node { id: 0, deps: vec![], started: started.clone() }),
            Arc::new(Node { id: 1, deps: vec![0], started: started.clone() }),
        ];
        let qep = Qep::new(pipelines, dispatcher);
        qep.begin().unwrap();
        qep.wait_for_execution();
        assert_eq!(started.load(Ordering::Relaxed), 2);
        assert!(qep.is_finished());
    }
}
