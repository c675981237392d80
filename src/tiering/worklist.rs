//! Background compilation queue
//!
//! Plans are handed to a single worker thread; finished artifacts wait in a
//! completion queue until the mutator drains them at a safe point. Nothing on
//! the worker touches runtime state: plans carry only `Send` data (bytecode,
//! predictions, structure ids) and installation happens on the mutator.

use super::compiler::{CompilationPlan, CompiledArtifact, Compiler};
use crate::bytecode::FunctionId;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Result of one background compilation
#[derive(Debug)]
pub struct CompletedCompilation {
    pub function: FunctionId,
    pub generation: u64,
    pub result: Result<CompiledArtifact>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<CompilationPlan>,
    completed: VecDeque<CompletedCompilation>,
    in_progress: usize,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Queue>> {
        self.queue
            .lock()
            .map_err(|_| Error::internal("compilation worklist poisoned"))
    }
}

/// Queue of optimizing compilations served by a worker thread
pub struct Worklist {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Worklist {
    pub fn new(compiler: Arc<dyn Compiler>) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            not_empty: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("jit-worker".into())
            .spawn(move || run_worker(&worker_shared, compiler.as_ref()))?;
        Ok(Self { shared, worker: Some(worker) })
    }

    pub fn enqueue(&self, plan: CompilationPlan) -> Result<()> {
        let mut queue = self.shared.lock()?;
        if queue.shutdown {
            return Err(Error::internal("enqueue on a stopped worklist"));
        }
        tracing::debug!(function = %plan.function, generation = plan.generation, "compilation queued");
        queue.pending.push_back(plan);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Take every finished compilation
    pub fn drain_completed(&self) -> Result<Vec<CompletedCompilation>> {
        let mut queue = self.shared.lock()?;
        Ok(queue.completed.drain(..).collect())
    }

    /// Block until nothing is pending or compiling
    pub fn wait_until_idle(&self) -> Result<()> {
        let mut queue = self.shared.lock()?;
        while !queue.pending.is_empty() || queue.in_progress > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .map_err(|_| Error::internal("compilation worklist poisoned"))?;
        }
        Ok(())
    }

    /// Plans not yet picked up by the worker
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.pending.len())
    }
}

impl Drop for Worklist {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.shared.lock() {
            queue.shutdown = true;
            queue.pending.clear();
        }
        self.shared.not_empty.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("jit worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for Worklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worklist")
            .field("pending", &self.pending_count().ok())
            .finish()
    }
}

fn run_worker(shared: &Shared, compiler: &dyn Compiler) {
    loop {
        let plan = {
            let Ok(mut queue) = shared.lock() else { return };
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(plan) = queue.pending.pop_front() {
                    queue.in_progress += 1;
                    break plan;
                }
                queue = match shared.not_empty.wait(queue) {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
            }
        };

        let result = compiler.compile(&plan);
        if let Err(error) = &result {
            tracing::warn!(function = %plan.function, %error, "background compilation failed");
        }

        let Ok(mut queue) = shared.lock() else { return };
        queue.in_progress -= 1;
        queue.completed.push_back(CompletedCompilation {
            function: plan.function,
            generation: plan.generation,
            result,
        });
        if queue.pending.is_empty() && queue.in_progress == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, BytecodeBuilder};
    use crate::code_block::JitType;
    use crate::config::JitOptions;
    use crate::profile::QueryableExitProfile;
    use crate::tiering::SpeculativeJit;

    fn bytecode() -> Arc<Bytecode> {
        let mut b = BytecodeBuilder::new("w", 1);
        let x = b.param(0);
        let r = b.new_register();
        b.add(r, x, x);
        b.ret(r);
        Arc::new(b.finish().unwrap())
    }

    fn plan(function: u32, generation: u64) -> CompilationPlan {
        CompilationPlan::optimizing(
            FunctionId(function),
            bytecode(),
            generation,
            QueryableExitProfile::default(),
            &JitOptions::default(),
        )
    }

    #[test]
    fn test_worklist_compiles_in_background() {
        let worklist = Worklist::new(Arc::new(SpeculativeJit::new())).unwrap();
        worklist.enqueue(plan(0, 3)).unwrap();
        worklist.enqueue(plan(1, 0)).unwrap();
        worklist.wait_until_idle().unwrap();

        let done = worklist.drain_completed().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].function, FunctionId(0));
        assert_eq!(done[0].generation, 3);
        let artifact = done[0].result.as_ref().unwrap();
        assert_eq!(artifact.jit_type, JitType::Optimizing);
        assert_eq!(worklist.pending_count().unwrap(), 0);
        assert!(worklist.drain_completed().unwrap().is_empty());
    }

    #[test]
    fn test_worklist_reports_compiler_errors() {
        let worklist = Worklist::new(Arc::new(SpeculativeJit::new())).unwrap();
        let mut bad = plan(4, 0);
        bad.jit_type = JitType::Baseline;
        worklist.enqueue(bad).unwrap();
        worklist.wait_until_idle().unwrap();
        let done = worklist.drain_completed().unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].result.is_err());
    }

    #[test]
    fn test_worklist_drop_joins_worker() {
        let worklist = Worklist::new(Arc::new(SpeculativeJit::new())).unwrap();
        for i in 0..8 {
            worklist.enqueue(plan(i, 0)).unwrap();
        }
        drop(worklist);
    }
}
