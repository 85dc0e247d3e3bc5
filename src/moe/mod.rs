//! Sparse MoE pipeline.
//!
//! For every layer the caller:
//! 1. optionally calls [`Pipeline::prefetch`] with predicted experts, to
//!    overlap disk reads with the previous layer's compute;
//! 2. calls [`Pipeline::build_tasks`] with the routed experts, which builds
//!    the task graph, attaches tasks to matrices still loading and issues the
//!    missing reads;
//! 3. calls [`Pipeline::forward`] once from each of the `n_workers` threads
//!    (or [`Pipeline::forward_all`] to spawn them), which drains the graph and
//!    returns the layer output on thread 0.
//!
//! Layers must be driven one at a time per layer slot: `build_tasks` panics
//! if the slot still holds a graph that was never forwarded.

pub mod tasks;

pub use tasks::{LayerContext, PipelineTask};

use crate::affinity;
use crate::cache::{DataStatus, ExpertCache, MatrixKind};
use crate::config::{Activation, PipelineConfig};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::task::{SpinBarrier, Task, TaskQueue, TaskRunner};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tasks::{DownTask, GateTask, LayerInputs, PipelineWorker, UpTask};

/// Identity of the calling thread within a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeParam {
    pub ith: usize,
    pub nth: usize,
}

/// Per-layer inputs of a forward pass. Only thread 0 reads them.
#[derive(Debug, Clone, Copy)]
pub struct ForwardArgs<'a> {
    /// Router logits, `[batch_size, n_experts]` row-major.
    pub expert_logits: &'a [f32],
    /// Hidden states, `[batch_size, embed_dim]` row-major.
    pub input: &'a [f32],
}

/// State shared by the worker threads.
pub(crate) struct PipelineShared {
    pub(crate) cfg: PipelineConfig,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) cache: Arc<ExpertCache>,
    /// Bytes per quantized activation row (`embed_dim` wide).
    pub(crate) input_row_size: usize,
    /// Bytes per quantized weight row (`embed_dim` wide) in every matrix.
    pub(crate) weight_row_size: usize,
    /// One `[max_batch_size, embed_dim]` accumulator per worker.
    pub(crate) local_out: Box<[Mutex<Vec<f32>>]>,
    pub(crate) n_tasks_run: AtomicUsize,
}

struct LayerData {
    ctx: Arc<LayerContext>,
    preprocess: Arc<Task<PipelineTask>>,
}

pub struct Pipeline {
    shared: Arc<PipelineShared>,
    queue: TaskQueue<PipelineTask>,
    runner: TaskRunner,
    barrier: SpinBarrier,
    layers: Box<[Mutex<Option<LayerData>>]>,
    /// Serialises prefetch and build_tasks.
    schedule_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(cache: Arc<ExpertCache>, kernel: Arc<dyn Kernel>, cfg: PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        let layout = *cache.layout();
        if layout.n_layers != cfg.n_layers || layout.n_experts != cfg.n_experts {
            return Err(Error::Config(format!(
                "bundle has {} layers x {} experts, pipeline expects {} x {}",
                layout.n_layers, layout.n_experts, cfg.n_layers, cfg.n_experts,
            )));
        }
        if layout.n_matrices < MatrixKind::ALL.len() {
            return Err(Error::Config(format!(
                "bundle has {} matrices per expert, need up, gate and down",
                layout.n_matrices,
            )));
        }

        let input_row_size = kernel.act_row_size(cfg.embed_dim);
        let weight_row_size = kernel.weight_row_size(cfg.embed_dim);
        let needed = cfg.ffn_hidden_dim * weight_row_size;
        if layout.matrix_bytes < needed {
            return Err(Error::Config(format!(
                "matrix_bytes ({}) is smaller than {} rows x {} bytes",
                layout.matrix_bytes, cfg.ffn_hidden_dim, weight_row_size,
            )));
        }

        let local_out = (0..cfg.n_workers)
            .map(|_| Mutex::new(vec![0.0f32; cfg.max_batch_size * cfg.embed_dim]))
            .collect();
        let shared = Arc::new(PipelineShared {
            cfg: cfg.clone(),
            kernel,
            cache,
            input_row_size,
            weight_row_size,
            local_out,
            n_tasks_run: AtomicUsize::new(0),
        });

        let queue = TaskQueue::new();
        let mut runner = TaskRunner::new(cfg.n_workers, cfg.idle);
        runner.register_task_queue(Arc::new(queue.clone()));
        for ith in 0..cfg.n_workers {
            runner.register_worker(
                Box::new(PipelineWorker { queue: queue.clone(), shared: Arc::clone(&shared) }),
                ith,
            );
        }

        log::info!(
            "MoE pipeline: {} workers, {} layers, embed={}, ffn={}, top-{} of {} experts, max batch {}, idle={:?}",
            cfg.n_workers,
            cfg.n_layers,
            cfg.embed_dim,
            cfg.ffn_hidden_dim,
            cfg.n_used_experts,
            cfg.n_experts,
            cfg.max_batch_size,
            cfg.idle,
        );

        Ok(Pipeline {
            shared,
            queue,
            runner,
            barrier: SpinBarrier::new(cfg.n_workers),
            layers: (0..cfg.n_layers).map(|_| Mutex::new(None)).collect(),
            schedule_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.cfg
    }

    pub fn cache(&self) -> &Arc<ExpertCache> {
        &self.shared.cache
    }

    /// Tasks executed since construction.
    pub fn n_tasks_run(&self) -> usize {
        self.shared.n_tasks_run.load(Ordering::Relaxed)
    }

    /// Whether a worker panicked during `forward`. A poisoned pipeline cannot run again.
    pub fn is_poisoned(&self) -> bool {
        self.runner.is_poisoned()
    }

    /// Whether `layer_id` has a built graph waiting for `forward`.
    pub fn is_built(&self, layer_id: usize) -> bool {
        self.layers[layer_id].lock().is_some()
    }

    /// Batch size of the graph waiting on `layer_id`, if one was built.
    pub fn built_batch_size(&self, layer_id: usize) -> Option<usize> {
        self.layers[layer_id].lock().as_ref().map(|l| l.ctx.batch_size)
    }

    /// Speculatively start reads for predicted experts.
    ///
    /// `expert_ids` is `[batch_size, n_predicted]` row-major. Experts are
    /// visited slot-major (all rows of slot 0 first). At most
    /// `max_n_prefetch` reads are issued, and none once the cache has no
    /// evictable entry left. Never waits for space. Returns how many reads
    /// were issued.
    pub fn prefetch(
        &self,
        layer_id: usize,
        batch_size: usize,
        n_predicted: usize,
        max_n_prefetch: usize,
        expert_ids: &[usize],
    ) -> usize {
        let _schedule = self.schedule_lock.lock();
        let cfg = &self.shared.cfg;
        let cache = &self.shared.cache;
        assert!(layer_id < cfg.n_layers, "layer {layer_id} out of range");
        assert!(batch_size <= cfg.max_batch_size, "batch {batch_size} exceeds max_batch_size");
        assert_eq!(expert_ids.len(), batch_size * n_predicted, "expert_ids shape mismatch");

        let mut n_prefetched = 0;
        'slots: for slot in 0..n_predicted {
            for batch_id in 0..batch_size {
                let expert_id = expert_ids[batch_id * n_predicted + slot];
                for kind in MatrixKind::ALL {
                    if n_prefetched >= max_n_prefetch {
                        break 'slots;
                    }
                    let matrix = cache.get(layer_id, expert_id, kind.index());
                    let mut state = matrix.lock();
                    if state.status() != DataStatus::NotPresent {
                        continue;
                    }
                    // The pins of a built layer may fill the cache; those
                    // clear only in forward, so waiting here would never end.
                    if !cache.try_async_fetch(matrix, &mut state) {
                        log::debug!(
                            "prefetch for layer {layer_id} stopped after {n_prefetched} reads: no evictable matrix",
                        );
                        break 'slots;
                    }
                    cache.lru_promote(matrix);
                    n_prefetched += 1;
                }
            }
        }
        cache.note_prefetched(n_prefetched);
        n_prefetched
    }

    /// Build and schedule the task graph of one layer.
    ///
    /// `expert_ids` is `[batch_size, n_used_experts]` row-major. Returns the
    /// number of tasks created, including the preprocess task that `forward`
    /// schedules later.
    ///
    /// Caller contract:
    /// - `layer_id` must not hold a graph that was never forwarded.
    /// - The distinct experts of the batch, times three matrices, must fit in
    ///   the cache capacity. Every matrix of the layer stays pinned until its
    ///   tasks ran, so a larger layer could never become fully resident.
    ///
    /// Both are checked and panic.
    pub fn build_tasks(
        &self,
        layer_id: usize,
        batch_size: usize,
        activation: Activation,
        expert_ids: &[usize],
    ) -> usize {
        let _schedule = self.schedule_lock.lock();
        let cfg = &self.shared.cfg;
        let cache = &self.shared.cache;
        assert!(layer_id < cfg.n_layers, "layer {layer_id} out of range");
        assert!(batch_size <= cfg.max_batch_size, "batch {batch_size} exceeds max_batch_size");
        assert_eq!(
            expert_ids.len(),
            batch_size * cfg.n_used_experts,
            "expert_ids shape mismatch",
        );
        let mut slot = self.layers[layer_id].lock();
        assert!(slot.is_none(), "build_tasks: layer {layer_id} already has tasks in flight");

        let mut activation_count = vec![0usize; cfg.n_experts];
        for &e in expert_ids {
            assert!(e < cfg.n_experts, "expert id {e} out of range");
            activation_count[e] += 1;
        }
        // Most-used experts first: their reads are issued and their tasks queued earliest.
        let mut order: Vec<usize> = (0..cfg.n_experts).collect();
        order.sort_by(|&a, &b| activation_count[b].cmp(&activation_count[a]));
        let n_active = activation_count.iter().filter(|&&c| c > 0).count();
        assert!(
            n_active * MatrixKind::ALL.len() <= cache.capacity(),
            "layer {layer_id} needs {} resident matrices, cache holds {}",
            n_active * MatrixKind::ALL.len(),
            cache.capacity(),
        );

        let rows = expert_ids
            .chunks_exact(cfg.n_used_experts)
            .map(<[usize]>::to_vec)
            .collect();
        let ctx = Arc::new(LayerContext::new(layer_id, batch_size, rows, activation));
        let preprocess = Task::new(PipelineTask::Preprocess(Arc::clone(&ctx)));
        let reduce = Task::new(PipelineTask::Reduce(Arc::clone(&ctx)));
        // Keeps reduce after preprocess when no expert is active.
        preprocess.link_to(&reduce);

        let mut n_tasks = 2;
        let mut n_examined = 0;
        let mut n_cached = 0;
        for &expert_id in order.iter().take(n_active) {
            let mut tasks: [Vec<Arc<Task<PipelineTask>>>; 3] = Default::default();
            for (batch_id, row) in ctx.expert_ids.iter().enumerate() {
                let Some(slot_idx) = row.iter().position(|&e| e == expert_id) else {
                    continue;
                };
                let gate_out = Arc::new(OnceLock::new());
                let up_out = Arc::new(OnceLock::new());
                let gate = Task::new(PipelineTask::Gate(GateTask {
                    layer: Arc::clone(&ctx),
                    expert_id,
                    batch_id,
                    out: Arc::clone(&gate_out),
                }));
                let up = Task::new(PipelineTask::Up(UpTask {
                    layer: Arc::clone(&ctx),
                    expert_id,
                    batch_id,
                    gate_out: Arc::clone(&gate_out),
                    out: Arc::clone(&up_out),
                }));
                let down = Task::new(PipelineTask::Down(DownTask {
                    layer: Arc::clone(&ctx),
                    expert_id,
                    batch_id,
                    slot: slot_idx,
                    gate_out,
                    up_out,
                }));

                preprocess.link_to(&gate);
                gate.link_to(&up);
                up.link_to(&down);
                down.link_to(&reduce);

                tasks[MatrixKind::Up.index()].push(up);
                tasks[MatrixKind::Gate.index()].push(gate);
                tasks[MatrixKind::Down.index()].push(down);
            }

            for kind in MatrixKind::ALL {
                let role_tasks = &tasks[kind.index()];
                let matrix = cache.get(layer_id, expert_id, kind.index());
                let mut state = matrix.lock();
                n_examined += 1;
                if state.status() == DataStatus::Present {
                    n_cached += 1;
                } else {
                    if state.status() == DataStatus::NotPresent {
                        cache.async_fetch(matrix, &mut state);
                    }
                    for task in role_tasks {
                        state.add_pending(task.clone());
                    }
                }
                state.pin(role_tasks.len());
                cache.lru_promote(matrix);
                drop(state);

                for task in role_tasks {
                    self.queue.schedule(task);
                }
                n_tasks += role_tasks.len();
            }
        }
        cache.note_lookups(n_examined, n_cached);

        // Preprocess needs the forward inputs; forward schedules it.
        self.queue.schedule(&reduce);
        log::debug!(
            "layer {layer_id}: batch {batch_size}, {n_active} experts, {n_tasks} tasks, {n_cached}/{n_examined} matrices cached",
        );

        *slot = Some(LayerData { ctx, preprocess });
        n_tasks
    }

    /// Cooperative per-thread entry point. Every one of the `n_workers`
    /// threads calls this with its own `param`; thread 0 gets the output
    /// (`[batch_size, embed_dim]`), the others get `None`.
    ///
    /// A panic on any thread, in argument checks or in a task body, poisons
    /// the pipeline: the other threads panic too instead of waiting forever,
    /// and every later call panics.
    pub fn forward(&self, param: &ComputeParam, layer_id: usize, args: &ForwardArgs<'_>) -> Option<Vec<f32>> {
        let _poison = self.runner.poison_on_unwind();
        let cfg = &self.shared.cfg;
        assert!(!self.runner.is_poisoned(), "pipeline poisoned by an earlier worker panic");
        assert_eq!(
            param.nth, cfg.n_workers,
            "forward called with {} threads, pipeline has {} workers",
            param.nth, cfg.n_workers,
        );
        assert!(param.ith < param.nth, "thread {} out of range", param.ith);
        assert!(layer_id < cfg.n_layers, "layer {layer_id} out of range");
        // Checked on every thread so a misuse panics everywhere instead of
        // leaving the others at the barrier.
        assert!(self.is_built(layer_id), "forward on layer {layer_id} before build_tasks");

        if cfg.pin_workers {
            affinity::auto_pin_worker(param.ith);
        }

        if param.ith == 0 {
            let slot = self.layers[layer_id].lock();
            if let Some(layer) = slot.as_ref() {
                layer.ctx.set_inputs(self.copy_inputs(&layer.ctx, args));
                self.queue.schedule(&layer.preprocess);
            }
        }

        self.barrier_wait(param.ith);
        self.runner.run(param.ith);
        self.barrier_wait(param.ith);

        if param.ith != 0 {
            return None;
        }
        let layer = self.layers[layer_id].lock().take();
        layer.map(|l| std::mem::take(&mut *l.ctx.output.lock()))
    }

    fn barrier_wait(&self, ith: usize) {
        let passed = self.barrier.wait_unless(|| self.runner.is_poisoned());
        assert!(passed, "thread {ith}: pipeline poisoned by a panic on another worker");
    }

    fn check_args(&self, layer_id: usize, batch_size: usize, args: &ForwardArgs<'_>) {
        let cfg = &self.shared.cfg;
        let n_logits = batch_size * cfg.n_experts;
        let n_input = batch_size * cfg.embed_dim;
        assert!(
            args.expert_logits.len() >= n_logits,
            "layer {layer_id}: expert_logits has {} values, need {n_logits}",
            args.expert_logits.len(),
        );
        assert!(
            args.input.len() >= n_input,
            "layer {layer_id}: input has {} values, need {n_input}",
            args.input.len(),
        );
    }

    fn copy_inputs(&self, ctx: &LayerContext, args: &ForwardArgs<'_>) -> LayerInputs {
        let cfg = &self.shared.cfg;
        self.check_args(ctx.layer_id, ctx.batch_size, args);
        let n_logits = ctx.batch_size * cfg.n_experts;
        let n_input = ctx.batch_size * cfg.embed_dim;
        LayerInputs {
            expert_logits: args.expert_logits[..n_logits].to_vec(),
            input: args.input[..n_input].to_vec(),
        }
    }

    /// Run `forward` on `n_workers` scoped threads (the caller acts as
    /// thread 0) and write the layer output into `output`.
    ///
    /// Shapes are checked on the calling thread before any worker starts.
    pub fn forward_all(&self, layer_id: usize, expert_logits: &[f32], input: &[f32], output: &mut [f32]) {
        let cfg = &self.shared.cfg;
        assert!(layer_id < cfg.n_layers, "layer {layer_id} out of range");
        let Some(batch_size) = self.built_batch_size(layer_id) else {
            panic!("forward on layer {layer_id} before build_tasks");
        };
        let args = ForwardArgs { expert_logits, input };
        self.check_args(layer_id, batch_size, &args);
        let n_output = batch_size * cfg.embed_dim;
        assert!(
            output.len() >= n_output,
            "layer {layer_id}: output has {} values, need {n_output}",
            output.len(),
        );

        let nth = cfg.n_workers;
        let result = std::thread::scope(|s| {
            let args = &args;
            let helpers: Vec<_> = (1..nth)
                .map(|ith| s.spawn(move || self.forward(&ComputeParam { ith, nth }, layer_id, args)))
                .collect();
            let result = self.forward(&ComputeParam { ith: 0, nth }, layer_id, args);
            for h in helpers {
                if let Err(panic) = h.join() {
                    std::panic::resume_unwind(panic);
                }
            }
            result
        });

        let result = result.unwrap_or_default();
        output[..result.len()].copy_from_slice(&result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{padded_matrix_bytes, BundleLayout, BundleWriter};
    use crate::config::{CacheConfig, IdleStrategy};
    use crate::kernel::Q4Kernel;

    fn config(n_workers: usize) -> PipelineConfig {
        PipelineConfig {
            n_workers,
            n_layers: 1,
            embed_dim: 32,
            ffn_hidden_dim: 32,
            max_batch_size: 2,
            n_experts: 2,
            n_used_experts: 1,
            normalize_scores: false,
            pin_workers: false,
            idle: IdleStrategy::Yield,
        }
    }

    /// Every weight of expert `e` is `e + 1`.
    fn constant_bundle(dir: &std::path::Path) -> (std::path::PathBuf, BundleLayout) {
        layered_bundle(dir, 1)
    }

    fn layered_bundle(dir: &std::path::Path, n_layers: usize) -> (std::path::PathBuf, BundleLayout) {
        let path = dir.join("experts.bin");
        let layout = BundleLayout::new(n_layers, 2, 3, padded_matrix_bytes(32, 32));
        let mut w = BundleWriter::create(&path, layout).unwrap();
        for _ in 0..n_layers {
            for e in 0..2 {
                for _ in MatrixKind::ALL {
                    w.append_f32(&vec![(e + 1) as f32; 32 * 32], 32, 32).unwrap();
                }
            }
        }
        w.finish().unwrap();
        (path, layout)
    }

    fn pipeline(dir: &std::path::Path, n_workers: usize) -> Pipeline {
        layered_pipeline(dir, 1, n_workers, Arc::new(Q4Kernel))
    }

    /// Cache capacity 6: exactly the two experts of one layer.
    fn layered_pipeline(
        dir: &std::path::Path,
        n_layers: usize,
        n_workers: usize,
        kernel: Arc<dyn Kernel>,
    ) -> Pipeline {
        let (path, layout) = layered_bundle(dir, n_layers);
        let cfg = CacheConfig {
            max_cached_matrices: 6,
            io_queue_depth: 4,
            direct_io: false,
            io_worker_cpu: None,
        };
        let cache = Arc::new(ExpertCache::open(&path, layout, &cfg).unwrap());
        let mut pcfg = config(n_workers);
        pcfg.n_layers = n_layers;
        Pipeline::new(cache, kernel, pcfg).unwrap()
    }

    #[test]
    fn test_rejects_mismatched_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let (path, layout) = constant_bundle(dir.path());
        let cache = Arc::new(ExpertCache::open(&path, layout, &CacheConfig {
            max_cached_matrices: 6,
            io_queue_depth: 4,
            direct_io: false,
            io_worker_cpu: None,
        }).unwrap());
        let mut cfg = config(1);
        cfg.n_experts = 4;
        assert!(Pipeline::new(cache.clone(), Arc::new(Q4Kernel), cfg).is_err());

        let mut cfg = config(1);
        cfg.ffn_hidden_dim = 256;
        assert!(Pipeline::new(cache, Arc::new(Q4Kernel), cfg).is_err());
    }

    #[test]
    fn test_single_expert_layer() {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 2);

        // One row routed to expert 1 (all weights 2.0), score 0.5.
        let n_tasks = p.build_tasks(0, 1, Activation::Relu, &[1]);
        assert_eq!(n_tasks, 5);
        assert!(p.is_built(0));
        assert_eq!(p.built_batch_size(0), Some(1));

        let input = vec![1.0f32; 32];
        let logits = vec![0.0, 0.5];
        let mut out = vec![0.0f32; 32];
        p.forward_all(0, &logits, &input, &mut out);
        assert!(!p.is_built(0));
        assert_eq!(p.n_tasks_run(), 5);

        // gate = up = 2 * 32 = 64 per hidden unit; 32 units x 64 x 64 x 2.0 x 0.5.
        let expected = 32.0 * 64.0 * 64.0 * 2.0 * 0.5;
        for &v in &out {
            assert!((v - expected).abs() / expected < 1e-2, "{v} vs {expected}");
        }
        eprintln!("single expert: out[0] = {}, cache {}", out[0], p.cache().stats());
    }

    #[test]
    fn test_empty_batch_produces_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 2);
        assert_eq!(p.build_tasks(0, 0, Activation::Relu, &[]), 2);
        let result = std::thread::scope(|s| {
            let h = s.spawn(|| p.forward(&ComputeParam { ith: 1, nth: 2 }, 0, &ForwardArgs { expert_logits: &[], input: &[] }));
            let r = p.forward(&ComputeParam { ith: 0, nth: 2 }, 0, &ForwardArgs { expert_logits: &[], input: &[] });
            assert!(h.join().unwrap().is_none());
            r
        });
        assert_eq!(result, Some(Vec::new()));
    }

    #[test]
    #[should_panic(expected = "already has tasks in flight")]
    fn test_build_twice_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 1);
        p.build_tasks(0, 1, Activation::Relu, &[0]);
        p.build_tasks(0, 1, Activation::Relu, &[0]);
    }

    #[test]
    #[should_panic(expected = "before build_tasks")]
    fn test_forward_before_build_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 1);
        let mut out = vec![0.0; 32];
        p.forward_all(0, &[0.0, 0.0], &[0.0; 32], &mut out);
    }

    #[test]
    fn test_prefetch_respects_cap_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 1);
        // Two rows, two predicted slots: slot 0 is [1, 0], slot 1 is [0, 1].
        let issued = p.prefetch(0, 2, 2, 4, &[1, 0, 0, 1]);
        assert_eq!(issued, 4);
        let cache = p.cache();
        // Expert 1 (row 0, slot 0) fully requested, then expert 0 up only.
        for kind in MatrixKind::ALL {
            assert_ne!(cache.get(0, 1, kind.index()).status(), DataStatus::NotPresent);
        }
        assert_ne!(cache.get(0, 0, MatrixKind::Up.index()).status(), DataStatus::NotPresent);
        assert_eq!(cache.get(0, 0, MatrixKind::Gate.index()).status(), DataStatus::NotPresent);
        assert_eq!(cache.stats().n_prefetched, 4);

        // Already requested matrices do not count against the cap.
        assert_eq!(p.prefetch(0, 2, 2, 10, &[1, 0, 0, 1]), 2);
    }

    #[test]
    fn test_prefetch_does_not_wait_on_pinned_cache() {
        let dir = tempfile::tempdir().unwrap();
        let p = layered_pipeline(dir.path(), 2, 2, Arc::new(Q4Kernel));

        // Layer 0 pins all six cache slots until it is forwarded.
        assert_eq!(p.build_tasks(0, 2, Activation::Relu, &[0, 1]), 8);
        assert_eq!(p.prefetch(1, 2, 1, 6, &[0, 1]), 0);
        for kind in MatrixKind::ALL {
            assert_eq!(p.cache().get(1, 0, kind.index()).status(), DataStatus::NotPresent);
        }

        let mut out = vec![0.0f32; 64];
        p.forward_all(0, &[1.0, 0.0, 0.0, 1.0], &[1.0; 64], &mut out);
        assert!(out.iter().all(|&v| v > 0.0));

        // Unpinned now: the next layer's reads evict layer 0.
        assert_eq!(p.prefetch(1, 2, 1, 6, &[0, 1]), 6);
        assert_eq!(p.cache().stats().n_prefetched, 6);
        p.build_tasks(1, 2, Activation::Relu, &[0, 1]);
        p.forward_all(1, &[1.0, 0.0, 0.0, 1.0], &[1.0; 64], &mut out);
        assert!(p.cache().stats().n_evicted >= 6);
        p.cache().check_invariants();
    }

    #[test]
    #[should_panic(expected = "input has 8 values, need 32")]
    fn test_short_input_fails_before_workers_start() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 2);
        p.build_tasks(0, 1, Activation::Relu, &[0]);
        let mut out = vec![0.0f32; 32];
        p.forward_all(0, &[1.0, 1.0], &[1.0; 8], &mut out);
    }

    #[test]
    fn test_bad_args_on_thread_zero_release_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), 3);
        p.build_tasks(0, 1, Activation::Relu, &[0]);

        let input = [1.0f32; 32];
        let failed: Vec<bool> = std::thread::scope(|s| {
            let p = &p;
            let input = &input;
            let handles: Vec<_> = (0..3)
                .map(|ith| {
                    s.spawn(move || {
                        // Thread 0 passes a truncated input.
                        let n = if ith == 0 { 8 } else { 32 };
                        let args = ForwardArgs { expert_logits: &[1.0, 1.0], input: &input[..n] };
                        p.forward(&ComputeParam { ith, nth: 3 }, 0, &args)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().is_err()).collect()
        });
        assert_eq!(failed, vec![true, true, true]);
        assert!(p.is_poisoned());
    }

    /// Q4 kernel whose dot product always fails.
    struct FailingKernel;

    impl Kernel for FailingKernel {
        fn weight_row_size(&self, n: usize) -> usize {
            Q4Kernel.weight_row_size(n)
        }

        fn act_row_size(&self, n: usize) -> usize {
            Q4Kernel.act_row_size(n)
        }

        fn quantize_act_row(&self, src: &[f32], dst: &mut [u8]) {
            Q4Kernel.quantize_act_row(src, dst)
        }

        fn vec_dot(&self, _n: usize, _weight_row: &[u8], _act_row: &[u8]) -> f32 {
            panic!("vec_dot failed");
        }

        fn axpy(&self, scale: f32, weight_row: &[u8], out: &mut [f32]) {
            Q4Kernel.axpy(scale, weight_row, out)
        }
    }

    #[test]
    fn test_task_panic_stops_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let p = layered_pipeline(dir.path(), 1, 3, Arc::new(FailingKernel));
        p.build_tasks(0, 1, Activation::Relu, &[1]);

        let mut out = vec![0.0f32; 32];
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            p.forward_all(0, &[0.0, 1.0], &[1.0; 32], &mut out);
        }));
        assert!(result.is_err());
        assert!(p.is_poisoned());

        // Later calls fail immediately.
        let again = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            p.forward(&ComputeParam { ith: 0, nth: 3 }, 0, &ForwardArgs { expert_logits: &[], input: &[] })
        }));
        assert!(again.is_err());
    }
}
