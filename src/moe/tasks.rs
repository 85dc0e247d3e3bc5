//! Task bodies of one MoE layer.
//!
//! Per layer: Preprocess -> {Gate -> Up -> Down} per (batch row, expert) -> Reduce.
//! Gate and Up publish their hidden activations through write-once cells that
//! later tasks read; the DAG edges guarantee the cells are filled by then.

use super::PipelineShared;
use crate::cache::MatrixKind;
use crate::config::Activation;
use crate::kernel::AxpyBatch;
use crate::task::{TaskQueue, Worker, WorkerContext};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Hidden activations of one (batch row, expert) pair.
pub(crate) type HiddenCell = Arc<OnceLock<Vec<f32>>>;

pub(crate) struct LayerInputs {
    pub expert_logits: Vec<f32>,
    pub input: Vec<f32>,
}

pub(crate) struct Prepared {
    /// Batch rows quantized to the activation block format.
    pub input_quant: Vec<u8>,
    /// Routing score per (batch row, slot).
    pub expert_scores: Vec<Vec<f32>>,
}

/// Per-layer state shared by every task of the layer.
pub struct LayerContext {
    pub layer_id: usize,
    pub batch_size: usize,
    /// Selected expert per (batch row, slot).
    pub expert_ids: Vec<Vec<usize>>,
    pub activation: Activation,
    pub(crate) inputs: OnceLock<LayerInputs>,
    pub(crate) prepared: OnceLock<Prepared>,
    pub(crate) output: Mutex<Vec<f32>>,
}

impl LayerContext {
    pub(crate) fn new(
        layer_id: usize,
        batch_size: usize,
        expert_ids: Vec<Vec<usize>>,
        activation: Activation,
    ) -> Self {
        LayerContext {
            layer_id,
            batch_size,
            expert_ids,
            activation,
            inputs: OnceLock::new(),
            prepared: OnceLock::new(),
            output: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_inputs(&self, inputs: LayerInputs) {
        if self.inputs.set(inputs).is_err() {
            panic!("layer {} received inputs twice", self.layer_id);
        }
    }

    fn inputs(&self) -> &LayerInputs {
        match self.inputs.get() {
            Some(i) => i,
            None => panic!("layer {} preprocessed before forward", self.layer_id),
        }
    }

    fn prepared(&self) -> &Prepared {
        match self.prepared.get() {
            Some(p) => p,
            None => panic!("layer {} task ran before preprocess", self.layer_id),
        }
    }
}

fn hidden<'a>(cell: &'a HiddenCell, what: &str) -> &'a [f32] {
    match cell.get() {
        Some(v) => v,
        None => panic!("{what} output read before it was produced"),
    }
}

fn publish(cell: &HiddenCell, values: Vec<f32>, what: &str) {
    if cell.set(values).is_err() {
        panic!("{what} output produced twice");
    }
}

pub struct GateTask {
    pub(crate) layer: Arc<LayerContext>,
    pub(crate) expert_id: usize,
    pub(crate) batch_id: usize,
    pub(crate) out: HiddenCell,
}

pub struct UpTask {
    pub(crate) layer: Arc<LayerContext>,
    pub(crate) expert_id: usize,
    pub(crate) batch_id: usize,
    pub(crate) gate_out: HiddenCell,
    pub(crate) out: HiddenCell,
}

pub struct DownTask {
    pub(crate) layer: Arc<LayerContext>,
    pub(crate) expert_id: usize,
    pub(crate) batch_id: usize,
    pub(crate) slot: usize,
    pub(crate) gate_out: HiddenCell,
    pub(crate) up_out: HiddenCell,
}

pub enum PipelineTask {
    Preprocess(Arc<LayerContext>),
    Gate(GateTask),
    Up(UpTask),
    Down(DownTask),
    Reduce(Arc<LayerContext>),
}

impl PipelineTask {
    pub(crate) fn run(&self, shared: &PipelineShared, ctx: &WorkerContext) {
        match self {
            PipelineTask::Preprocess(layer) => preprocess(shared, layer),
            PipelineTask::Gate(t) => t.run(shared),
            PipelineTask::Up(t) => t.run(shared),
            PipelineTask::Down(t) => t.run(shared, ctx),
            PipelineTask::Reduce(layer) => reduce(shared, layer),
        }
    }
}

/// Zero the accumulators, quantize the inputs and gather routing scores.
fn preprocess(shared: &PipelineShared, layer: &LayerContext) {
    let cfg = &shared.cfg;
    for buf in shared.local_out.iter() {
        buf.lock().fill(0.0);
    }

    let inputs = layer.inputs();
    let row_bytes = shared.input_row_size;
    let mut input_quant = vec![0u8; layer.batch_size * row_bytes];
    for (src, dst) in inputs
        .input
        .chunks_exact(cfg.embed_dim)
        .zip(input_quant.chunks_exact_mut(row_bytes))
    {
        shared.kernel.quantize_act_row(src, dst);
    }

    let expert_scores = layer
        .expert_ids
        .iter()
        .enumerate()
        .map(|(i, ids)| {
            let logits = &inputs.expert_logits[i * cfg.n_experts..(i + 1) * cfg.n_experts];
            let mut scores: Vec<f32> = ids.iter().map(|&e| logits[e]).collect();
            if cfg.normalize_scores {
                let scale = 1.0 / scores.iter().sum::<f32>();
                scores.iter_mut().for_each(|s| *s *= scale);
            }
            scores
        })
        .collect();

    if layer.prepared.set(Prepared { input_quant, expert_scores }).is_err() {
        panic!("layer {} preprocessed twice", layer.layer_id);
    }
}

fn act_row<'a>(shared: &PipelineShared, prepared: &'a Prepared, batch_id: usize) -> &'a [u8] {
    let n = shared.input_row_size;
    &prepared.input_quant[batch_id * n..(batch_id + 1) * n]
}

impl GateTask {
    fn run(&self, shared: &PipelineShared) {
        let cfg = &shared.cfg;
        let matrix = shared
            .cache
            .get(self.layer.layer_id, self.expert_id, MatrixKind::Gate.index());
        let data = matrix.data();
        let act = act_row(shared, self.layer.prepared(), self.batch_id);
        let activation = self.layer.activation;

        let out: Vec<f32> = data
            .as_slice()
            .chunks_exact(shared.weight_row_size)
            .take(cfg.ffn_hidden_dim)
            .map(|row| activation.apply_sparse(shared.kernel.vec_dot(cfg.embed_dim, row, act)))
            .collect();

        drop(data);
        matrix.unpin();
        publish(&self.out, out, "gate");
    }
}

impl UpTask {
    fn run(&self, shared: &PipelineShared) {
        let cfg = &shared.cfg;
        let gate = hidden(&self.gate_out, "gate");
        let matrix = shared
            .cache
            .get(self.layer.layer_id, self.expert_id, MatrixKind::Up.index());
        let data = matrix.data();
        let act = act_row(shared, self.layer.prepared(), self.batch_id);

        // Hidden units the gate zeroed contribute nothing: skip their dot products.
        let out: Vec<f32> = data
            .as_slice()
            .chunks_exact(shared.weight_row_size)
            .take(cfg.ffn_hidden_dim)
            .zip(gate)
            .map(|(row, &g)| {
                if g <= 0.0 {
                    0.0
                } else {
                    shared.kernel.vec_dot(cfg.embed_dim, row, act)
                }
            })
            .collect();

        drop(data);
        matrix.unpin();
        publish(&self.out, out, "up");
    }
}

impl DownTask {
    fn run(&self, shared: &PipelineShared, ctx: &WorkerContext) {
        let cfg = &shared.cfg;
        let gate = hidden(&self.gate_out, "gate");
        let up = hidden(&self.up_out, "up");
        let matrix = shared
            .cache
            .get(self.layer.layer_id, self.expert_id, MatrixKind::Down.index());
        let data = matrix.data();

        let mut tmp = vec![0.0f32; cfg.embed_dim];
        {
            let mut axpy = AxpyBatch::new(shared.kernel.as_ref(), &mut tmp);
            let rows = data.as_slice().chunks_exact(shared.weight_row_size);
            for ((row, &u), &g) in rows.take(cfg.ffn_hidden_dim).zip(up).zip(gate) {
                let a = u * g;
                if a != 0.0 {
                    axpy.enqueue(a, row);
                }
            }
            axpy.flush();
        }
        drop(data);
        matrix.unpin();

        let score = self.layer.prepared().expert_scores[self.batch_id][self.slot];
        let mut acc = shared.local_out[ctx.thread_id].lock();
        let out = &mut acc[self.batch_id * cfg.embed_dim..(self.batch_id + 1) * cfg.embed_dim];
        for (o, &t) in out.iter_mut().zip(&tmp) {
            *o += score * t;
        }
    }
}

/// Sum the per-worker accumulators into the layer output.
fn reduce(shared: &PipelineShared, layer: &LayerContext) {
    let n = shared.cfg.embed_dim * layer.batch_size;
    let mut output = vec![0.0f32; n];
    for buf in shared.local_out.iter() {
        let buf = buf.lock();
        for (o, &v) in output.iter_mut().zip(&buf[..n]) {
            *o += v;
        }
    }
    *layer.output.lock() = output;
}

/// Pops one ready task, runs it and propagates completion.
pub(crate) struct PipelineWorker {
    pub(crate) queue: TaskQueue<PipelineTask>,
    pub(crate) shared: Arc<PipelineShared>,
}

impl Worker for PipelineWorker {
    fn run_tasks(&self, ctx: &WorkerContext) -> bool {
        let Some(task) = self.queue.pop() else {
            return false;
        };
        task.body().run(&self.shared, ctx);
        self.shared.n_tasks_run.fetch_add(1, Ordering::Relaxed);
        task.on_finish();
        true
    }
}
