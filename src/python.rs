//! Python bindings.
//!
//! ```python
//! from moe_stream import MoeEngine
//! engine = MoeEngine("experts.bin", n_layers=24, n_experts=64, n_used_experts=4,
//!                    embed_dim=2560, ffn_hidden_dim=768)
//! engine.prefetch(layer, predicted_ids, max_n_prefetch=32)
//! engine.build_tasks(layer, expert_ids, activation=0)
//! out = engine.forward(layer, logits_f32_bytes, hidden_f32_bytes)
//! ```
//!
//! Arrays cross the boundary as little-endian f32 bytes; expert ids as lists
//! of rows. Shape errors raise `ValueError`, setup failures `RuntimeError`.

use crate::affinity;
use crate::bundle::{padded_matrix_bytes, BundleLayout};
use crate::cache::{ExpertCache, MatrixKind};
use crate::config::{Activation, CacheConfig, IdleStrategy, PipelineConfig};
use crate::kernel::Q4Kernel;
use crate::moe::Pipeline;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use std::path::Path;
use std::sync::Arc;

fn runtime_err(e: crate::error::Error) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn f32_from_bytes(name: &str, bytes: &[u8]) -> PyResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(PyValueError::new_err(format!(
            "{name}: {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Disk-streamed MoE layer executor.
#[pyclass]
pub struct MoeEngine {
    pipeline: Pipeline,
}

impl MoeEngine {
    fn flatten_ids(&self, rows: &[Vec<usize>], width: usize) -> PyResult<Vec<usize>> {
        let cfg = self.pipeline.config();
        if rows.len() > cfg.max_batch_size {
            return Err(PyValueError::new_err(format!(
                "batch of {} rows exceeds max_batch_size {}",
                rows.len(),
                cfg.max_batch_size
            )));
        }
        let mut flat = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(PyValueError::new_err(format!(
                    "row {i} has {} expert ids, expected {width}",
                    row.len()
                )));
            }
            if let Some(&bad) = row.iter().find(|&&e| e >= cfg.n_experts) {
                return Err(PyValueError::new_err(format!(
                    "expert id {bad} out of range (n_experts={})",
                    cfg.n_experts
                )));
            }
            flat.extend_from_slice(row);
        }
        Ok(flat)
    }
}

#[pymethods]
impl MoeEngine {
    /// Open an expert bundle. The cache bound comes from `MAX_N_CACHED`.
    #[new]
    #[pyo3(signature = (
        bundle_path,
        n_layers,
        n_experts,
        n_used_experts,
        embed_dim,
        ffn_hidden_dim,
        n_workers=None,
        max_batch_size=8,
        matrix_bytes=None,
        normalize_scores=false,
        use_mmap=false,
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bundle_path: &str,
        n_layers: usize,
        n_experts: usize,
        n_used_experts: usize,
        embed_dim: usize,
        ffn_hidden_dim: usize,
        n_workers: Option<usize>,
        max_batch_size: usize,
        matrix_bytes: Option<usize>,
        normalize_scores: bool,
        use_mmap: bool,
    ) -> PyResult<Self> {
        let cfg = PipelineConfig {
            n_workers: n_workers.unwrap_or_else(affinity::num_cpus),
            n_layers,
            embed_dim,
            ffn_hidden_dim,
            max_batch_size,
            n_experts,
            n_used_experts,
            normalize_scores,
            pin_workers: true,
            idle: IdleStrategy::Spin,
        };
        cfg.validate().map_err(runtime_err)?;

        let cache_cfg = CacheConfig::from_env().map_err(runtime_err)?;
        let matrix_bytes = matrix_bytes.unwrap_or_else(|| padded_matrix_bytes(ffn_hidden_dim, embed_dim));
        let layout = BundleLayout::new(n_layers, n_experts, MatrixKind::ALL.len(), matrix_bytes);

        let path = Path::new(bundle_path);
        let cache = if use_mmap {
            ExpertCache::open_mmap(path, layout, &cache_cfg)
        } else {
            ExpertCache::open(path, layout, &cache_cfg)
        }
        .map_err(runtime_err)?;

        let pipeline = Pipeline::new(Arc::new(cache), Arc::new(Q4Kernel), cfg).map_err(runtime_err)?;
        Ok(MoeEngine { pipeline })
    }

    /// Start reads for predicted experts (`expert_ids[batch][slot]`). Returns the number issued.
    pub fn prefetch(
        &self,
        py: Python<'_>,
        layer_id: usize,
        expert_ids: Vec<Vec<usize>>,
        max_n_prefetch: usize,
    ) -> PyResult<usize> {
        if layer_id >= self.pipeline.config().n_layers {
            return Err(PyValueError::new_err(format!("layer {layer_id} out of range")));
        }
        let n_predicted = expert_ids.first().map_or(0, Vec::len);
        let flat = self.flatten_ids(&expert_ids, n_predicted)?;
        let batch = expert_ids.len();
        Ok(py.allow_threads(|| {
            self.pipeline.prefetch(layer_id, batch, n_predicted, max_n_prefetch, &flat)
        }))
    }

    /// Build the task graph for routed experts (`expert_ids[batch][slot]`).
    ///
    /// `activation`: 0 = ReLU, 1 = SiLU.
    #[pyo3(signature = (layer_id, expert_ids, activation=0))]
    pub fn build_tasks(
        &self,
        py: Python<'_>,
        layer_id: usize,
        expert_ids: Vec<Vec<usize>>,
        activation: i32,
    ) -> PyResult<usize> {
        let activation = match activation {
            0 | 1 => Activation::from_selector(activation),
            other => {
                return Err(PyValueError::new_err(format!(
                    "activation must be 0 (ReLU) or 1 (SiLU), got {other}"
                )))
            }
        };
        if layer_id >= self.pipeline.config().n_layers {
            return Err(PyValueError::new_err(format!("layer {layer_id} out of range")));
        }
        if self.pipeline.is_built(layer_id) {
            return Err(PyRuntimeError::new_err(format!(
                "layer {layer_id} already has tasks in flight, call forward first"
            )));
        }
        let flat = self.flatten_ids(&expert_ids, self.pipeline.config().n_used_experts)?;
        let mut distinct = flat.clone();
        distinct.sort_unstable();
        distinct.dedup();
        let needed = distinct.len() * MatrixKind::ALL.len();
        if needed > self.pipeline.cache().capacity() {
            return Err(PyValueError::new_err(format!(
                "layer {layer_id} needs {needed} resident matrices, MAX_N_CACHED is {}",
                self.pipeline.cache().capacity()
            )));
        }
        let batch = expert_ids.len();
        Ok(py.allow_threads(|| self.pipeline.build_tasks(layer_id, batch, activation, &flat)))
    }

    /// Run a built layer on all workers.
    ///
    /// Args:
    ///   expert_logits: f32 bytes, [batch, n_experts]
    ///   input: f32 bytes, [batch, embed_dim]
    ///
    /// Returns: f32 bytes, [batch, embed_dim]
    pub fn forward<'py>(
        &self,
        py: Python<'py>,
        layer_id: usize,
        expert_logits: &[u8],
        input: &[u8],
    ) -> PyResult<Bound<'py, PyBytes>> {
        let cfg = self.pipeline.config();
        let batch = match (layer_id < cfg.n_layers).then(|| self.pipeline.built_batch_size(layer_id)) {
            Some(Some(batch)) => batch,
            _ => {
                return Err(PyRuntimeError::new_err(format!(
                    "layer {layer_id} has no task graph, call build_tasks first"
                )))
            }
        };
        let logits = f32_from_bytes("expert_logits", expert_logits)?;
        let input = f32_from_bytes("input", input)?;
        if logits.len() != batch * cfg.n_experts || input.len() != batch * cfg.embed_dim {
            return Err(PyValueError::new_err(format!(
                "layer {layer_id} was built for batch {batch}: expected {} logits and {} inputs, got {} and {}",
                batch * cfg.n_experts,
                batch * cfg.embed_dim,
                logits.len(),
                input.len(),
            )));
        }

        let mut output = vec![0.0f32; input.len()];
        py.allow_threads(|| self.pipeline.forward_all(layer_id, &logits, &input, &mut output));

        let bytes: Vec<u8> = output.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(PyBytes::new(py, &bytes))
    }

    /// Cache activity counters as a human-readable line.
    pub fn cache_stats(&self) -> String {
        self.pipeline.cache().stats().to_string()
    }

    /// Fraction of examined matrices that were already resident, in percent.
    pub fn hit_rate(&self) -> f64 {
        self.pipeline.cache().stats().hit_rate()
    }

    pub fn n_workers(&self) -> usize {
        self.pipeline.config().n_workers
    }
}
