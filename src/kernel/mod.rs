//! Numeric kernels consumed by the pipeline.
//!
//! The pipeline only depends on the [`Kernel`] trait: byte footprint of a
//! quantized row, activation quantization, a quantized dot product and a
//! scaled row accumulation. [`Q4Kernel`] is the reference implementation
//! (Q4_0 weights against Q8_0 activations).

pub mod axpy;
pub mod q4_0;

pub use axpy::{AxpyBatch, AXPY_BATCH_SIZE};

/// Row-level compute contract between the expert pipeline and a weight format.
pub trait Kernel: Send + Sync {
    /// Bytes occupied by one quantized weight row of `n` columns.
    fn weight_row_size(&self, n: usize) -> usize;

    /// Bytes occupied by one quantized activation row of `n` values.
    fn act_row_size(&self, n: usize) -> usize;

    /// Quantize `src` into the activation block format; `dst` is `act_row_size(src.len())` bytes.
    fn quantize_act_row(&self, src: &[f32], dst: &mut [u8]);

    /// Dot product of a quantized weight row and a quantized activation row, both `n` wide.
    fn vec_dot(&self, n: usize, weight_row: &[u8], act_row: &[u8]) -> f32;

    /// `out += scale * dequant(weight_row)` over `out.len()` columns.
    fn axpy(&self, scale: f32, weight_row: &[u8], out: &mut [f32]);

    /// Accumulate several scaled rows at once. Implementations may fuse the
    /// rows so `out` is traversed only once.
    fn axpy_batch(&self, scales: &[f32], rows: &[&[u8]], out: &mut [f32]) {
        for (&a, row) in scales.iter().zip(rows) {
            self.axpy(a, row, out);
        }
    }
}

/// Q4_0 weights x Q8_0 activations, portable scalar code.
#[derive(Debug, Default, Clone, Copy)]
pub struct Q4Kernel;

impl Kernel for Q4Kernel {
    fn weight_row_size(&self, n: usize) -> usize {
        q4_0::row_size_q4_0(n)
    }

    fn act_row_size(&self, n: usize) -> usize {
        q4_0::row_size_q8_0(n)
    }

    fn quantize_act_row(&self, src: &[f32], dst: &mut [u8]) {
        q4_0::quantize_row_q8_0(src, dst);
    }

    fn vec_dot(&self, n: usize, weight_row: &[u8], act_row: &[u8]) -> f32 {
        q4_0::vec_dot_q4_0_q8_0(n, weight_row, act_row)
    }

    fn axpy(&self, scale: f32, weight_row: &[u8], out: &mut [f32]) {
        q4_0::axpy_q4_0(scale, weight_row, out);
    }

    fn axpy_batch(&self, scales: &[f32], rows: &[&[u8]], out: &mut [f32]) {
        q4_0::axpy_batch_q4_0(scales, rows, out);
    }
}
