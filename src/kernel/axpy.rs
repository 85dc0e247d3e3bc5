//! Batched scaled-row accumulation for the down projection.

use super::Kernel;

pub const AXPY_BATCH_SIZE: usize = 8;

/// Collects `(scale, row)` pairs and hands them to the kernel eight at a time.
///
/// Anything still queued when the batch is dropped is lost; call
/// [`AxpyBatch::flush`] before reading `out`.
pub struct AxpyBatch<'a> {
    kernel: &'a dyn Kernel,
    out: &'a mut [f32],
    scales: [f32; AXPY_BATCH_SIZE],
    rows: [&'a [u8]; AXPY_BATCH_SIZE],
    len: usize,
}

impl<'a> AxpyBatch<'a> {
    pub fn new(kernel: &'a dyn Kernel, out: &'a mut [f32]) -> Self {
        AxpyBatch {
            kernel,
            out,
            scales: [0.0; AXPY_BATCH_SIZE],
            rows: [&[][..]; AXPY_BATCH_SIZE],
            len: 0,
        }
    }

    pub fn enqueue(&mut self, scale: f32, row: &'a [u8]) {
        self.scales[self.len] = scale;
        self.rows[self.len] = row;
        self.len += 1;
        if self.len == AXPY_BATCH_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        self.kernel
            .axpy_batch(&self.scales[..self.len], &self.rows[..self.len], self.out);
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::q4_0::{quantize_row_q4_0, row_size_q4_0};
    use crate::kernel::Q4Kernel;

    #[test]
    fn test_batch_flushes_every_eight() {
        let n = 32;
        let mut row = vec![0u8; row_size_q4_0(n)];
        quantize_row_q4_0(&vec![1.0f32; n], &mut row);

        let kernel = Q4Kernel;
        let mut out = vec![0.0f32; n];
        {
            let mut batch = AxpyBatch::new(&kernel, &mut out);
            for _ in 0..11 {
                batch.enqueue(1.0, &row);
            }
            batch.flush();
        }
        // Every element dequantizes to exactly 1.0.
        for v in &out {
            assert!((v - 11.0).abs() < 1e-4, "{v}");
        }
    }
}
