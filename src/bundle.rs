//! Expert bundle files.
//!
//! A bundle is a flat concatenation of fixed-size records, one per
//! (layer, expert, matrix), nested layer -> expert -> matrix. There is no
//! header or index: the offset of every record is computed from the layout.
//! Each record holds one Q4_0 matrix padded with zeros to `matrix_bytes`,
//! which is a multiple of the I/O alignment so records can be read with
//! O_DIRECT.

use crate::config::IO_ALIGNMENT;
use crate::error::{Error, Result};
use crate::kernel::q4_0::{quantize_row_q4_0, row_size_q4_0};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Geometry of a bundle. Serializes with the field names below so it can be
/// kept next to the bundle as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLayout {
    pub n_layers: usize,
    pub n_experts: usize,
    pub n_matrices: usize,
    pub matrix_bytes: usize,
}

impl BundleLayout {
    pub fn new(n_layers: usize, n_experts: usize, n_matrices: usize, matrix_bytes: usize) -> Self {
        BundleLayout { n_layers, n_experts, n_matrices, matrix_bytes }
    }

    pub fn validate(&self) -> Result<()> {
        if self.matrix_bytes == 0 || self.matrix_bytes % IO_ALIGNMENT != 0 {
            return Err(Error::Config(format!(
                "matrix_bytes ({}) must be a non-zero multiple of {IO_ALIGNMENT}",
                self.matrix_bytes,
            )));
        }
        if self.n_layers == 0 || self.n_experts == 0 || self.n_matrices == 0 {
            return Err(Error::Config(format!(
                "empty bundle geometry: {} layers x {} experts x {} matrices",
                self.n_layers, self.n_experts, self.n_matrices,
            )));
        }
        Ok(())
    }

    pub fn n_records(&self) -> usize {
        self.n_layers * self.n_experts * self.n_matrices
    }

    /// Position of a record in the flat layer -> expert -> matrix order.
    pub fn record_index(&self, layer_id: usize, expert_id: usize, matrix_id: usize) -> usize {
        assert!(
            layer_id < self.n_layers && expert_id < self.n_experts && matrix_id < self.n_matrices,
            "record ({layer_id}, {expert_id}, {matrix_id}) out of range for {self:?}",
        );
        matrix_id + expert_id * self.n_matrices + layer_id * self.n_experts * self.n_matrices
    }

    /// Byte offset of a record in the bundle file.
    pub fn matrix_offset(&self, layer_id: usize, expert_id: usize, matrix_id: usize) -> u64 {
        (self.matrix_bytes * self.record_index(layer_id, expert_id, matrix_id)) as u64
    }

    pub fn file_len(&self) -> u64 {
        (self.matrix_bytes * self.n_records()) as u64
    }
}

/// Record size for a Q4_0 matrix of `rows` x `cols`, rounded up to the I/O alignment.
pub fn padded_matrix_bytes(rows: usize, cols: usize) -> usize {
    let size = row_size_q4_0(cols) * rows;
    size.div_ceil(IO_ALIGNMENT) * IO_ALIGNMENT
}

/// Writes bundle records in layout order.
pub struct BundleWriter {
    file: BufWriter<File>,
    layout: BundleLayout,
    n_written: usize,
    zeros: Vec<u8>,
}

impl BundleWriter {
    pub fn create(path: &Path, layout: BundleLayout) -> Result<Self> {
        layout.validate()?;
        let file = File::create(path)?;
        Ok(BundleWriter {
            file: BufWriter::new(file),
            layout,
            n_written: 0,
            zeros: vec![0u8; layout.matrix_bytes],
        })
    }

    /// Number of records written so far.
    pub fn n_written(&self) -> usize {
        self.n_written
    }

    /// Append an already-quantized matrix, zero-padded to `matrix_bytes`.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.n_written >= self.layout.n_records() {
            return Err(Error::Bundle(format!(
                "bundle already holds all {} records",
                self.layout.n_records(),
            )));
        }
        if data.len() > self.layout.matrix_bytes {
            return Err(Error::Bundle(format!(
                "record {} is {} bytes, larger than matrix_bytes ({})",
                self.n_written,
                data.len(),
                self.layout.matrix_bytes,
            )));
        }
        self.file.write_all(data)?;
        self.file.write_all(&self.zeros[..self.layout.matrix_bytes - data.len()])?;
        self.n_written += 1;
        Ok(())
    }

    /// Quantize a row-major f32 matrix to Q4_0 and append it.
    pub fn append_f32(&mut self, weights: &[f32], rows: usize, cols: usize) -> Result<()> {
        if weights.len() != rows * cols {
            return Err(Error::Bundle(format!(
                "expected {rows}x{cols} = {} weights, got {}",
                rows * cols,
                weights.len(),
            )));
        }
        let row_bytes = row_size_q4_0(cols);
        let mut packed = vec![0u8; row_bytes * rows];
        for (src, dst) in weights.chunks_exact(cols).zip(packed.chunks_exact_mut(row_bytes)) {
            quantize_row_q4_0(src, dst);
        }
        self.append(&packed)
    }

    /// Append an all-zero record (placeholder for layers without experts).
    pub fn append_zero(&mut self) -> Result<()> {
        self.append(&[])
    }

    /// Flush and check that every record of the layout was written.
    pub fn finish(self) -> Result<BundleLayout> {
        if self.n_written != self.layout.n_records() {
            return Err(Error::Bundle(format!(
                "bundle incomplete: {} of {} records written",
                self.n_written,
                self.layout.n_records(),
            )));
        }
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        log::info!(
            "Wrote expert bundle: {} layers x {} experts x {} matrices, {:.1} MiB",
            self.layout.n_layers,
            self.layout.n_experts,
            self.layout.n_matrices,
            self.layout.file_len() as f64 / (1024.0 * 1024.0),
        );
        Ok(self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_offsets_nest_layer_expert_matrix() {
        let layout = BundleLayout::new(2, 4, 3, 4096);
        assert_eq!(layout.matrix_offset(0, 0, 0), 0);
        assert_eq!(layout.matrix_offset(0, 0, 2), 2 * 4096);
        assert_eq!(layout.matrix_offset(0, 1, 0), 3 * 4096);
        assert_eq!(layout.matrix_offset(1, 0, 0), 12 * 4096);
        assert_eq!(layout.file_len(), 24 * 4096);
    }

    #[test]
    fn test_layout_rejects_misaligned_records() {
        assert!(BundleLayout::new(1, 1, 3, 4096 + 512).validate().is_err());
        assert!(BundleLayout::new(1, 1, 3, 0).validate().is_err());
        assert!(BundleLayout::new(1, 1, 3, 8192).validate().is_ok());
    }

    #[test]
    fn test_layout_from_json() {
        let layout: BundleLayout = serde_json::from_str(
            r#"{"n_layers": 24, "n_experts": 64, "n_matrices": 3, "matrix_bytes": 1769472}"#,
        )
        .unwrap();
        assert_eq!(layout, BundleLayout::new(24, 64, 3, 1769472));
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_padded_matrix_bytes() {
        // 64 rows x 64 cols of Q4_0 = 64 * 36 bytes = 2304 -> one page.
        assert_eq!(padded_matrix_bytes(64, 64), 4096);
        assert_eq!(padded_matrix_bytes(256, 64), 12288);
    }

    #[test]
    fn test_writer_pads_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experts.bin");
        let layout = BundleLayout::new(1, 2, 1, 4096);

        let mut w = BundleWriter::create(&path, layout).unwrap();
        w.append(&[7u8; 100]).unwrap();
        w.append_f32(&vec![1.0f32; 32 * 32], 32, 32).unwrap();
        assert!(w.append_zero().is_err(), "third record must not fit");
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, layout.file_len());
        assert!(bytes[..100].iter().all(|&b| b == 7));
        assert!(bytes[100..4096].iter().all(|&b| b == 0));
        // Second record starts with the fp16 scale of the first Q4_0 block (-0.125).
        assert_eq!(&bytes[4096..4098], &half::f16::from_f32(-0.125).to_bits().to_le_bytes());
    }

    #[test]
    fn test_writer_rejects_incomplete_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut w = BundleWriter::create(&path, BundleLayout::new(1, 2, 3, 4096)).unwrap();
        w.append_zero().unwrap();
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_writer_rejects_oversized_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut w = BundleWriter::create(&path, BundleLayout::new(1, 1, 1, 4096)).unwrap();
        assert!(w.append(&vec![0u8; 4097]).is_err());
    }

    proptest! {
        #[test]
        fn prop_offsets_are_pure_distinct_and_contiguous(
            n_layers in 1usize..5,
            n_experts in 1usize..9,
            n_matrices in 1usize..4,
            pages in 1usize..4,
        ) {
            let layout = BundleLayout::new(n_layers, n_experts, n_matrices, pages * IO_ALIGNMENT);
            let mut seen = HashSet::new();
            for l in 0..n_layers {
                for e in 0..n_experts {
                    for m in 0..n_matrices {
                        let off = layout.matrix_offset(l, e, m);
                        prop_assert_eq!(off, layout.matrix_offset(l, e, m));
                        prop_assert_eq!(off % layout.matrix_bytes as u64, 0);
                        prop_assert!(seen.insert(off));
                    }
                }
            }
            // Distinct multiples below file_len, as many as records: exactly contiguous.
            prop_assert_eq!(seen.len(), layout.n_records());
            prop_assert!(seen.iter().all(|&o| o < layout.file_len()));
        }
    }
}
