//! Q4_0 / Q8_0 block formats.
//!
//! Q4_0 block (18 bytes, 32 weights): fp16 scale `d`, then 16 bytes of
//! nibbles. Byte `j` holds element `j` in its low nibble and element `j + 16`
//! in its high nibble; value = d * (nibble - 8).
//!
//! Q8_0 block (34 bytes, 32 values): fp16 scale `d`, then 32 x int8;
//! value = d * q.

use half::f16;

/// Elements per block (both formats).
pub const QK: usize = 32;
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;
pub const Q8_0_BLOCK_BYTES: usize = 2 + QK;

pub fn row_size_q4_0(n: usize) -> usize {
    assert_eq!(n % QK, 0, "row width {n} is not a multiple of {QK}");
    (n / QK) * Q4_0_BLOCK_BYTES
}

pub fn row_size_q8_0(n: usize) -> usize {
    assert_eq!(n % QK, 0, "row width {n} is not a multiple of {QK}");
    (n / QK) * Q8_0_BLOCK_BYTES
}

#[inline]
fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f32()
}

#[inline]
fn write_f16(bytes: &mut [u8], v: f32) {
    bytes[..2].copy_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
}

pub fn quantize_row_q4_0(src: &[f32], dst: &mut [u8]) {
    let nb = src.len() / QK;
    assert_eq!(nb * QK, src.len());
    assert!(dst.len() >= nb * Q4_0_BLOCK_BYTES);

    for (x, block) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(Q4_0_BLOCK_BYTES)) {
        // Signed value with the largest magnitude maps to -8.
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in x {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(block, d);

        for j in 0..QK / 2 {
            let x0 = x[j] * id;
            let x1 = x[j + QK / 2] * id;
            let q0 = ((x0 + 8.5) as i32).clamp(0, 15) as u8;
            let q1 = ((x1 + 8.5) as i32).clamp(0, 15) as u8;
            block[2 + j] = q0 | (q1 << 4);
        }
    }
}

pub fn dequantize_row_q4_0(src: &[u8], n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n];
    axpy_q4_0(1.0, src, &mut out);
    out
}

pub fn quantize_row_q8_0(src: &[f32], dst: &mut [u8]) {
    let nb = src.len() / QK;
    assert_eq!(nb * QK, src.len());
    assert!(dst.len() >= nb * Q8_0_BLOCK_BYTES);

    for (x, block) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(Q8_0_BLOCK_BYTES)) {
        let amax = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(block, d);
        for j in 0..QK {
            block[2 + j] = ((x[j] * id).round() as i8) as u8;
        }
    }
}

pub fn vec_dot_q4_0_q8_0(n: usize, x: &[u8], y: &[u8]) -> f32 {
    let nb = n / QK;
    debug_assert_eq!(nb * QK, n);

    let mut sumf = 0.0f32;
    for i in 0..nb {
        let bx = &x[i * Q4_0_BLOCK_BYTES..(i + 1) * Q4_0_BLOCK_BYTES];
        let by = &y[i * Q8_0_BLOCK_BYTES..(i + 1) * Q8_0_BLOCK_BYTES];
        let qy = &by[2..];

        let mut sumi = 0i32;
        for j in 0..QK / 2 {
            let v0 = (bx[2 + j] & 0x0F) as i32 - 8;
            let v1 = (bx[2 + j] >> 4) as i32 - 8;
            sumi += v0 * (qy[j] as i8) as i32 + v1 * (qy[j + QK / 2] as i8) as i32;
        }
        sumf += sumi as f32 * read_f16(bx) * read_f16(by);
    }
    sumf
}

pub fn axpy_q4_0(scale: f32, row: &[u8], out: &mut [f32]) {
    let nb = out.len() / QK;
    for (i, y) in out.chunks_exact_mut(QK).enumerate().take(nb) {
        let block = &row[i * Q4_0_BLOCK_BYTES..(i + 1) * Q4_0_BLOCK_BYTES];
        let d = scale * read_f16(block);
        for j in 0..QK / 2 {
            let q = block[2 + j];
            y[j] += d * ((q & 0x0F) as i32 - 8) as f32;
            y[j + QK / 2] += d * ((q >> 4) as i32 - 8) as f32;
        }
    }
}

/// Fused accumulation of several rows: each output block is loaded once.
pub fn axpy_batch_q4_0(scales: &[f32], rows: &[&[u8]], out: &mut [f32]) {
    debug_assert_eq!(scales.len(), rows.len());
    for (i, y) in out.chunks_exact_mut(QK).enumerate() {
        let lo = i * Q4_0_BLOCK_BYTES;
        for (&a, row) in scales.iter().zip(rows) {
            let block = &row[lo..lo + Q4_0_BLOCK_BYTES];
            let d = a * read_f16(block);
            for j in 0..QK / 2 {
                let q = block[2 + j];
                y[j] += d * ((q & 0x0F) as i32 - 8) as f32;
                y[j + QK / 2] += d * ((q >> 4) as i32 - 8) as f32;
            }
        }
    }
}
