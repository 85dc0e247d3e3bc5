//! Runtime configuration: crate-wide constants, the env-driven cache bound,
//! and the pipeline shape.

use crate::error::{Error, Result};
use crate::kernel::q4_0::QK;
use serde::Deserialize;
use std::path::Path;

/// Largest batch a pipeline may be configured for.
pub const MAX_BATCH_SIZE: usize = 8;

/// Number of reads the I/O ring may have in flight at once. Also the floor
/// for `max_cached_matrices`: the cache must be able to hold every buffer
/// that could be under I/O simultaneously.
pub const IO_QUEUE_DEPTH: usize = 512;

/// Alignment of cache buffers and of every record in the expert bundle.
/// Required by O_DIRECT reads.
pub const IO_ALIGNMENT: usize = 4096;

/// Default residency bound: 3 matrices x 64 experts x 32 layers.
pub const DEFAULT_MAX_CACHED_MATRICES: usize = 3 * 64 * 32;

const ENV_MAX_CACHED: &str = "MAX_N_CACHED";
const ENV_DIRECT_IO: &str = "MOE_DIRECT_IO";
const ENV_IO_WORKER_CPU: &str = "MOE_IO_WORKER_CPU";

/// Expert cache tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on matrices holding a data buffer at any time.
    pub max_cached_matrices: usize,
    /// Ring capacity (reads in flight).
    pub io_queue_depth: usize,
    /// Open the bundle with O_DIRECT (bypasses the page cache).
    pub direct_io: bool,
    /// Pin the I/O worker thread to this CPU.
    pub io_worker_cpu: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_cached_matrices: DEFAULT_MAX_CACHED_MATRICES,
            io_queue_depth: IO_QUEUE_DEPTH,
            direct_io: true,
            io_worker_cpu: None,
        }
    }
}

impl CacheConfig {
    /// Build the config from the process environment.
    ///
    /// `MAX_N_CACHED` below the I/O queue depth is rejected.
    pub fn from_env() -> Result<Self> {
        let mut cfg = CacheConfig::default();

        if let Ok(v) = std::env::var(ENV_MAX_CACHED) {
            cfg.max_cached_matrices = v.trim().parse().map_err(|e| {
                Error::Config(format!("{ENV_MAX_CACHED}={v:?} is not a count: {e}"))
            })?;
        }
        if let Ok(v) = std::env::var(ENV_DIRECT_IO) {
            cfg.direct_io = parse_flag(ENV_DIRECT_IO, &v)?;
        }
        if let Ok(v) = std::env::var(ENV_IO_WORKER_CPU) {
            let cpu = v.trim().parse().map_err(|e| {
                Error::Config(format!("{ENV_IO_WORKER_CPU}={v:?} is not a CPU index: {e}"))
            })?;
            cfg.io_worker_cpu = Some(cpu);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_queue_depth == 0 {
            return Err(Error::Config("io_queue_depth must be > 0".into()));
        }
        if self.max_cached_matrices < self.io_queue_depth {
            return Err(Error::Config(format!(
                "{ENV_MAX_CACHED} must be >= {} (the I/O queue depth), got {}",
                self.io_queue_depth, self.max_cached_matrices,
            )));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{name}={v:?} is not a boolean"))),
    }
}

/// Pointwise nonlinearity applied to gate projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Silu,
}

impl Activation {
    /// Map the integer selector used by embedding applications (0 = ReLU, 1 = SiLU).
    pub fn from_selector(selector: i32) -> Self {
        match selector {
            0 => Activation::Relu,
            1 => Activation::Silu,
            other => panic!("unknown FFN activation selector {other} (expected 0=ReLU or 1=SiLU)"),
        }
    }

    /// Apply the activation and sparsify: anything not strictly positive is 0.
    #[inline]
    pub fn apply_sparse(self, x: f32) -> f32 {
        if x <= 0.0 {
            return 0.0;
        }
        match self {
            Activation::Relu => x,
            Activation::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

/// What a worker thread does when the ready queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleStrategy {
    /// Busy-poll with a CPU spin hint. Lowest hand-off latency, burns a core.
    #[default]
    Spin,
    /// Give the rest of the time slice back to the OS on every idle poll.
    Yield,
}

impl IdleStrategy {
    #[inline]
    pub fn idle(self) {
        match self {
            IdleStrategy::Spin => std::hint::spin_loop(),
            IdleStrategy::Yield => std::thread::yield_now(),
        }
    }
}

/// Shape of the MoE layers served by a pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub n_workers: usize,
    pub n_layers: usize,
    pub embed_dim: usize,
    pub ffn_hidden_dim: usize,
    pub max_batch_size: usize,
    pub n_experts: usize,
    pub n_used_experts: usize,
    #[serde(default)]
    pub normalize_scores: bool,
    /// Pin worker thread `i` to CPU `i mod n_cpus` on entry to `forward`.
    #[serde(default)]
    pub pin_workers: bool,
    #[serde(default)]
    pub idle: IdleStrategy,
}

impl PipelineConfig {
    /// Load from a JSON file with the field names above.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: PipelineConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_workers == 0 {
            return Err(Error::Config("n_workers must be > 0".into()));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "max_batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.max_batch_size,
            )));
        }
        if self.n_used_experts == 0 || self.n_used_experts > self.n_experts {
            return Err(Error::Config(format!(
                "n_used_experts must be in 1..={}, got {}",
                self.n_experts, self.n_used_experts,
            )));
        }
        if self.embed_dim == 0 || self.ffn_hidden_dim == 0 {
            return Err(Error::Config("embed_dim and ffn_hidden_dim must be > 0".into()));
        }
        if self.embed_dim % QK != 0 || self.ffn_hidden_dim % QK != 0 {
            return Err(Error::Config(format!(
                "embed_dim ({}) and ffn_hidden_dim ({}) must be multiples of {QK}",
                self.embed_dim, self.ffn_hidden_dim,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cache_config_floor() {
        let mut cfg = CacheConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.max_cached_matrices = IO_QUEUE_DEPTH - 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_N_CACHED"), "{err}");

        cfg.max_cached_matrices = IO_QUEUE_DEPTH;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "ON").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }

    #[test]
    fn test_activation_sparsifies() {
        assert_eq!(Activation::Relu.apply_sparse(-1.0), 0.0);
        assert_eq!(Activation::Relu.apply_sparse(0.0), 0.0);
        assert_eq!(Activation::Relu.apply_sparse(2.5), 2.5);
        assert_eq!(Activation::Silu.apply_sparse(-3.0), 0.0);
        let s = Activation::Silu.apply_sparse(1.0);
        assert!((s - 0.731_058_6).abs() < 1e-5, "silu(1) = {s}");
        assert_eq!(Activation::from_selector(0), Activation::Relu);
        assert_eq!(Activation::from_selector(1), Activation::Silu);
    }

    #[test]
    #[should_panic(expected = "unknown FFN activation selector")]
    fn test_activation_bad_selector() {
        let _ = Activation::from_selector(7);
    }

    #[test]
    fn test_pipeline_config_from_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"n_workers": 4, "n_layers": 2, "embed_dim": 64, "ffn_hidden_dim": 32,
                "max_batch_size": 4, "n_experts": 8, "n_used_experts": 2,
                "normalize_scores": true, "idle": "yield"}}"#
        )
        .unwrap();

        let cfg = PipelineConfig::from_json_file(f.path()).unwrap();
        assert_eq!(cfg.n_workers, 4);
        assert!(cfg.normalize_scores);
        assert!(!cfg.pin_workers);
        assert_eq!(cfg.idle, IdleStrategy::Yield);
    }

    #[test]
    fn test_pipeline_config_rejects_large_batch() {
        let cfg = PipelineConfig {
            n_workers: 1,
            n_layers: 1,
            embed_dim: 32,
            ffn_hidden_dim: 32,
            max_batch_size: MAX_BATCH_SIZE + 1,
            n_experts: 2,
            n_used_experts: 1,
            normalize_scores: false,
            pin_workers: false,
            idle: IdleStrategy::Spin,
        };
        assert!(cfg.validate().is_err());
    }
}
